//! Ingress to HTTPProxy synthesis
//!
//! One HTTPProxy is produced per (rule, host). Every Ingress path becomes two
//! routes: a probe route matched only by the fixed probe header value, and
//! the live route that stamps each request with the fingerprint of the
//! Ingress spec. The prober can then address a generation-independent route
//! while the fingerprint tells generations apart.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use netcontour_common::kube_utils::{
    child_name, controller_owner_refs, domain_hash, expanded_hosts, is_cluster_service_host,
    spec_fingerprint,
};
use netcontour_common::{
    data_plane_user_san, ContourConfig, CLASS_KEY, DATA_PLANE_ROUTING_SAN, DOMAIN_HASH_LABEL,
    EXTENSION_SERVICE_ANNOTATION, EXTENSION_SERVICE_NAMESPACE_ANNOTATION, GENERATION_LABEL,
    HTTP_CHALLENGE_PATH, NETWORK_HASH_HEADER, ORIGINAL_HOST_HEADER, PARENT_LABEL,
    PROBE_HASH_SENTINEL, ROUTING_CERT_SECRET,
};

use crate::crd::{
    AuthorizationServer, ExtensionServiceReference, HeaderValue, HeadersPolicy, HttpIngressPath,
    HttpOption, HttpProxy, HttpProxySpec, Ingress, IngressBackendSplit, IngressVisibility,
    MatchCondition, RetryPolicy, Route, RouteService, TimeoutPolicy, UpstreamValidation,
    VirtualHost, VirtualHostTls,
};
use crate::Result;

/// Retries applied to paths that configure none
pub const DEFAULT_RETRY_COUNT: i64 = 2;

/// Envoy retry conditions applied to paths that configure none
pub const DEFAULT_RETRY_ON: [&str; 6] = [
    "cancelled",
    "connect-failure",
    "refused-stream",
    "resource-exhausted",
    "retriable-status-codes",
    "reset",
];

/// Protocol Envoy speaks to a backend service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireProtocol {
    /// Cleartext HTTP/2
    H2c,
    /// HTTP/2 over TLS
    H2,
    /// HTTP/1.1 over TLS
    Tls,
}

impl WireProtocol {
    /// Value of the HTTPProxy `protocol` field
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H2c => "h2c",
            Self::H2 => "h2",
            Self::Tls => "tls",
        }
    }
}

fn default_retry_policy() -> RetryPolicy {
    RetryPolicy {
        count: DEFAULT_RETRY_COUNT,
        per_try_timeout: None,
        retry_on: DEFAULT_RETRY_ON.iter().map(|s| s.to_string()).collect(),
    }
}

/// Whether `make_http_proxies` yields at least one HTTPProxy for `ing`
pub fn has_routable_rule(ing: &Ingress) -> bool {
    ing.spec
        .rules
        .iter()
        .any(|r| r.http.is_some() && !r.hosts.is_empty())
}

/// Build the HTTPProxies for an Ingress.
///
/// The output is a pure function of its inputs. The only failure is the
/// Ingress spec not serializing for its fingerprint.
pub fn make_http_proxies(
    cfg: &ContourConfig,
    ing: &Ingress,
    protocols: &BTreeMap<String, WireProtocol>,
) -> Result<Vec<HttpProxy>> {
    let fingerprint = spec_fingerprint(&ing.spec)?;
    let tls_entries = ing.tls_entries();
    let name = ing.name_any();
    let namespace = ing.namespace().unwrap_or_default();
    let generation = ing.metadata.generation.unwrap_or_default();
    let owner_references = controller_owner_refs(ing);
    let allow_insecure = ing.spec.http_option == Some(HttpOption::Enabled);

    let mut proxies = Vec::new();
    for rule in &ing.spec.rules {
        let Some(http) = &rule.http else { continue };

        let permit_insecure =
            allow_insecure || rule.visibility == IngressVisibility::ClusterLocal;
        let routes: Vec<Route> = http
            .paths
            .iter()
            .flat_map(|path| {
                let route = RouteBuilder {
                    cfg,
                    namespace: &namespace,
                    path,
                    permit_insecure,
                    protocols,
                };
                [route.probe(), route.live(&fingerprint)]
            })
            .collect();

        for original_host in &rule.hosts {
            let (hosts, class) = match rule.visibility {
                IngressVisibility::ExternalIP
                    if is_cluster_service_host(original_host, &cfg.cluster_domain) =>
                {
                    (
                        expanded_hosts(original_host, &cfg.cluster_domain),
                        cfg.class_for(IngressVisibility::ClusterLocal),
                    )
                }
                visibility => (vec![original_host.clone()], cfg.class_for(visibility)),
            };

            for host in hosts {
                let tls = match tls_entries.get(host.as_str()) {
                    Some(tls) => Some(VirtualHostTls {
                        secret_name: format!("{}/{}", tls.secret_namespace, tls.secret_name),
                    }),
                    None if rule.visibility == IngressVisibility::ExternalIP => cfg
                        .default_tls_secret
                        .as_ref()
                        .map(|secret| VirtualHostTls {
                            secret_name: secret.clone(),
                        }),
                    None => None,
                };
                let cors_policy = match rule.visibility {
                    IngressVisibility::ExternalIP => cfg.cors_policy.clone(),
                    IngressVisibility::ClusterLocal => None,
                };

                let spec = HttpProxySpec {
                    virtualhost: Some(VirtualHost {
                        fqdn: host.clone(),
                        tls,
                        cors_policy,
                        authorization: authorization(ing),
                    }),
                    routes: routes.clone(),
                };

                let mut proxy =
                    HttpProxy::new(&child_name(&format!("{}-{}-", name, class), &host), spec);
                proxy.metadata.namespace = Some(namespace.clone());
                proxy.metadata.labels = Some(BTreeMap::from([
                    (GENERATION_LABEL.to_string(), generation.to_string()),
                    (PARENT_LABEL.to_string(), name.clone()),
                    (CLASS_KEY.to_string(), class.to_string()),
                    (DOMAIN_HASH_LABEL.to_string(), domain_hash(&host)),
                ]));
                proxy.metadata.annotations =
                    Some(BTreeMap::from([(CLASS_KEY.to_string(), class.to_string())]));
                proxy.metadata.owner_references = owner_references.clone();
                proxies.push(proxy);
            }
        }
    }

    Ok(proxies)
}

fn authorization(ing: &Ingress) -> Option<AuthorizationServer> {
    let annotations = ing.annotations();
    let name = annotations.get(EXTENSION_SERVICE_ANNOTATION)?;
    Some(AuthorizationServer {
        extension_ref: ExtensionServiceReference {
            name: name.clone(),
            namespace: annotations
                .get(EXTENSION_SERVICE_NAMESPACE_ANNOTATION)
                .cloned(),
        },
    })
}

/// Builds the two route variants of one Ingress path
struct RouteBuilder<'a> {
    cfg: &'a ContourConfig,
    namespace: &'a str,
    path: &'a HttpIngressPath,
    permit_insecure: bool,
    protocols: &'a BTreeMap<String, WireProtocol>,
}

impl RouteBuilder<'_> {
    /// Route matched only by requests carrying the probe sentinel
    fn probe(&self) -> Route {
        let mut conditions = self.conditions();
        conditions.push(MatchCondition::header_exact(
            NETWORK_HASH_HEADER,
            PROBE_HASH_SENTINEL,
        ));
        self.route(conditions, None)
    }

    /// Route serving traffic, stamped with the spec fingerprint
    fn live(&self, fingerprint: &str) -> Route {
        self.route(self.conditions(), Some(fingerprint))
    }

    fn conditions(&self) -> Vec<MatchCondition> {
        let prefix = self
            .path
            .path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(MatchCondition::prefix);
        prefix
            .into_iter()
            .chain(
                self.path
                    .headers
                    .iter()
                    .map(|(name, m)| MatchCondition::header_exact(name, &m.exact)),
            )
            .collect()
    }

    fn route(&self, conditions: Vec<MatchCondition>, fingerprint: Option<&str>) -> Route {
        let mut headers: Vec<HeaderValue> = self
            .path
            .append_headers
            .iter()
            .map(|(name, value)| header(name, value))
            .collect();
        if let Some(host) = &self.path.rewrite_host {
            headers.push(header("Host", host));
        }
        if let Some(fingerprint) = fingerprint {
            headers.push(header(NETWORK_HASH_HEADER, fingerprint));
        }
        headers.sort_by(|a, b| a.name.cmp(&b.name));

        let retry_policy = match &self.path.retries {
            Some(retries) => RetryPolicy {
                count: retries.attempts,
                per_try_timeout: retries.per_try_timeout.clone(),
                retry_on: Vec::new(),
            },
            None => default_retry_policy(),
        };

        Route {
            conditions,
            services: self.path.splits.iter().map(|s| self.service(s)).collect(),
            enable_websockets: true,
            permit_insecure: self.permit_insecure,
            timeout_policy: Some(TimeoutPolicy {
                response: Some(
                    self.path
                        .timeout
                        .clone()
                        .unwrap_or_else(|| self.cfg.timeout_policy_response.clone()),
                ),
                idle: Some(self.cfg.timeout_policy_idle.clone()),
            }),
            retry_policy: Some(retry_policy),
            request_headers_policy: Some(HeadersPolicy { set: headers }),
        }
    }

    fn service(&self, split: &IngressBackendSplit) -> RouteService {
        let request_headers_policy = (!split.append_headers.is_empty()).then(|| HeadersPolicy {
            set: split
                .append_headers
                .iter()
                .map(|(name, value)| header(name, value))
                .collect(),
        });

        let mut service = RouteService {
            name: split.service_name.clone(),
            port: port_number(&split.service_port),
            protocol: None,
            weight: split.percent,
            request_headers_policy,
            validation: None,
        };

        let is_challenge = self
            .path
            .path
            .as_deref()
            .is_some_and(|p| p.contains(HTTP_CHALLENGE_PATH));
        if is_challenge {
            return service;
        }

        let Some(protocol) = self.protocols.get(&split.service_name) else {
            return service;
        };
        // Domain-mapping traffic re-enters the proxy, which only speaks cleartext to itself
        let is_domain_mapping = self.path.rewrite_host.is_some()
            && split.append_headers.contains_key(ORIGINAL_HOST_HEADER);
        let protocol = if is_domain_mapping {
            WireProtocol::H2c
        } else {
            *protocol
        };
        service.protocol = Some(protocol.as_str().to_string());
        if self.cfg.internal_encryption {
            service.validation = Some(UpstreamValidation {
                ca_secret: format!("{}/{}", self.cfg.system_namespace, ROUTING_CERT_SECRET),
                subject_name: data_plane_user_san(self.namespace),
                subject_names: vec![
                    data_plane_user_san(self.namespace),
                    DATA_PLANE_ROUTING_SAN.to_string(),
                ],
            });
        }
        service
    }
}

fn header(name: &str, value: &str) -> HeaderValue {
    HeaderValue {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// Numeric value of a service port; named ports that are not numbers map to 0
fn port_number(port: &IntOrString) -> i32 {
    match port {
        IntOrString::Int(p) => *p,
        IntOrString::String(s) => s.parse().unwrap_or_default(),
    }
}
