//! Endpoint-probe Ingress synthesis
//!
//! Before a new generation of an Ingress is exposed, the reconciler programs
//! a child Ingress that routes a synthetic host to every backend service.
//! Once the child is ready Envoy has endpoints for all of them, so switching
//! the real hosts over does not drop requests.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use netcontour_common::kube_utils::{child_name, controller_owner_refs};
use netcontour_common::{ContourConfig, CLASS_KEY, ENDPOINTS_PROBE_ANNOTATION, PROBE_DOMAIN_SUFFIX};

use super::service_info::{service_names, ServiceInfo};
use crate::crd::{
    HttpIngressPath, HttpIngressRuleValue, HttpProxy, Ingress, IngressBackendSplit, IngressRule,
    IngressSpec,
};

/// Name of the endpoint-probe child of an Ingress
pub fn probe_ingress_name(parent: &str) -> String {
    child_name(&format!("{}--", parent), "ep")
}

/// Synthetic host routed to `service` by the probe child of `parent`
pub fn probe_host(service: &str, parent: &str, namespace: &str) -> String {
    format!("{}.{}.{}.{}", service, parent, namespace, PROBE_DOMAIN_SUFFIX)
}

/// Build the endpoint-probe child of `ing`.
///
/// `previous` is the stale-generation HTTPProxy set being replaced. Its
/// backends are probed too, since they keep serving until the new
/// generation takes over.
pub fn make_endpoint_probe_ingress(
    cfg: &ContourConfig,
    ing: &Ingress,
    previous: Option<&[HttpProxy]>,
) -> Ingress {
    let name = ing.name_any();
    let namespace = ing.namespace().unwrap_or_default();

    let mut services = service_names(ing);
    for proxy in previous.unwrap_or_default() {
        widen_with_proxy(cfg, &mut services, proxy);
    }

    let (parent, ns) = (name.as_str(), namespace.as_str());
    let rules = services
        .iter()
        .flat_map(|(service, info)| {
            info.visibilities.iter().map(move |visibility| IngressRule {
                hosts: vec![probe_host(service, parent, ns)],
                visibility: *visibility,
                http: Some(HttpIngressRuleValue {
                    paths: vec![HttpIngressPath {
                        rewrite_host: info.rewrite_host.clone(),
                        splits: vec![IngressBackendSplit {
                            service_name: service.clone(),
                            service_namespace: ns.to_string(),
                            service_port: info.port.clone(),
                            percent: 100,
                            append_headers: BTreeMap::new(),
                        }],
                        ..Default::default()
                    }],
                }),
            })
        })
        .collect();

    let mut annotations = ing.annotations().clone();
    annotations.insert(ENDPOINTS_PROBE_ANNOTATION.to_string(), "true".to_string());

    let mut child = Ingress::new(
        &probe_ingress_name(&name),
        IngressSpec {
            rules,
            ..Default::default()
        },
    );
    child.metadata.namespace = Some(namespace);
    child.metadata.labels = ing.metadata.labels.clone();
    child.metadata.annotations = Some(annotations);
    child.metadata.owner_references = controller_owner_refs(ing);
    child
}

/// Add the backends of a stale HTTPProxy to the inventory
fn widen_with_proxy(
    cfg: &ContourConfig,
    services: &mut BTreeMap<String, ServiceInfo>,
    proxy: &HttpProxy,
) {
    let visibility = proxy
        .annotations()
        .get(CLASS_KEY)
        .map(|class| cfg.visibility_for_class(class))
        .unwrap_or_default();

    for service in proxy.spec.routes.iter().flat_map(|r| &r.services) {
        services
            .entry(service.name.clone())
            .or_insert_with(|| ServiceInfo {
                port: IntOrString::Int(service.port),
                visibilities: BTreeSet::new(),
                rewrite_host: None,
                has_path_prefix: false,
            })
            .visibilities
            .insert(visibility);
    }
}
