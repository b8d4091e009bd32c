//! Contour HTTPProxy CRD
//!
//! Only the fields the controller writes or reads back are modeled. Contour
//! owns the schema; the CRD generated here is used for tests and docs only.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `status.currentStatus` reported by Contour for an accepted HTTPProxy
pub const PROXY_STATUS_VALID: &str = "valid";

/// HTTPProxy routes one virtual host to weighted backend services.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "projectcontour.io",
    version = "v1",
    kind = "HTTPProxy",
    root = "HttpProxy",
    derive = "PartialEq",
    plural = "httpproxies",
    shortname = "proxy",
    namespaced,
    status = "HttpProxyStatus",
    printcolumn = r#"{"name":"FQDN","type":"string","jsonPath":".spec.virtualhost.fqdn"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.currentStatus"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxySpec {
    /// Root virtual host served by this proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtualhost: Option<VirtualHost>,

    /// Routes, matched in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// Virtual host of an HTTPProxy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHost {
    /// Fully qualified domain name
    pub fqdn: String,

    /// TLS termination; plain HTTP only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<VirtualHostTls>,

    /// CORS policy for the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors_policy: Option<CorsPolicy>,

    /// External authorization server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationServer>,
}

/// TLS termination settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHostTls {
    /// Certificate secret as `namespace/name`
    pub secret_name: String,
}

/// CORS policy applied to a virtual host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorsPolicy {
    /// Whether credentials may be sent
    #[serde(default)]
    pub allow_credentials: bool,
    /// Allowed origins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_origin: Vec<String>,
    /// Allowed methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_methods: Vec<String>,
    /// Allowed request headers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_headers: Vec<String>,
    /// Response headers exposed to the browser
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose_headers: Vec<String>,
    /// Duration literal for preflight caching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
}

/// Authorization server reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationServer {
    /// ExtensionService that authorizes requests
    pub extension_ref: ExtensionServiceReference,
}

/// Reference to a Contour ExtensionService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ExtensionServiceReference {
    /// ExtensionService name
    pub name: String,
    /// Defaults to the proxy's namespace when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A route of an HTTPProxy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Conditions that must all match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MatchCondition>,

    /// Weighted upstream services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<RouteService>,

    /// Allow websocket upgrades
    #[serde(default)]
    pub enable_websockets: bool,

    /// Serve this route over plain HTTP as well
    #[serde(default)]
    pub permit_insecure: bool,

    /// Response and idle timeouts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_policy: Option<TimeoutPolicy>,

    /// Retry settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Headers set on requests before the split
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers_policy: Option<HeadersPolicy>,
}

/// A single route match condition; exactly one field is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MatchCondition {
    /// Path prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Header match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderMatchCondition>,
}

impl MatchCondition {
    /// Condition matching a path prefix
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            header: None,
        }
    }

    /// Condition matching a header value exactly
    pub fn header_exact(name: impl Into<String>, exact: impl Into<String>) -> Self {
        Self {
            prefix: None,
            header: Some(HeaderMatchCondition {
                name: name.into(),
                exact: Some(exact.into()),
            }),
        }
    }
}

/// Header match condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HeaderMatchCondition {
    /// Header name
    pub name: String,
    /// Value the header must equal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
}

/// Upstream service of a route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteService {
    /// Kubernetes Service name
    pub name: String,
    /// Service port number
    pub port: i32,

    /// Upstream protocol: `h2c`, `h2` or `tls`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Relative traffic weight
    #[serde(default)]
    pub weight: i64,

    /// Headers set on requests sent to this service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers_policy: Option<HeadersPolicy>,

    /// Upstream TLS validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<UpstreamValidation>,
}

/// Upstream certificate validation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamValidation {
    /// CA secret as `namespace/name`
    pub ca_secret: String,
    /// Expected subject name of the upstream certificate
    pub subject_name: String,
    /// All accepted subject names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_names: Vec<String>,
}

/// Route timeouts; values are `infinity` or duration literals
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TimeoutPolicy {
    /// Time to wait for a full response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Idle time before the stream is closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle: Option<String>,
}

/// Route retry settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub count: i64,
    /// Timeout of each attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<String>,
    /// Envoy retry-on conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_on: Vec<String>,
}

/// Request header rewrite policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HeadersPolicy {
    /// Headers to set, sorted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<HeaderValue>,
}

/// A header name and value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HeaderValue {
    /// Header name
    pub name: String,
    /// Header value
    pub value: String,
}

/// Status reported by Contour
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxyStatus {
    /// `valid`, `invalid` or `orphaned`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl HttpProxy {
    /// Whether Contour has accepted this proxy
    pub fn is_valid(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.current_status.as_deref())
            == Some(PROXY_STATUS_VALID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn kind_and_plural_match_contour() {
        assert_eq!(HttpProxy::kind(&()), "HTTPProxy");
        assert_eq!(HttpProxy::plural(&()), "httpproxies");
        assert_eq!(HttpProxy::api_version(&()), "projectcontour.io/v1");
    }

    #[test]
    fn proxy_with_status_parses() {
        let yaml = r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: hello-contour-external-hello.example.com
  namespace: default
spec:
  virtualhost:
    fqdn: hello.example.com
    tls:
      secretName: default/cert
  routes:
  - conditions:
    - prefix: /
    - header:
        name: K-Network-Hash
        exact: override
    enableWebsockets: true
    requestHeadersPolicy: {}
    services:
    - name: hello-00001
      port: 80
      protocol: h2c
      weight: 100
status:
  currentStatus: valid
  description: valid HTTPProxy
"#;
        let proxy: HttpProxy = serde_yaml::from_str(yaml).unwrap();
        assert!(proxy.is_valid());

        let route = &proxy.spec.routes[0];
        assert_eq!(route.conditions[0], MatchCondition::prefix("/"));
        assert_eq!(
            route.conditions[1],
            MatchCondition::header_exact("K-Network-Hash", "override")
        );
        assert_eq!(route.request_headers_policy, Some(HeadersPolicy::default()));
        assert_eq!(route.services[0].protocol.as_deref(), Some("h2c"));
    }

    #[test]
    fn proxy_without_status_is_not_valid() {
        let proxy = HttpProxy::new("p", HttpProxySpec::default());
        assert!(!proxy.is_valid());
    }
}
