//! Ingress CRD: the routing intent reconciled into Contour HTTPProxies
//!
//! The serving layer owns the spec. The controller only ever writes the
//! status subresource, plus the spec of the synthetic endpoint-probe
//! children it creates itself.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{get_condition, set_condition, Condition, ConditionStatus};
use crate::{ENDPOINTS_PROBE_ANNOTATION, INGRESS_CLASS_ANNOTATION};

/// Overall readiness of the Ingress
pub const CONDITION_READY: &str = "Ready";

/// HTTPProxies for the current generation have been programmed
pub const CONDITION_NETWORK_CONFIGURED: &str = "NetworkConfigured";

/// The data plane serves the current generation
pub const CONDITION_LOAD_BALANCER_READY: &str = "LoadBalancerReady";

/// Conditions that feed the Ready condition
const DEPENDENT_CONDITIONS: [&str; 2] = [CONDITION_LOAD_BALANCER_READY, CONDITION_NETWORK_CONFIGURED];

/// Ingress routes external or cluster-local hosts to backend services.
///
/// Example:
/// ```yaml
/// apiVersion: networking.internal.knative.dev/v1alpha1
/// kind: Ingress
/// metadata:
///   name: hello
///   namespace: default
///   annotations:
///     networking.knative.dev/ingress.class: contour.ingress.networking.knative.dev
/// spec:
///   httpOption: Redirected
///   rules:
///   - hosts: [hello.example.com]
///     visibility: ExternalIP
///     http:
///       paths:
///       - splits:
///         - serviceName: hello-00001
///           serviceNamespace: default
///           servicePort: 80
///           percent: 100
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.internal.knative.dev",
    version = "v1alpha1",
    kind = "Ingress",
    derive = "PartialEq",
    plural = "ingresses",
    shortname = "kingress",
    namespaced,
    status = "IngressStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// TLS configuration, matched to rules by host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTls>,

    /// Routing rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<IngressRule>,

    /// Plain HTTP handling on external hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_option: Option<HttpOption>,
}

/// How plain HTTP requests to external hosts are handled
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum HttpOption {
    /// Serve plain HTTP alongside HTTPS
    Enabled,
    /// Redirect plain HTTP to HTTPS
    Redirected,
}

/// Network reachability of a rule
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
    Hash,
)]
pub enum IngressVisibility {
    /// Reachable from outside the cluster
    #[default]
    ExternalIP,
    /// Reachable only from inside the cluster
    ClusterLocal,
}

impl IngressVisibility {
    /// All visibilities, in a stable order
    pub const ALL: [IngressVisibility; 2] =
        [IngressVisibility::ExternalIP, IngressVisibility::ClusterLocal];

    /// Wire name of the visibility
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalIP => "ExternalIP",
            Self::ClusterLocal => "ClusterLocal",
        }
    }
}

impl std::fmt::Display for IngressVisibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS secret covering a set of hosts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    /// Hosts served with this certificate
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Name of the certificate secret
    pub secret_name: String,
    /// Namespace of the certificate secret
    pub secret_namespace: String,
}

/// A set of hosts with shared visibility and paths
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    /// Hosts matched by this rule
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Reachability of the hosts
    #[serde(default)]
    pub visibility: IngressVisibility,
    /// HTTP paths; a rule without them contributes nothing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpIngressRuleValue>,
}

/// HTTP paths of a rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HttpIngressRuleValue {
    /// Paths, matched in order
    #[serde(default)]
    pub paths: Vec<HttpIngressPath>,
}

/// One routed path with its traffic splits
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressPath {
    /// Path prefix to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Request headers that must match exactly
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, HeaderMatch>,

    /// Host header sent upstream instead of the requested host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_host: Option<String>,

    /// Headers added to requests before the split
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_headers: BTreeMap<String, String>,

    /// Response timeout as a duration literal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Retry settings for this path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<HttpRetry>,

    /// Weighted backends
    #[serde(default)]
    pub splits: Vec<IngressBackendSplit>,
}

/// Exact header match
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HeaderMatch {
    /// Value the header must equal
    pub exact: String,
}

/// Retry settings for a path
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRetry {
    /// Maximum number of retries
    pub attempts: i64,
    /// Timeout of each attempt as a duration literal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<String>,
}

/// Weighted backend service of a path
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressBackendSplit {
    /// Backend service name
    pub service_name: String,
    /// Backend service namespace
    pub service_namespace: String,
    /// Backend service port
    pub service_port: IntOrString,
    /// Share of traffic in percent
    #[serde(default)]
    pub percent: i64,
    /// Headers added to requests routed to this split
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_headers: BTreeMap<String, String>,
}

/// Observed state of an Ingress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressStatus {
    /// Generation of the last successful reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Ready, NetworkConfigured and LoadBalancerReady
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Addresses serving ExternalIP rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_load_balancer: Option<LoadBalancerStatus>,

    /// Addresses serving ClusterLocal rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_load_balancer: Option<LoadBalancerStatus>,
}

/// Load balancer addresses of one visibility
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LoadBalancerStatus {
    /// Entry points
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<LoadBalancerIngressStatus>,
}

/// A single load balancer entry point
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerIngressStatus {
    /// Cluster-internal DNS name of the entry point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_internal: Option<String>,
}

impl IngressStatus {
    /// Ensure every condition exists, defaulting to Unknown
    pub fn initialize_conditions(&mut self) {
        for type_ in [
            CONDITION_LOAD_BALANCER_READY,
            CONDITION_NETWORK_CONFIGURED,
            CONDITION_READY,
        ] {
            if get_condition(&self.conditions, type_).is_none() {
                set_condition(&mut self.conditions, type_, ConditionStatus::Unknown, "", "");
            }
        }
    }

    /// Record that the HTTPProxies for the current generation are programmed
    pub fn mark_network_configured(&mut self) {
        set_condition(
            &mut self.conditions,
            CONDITION_NETWORK_CONFIGURED,
            ConditionStatus::True,
            "",
            "",
        );
        self.recompute_ready();
    }

    /// Record the load balancer addresses and mark the data plane ready
    pub fn mark_load_balancer_ready(
        &mut self,
        public: Vec<LoadBalancerIngressStatus>,
        private: Vec<LoadBalancerIngressStatus>,
    ) {
        self.public_load_balancer = Some(LoadBalancerStatus { ingress: public });
        self.private_load_balancer = Some(LoadBalancerStatus { ingress: private });
        set_condition(
            &mut self.conditions,
            CONDITION_LOAD_BALANCER_READY,
            ConditionStatus::True,
            "",
            "",
        );
        self.recompute_ready();
    }

    /// Record that the data plane has not picked up the current generation
    pub fn mark_load_balancer_not_ready(&mut self) {
        set_condition(
            &mut self.conditions,
            CONDITION_LOAD_BALANCER_READY,
            ConditionStatus::Unknown,
            "Uninitialized",
            "Waiting for load balancer to be ready",
        );
        self.recompute_ready();
    }

    /// Mark the Ingress as not ready because a dependency is missing.
    ///
    /// Both LoadBalancerReady and Ready turn False with the given reason.
    pub fn mark_ingress_not_ready(&mut self, reason: &str, message: &str) {
        set_condition(
            &mut self.conditions,
            CONDITION_LOAD_BALANCER_READY,
            ConditionStatus::False,
            reason,
            message,
        );
        set_condition(
            &mut self.conditions,
            CONDITION_READY,
            ConditionStatus::False,
            reason,
            message,
        );
    }

    /// Whether the Ready condition is True
    pub fn is_ready(&self) -> bool {
        self.condition_status(CONDITION_READY) == ConditionStatus::True
    }

    /// Status of a condition, Unknown when absent
    pub fn condition_status(&self, type_: &str) -> ConditionStatus {
        get_condition(&self.conditions, type_)
            .map(|c| c.status)
            .unwrap_or_default()
    }

    fn recompute_ready(&mut self) {
        let dependents: Vec<&Condition> = DEPENDENT_CONDITIONS
            .iter()
            .filter_map(|t| get_condition(&self.conditions, t))
            .collect();

        let (status, reason, message) =
            if let Some(failed) = dependents.iter().find(|c| c.status == ConditionStatus::False) {
                (ConditionStatus::False, failed.reason.clone(), failed.message.clone())
            } else if dependents.len() == DEPENDENT_CONDITIONS.len()
                && dependents.iter().all(|c| c.status == ConditionStatus::True)
            {
                (ConditionStatus::True, String::new(), String::new())
            } else {
                let pending = dependents
                    .iter()
                    .find(|c| c.status != ConditionStatus::True);
                (
                    ConditionStatus::Unknown,
                    pending.map(|c| c.reason.clone()).unwrap_or_default(),
                    pending.map(|c| c.message.clone()).unwrap_or_default(),
                )
            };

        set_condition(&mut self.conditions, CONDITION_READY, status, &reason, &message);
    }
}

impl Ingress {
    /// `namespace/name` key used in logs and errors
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Value of the ingress class annotation
    pub fn ingress_class(&self) -> Option<&str> {
        self.annotations()
            .get(INGRESS_CLASS_ANNOTATION)
            .map(String::as_str)
    }

    /// Whether this Ingress is a synthetic endpoint-probe child
    pub fn is_probe_child(&self) -> bool {
        self.annotations().contains_key(ENDPOINTS_PROBE_ANNOTATION)
    }

    /// Whether the Ingress has been reconciled to Ready at its current generation
    pub fn is_ready_at_current_generation(&self) -> bool {
        match &self.status {
            Some(status) => {
                status.is_ready() && status.observed_generation == self.metadata.generation
            }
            None => false,
        }
    }

    /// Flatten TLS entries to `host -> entry`; later entries win
    pub fn tls_entries(&self) -> BTreeMap<&str, &IngressTls> {
        let mut entries = BTreeMap::new();
        for tls in &self.spec.tls {
            for host in &tls.hosts {
                entries.insert(host.as_str(), tls);
            }
        }
        entries
    }
}
