//! Controller configuration loaded from the `config-contour` and
//! `config-network` ConfigMaps
//!
//! A [`ContourConfig`] is an immutable snapshot. The [`ConfigStore`] swaps the
//! snapshot when a ConfigMap changes; each reconcile takes one `Arc` at entry
//! and keeps it for the whole pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use crate::crd::{CorsPolicy, IngressVisibility};
use crate::{Error, Result};

/// Name of the ConfigMap holding Contour settings
pub const CONTOUR_CONFIG_NAME: &str = "config-contour";

/// Name of the ConfigMap holding shared networking settings
pub const NETWORK_CONFIG_NAME: &str = "config-network";

/// Key mapping each visibility to a Contour class and Envoy service
pub const VISIBILITY_KEY: &str = "visibility";

/// Key naming the fallback TLS secret for external hosts
pub const DEFAULT_TLS_SECRET_KEY: &str = "default-tls-secret";

/// Key for the route response timeout
pub const TIMEOUT_POLICY_RESPONSE_KEY: &str = "timeout-policy-response";

/// Key for the route idle timeout
pub const TIMEOUT_POLICY_IDLE_KEY: &str = "timeout-policy-idle";

/// Key for the CORS policy applied to external hosts
pub const CORS_POLICY_KEY: &str = "cors-policy";

/// `config-network` key switching on encryption between proxy and backends
pub const SYSTEM_INTERNAL_TLS_KEY: &str = "system-internal-tls";

/// Timeout value that disables the timeout
pub const TIMEOUT_INFINITY: &str = "infinity";

/// Default cluster DNS domain
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Default namespace of the serving control plane
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "knative-serving";

/// Immutable configuration snapshot used by one reconcile
#[derive(Clone, Debug, PartialEq)]
pub struct ContourConfig {
    /// Contour ingress class serving each visibility
    pub visibility_classes: BTreeMap<IngressVisibility, String>,
    /// Envoy services (`namespace/name`) serving each visibility
    pub visibility_keys: BTreeMap<IngressVisibility, BTreeSet<String>>,
    /// Fallback certificate (`namespace/name`) for external hosts without TLS
    pub default_tls_secret: Option<String>,
    /// Response timeout applied when a path sets none
    pub timeout_policy_response: String,
    /// Idle timeout applied to every route
    pub timeout_policy_idle: String,
    /// CORS policy applied to external virtual hosts
    pub cors_policy: Option<CorsPolicy>,
    /// Whether traffic from the proxy to backends is encrypted
    pub internal_encryption: bool,
    /// Cluster DNS domain
    pub cluster_domain: String,
    /// Namespace of the serving control plane
    pub system_namespace: String,
}

impl Default for ContourConfig {
    fn default() -> Self {
        Self {
            visibility_classes: BTreeMap::from([
                (IngressVisibility::ExternalIP, "contour-external".to_string()),
                (IngressVisibility::ClusterLocal, "contour-internal".to_string()),
            ]),
            visibility_keys: BTreeMap::from([
                (
                    IngressVisibility::ExternalIP,
                    BTreeSet::from(["contour-external/envoy".to_string()]),
                ),
                (
                    IngressVisibility::ClusterLocal,
                    BTreeSet::from(["contour-internal/envoy".to_string()]),
                ),
            ]),
            default_tls_secret: None,
            timeout_policy_response: TIMEOUT_INFINITY.to_string(),
            timeout_policy_idle: TIMEOUT_INFINITY.to_string(),
            cors_policy: None,
            internal_encryption: false,
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VisibilityValue {
    class: String,
    service: String,
}

impl ContourConfig {
    /// Defaults with the given cluster domain and system namespace
    pub fn for_cluster(cluster_domain: impl Into<String>, system_namespace: impl Into<String>) -> Self {
        Self {
            cluster_domain: cluster_domain.into(),
            system_namespace: system_namespace.into(),
            ..Self::default()
        }
    }

    /// Parse the `config-contour` data on top of `self`.
    ///
    /// Keys that are absent fall back to their defaults, so removing a key
    /// from the ConfigMap restores the default behavior.
    pub fn with_contour_data(&self, data: &BTreeMap<String, String>) -> Result<Self> {
        let defaults = Self::for_cluster(&self.cluster_domain, &self.system_namespace);
        let mut next = Self {
            internal_encryption: self.internal_encryption,
            ..defaults
        };

        if let Some(raw) = data.get(DEFAULT_TLS_SECRET_KEY) {
            split_namespaced_name(DEFAULT_TLS_SECRET_KEY, raw)?;
            next.default_tls_secret = Some(raw.trim().to_string());
        }
        if let Some(raw) = data.get(TIMEOUT_POLICY_RESPONSE_KEY) {
            next.timeout_policy_response = parse_timeout(TIMEOUT_POLICY_RESPONSE_KEY, raw)?;
        }
        if let Some(raw) = data.get(TIMEOUT_POLICY_IDLE_KEY) {
            next.timeout_policy_idle = parse_timeout(TIMEOUT_POLICY_IDLE_KEY, raw)?;
        }
        if let Some(raw) = data.get(CORS_POLICY_KEY) {
            next.cors_policy = Some(parse_cors_policy(raw)?);
        }
        if let Some(raw) = data.get(VISIBILITY_KEY) {
            let (classes, keys) = parse_visibility(raw)?;
            next.visibility_classes = classes;
            next.visibility_keys = keys;
        }

        Ok(next)
    }

    /// Apply the `config-network` data on top of `self`
    pub fn with_network_data(&self, data: &BTreeMap<String, String>) -> Self {
        let internal_encryption = data
            .get(SYSTEM_INTERNAL_TLS_KEY)
            .map(|v| v.trim().eq_ignore_ascii_case("enabled"))
            .unwrap_or(false);
        Self {
            internal_encryption,
            ..self.clone()
        }
    }

    /// Contour class for a visibility; empty when unconfigured
    pub fn class_for(&self, visibility: IngressVisibility) -> &str {
        self.visibility_classes
            .get(&visibility)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Visibility served by a Contour class, ExternalIP when none matches
    pub fn visibility_for_class(&self, class: &str) -> IngressVisibility {
        self.visibility_classes
            .iter()
            .find(|(_, c)| c.as_str() == class)
            .map(|(vis, _)| *vis)
            .unwrap_or(IngressVisibility::ExternalIP)
    }
}

/// Split a `namespace/name` key, rejecting anything else
pub fn split_namespaced_name<'a>(key: &str, raw: &'a str) -> Result<(&'a str, &'a str)> {
    match raw.trim().split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        _ => Err(Error::config(
            key,
            format!("expected namespace/name, got {:?}", raw),
        )),
    }
}

fn parse_timeout(key: &str, raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw == TIMEOUT_INFINITY {
        return Ok(raw.to_string());
    }
    validate_duration(raw)
        .map(|_| raw.to_string())
        .map_err(|msg| Error::config(key, msg))
}

fn parse_cors_policy(raw: &str) -> Result<CorsPolicy> {
    let policy: CorsPolicy = serde_yaml::from_str(raw)
        .map_err(|e| Error::config(CORS_POLICY_KEY, e.to_string()))?;
    if let Some(max_age) = &policy.max_age {
        validate_duration(max_age).map_err(|msg| Error::config(CORS_POLICY_KEY, msg))?;
    }
    Ok(policy)
}

type VisibilityTables = (
    BTreeMap<IngressVisibility, String>,
    BTreeMap<IngressVisibility, BTreeSet<String>>,
);

fn parse_visibility(raw: &str) -> Result<VisibilityTables> {
    let entries: BTreeMap<String, VisibilityValue> =
        serde_yaml::from_str(raw).map_err(|e| Error::config(VISIBILITY_KEY, e.to_string()))?;

    let mut classes = BTreeMap::new();
    let mut keys = BTreeMap::new();
    for (name, value) in &entries {
        let visibility = IngressVisibility::ALL
            .into_iter()
            .find(|v| v.as_str() == name)
            .ok_or_else(|| {
                Error::config(VISIBILITY_KEY, format!("unrecognized visibility: {:?}", name))
            })?;
        split_namespaced_name(VISIBILITY_KEY, &value.service)?;
        classes.insert(visibility, value.class.clone());
        keys.insert(visibility, BTreeSet::from([value.service.trim().to_string()]));
    }

    for visibility in IngressVisibility::ALL {
        if !classes.contains_key(&visibility) {
            return Err(Error::config(
                VISIBILITY_KEY,
                format!("visibility must contain {:?} with class and service", visibility.as_str()),
            ));
        }
    }

    Ok((classes, keys))
}

/// Validate a duration literal such as `15s`, `1h30m` or `500ms`.
///
/// Accepts an optional sign, then one or more `<number><unit>` pairs where
/// the number may carry a fraction and the unit is one of `ns`, `us`, `µs`,
/// `ms`, `s`, `m`, `h`. A bare `0` is also accepted.
pub fn validate_duration(raw: &str) -> std::result::Result<(), String> {
    let invalid = || format!("invalid duration {:?}", raw);

    let s = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    if s == "0" {
        return Ok(());
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {:?}", raw))?;
        let number = &rest[..digits];
        if number.is_empty() || number == "." || number.matches('.').count() > 1 {
            return Err(invalid());
        }
        rest = &rest[digits..];

        // two-letter units first so "ms" is not read as "m"
        let unit_len = ["ns", "us", "µs", "ms", "s", "m", "h"]
            .iter()
            .find(|unit| rest.starts_with(*unit))
            .map(|unit| unit.len())
            .ok_or_else(|| format!("unknown unit in duration {:?}", raw))?;
        rest = &rest[unit_len..];
    }
    Ok(())
}

/// Holder of the current configuration snapshot
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<ContourConfig>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(ContourConfig::default())
    }
}

impl ConfigStore {
    /// Create a store holding the given snapshot
    pub fn new(initial: ContourConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// The current snapshot
    pub fn current(&self) -> Arc<ContourConfig> {
        Arc::clone(&self.current.read())
    }

    /// Replace the snapshot with one built from new `config-contour` data.
    ///
    /// On a parse error the previous snapshot stays in place.
    pub fn apply_contour_data(&self, data: &BTreeMap<String, String>) -> Result<()> {
        let mut guard = self.current.write();
        let next = guard.with_contour_data(data)?;
        if next != **guard {
            info!(
                response_timeout = %next.timeout_policy_response,
                idle_timeout = %next.timeout_policy_idle,
                "Updated contour configuration"
            );
            *guard = Arc::new(next);
        }
        Ok(())
    }

    /// Replace the snapshot with one built from new `config-network` data
    pub fn apply_network_data(&self, data: &BTreeMap<String, String>) {
        let mut guard = self.current.write();
        let next = guard.with_network_data(data);
        if next != **guard {
            info!(
                internal_encryption = next.internal_encryption,
                "Updated network configuration"
            );
            *guard = Arc::new(next);
        }
    }
}
