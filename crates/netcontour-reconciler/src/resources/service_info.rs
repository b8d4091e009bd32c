//! Inventory of the backend services an Ingress routes to

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{Ingress, IngressVisibility};

/// What the reconciler needs to know about one backend service
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceInfo {
    /// Port of the first split that referenced the service
    pub port: IntOrString,
    /// Every visibility the service is reachable under
    pub visibilities: BTreeSet<IngressVisibility>,
    /// Host rewrite of the first path that referenced the service
    pub rewrite_host: Option<String>,
    /// Whether the first path that referenced the service had a prefix
    pub has_path_prefix: bool,
}

/// Collect the backend services of an Ingress, keyed by service name.
///
/// Visibilities are unioned across occurrences; everything else comes from
/// the first occurrence.
pub fn service_names(ing: &Ingress) -> BTreeMap<String, ServiceInfo> {
    let mut services: BTreeMap<String, ServiceInfo> = BTreeMap::new();
    for rule in &ing.spec.rules {
        let Some(http) = &rule.http else { continue };
        for path in &http.paths {
            for split in &path.splits {
                services
                    .entry(split.service_name.clone())
                    .or_insert_with(|| ServiceInfo {
                        port: split.service_port.clone(),
                        visibilities: BTreeSet::new(),
                        rewrite_host: path.rewrite_host.clone(),
                        has_path_prefix: path.path.as_deref().is_some_and(|p| !p.is_empty()),
                    })
                    .visibilities
                    .insert(rule.visibility);
            }
        }
    }
    services
}
