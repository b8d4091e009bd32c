//! Naming, hashing and selector helpers shared by the synthesizers and the
//! reconciler

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::{Result, DOMAIN_HASH_LABEL, GENERATION_LABEL, PARENT_LABEL};

/// Longest name Kubernetes accepts for a label-compatible object name
pub const MAX_NAME_LENGTH: usize = 63;

/// Length of a hex SHA-1 digest
const SHA1_HEX_LENGTH: usize = 40;

/// Deterministic child object name `parent + suffix`.
///
/// Names longer than [`MAX_NAME_LENGTH`] keep a prefix of the combined name
/// and end with the SHA-1 of the full combined name, so distinct inputs
/// never collapse onto the same truncated name.
pub fn child_name(parent: &str, suffix: &str) -> String {
    let combined = format!("{}{}", parent, suffix);
    if combined.len() <= MAX_NAME_LENGTH {
        return combined;
    }

    let digest = hex_sha1(combined.as_bytes());
    let mut head = MAX_NAME_LENGTH - SHA1_HEX_LENGTH;
    while !combined.is_char_boundary(head) {
        head -= 1;
    }
    format!("{}{}", &combined[..head], digest)
}

/// Hex SHA-1 of a host, used as the `domainHash` label
pub fn domain_hash(host: &str) -> String {
    hex_sha1(host.as_bytes())
}

/// Hex SHA-256 of the JSON form of `spec`.
///
/// Any change to the spec changes the fingerprint, which makes the data
/// plane's route for the new generation distinguishable from the old one.
pub fn spec_fingerprint<T: Serialize>(spec: &T) -> Result<String> {
    let bytes = serde_json::to_vec(spec)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn hex_sha1(bytes: &[u8]) -> String {
    format!("{:x}", Sha1::digest(bytes))
}

/// Cluster DNS name of a Service
pub fn service_hostname(name: &str, namespace: &str, cluster_domain: &str) -> String {
    format!("{}.{}.svc.{}", name, namespace, cluster_domain)
}

/// Whether `host` is the full cluster DNS name of some Service
pub fn is_cluster_service_host(host: &str, cluster_domain: &str) -> bool {
    host.strip_suffix(cluster_domain)
        .and_then(|h| h.strip_suffix(".svc."))
        .and_then(|h| h.split_once('.'))
        .map(|(name, ns)| !name.is_empty() && !ns.is_empty() && !ns.contains('.'))
        .unwrap_or(false)
}

/// All names a host is reachable under, sorted.
///
/// `name.ns.svc.<domain>` also answers to `name.ns` and `name.ns.svc`;
/// any other host is returned as-is.
pub fn expanded_hosts(host: &str, cluster_domain: &str) -> Vec<String> {
    if !is_cluster_service_host(host, cluster_domain) {
        return vec![host.to_string()];
    }
    let short = host
        .strip_suffix(cluster_domain)
        .and_then(|h| h.strip_suffix(".svc."))
        .unwrap_or(host);
    let mut hosts = vec![
        short.to_string(),
        format!("{}.svc", short),
        host.to_string(),
    ];
    hosts.sort();
    hosts
}

/// Controller owner reference pointing at `owner`; `None` without a uid
pub fn controller_owner_refs<K>(owner: &K) -> Option<Vec<OwnerReference>>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).map(|r| vec![r])
}

/// Selector for every HTTPProxy of a parent Ingress
pub fn parent_selector(parent: &str) -> String {
    format!("{}={}", PARENT_LABEL, parent)
}

/// Selector for the HTTPProxy of a parent serving one virtual host
pub fn domain_selector(parent: &str, domain_hash: &str) -> String {
    format!("{}={},{}={}", PARENT_LABEL, parent, DOMAIN_HASH_LABEL, domain_hash)
}

/// Selector for the HTTPProxies of a parent built from `generation`
pub fn generation_selector(parent: &str, generation: i64) -> String {
    format!("{}={},{}={}", PARENT_LABEL, parent, GENERATION_LABEL, generation)
}

/// Selector for the HTTPProxies of a parent built from any other generation
pub fn stale_generation_selector(parent: &str, generation: i64) -> String {
    format!("{}={},{}!={}", PARENT_LABEL, parent, GENERATION_LABEL, generation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_child_names_are_concatenated() {
        assert_eq!(child_name("hello--", "ep"), "hello--ep");
        assert_eq!(
            child_name("hello-contour-external-", "hello.example.com"),
            "hello-contour-external-hello.example.com"
        );
    }

    #[test]
    fn long_child_names_are_truncated_with_digest() {
        let parent = "a-very-long-ingress-name-that-keeps-going-and-going-";
        let a = child_name(parent, "first.example.com");
        let b = child_name(parent, "second.example.com");
        assert_eq!(a.len(), MAX_NAME_LENGTH);
        assert_eq!(b.len(), MAX_NAME_LENGTH);
        assert_ne!(a, b);
        assert!(a.starts_with("a-very-long-ingress-nam"));
        assert_eq!(a, child_name(parent, "first.example.com"));
    }

    #[test]
    fn domain_hash_is_stable_sha1() {
        assert_eq!(
            domain_hash("example.com"),
            "0caaf24ab1a0c33440c06afe99df986365b0781f"
        );
    }

    #[test]
    fn fingerprint_changes_with_spec() {
        let a = spec_fingerprint(&serde_json::json!({"rules": [1]})).unwrap();
        let b = spec_fingerprint(&serde_json::json!({"rules": [2]})).unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(a, spec_fingerprint(&serde_json::json!({"rules": [1]})).unwrap());
    }

    #[test]
    fn cluster_service_hosts_expand() {
        assert_eq!(
            expanded_hosts("hello.default.svc.cluster.local", "cluster.local"),
            vec![
                "hello.default".to_string(),
                "hello.default.svc".to_string(),
                "hello.default.svc.cluster.local".to_string(),
            ]
        );
        assert_eq!(
            expanded_hosts("hello.example.com", "cluster.local"),
            vec!["hello.example.com".to_string()]
        );
        assert!(!is_cluster_service_host("svc.cluster.local", "cluster.local"));
        assert!(!is_cluster_service_host("a.b.c.svc.cluster.local", "cluster.local"));
    }

    #[test]
    fn selectors_scope_by_parent() {
        assert_eq!(
            stale_generation_selector("hello", 3),
            "contour.networking.knative.dev/parent=hello,contour.networking.knative.dev/generation!=3"
        );
        assert_eq!(
            domain_selector("hello", "abc"),
            "contour.networking.knative.dev/parent=hello,contour.networking.knative.dev/domainHash=abc"
        );
        assert_eq!(parent_selector("hello"), "contour.networking.knative.dev/parent=hello");
    }
}
