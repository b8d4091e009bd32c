//! Fixtures and an in-memory cluster for reconciler tests

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointSubset, Endpoints, ObjectReference, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use parking_lot::Mutex;

use netcontour_common::{
    EventPublisher, CONTOUR_INGRESS_CLASS, H2C_PORT_NAME, INGRESS_CLASS_ANNOTATION,
};

use crate::controller::IngressKubeClient;
use crate::crd::{
    HttpIngressPath, HttpIngressRuleValue, HttpProxy, HttpProxyStatus, Ingress,
    IngressBackendSplit, IngressRule, IngressSpec, IngressStatus, IngressVisibility,
    PROXY_STATUS_VALID,
};
use crate::Result;

// =============================================================================
// Fixtures
// =============================================================================

/// Contour-class Ingress at generation 1 with a uid, so children get owner refs
pub(crate) fn ingress(namespace: &str, name: &str, rules: Vec<IngressRule>) -> Ingress {
    let mut ing = Ingress::new(
        name,
        IngressSpec {
            rules,
            ..Default::default()
        },
    );
    ing.metadata.namespace = Some(namespace.to_string());
    ing.metadata.generation = Some(1);
    ing.metadata.uid = Some(format!("uid-{}-{}", namespace, name));
    ing.metadata.annotations = Some(BTreeMap::from([(
        INGRESS_CLASS_ANNOTATION.to_string(),
        CONTOUR_INGRESS_CLASS.to_string(),
    )]));
    ing
}

pub(crate) fn rule(
    hosts: &[&str],
    visibility: IngressVisibility,
    paths: Vec<HttpIngressPath>,
) -> IngressRule {
    IngressRule {
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        visibility,
        http: Some(HttpIngressRuleValue { paths }),
    }
}

pub(crate) fn path(splits: Vec<IngressBackendSplit>) -> HttpIngressPath {
    HttpIngressPath {
        splits,
        ..Default::default()
    }
}

/// Split to a service in the fixture namespace `ns`
pub(crate) fn split(service: &str, port: i32, percent: i64) -> IngressBackendSplit {
    IngressBackendSplit {
        service_name: service.to_string(),
        service_namespace: "ns".to_string(),
        service_port: IntOrString::Int(port),
        percent,
        append_headers: BTreeMap::new(),
    }
}

pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("fake api error {}", code),
        reason: "Fake".to_string(),
        code,
    })
}

// =============================================================================
// In-memory cluster
// =============================================================================

type Key = (String, String);

fn key_of<K: ResourceExt>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Counts of mutating calls made against a [`FakeCluster`]
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Calls {
    pub ingress_creates: usize,
    pub ingress_updates: usize,
    pub ingress_deletes: usize,
    pub status_patches: usize,
    pub proxy_creates: usize,
    pub proxy_updates: usize,
    pub proxy_deletes: usize,
}

#[derive(Default)]
struct State {
    ingresses: BTreeMap<Key, Ingress>,
    proxies: BTreeMap<Key, HttpProxy>,
    services: BTreeMap<Key, Service>,
    endpoints: BTreeMap<Key, Endpoints>,
    calls: Calls,
    next_uid: u64,
}

/// Object store standing in for the API server.
///
/// Written HTTPProxies are immediately reported valid, as a healthy Contour
/// would. Ingress updates that change the spec bump the generation.
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_ingress(&self, ing: Ingress) {
        let mut state = self.state.lock();
        state.ingresses.insert(key_of(&ing), ing);
    }

    pub fn insert_proxy(&self, proxy: HttpProxy) {
        let mut state = self.state.lock();
        state.proxies.insert(key_of(&proxy), proxy);
    }

    /// Add a Service and an Endpoints object with one ready address
    pub fn add_ready_service(&self, namespace: &str, name: &str, h2c: bool) {
        self.add_service(namespace, name, h2c);
        let endpoints = Endpoints {
            metadata: meta(namespace, name),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        };
        self.state.lock().endpoints.insert(key(namespace, name), endpoints);
    }

    /// Add a Service without Endpoints
    pub fn add_service(&self, namespace: &str, name: &str, h2c: bool) {
        let service = Service {
            metadata: meta(namespace, name),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some(if h2c { H2C_PORT_NAME } else { "http" }.to_string()),
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.state.lock().services.insert(key(namespace, name), service);
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.state.lock().ingresses.get(&key(namespace, name)).cloned()
    }

    /// Replace the spec of a stored Ingress as a user edit would
    pub fn edit_spec(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut IngressSpec)) {
        let mut state = self.state.lock();
        if let Some(ing) = state.ingresses.get_mut(&key(namespace, name)) {
            edit(&mut ing.spec);
            ing.metadata.generation = Some(ing.metadata.generation.unwrap_or_default() + 1);
        }
    }

    pub fn proxies(&self, namespace: &str) -> Vec<HttpProxy> {
        self.state
            .lock()
            .proxies
            .values()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls = Calls::default();
    }
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Match `k=v` and `k!=v` terms; `!=` also matches objects without the label
fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            labels.get(k).map(String::as_str) != Some(v)
        } else if let Some((k, v)) = term.split_once('=') {
            labels.get(k).map(String::as_str) == Some(v)
        } else {
            labels.contains_key(term)
        }
    })
}

fn valid_status() -> Option<HttpProxyStatus> {
    Some(HttpProxyStatus {
        current_status: Some(PROXY_STATUS_VALID.to_string()),
        description: Some("Valid HTTPProxy".to_string()),
    })
}

#[async_trait]
impl IngressKubeClient for FakeCluster {
    async fn get_ingress(&self, name: &str, namespace: &str) -> Result<Option<Ingress>> {
        Ok(self.ingress(namespace, name))
    }

    async fn create_ingress(&self, ing: &Ingress) -> Result<Ingress> {
        let mut state = self.state.lock();
        let k = key_of(ing);
        if state.ingresses.contains_key(&k) {
            return Err(api_error(409).into());
        }
        state.next_uid += 1;
        let mut created = ing.clone();
        created.metadata.generation = Some(1);
        created.metadata.uid = Some(format!("fake-uid-{}", state.next_uid));
        created.status = None;
        state.calls.ingress_creates += 1;
        state.ingresses.insert(k, created.clone());
        Ok(created)
    }

    async fn update_ingress(&self, ing: &Ingress) -> Result<Ingress> {
        let mut state = self.state.lock();
        let k = key_of(ing);
        let Some(current) = state.ingresses.get(&k).cloned() else {
            return Err(api_error(404).into());
        };
        let mut updated = ing.clone();
        updated.status = current.status.clone();
        updated.metadata.generation = if current.spec == ing.spec {
            current.metadata.generation
        } else {
            Some(current.metadata.generation.unwrap_or_default() + 1)
        };
        state.calls.ingress_updates += 1;
        state.ingresses.insert(k, updated.clone());
        Ok(updated)
    }

    async fn delete_ingress(&self, name: &str, namespace: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.ingress_deletes += 1;
        let Some(removed) = state.ingresses.remove(&key(namespace, name)) else {
            return Ok(());
        };
        // Garbage-collect dependents the way the API server does
        if let Some(uid) = removed.metadata.uid {
            state.proxies.retain(|_, p| {
                !p.owner_references()
                    .iter()
                    .any(|owner| owner.uid == uid)
            });
        }
        Ok(())
    }

    async fn patch_ingress_status(
        &self,
        name: &str,
        namespace: &str,
        status: &IngressStatus,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.status_patches += 1;
        match state.ingresses.get_mut(&key(namespace, name)) {
            Some(ing) => {
                ing.status = Some(status.clone());
                Ok(())
            }
            None => Err(api_error(404).into()),
        }
    }

    async fn list_proxies(&self, namespace: &str, selector: &str) -> Result<Vec<HttpProxy>> {
        Ok(self
            .proxies(namespace)
            .into_iter()
            .filter(|p| selector_matches(selector, p.labels()))
            .collect())
    }

    async fn create_proxy(&self, proxy: &HttpProxy) -> Result<HttpProxy> {
        let mut state = self.state.lock();
        let k = key_of(proxy);
        if state.proxies.contains_key(&k) {
            return Err(api_error(409).into());
        }
        let mut created = proxy.clone();
        created.status = valid_status();
        state.calls.proxy_creates += 1;
        state.proxies.insert(k, created.clone());
        Ok(created)
    }

    async fn update_proxy(&self, proxy: &HttpProxy) -> Result<HttpProxy> {
        let mut state = self.state.lock();
        let k = key_of(proxy);
        if !state.proxies.contains_key(&k) {
            return Err(api_error(404).into());
        }
        let mut updated = proxy.clone();
        updated.status = valid_status();
        state.calls.proxy_updates += 1;
        state.proxies.insert(k, updated.clone());
        Ok(updated)
    }

    async fn delete_proxies(&self, namespace: &str, selector: &str) -> Result<()> {
        let mut state = self.state.lock();
        let doomed: Vec<Key> = state
            .proxies
            .iter()
            .filter(|(k, p)| k.0 == namespace && selector_matches(selector, p.labels()))
            .map(|(k, _)| k.clone())
            .collect();
        state.calls.proxy_deletes += doomed.len();
        for k in doomed {
            state.proxies.remove(&k);
        }
        Ok(())
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>> {
        Ok(self.state.lock().services.get(&key(namespace, name)).cloned())
    }

    async fn get_endpoints(&self, name: &str, namespace: &str) -> Result<Option<Endpoints>> {
        Ok(self.state.lock().endpoints.get(&key(namespace, name)).cloned())
    }
}

// =============================================================================
// Events
// =============================================================================

/// Publisher that remembers the reason of every event
#[derive(Default)]
pub(crate) struct RecordingEventPublisher {
    reasons: Mutex<Vec<String>>,
}

impl RecordingEventPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.reasons.lock().push(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_like_the_api_server() {
        let labels = BTreeMap::from([
            ("parent".to_string(), "hello".to_string()),
            ("generation".to_string(), "2".to_string()),
        ]);
        assert!(selector_matches("parent=hello", &labels));
        assert!(selector_matches("parent=hello,generation!=1", &labels));
        assert!(!selector_matches("parent=hello,generation!=2", &labels));
        assert!(selector_matches("other!=x", &labels));
        assert!(!selector_matches("parent=bye", &labels));
    }

    #[tokio::test]
    async fn deleting_an_ingress_collects_its_proxies() {
        let cluster = FakeCluster::new();
        let owner = ingress("ns", "hello--ep", vec![]);
        cluster.insert_ingress(owner.clone());

        let mut owned = HttpProxy::new("owned", Default::default());
        owned.metadata.namespace = Some("ns".to_string());
        owned.metadata.owner_references =
            netcontour_common::kube_utils::controller_owner_refs(&owner);
        let mut other = HttpProxy::new("other", Default::default());
        other.metadata.namespace = Some("ns".to_string());
        cluster.insert_proxy(owned);
        cluster.insert_proxy(other);

        cluster.delete_ingress("hello--ep", "ns").await.unwrap();

        let left: Vec<String> = cluster.proxies("ns").iter().map(|p| p.name_any()).collect();
        assert_eq!(left, vec!["other"]);
        assert_eq!(cluster.calls().proxy_deletes, 0);
    }
}
