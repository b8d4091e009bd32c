//! Ingress rollout controller
//!
//! Each pass moves an Ingress one step through its rollout:
//!
//! 1. A new generation first gets an endpoint-probe child Ingress, which
//!    routes a synthetic host to every backend so Envoy learns their
//!    endpoints.
//! 2. Once the child is ready, the HTTPProxies for the new generation are
//!    written and every proxy of an older generation is deleted.
//! 3. Once Contour reports the new proxies valid, the load balancer status is
//!    published and the child is removed.
//!
//! Probe children run through the same pass, minus the gating and cleanup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use netcontour_common::config::{split_namespaced_name, VISIBILITY_KEY};
use netcontour_common::events::{actions, reasons, EventPublisher};
use netcontour_common::kube_utils::{
    domain_selector, parent_selector, service_hostname, stale_generation_selector,
};
use netcontour_common::{
    ConfigStore, ContourConfig, KubeEventPublisher, CONTOUR_INGRESS_CLASS, DOMAIN_HASH_LABEL,
    GENERATION_LABEL, H2C_PORT_NAME,
};
#[cfg(test)]
use netcontour_common::NoopEventPublisher;

use crate::crd::{
    HttpProxy, Ingress, IngressStatus, IngressVisibility, LoadBalancerIngressStatus,
};
use crate::prober::{ProxyStatusProber, StatusProber};
use crate::resources::{
    has_routable_rule, make_endpoint_probe_ingress, make_http_proxies, probe_ingress_name,
    service_names, WireProtocol,
};
use crate::{Error, Result};

/// Name the controller reports as, in events and field managers
pub const CONTROLLER_NAME: &str = "netcontour-controller";

/// Status reason while backends or the probe child have no ready endpoints
pub const REASON_ENDPOINTS_NOT_READY: &str = "EndpointsNotReady";

/// Status reason while a backend Service does not exist
pub const REASON_SERVICE_NOT_FOUND: &str = "ServiceNotFound";

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Object store operations the rollout needs
///
/// Lookups return `None` for objects that do not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IngressKubeClient: Send + Sync {
    /// Get an Ingress by name and namespace
    async fn get_ingress(&self, name: &str, namespace: &str) -> Result<Option<Ingress>>;

    /// Create an Ingress, returning the stored object
    async fn create_ingress(&self, ing: &Ingress) -> Result<Ingress>;

    /// Replace an Ingress, returning the stored object
    async fn update_ingress(&self, ing: &Ingress) -> Result<Ingress>;

    /// Delete an Ingress; a missing object is not an error
    async fn delete_ingress(&self, name: &str, namespace: &str) -> Result<()>;

    /// Patch the status of an Ingress
    async fn patch_ingress_status(
        &self,
        name: &str,
        namespace: &str,
        status: &IngressStatus,
    ) -> Result<()>;

    /// List HTTPProxies matching a label selector
    async fn list_proxies(&self, namespace: &str, selector: &str) -> Result<Vec<HttpProxy>>;

    /// Create an HTTPProxy, returning the stored object
    async fn create_proxy(&self, proxy: &HttpProxy) -> Result<HttpProxy>;

    /// Replace an HTTPProxy, returning the stored object
    async fn update_proxy(&self, proxy: &HttpProxy) -> Result<HttpProxy>;

    /// Delete every HTTPProxy matching a label selector
    async fn delete_proxies(&self, namespace: &str, selector: &str) -> Result<()>;

    /// Get a Service by name and namespace
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>>;

    /// Get the Endpoints of a Service by name and namespace
    async fn get_endpoints(&self, name: &str, namespace: &str) -> Result<Option<Endpoints>>;
}

/// [`IngressKubeClient`] talking to the API server
pub struct IngressKubeClientImpl {
    client: Client,
}

impl IngressKubeClientImpl {
    /// Create a new IngressKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl IngressKubeClient for IngressKubeClientImpl {
    async fn get_ingress(&self, name: &str, namespace: &str) -> Result<Option<Ingress>> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn create_ingress(&self, ing: &Ingress) -> Result<Ingress> {
        let namespace = ing.namespace().unwrap_or_default();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), ing).await?)
    }

    async fn update_ingress(&self, ing: &Ingress) -> Result<Ingress> {
        let namespace = ing.namespace().unwrap_or_default();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace(&ing.name_any(), &PostParams::default(), ing)
            .await?)
    }

    async fn delete_ingress(&self, name: &str, namespace: &str) -> Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_ingress_status(
        &self,
        name: &str,
        namespace: &str,
        status: &IngressStatus,
    ) -> Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(CONTROLLER_NAME),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn list_proxies(&self, namespace: &str, selector: &str) -> Result<Vec<HttpProxy>> {
        let api: Api<HttpProxy> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn create_proxy(&self, proxy: &HttpProxy) -> Result<HttpProxy> {
        let namespace = proxy.namespace().unwrap_or_default();
        let api: Api<HttpProxy> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), proxy).await?)
    }

    async fn update_proxy(&self, proxy: &HttpProxy) -> Result<HttpProxy> {
        let namespace = proxy.namespace().unwrap_or_default();
        let api: Api<HttpProxy> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace(&proxy.name_any(), &PostParams::default(), proxy)
            .await?)
    }

    async fn delete_proxies(&self, namespace: &str, selector: &str) -> Result<()> {
        let api: Api<HttpProxy> = Api::namespaced(self.client.clone(), namespace);
        api.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(selector),
        )
        .await?;
        Ok(())
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn get_endpoints(&self, name: &str, namespace: &str) -> Result<Option<Endpoints>> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for every reconcile
pub struct IngressContext {
    /// Object store
    pub kube: Arc<dyn IngressKubeClient>,
    /// Data-plane readiness
    pub prober: Arc<dyn StatusProber>,
    /// Live controller configuration
    pub config: Arc<ConfigStore>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
}

impl IngressContext {
    /// Create a new IngressContext with the given dependencies
    pub fn new(
        kube: Arc<dyn IngressKubeClient>,
        prober: Arc<dyn StatusProber>,
        config: Arc<ConfigStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            prober,
            config,
            events,
        }
    }

    /// Create a context backed by the API server
    pub fn from_client(client: Client, config: Arc<ConfigStore>) -> Self {
        let kube: Arc<dyn IngressKubeClient> =
            Arc::new(IngressKubeClientImpl::new(client.clone()));
        Self {
            prober: Arc::new(ProxyStatusProber::new(kube.clone())),
            kube,
            config,
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
        }
    }

    /// Create a context for testing with the default configuration
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn IngressKubeClient>) -> Self {
        Self {
            prober: Arc::new(ProxyStatusProber::new(kube.clone())),
            kube,
            config: Arc::new(ConfigStore::default()),
            events: Arc::new(NoopEventPublisher),
        }
    }
}

// =============================================================================
// Rollout state machine
// =============================================================================

/// Whether an Ingress is user intent or a synthetic probe child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileMode {
    /// User intent, gated on its probe child
    Parent,
    /// Endpoint-probe child, programmed directly
    ProbeChild,
}

impl ReconcileMode {
    /// Mode an Ingress is reconciled in
    pub fn of(ing: &Ingress) -> Self {
        if ing.is_probe_child() {
            Self::ProbeChild
        } else {
            Self::Parent
        }
    }
}

/// Where a reconcile pass left an Ingress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutState {
    /// Not ours, or being deleted
    Skipped,
    /// Waiting for the probe child to become ready
    AwaitingProbe,
    /// Waiting for a backend Service or its endpoints
    AwaitingEndpoints,
    /// Programmed and served by the data plane
    SteadyReady,
    /// Programmed, not yet served by the data plane
    SteadyNotReady,
}

impl RolloutState {
    /// When to look at the Ingress again
    pub fn action(self) -> Action {
        match self {
            Self::Skipped => Action::await_change(),
            Self::AwaitingProbe | Self::AwaitingEndpoints | Self::SteadyNotReady => {
                Action::requeue(Duration::from_secs(5))
            }
            Self::SteadyReady => Action::requeue(Duration::from_secs(60)),
        }
    }
}

/// Reconcile an Ingress or one of its probe children
#[instrument(skip(ing, ctx), fields(ingress = %ing.key()))]
pub async fn reconcile(ing: Arc<Ingress>, ctx: Arc<IngressContext>) -> Result<Action> {
    match reconcile_ingress(&ing, &ctx).await {
        Ok(state) => {
            debug!(?state, "reconciled ingress");
            Ok(state.action())
        }
        Err(e) => {
            ctx.events
                .publish(
                    &ing.object_ref(&()),
                    EventType::Warning,
                    reasons::RECONCILE_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            Err(e)
        }
    }
}

/// Error policy for the ingress controller
///
/// - Retryable errors (transient): requeue after 30 seconds
/// - Non-retryable errors (permanent): await an input change
pub fn error_policy(ing: Arc<Ingress>, error: &Error, _ctx: Arc<IngressContext>) -> Action {
    error!(
        ?error,
        ingress = %ing.key(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

async fn reconcile_ingress(ing: &Ingress, ctx: &IngressContext) -> Result<RolloutState> {
    if ing.ingress_class() != Some(CONTOUR_INGRESS_CLASS) {
        debug!(class = ?ing.ingress_class(), "ingress class not handled, skipping");
        return Ok(RolloutState::Skipped);
    }
    if ing.metadata.deletion_timestamp.is_some() {
        debug!("ingress is being deleted, skipping");
        return Ok(RolloutState::Skipped);
    }
    let namespace = ing.namespace().ok_or_else(|| {
        Error::validation_for_field(ing.key(), "metadata.namespace", "Ingress has no namespace")
    })?;

    let cfg = ctx.config.current();
    let observed = ing.status.clone().unwrap_or_default();
    let mut status = observed.clone();
    status.initialize_conditions();

    let rollout = Rollout {
        ing,
        name: ing.name_any(),
        namespace,
        generation: ing.metadata.generation.unwrap_or_default(),
        cfg: &cfg,
        ctx,
    };
    let result = rollout.run(&mut status).await;
    if result.is_ok() {
        status.observed_generation = ing.metadata.generation;
    }

    if status != observed {
        let patched = ctx
            .kube
            .patch_ingress_status(&rollout.name, &rollout.namespace, &status)
            .await;
        match (patched, &result) {
            (Err(e), Ok(_)) => return Err(e),
            (Err(e), Err(_)) => warn!(error = %e, "failed to persist status of failed reconcile"),
            (Ok(()), _) => {}
        }
    }
    result
}

/// One reconcile pass over an Ingress
struct Rollout<'a> {
    ing: &'a Ingress,
    name: String,
    namespace: String,
    generation: i64,
    cfg: &'a ContourConfig,
    ctx: &'a IngressContext,
}

impl Rollout<'_> {
    async fn run(&self, status: &mut IngressStatus) -> Result<RolloutState> {
        let mode = ReconcileMode::of(self.ing);
        if mode == ReconcileMode::Parent {
            if let Some(waiting) = self.gate_on_probe(status).await? {
                return Ok(waiting);
            }
        }
        self.program(mode, status).await
    }

    /// Hold a new generation back until its probe child is ready.
    ///
    /// Returns `None` once the generation may be programmed.
    async fn gate_on_probe(&self, status: &mut IngressStatus) -> Result<Option<RolloutState>> {
        // Nothing for Envoy to serve, so nothing to warm up
        if !has_routable_rule(self.ing) {
            return Ok(None);
        }
        let existing = self
            .ctx
            .kube
            .list_proxies(&self.namespace, &parent_selector(&self.name))
            .await?;
        let current = self.generation.to_string();
        if existing
            .iter()
            .any(|p| p.labels().get(GENERATION_LABEL) == Some(&current))
        {
            return Ok(None);
        }

        let previous = (!existing.is_empty()).then_some(existing.as_slice());
        let desired = make_endpoint_probe_ingress(self.cfg, self.ing, previous);
        let probe = self.upsert_probe(desired).await?;
        if probe.is_ready_at_current_generation() {
            debug!(probe = %probe.name_any(), "endpoint probe ready");
            return Ok(None);
        }

        debug!(probe = %probe.name_any(), "waiting for endpoint probe");
        status.mark_ingress_not_ready(
            REASON_ENDPOINTS_NOT_READY,
            &format!("Waiting for endpoint probe {} to become ready", probe.name_any()),
        );
        Ok(Some(RolloutState::AwaitingProbe))
    }

    async fn upsert_probe(&self, desired: Ingress) -> Result<Ingress> {
        let probe_name = desired.name_any();
        let Some(existing) = self.ctx.kube.get_ingress(&probe_name, &self.namespace).await? else {
            let created = self.ctx.kube.create_ingress(&desired).await?;
            info!(probe = %probe_name, "created endpoint probe");
            self.publish(
                reasons::PROBE_CREATED,
                format!("Created endpoint probe {}", probe_name),
            )
            .await;
            return Ok(created);
        };

        if existing.spec == desired.spec
            && existing.metadata.labels == desired.metadata.labels
            && existing.metadata.annotations == desired.metadata.annotations
        {
            return Ok(existing);
        }

        let mut update = existing;
        update.spec = desired.spec;
        update.metadata.labels = desired.metadata.labels;
        update.metadata.annotations = desired.metadata.annotations;
        debug!(probe = %probe_name, "updating endpoint probe");
        self.ctx.kube.update_ingress(&update).await
    }

    /// Write the HTTPProxies of the current generation and report readiness
    async fn program(&self, mode: ReconcileMode, status: &mut IngressStatus) -> Result<RolloutState> {
        let mut protocols = BTreeMap::new();
        for service in service_names(self.ing).into_keys() {
            let Some(svc) = self.ctx.kube.get_service(&service, &self.namespace).await? else {
                debug!(%service, "backend service not found");
                status.mark_ingress_not_ready(
                    REASON_SERVICE_NOT_FOUND,
                    &format!("Waiting for Service {:?} to be created", service),
                );
                return Ok(RolloutState::AwaitingEndpoints);
            };

            let endpoints = self.ctx.kube.get_endpoints(&service, &self.namespace).await?;
            if !endpoints.as_ref().is_some_and(has_ready_addresses) {
                debug!(%service, "backend has no ready endpoints");
                status.mark_ingress_not_ready(
                    REASON_ENDPOINTS_NOT_READY,
                    &format!("Waiting for Endpoints {:?} to have ready addresses", service),
                );
                return Ok(RolloutState::AwaitingEndpoints);
            }

            if let Some(protocol) = wire_protocol(&svc, self.cfg.internal_encryption) {
                protocols.insert(service, protocol);
            }
        }

        let desired = make_http_proxies(self.cfg, self.ing, &protocols)?;
        for proxy in &desired {
            self.upsert_proxy(proxy).await?;
        }
        self.ctx
            .kube
            .delete_proxies(
                &self.namespace,
                &stale_generation_selector(&self.name, self.generation),
            )
            .await?;
        status.mark_network_configured();

        if !self.ctx.prober.is_ready(self.ing).await? {
            debug!(proxies = desired.len(), "HTTPProxies not yet served");
            status.mark_load_balancer_not_ready();
            return Ok(RolloutState::SteadyNotReady);
        }

        status.mark_load_balancer_ready(
            load_balancer_ingress(self.cfg, IngressVisibility::ExternalIP),
            load_balancer_ingress(self.cfg, IngressVisibility::ClusterLocal),
        );
        if mode == ReconcileMode::Parent {
            self.cleanup_probe().await?;
        }
        Ok(RolloutState::SteadyReady)
    }

    /// Create or update the proxy serving one virtual host
    async fn upsert_proxy(&self, desired: &HttpProxy) -> Result<()> {
        let hash = desired
            .labels()
            .get(DOMAIN_HASH_LABEL)
            .map(String::as_str)
            .unwrap_or_default();
        let existing = self
            .ctx
            .kube
            .list_proxies(&self.namespace, &domain_selector(&self.name, hash))
            .await?;

        let Some(current) = existing.into_iter().next() else {
            self.ctx.kube.create_proxy(desired).await?;
            debug!(proxy = %desired.name_any(), "created HTTPProxy");
            return Ok(());
        };

        if current.metadata.labels == desired.metadata.labels
            && current.metadata.annotations == desired.metadata.annotations
            && current.spec == desired.spec
        {
            return Ok(());
        }

        let mut update = current;
        update.metadata.labels = desired.metadata.labels.clone();
        update.metadata.annotations = desired.metadata.annotations.clone();
        update.spec = desired.spec.clone();
        self.ctx.kube.update_proxy(&update).await?;
        debug!(proxy = %update.name_any(), "updated HTTPProxy");
        Ok(())
    }

    async fn cleanup_probe(&self) -> Result<()> {
        let probe_name = probe_ingress_name(&self.name);
        if self
            .ctx
            .kube
            .get_ingress(&probe_name, &self.namespace)
            .await?
            .is_none()
        {
            return Ok(());
        }

        self.ctx.kube.delete_ingress(&probe_name, &self.namespace).await?;
        info!(probe = %probe_name, "removed endpoint probe");
        self.publish(
            reasons::PROBE_DELETED,
            format!("Removed endpoint probe {}", probe_name),
        )
        .await;
        Ok(())
    }

    async fn publish(&self, reason: &str, note: String) {
        self.ctx
            .events
            .publish(
                &self.ing.object_ref(&()),
                EventType::Normal,
                reason,
                actions::PROBE,
                Some(note),
            )
            .await;
    }
}

/// Protocol Envoy must speak to a backend Service
fn wire_protocol(service: &Service, internal_encryption: bool) -> Option<WireProtocol> {
    let h2c = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .is_some_and(|ports| {
            ports
                .iter()
                .any(|p| p.name.as_deref() == Some(H2C_PORT_NAME))
        });

    match (h2c, internal_encryption) {
        (true, false) => Some(WireProtocol::H2c),
        (true, true) => Some(WireProtocol::H2),
        (false, true) => Some(WireProtocol::Tls),
        (false, false) => None,
    }
}

fn has_ready_addresses(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()))
}

/// Load balancer entries for the envoy services of one visibility
fn load_balancer_ingress(
    cfg: &ContourConfig,
    visibility: IngressVisibility,
) -> Vec<LoadBalancerIngressStatus> {
    cfg.visibility_keys
        .get(&visibility)
        .into_iter()
        .flatten()
        .filter_map(|key| split_namespaced_name(VISIBILITY_KEY, key).ok())
        .map(|(namespace, name)| LoadBalancerIngressStatus {
            domain_internal: Some(service_hostname(name, namespace, &cfg.cluster_domain)),
        })
        .collect()
}
