//! Controller runner - builds the ingress controller and config watcher futures
//!
//! Each future runs until shutdown. The caller decides how to compose them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use netcontour_common::config::{CONTOUR_CONFIG_NAME, NETWORK_CONFIG_NAME};
use netcontour_common::crd::{HttpProxy, Ingress};
use netcontour_common::ConfigStore;
use netcontour_reconciler::controller::{error_policy, reconcile, IngressContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future, boxed so callers can hold a mixed set
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// ConfigMaps the controller takes its configuration from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    /// `config-contour`: visibility classes, timeouts, TLS and CORS
    Contour,
    /// `config-network`: internal encryption
    Network,
}

impl ConfigSource {
    /// Source a ConfigMap name feeds, if any
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            CONTOUR_CONFIG_NAME => Some(Self::Contour),
            NETWORK_CONFIG_NAME => Some(Self::Network),
            _ => None,
        }
    }
}

/// Apply a ConfigMap to the store.
///
/// Returns whether the store took the new data. A ConfigMap that fails to
/// parse is logged and leaves the previous snapshot in place.
pub fn apply_config_map(store: &ConfigStore, cm: &ConfigMap) -> bool {
    let name = cm.name_any();
    let Some(source) = ConfigSource::from_name(&name) else {
        return false;
    };
    let data = cm.data.clone().unwrap_or_default();

    match source {
        ConfigSource::Contour => match store.apply_contour_data(&data) {
            Ok(()) => true,
            Err(e) => {
                warn!(configmap = %name, error = %e, "rejected config, keeping previous snapshot");
                false
            }
        },
        ConfigSource::Network => {
            store.apply_network_data(&data);
            true
        }
    }
}

/// Read both ConfigMaps once, before any reconcile runs
pub async fn load_config(api: &Api<ConfigMap>, store: &ConfigStore) -> Result<(), kube::Error> {
    for name in [CONTOUR_CONFIG_NAME, NETWORK_CONFIG_NAME] {
        match api.get_opt(name).await? {
            Some(cm) => {
                apply_config_map(store, &cm);
            }
            None => info!(configmap = name, "config map not found, using defaults"),
        }
    }
    Ok(())
}

/// Build the Ingress controller and the config watcher feeding it
///
/// A config change requeues every Ingress, so the new snapshot reaches all
/// of them without waiting for their next drift check.
pub fn build_controllers(
    client: Client,
    config_maps: Api<ConfigMap>,
    config: Arc<ConfigStore>,
) -> Vec<ControllerFuture> {
    let (resync_tx, resync_rx) = mpsc::channel::<()>(1);
    let ctx = Arc::new(IngressContext::from_client(client.clone(), config.clone()));

    let ingresses: Api<Ingress> = Api::all(client.clone());
    let proxies: Api<HttpProxy> = Api::all(client);

    info!("- Ingress controller");
    let ingress_ctrl = Controller::new(
        ingresses.clone(),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns(proxies, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
    .owns(ingresses, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
    .reconcile_all_on(resync_rx)
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("Ingress"));

    info!("- config watcher");
    let config_watch = watch_config(config_maps, config, resync_tx);

    vec![Box::pin(ingress_ctrl), Box::pin(config_watch)]
}

async fn watch_config(api: Api<ConfigMap>, store: Arc<ConfigStore>, mut resync: mpsc::Sender<()>) {
    let stream = watcher::watcher(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff()
        .applied_objects();
    let mut stream = std::pin::pin!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(cm) => {
                if apply_config_map(&store, &cm) {
                    debug!(configmap = %cm.name_any(), "config applied, requeueing ingresses");
                    // A full channel already holds a pending resync
                    let _ = resync.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "config watch error"),
        }
    }
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("knative-serving".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn config_sources_are_named() {
        assert_eq!(ConfigSource::from_name("config-contour"), Some(ConfigSource::Contour));
        assert_eq!(ConfigSource::from_name("config-network"), Some(ConfigSource::Network));
        assert_eq!(ConfigSource::from_name("config-domain"), None);
    }

    /// Story: A valid config-contour update replaces the snapshot
    #[test]
    fn story_contour_config_is_applied() {
        let store = ConfigStore::default();
        let cm = config_map("config-contour", &[("timeout-policy-idle", "5m")]);

        assert!(apply_config_map(&store, &cm));
        assert_eq!(store.current().timeout_policy_idle, "5m");
    }

    /// Story: A malformed config-contour keeps the last good snapshot
    #[test]
    fn story_bad_contour_config_keeps_previous() {
        let store = ConfigStore::default();
        let good = config_map("config-contour", &[("timeout-policy-response", "30s")]);
        assert!(apply_config_map(&store, &good));

        let bad = config_map("config-contour", &[("timeout-policy-response", "soon")]);
        assert!(!apply_config_map(&store, &bad));
        assert_eq!(store.current().timeout_policy_response, "30s");
    }

    #[test]
    fn network_config_toggles_encryption() {
        let store = ConfigStore::default();
        let cm = config_map("config-network", &[("system-internal-tls", "Enabled")]);

        assert!(apply_config_map(&store, &cm));
        assert!(store.current().internal_encryption);
    }

    #[test]
    fn unrelated_config_maps_are_ignored() {
        let store = ConfigStore::default();
        let before = store.current();
        let cm = config_map("config-domain", &[("example.com", "")]);

        assert!(!apply_config_map(&store, &cm));
        assert_eq!(*store.current(), *before);
    }
}
