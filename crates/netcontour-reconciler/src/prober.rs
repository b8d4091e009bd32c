//! Data-plane readiness of an Ingress generation
//!
//! Contour reports on each HTTPProxy whether it accepted the object. Once
//! every proxy of the current generation is `valid`, Envoy has the routes.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use netcontour_common::kube_utils::generation_selector;

use crate::controller::IngressKubeClient;
use crate::crd::{HttpProxy, Ingress};
use crate::resources::has_routable_rule;
use crate::{Error, Result};

/// Answers whether the data plane serves the current generation of an Ingress
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusProber: Send + Sync {
    /// Whether every route of `ing` at its current generation is live
    async fn is_ready(&self, ing: &Ingress) -> Result<bool>;
}

/// Prober backed by the status Contour writes on each HTTPProxy
pub struct ProxyStatusProber {
    kube: Arc<dyn IngressKubeClient>,
}

impl ProxyStatusProber {
    /// Create a prober reading proxies through `kube`
    pub fn new(kube: Arc<dyn IngressKubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl StatusProber for ProxyStatusProber {
    async fn is_ready(&self, ing: &Ingress) -> Result<bool> {
        if !has_routable_rule(ing) {
            return Ok(true);
        }

        let namespace = ing.namespace().ok_or_else(|| {
            Error::validation_for_field(ing.key(), "metadata.namespace", "Ingress has no namespace")
        })?;
        let generation = ing.metadata.generation.unwrap_or_default();
        let proxies = self
            .kube
            .list_proxies(&namespace, &generation_selector(&ing.name_any(), generation))
            .await?;

        let pending: Vec<String> = proxies
            .iter()
            .filter(|p| !p.is_valid())
            .map(HttpProxy::name_any)
            .collect();
        debug!(
            generation,
            proxies = proxies.len(),
            ?pending,
            "probed HTTPProxy status"
        );

        Ok(!proxies.is_empty() && pending.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockIngressKubeClient;
    use crate::crd::{HttpProxyStatus, IngressVisibility, PROXY_STATUS_VALID};
    use crate::testing::{api_error, ingress, path, rule, split};

    fn sample_ingress() -> Ingress {
        let mut ing = ingress(
            "ns",
            "hello",
            vec![rule(
                &["hello.example.com"],
                IngressVisibility::ExternalIP,
                vec![path(vec![split("hello-00001", 80, 100)])],
            )],
        );
        ing.metadata.generation = Some(4);
        ing
    }

    fn proxy(name: &str, status: Option<&str>) -> HttpProxy {
        let mut proxy = HttpProxy::new(name, Default::default());
        proxy.status = status.map(|s| HttpProxyStatus {
            current_status: Some(s.to_string()),
            description: None,
        });
        proxy
    }

    fn prober_listing(proxies: Vec<HttpProxy>) -> ProxyStatusProber {
        let mut mock = MockIngressKubeClient::new();
        mock.expect_list_proxies()
            .withf(|ns, selector| {
                ns == "ns"
                    && selector
                        == "contour.networking.knative.dev/parent=hello,contour.networking.knative.dev/generation=4"
            })
            .returning(move |_, _| Ok(proxies.clone()));
        ProxyStatusProber::new(Arc::new(mock))
    }

    /// Story: A generation is ready once Contour accepted all of its proxies
    #[tokio::test]
    async fn story_ready_when_every_proxy_is_valid() {
        let prober = prober_listing(vec![
            proxy("a", Some(PROXY_STATUS_VALID)),
            proxy("b", Some(PROXY_STATUS_VALID)),
        ]);
        assert!(prober.is_ready(&sample_ingress()).await.unwrap());
    }

    #[tokio::test]
    async fn pending_or_invalid_proxies_are_not_ready() {
        let prober = prober_listing(vec![proxy("a", Some(PROXY_STATUS_VALID)), proxy("b", None)]);
        assert!(!prober.is_ready(&sample_ingress()).await.unwrap());

        let prober = prober_listing(vec![proxy("a", Some("invalid"))]);
        assert!(!prober.is_ready(&sample_ingress()).await.unwrap());
    }

    /// Story: Proxies that were never written are not mistaken for ready ones
    #[tokio::test]
    async fn story_missing_proxies_are_not_ready() {
        let prober = prober_listing(vec![]);
        assert!(!prober.is_ready(&sample_ingress()).await.unwrap());
    }

    #[tokio::test]
    async fn ingress_without_routes_is_ready_without_listing() {
        let prober = ProxyStatusProber::new(Arc::new(MockIngressKubeClient::new()));
        let ing = ingress("ns", "empty", vec![]);
        assert!(prober.is_ready(&ing).await.unwrap());
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let mut mock = MockIngressKubeClient::new();
        mock.expect_list_proxies()
            .returning(|_, _| Err(api_error(503).into()));
        let prober = ProxyStatusProber::new(Arc::new(mock));

        let err = prober.is_ready(&sample_ingress()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
