//! Common types for netcontour: CRDs, configuration, errors, and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use config::{ConfigStore, ContourConfig};
pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation selecting which ingress implementation reconciles an Ingress
pub const INGRESS_CLASS_ANNOTATION: &str = "networking.knative.dev/ingress.class";

/// Ingress class value handled by this controller
pub const CONTOUR_INGRESS_CLASS: &str = "contour.ingress.networking.knative.dev";

/// Label carrying the name of the Ingress that owns an HTTPProxy
pub const PARENT_LABEL: &str = "contour.networking.knative.dev/parent";

/// Label carrying the Ingress generation an HTTPProxy was built from
pub const GENERATION_LABEL: &str = "contour.networking.knative.dev/generation";

/// Label carrying the fingerprint of an HTTPProxy's virtual host
pub const DOMAIN_HASH_LABEL: &str = "contour.networking.knative.dev/domainHash";

/// Label and annotation selecting the Contour instance that serves an HTTPProxy
pub const CLASS_KEY: &str = "projectcontour.io/ingress.class";

/// Annotation marking an Ingress as a synthetic endpoint-probe child
pub const ENDPOINTS_PROBE_ANNOTATION: &str = "contour.networking.knative.dev/endpoints-probe";

/// Annotation naming a Contour ExtensionService used for authorization
pub const EXTENSION_SERVICE_ANNOTATION: &str = "contour.knative.dev/extension-service";

/// Annotation naming the namespace of the authorization ExtensionService
pub const EXTENSION_SERVICE_NAMESPACE_ANNOTATION: &str =
    "contour.knative.dev/extension-service-namespace";

/// Domain suffix for the synthetic hosts of endpoint-probe Ingresses
pub const PROBE_DOMAIN_SUFFIX: &str = "net-contour.invalid";

/// Request header carrying the content fingerprint of the Ingress
pub const NETWORK_HASH_HEADER: &str = "K-Network-Hash";

/// Header value the readiness prober sends to address the probe route variant
pub const PROBE_HASH_SENTINEL: &str = "override";

/// Split header that identifies domain-mapping traffic
pub const ORIGINAL_HOST_HEADER: &str = "K-Original-Host";

/// Path prefix served by ACME HTTP-01 solvers
pub const HTTP_CHALLENGE_PATH: &str = "/.well-known/acme-challenge/";

/// Service port name that signals a cleartext HTTP/2 backend
pub const H2C_PORT_NAME: &str = "h2c";

/// Secret holding the CA used to validate internally encrypted upstreams
pub const ROUTING_CERT_SECRET: &str = "routing-serving-certs";

/// Subject name shared by every data-plane routing identity
pub const DATA_PLANE_ROUTING_SAN: &str = "kn-routing";

/// Subject name of the data-plane identity for a namespace
pub fn data_plane_user_san(namespace: &str) -> String {
    format!("kn-user-{}", namespace)
}
