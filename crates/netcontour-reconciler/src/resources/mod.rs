//! Pure synthesis of the objects the reconciler writes

mod httpproxy;
mod probe_ingress;
mod service_info;

pub use httpproxy::{
    has_routable_rule, make_http_proxies, WireProtocol, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_ON,
};
pub use probe_ingress::{make_endpoint_probe_ingress, probe_host, probe_ingress_name};
pub use service_info::{service_names, ServiceInfo};
