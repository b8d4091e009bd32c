//! Custom Resource Definitions consumed and produced by the controller
//!
//! `Ingress` is the routing intent written by the serving layer. `HttpProxy`
//! is the Contour object the controller synthesizes from it.

mod httpproxy;
mod ingress;
mod types;

pub use httpproxy::{
    AuthorizationServer, CorsPolicy, ExtensionServiceReference, HeaderMatchCondition,
    HeaderValue, HeadersPolicy, HttpProxy, HttpProxySpec, HttpProxyStatus, MatchCondition,
    RetryPolicy, Route, RouteService, TimeoutPolicy, UpstreamValidation, VirtualHost,
    VirtualHostTls, PROXY_STATUS_VALID,
};
pub use ingress::{
    HeaderMatch, HttpIngressPath, HttpIngressRuleValue, HttpOption, HttpRetry, Ingress,
    IngressBackendSplit, IngressRule, IngressSpec, IngressStatus, IngressTls, IngressVisibility,
    LoadBalancerIngressStatus, LoadBalancerStatus, CONDITION_LOAD_BALANCER_READY,
    CONDITION_NETWORK_CONFIGURED, CONDITION_READY,
};
pub use types::{get_condition, set_condition, Condition, ConditionStatus};
