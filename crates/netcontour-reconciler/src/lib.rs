//! Rollout of Knative Ingresses onto Contour
//!
//! - **Resources**: pure synthesis of the service inventory, HTTPProxies and
//!   endpoint-probe Ingresses
//! - **Controller**: the rollout state machine driven by the kube-rs runtime
//! - **Prober**: data-plane readiness of a generation

pub mod controller;
pub mod prober;
pub mod resources;

#[cfg(test)]
mod testing;

pub(crate) use netcontour_common::{crd, Error, Result};
