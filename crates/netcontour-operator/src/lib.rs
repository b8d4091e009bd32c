//! netcontour operator - wires the ingress reconciler into the kube-rs runtime

pub mod controller_runner;
