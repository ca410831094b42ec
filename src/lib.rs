//! clusterforge: resumable provisioning of a GitOps-managed Kubernetes
//! platform on a cloud provider.
//!
//! The [`controller`] runs an ordered list of stages against a cluster
//! record kept in a [`store`]. Every external system sits behind a trait so
//! the orchestrator can be driven entirely by in-memory fakes.

pub mod cli;
pub mod config;
pub mod controller;
pub mod dns;
pub mod gitops;
pub mod infra;
pub mod objectstore;
pub mod provider;
pub mod store;
pub mod telemetry;
