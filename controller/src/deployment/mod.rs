//! ActDeployment reconciliation: listener workload, identity and RBAC.

pub mod controller;
pub mod resources;

pub use controller::{error_policy, reconcile, run, Context};
