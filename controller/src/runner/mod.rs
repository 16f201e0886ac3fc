//! ActRunner reconciliation: one runner, one execution pod.

pub mod controller;
pub mod pod;

pub use controller::{error_policy, reconcile, run, Context};
