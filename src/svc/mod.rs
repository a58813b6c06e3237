//! # Services module
//!
//! This module provide services to interact with kubernetes, the operator
//! configuration and its telemetry.
pub mod cfg;
pub mod crd;
pub mod k8s;
pub mod telemetry;
