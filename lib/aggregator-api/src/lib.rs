//! Aggregation gateway API types and CRDs for Kubernetes integration
//!
//! This library defines the registration resource the gateway watches:
//! - APIService: binds an API group/version to an in-cluster backend service

pub mod v1alpha1;

pub use v1alpha1::{APIService, ApiError};
