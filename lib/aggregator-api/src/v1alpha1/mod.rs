/// API version v1alpha1 for aggregation gateway CRDs

pub mod api_service;

pub use api_service::{APIService, APIServiceSpec, ApiError, ServiceReference};

/// API group for aggregation gateway resources
pub const API_GROUP: &str = "apiregistration.k8s.io";
/// API version for aggregation gateway resources
pub const API_VERSION: &str = "v1alpha1";
