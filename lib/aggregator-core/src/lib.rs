//! Core data model for the aggregation gateway
//!
//! This library provides:
//! - Route configuration (backend destination + TLS trust policy) and its atomic store
//! - Caller identity and the resolver seam the authentication layer plugs into
//! - Request info parsing for API group/version/resource paths

pub mod error;
pub mod identity;
pub mod request_info;
pub mod route;

pub use error::{CoreError, Result};
pub use identity::{IdentityResolver, Resolution, StaticIdentityResolver, UserInfo};
pub use request_info::{RequestInfo, RequestInfoFactory};
pub use route::{Destination, RouteConfig, RouteStore, TrustPolicy};
