//! Caller identity and the resolver seam used by the proxy handler

use crate::RequestInfo;
use http::request::Parts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Authenticated caller, as established by the authentication layer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Group memberships; order is preserved when forwarded
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extra<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }
}

/// Outcome of resolving an inbound request.
///
/// A missing `user` is a valid answer, not a resolver failure.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    pub user: Option<UserInfo>,
    pub request_info: Option<RequestInfo>,
}

/// Resolves the authenticated identity attached to an inbound request
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, parts: &Parts) -> Resolution;
}

/// Resolver that answers with the same identity for every request
#[derive(Clone, Debug, Default)]
pub struct StaticIdentityResolver {
    user: Option<UserInfo>,
}

impl StaticIdentityResolver {
    pub fn new(user: Option<UserInfo>) -> Self {
        Self { user }
    }

    pub fn anonymous() -> Self {
        Self { user: None }
    }
}

#[async_trait::async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, parts: &Parts) -> Resolution {
        let request_info = crate::RequestInfoFactory::default()
            .new_request_info(parts.method.as_str(), parts.uri.path(), parts.uri.query())
            .ok();
        Resolution {
            user: self.user.clone(),
            request_info,
        }
    }
}
