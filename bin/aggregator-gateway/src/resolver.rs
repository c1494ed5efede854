//! Identity asserted by an authenticating front proxy
//!
//! The gateway itself performs no authentication. It must only be reachable
//! through a front proxy that authenticates callers and overwrites these
//! headers; anyone who can reach the gateway directly can claim any identity.

use crate::config::IdentityHeaders;
use aggregator_core::{IdentityResolver, RequestInfoFactory, Resolution, UserInfo};
use anyhow::{Context, Result};
use async_trait::async_trait;
use hyper::header::{HeaderMap, HeaderName};
use http::request::Parts;
use tracing::debug;

pub struct RequestHeaderResolver {
    user_headers: Vec<HeaderName>,
    group_headers: Vec<HeaderName>,
    /// Lowercased, as header names are
    extra_prefixes: Vec<String>,
    request_info: RequestInfoFactory,
}

impl RequestHeaderResolver {
    pub fn new(config: &IdentityHeaders) -> Result<Self> {
        Ok(Self {
            user_headers: header_names(&config.user_headers)?,
            group_headers: header_names(&config.group_headers)?,
            extra_prefixes: config
                .extra_header_prefixes
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            request_info: RequestInfoFactory::default(),
        })
    }

    fn user(&self, headers: &HeaderMap) -> Option<UserInfo> {
        let name = self
            .user_headers
            .iter()
            .filter_map(|h| headers.get(h))
            .filter_map(|v| v.to_str().ok())
            .find(|v| !v.is_empty())?;

        let groups: Vec<&str> = self
            .group_headers
            .iter()
            .flat_map(|h| headers.get_all(h))
            .filter_map(|v| v.to_str().ok())
            .collect();

        let mut user = UserInfo::new(name).with_groups(groups);
        for (header, value) in headers {
            let Some(key) = self
                .extra_prefixes
                .iter()
                .find_map(|prefix| header.as_str().strip_prefix(prefix.as_str()))
            else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            if let Ok(value) = value.to_str() {
                user.extra
                    .entry(key.to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
        Some(user)
    }
}

#[async_trait]
impl IdentityResolver for RequestHeaderResolver {
    async fn resolve(&self, parts: &Parts) -> Resolution {
        let request_info = match self.request_info.new_request_info(
            parts.method.as_str(),
            parts.uri.path(),
            parts.uri.query(),
        ) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(path = %parts.uri.path(), "No request info: {}", e);
                None
            }
        };

        Resolution {
            user: self.user(&parts.headers),
            request_info,
        }
    }
}

fn header_names(names: &[String]) -> Result<Vec<HeaderName>> {
    names
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid identity header name: {}", name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(builder: http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    fn resolver() -> RequestHeaderResolver {
        RequestHeaderResolver::new(&IdentityHeaders::default()).unwrap()
    }

    #[tokio::test]
    async fn test_resolves_user_groups_and_extra() {
        let parts = parts(
            http::Request::get("/apis/wardle.example.com/v1alpha1/namespaces/ns/flunders")
                .header("X-Remote-User", "alice")
                .header("X-Remote-Group", "one")
                .header("X-Remote-Group", "two")
                .header("X-Remote-Extra-Scopes", "read")
                .header("X-Remote-Extra-Scopes", "write"),
        );

        let resolution = resolver().resolve(&parts).await;
        let user = resolution.user.unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(user.groups, vec!["one", "two"]);
        assert_eq!(user.extra["scopes"], vec!["read", "write"]);

        let info = resolution.request_info.unwrap();
        assert_eq!(info.verb, "list");
        assert_eq!(info.namespace, "ns");
        assert_eq!(info.resource, "flunders");
    }

    #[tokio::test]
    async fn test_missing_or_empty_user_header() {
        let resolution = resolver()
            .resolve(&parts(http::Request::get("/apis/foo/v1/bars")))
            .await;
        assert!(resolution.user.is_none());

        let resolution = resolver()
            .resolve(&parts(
                http::Request::get("/apis/foo/v1/bars").header("X-Remote-User", ""),
            ))
            .await;
        assert!(resolution.user.is_none());
    }

    #[tokio::test]
    async fn test_custom_user_header() {
        let config = IdentityHeaders {
            user_headers: vec!["X-Authenticated-User".to_string(), "X-Remote-User".to_string()],
            ..Default::default()
        };
        let resolver = RequestHeaderResolver::new(&config).unwrap();
        let parts = parts(
            http::Request::get("/")
                .header("X-Remote-User", "fallback")
                .header("X-Authenticated-User", "primary"),
        );

        let user = resolver.resolve(&parts).await.user.unwrap();
        assert_eq!(user.name, "primary");
    }

    #[test]
    fn test_invalid_header_name() {
        let config = IdentityHeaders {
            user_headers: vec!["bad header".to_string()],
            ..Default::default()
        };
        assert!(RequestHeaderResolver::new(&config).is_err());
    }
}
