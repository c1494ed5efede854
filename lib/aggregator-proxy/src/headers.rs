//! Forwarding headers: the caller's external context and identity as seen by the backend

use crate::ProxyError;
use aggregator_core::UserInfo;
use http::request::Parts;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use tracing::warn;

pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_URI: HeaderName = HeaderName::from_static("x-forwarded-uri");
/// Deployment dependent; tests check its presence, not its value
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_REMOTE_USER: HeaderName = HeaderName::from_static("x-remote-user");
pub const X_REMOTE_GROUP: HeaderName = HeaderName::from_static("x-remote-group");
pub const X_REMOTE_EXTRA_PREFIX: &str = "x-remote-extra-";

/// Scheme the caller used to reach the gateway, attached as a request
/// extension by the listener that accepted the connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundScheme {
    Http,
    /// The gateway terminated TLS for this request
    Https,
}

impl InboundScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundScheme::Http => "http",
            InboundScheme::Https => "https",
        }
    }
}

/// Per-request forwarding context derived from the inbound request and its identity
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardedContext {
    /// Original path and query, exactly as received
    pub uri: String,
    pub scheme: String,
    pub host: Option<String>,
    pub user: UserInfo,
}

impl ForwardedContext {
    pub fn from_request(parts: &Parts, user: UserInfo) -> Self {
        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let scheme = match parts.extensions.get::<InboundScheme>() {
            Some(scheme) => scheme.as_str().to_string(),
            None => parts.uri.scheme_str().unwrap_or("http").to_string(),
        };

        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()));

        Self {
            uri,
            scheme,
            host,
            user,
        }
    }

    /// Replace any identity headers in `headers` with this context's forwarding headers
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), ProxyError> {
        strip_identity_headers(headers);

        headers.insert(X_FORWARDED_PROTO, header_value(&X_FORWARDED_PROTO, &self.scheme)?);
        headers.insert(X_FORWARDED_URI, header_value(&X_FORWARDED_URI, &self.uri)?);
        match &self.host {
            Some(host) => {
                headers.insert(X_FORWARDED_HOST, header_value(&X_FORWARDED_HOST, host)?);
            }
            None => {
                headers.remove(X_FORWARDED_HOST);
            }
        }

        headers.insert(X_REMOTE_USER, header_value(&X_REMOTE_USER, &self.user.name)?);
        for group in &self.user.groups {
            headers.append(X_REMOTE_GROUP, header_value(&X_REMOTE_GROUP, group)?);
        }

        for (key, values) in &self.user.extra {
            let name = format!("{}{}", X_REMOTE_EXTRA_PREFIX, key.to_lowercase());
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                warn!(key = %key, "Skipping user extra that is not a valid header name");
                continue;
            };
            for value in values {
                headers.append(name.clone(), header_value(&name, value)?);
            }
        }

        Ok(())
    }
}

fn header_value(name: &HeaderName, value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value).map_err(|e| ProxyError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Remove caller-supplied identity headers so they cannot be spoofed
pub fn strip_identity_headers(headers: &mut HeaderMap) {
    headers.remove(X_REMOTE_USER);
    headers.remove(X_REMOTE_GROUP);

    let extras: Vec<HeaderName> = headers
        .keys()
        .filter(|k| k.as_str().starts_with(X_REMOTE_EXTRA_PREFIX))
        .cloned()
        .collect();
    for name in extras {
        headers.remove(name);
    }
}

/// Remove hop-by-hop headers, including any the `Connection` header names
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    let fixed: Vec<HeaderName> = headers
        .keys()
        .filter(|k| is_hop_by_hop_header(k.as_str()))
        .cloned()
        .collect();

    for name in named.into_iter().chain(fixed) {
        headers.remove(name);
    }
}

/// Check if header is hop-by-hop (should not be forwarded)
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(builder: http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    fn values(headers: &HeaderMap, name: &str) -> Vec<String> {
        headers
            .get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_context_from_request() {
        let mut parts = parts(
            http::Request::get("/apis/foo/v1/bars?limit=10").header(HOST, "gateway.example.com"),
        );
        parts.extensions.insert(InboundScheme::Https);

        let context = ForwardedContext::from_request(&parts, UserInfo::new("username"));
        assert_eq!(context.uri, "/apis/foo/v1/bars?limit=10");
        assert_eq!(context.scheme, "https");
        assert_eq!(context.host.as_deref(), Some("gateway.example.com"));
    }

    #[test]
    fn test_context_scheme_falls_back_to_uri() {
        let parts = parts(http::Request::get("http://gateway.local/request/path"));
        let context = ForwardedContext::from_request(&parts, UserInfo::new("username"));
        assert_eq!(context.scheme, "http");
        assert_eq!(context.uri, "/request/path");
        assert_eq!(context.host.as_deref(), Some("gateway.local"));
    }

    #[test]
    fn test_apply_sets_identity_in_order() {
        let user = UserInfo::new("username").with_groups(["one", "two"]);
        let context = ForwardedContext {
            uri: "/request/path".to_string(),
            scheme: "https".to_string(),
            host: Some("gateway".to_string()),
            user,
        };

        let mut headers = HeaderMap::new();
        context.apply(&mut headers).unwrap();

        assert_eq!(values(&headers, "x-forwarded-proto"), vec!["https"]);
        assert_eq!(values(&headers, "x-forwarded-uri"), vec!["/request/path"]);
        assert_eq!(values(&headers, "x-forwarded-host"), vec!["gateway"]);
        assert_eq!(values(&headers, "x-remote-user"), vec!["username"]);
        assert_eq!(values(&headers, "x-remote-group"), vec!["one", "two"]);
    }

    #[test]
    fn test_apply_replaces_spoofed_identity() {
        let mut headers = HeaderMap::new();
        headers.insert("x-remote-user", HeaderValue::from_static("mallory"));
        headers.append("x-remote-group", HeaderValue::from_static("system:masters"));
        headers.insert("x-remote-extra-scopes", HeaderValue::from_static("all"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let context = ForwardedContext {
            uri: "/".to_string(),
            scheme: "https".to_string(),
            host: None,
            user: UserInfo::new("alice"),
        };
        context.apply(&mut headers).unwrap();

        assert_eq!(values(&headers, "x-remote-user"), vec!["alice"]);
        assert!(values(&headers, "x-remote-group").is_empty());
        assert!(headers.get("x-remote-extra-scopes").is_none());
        assert!(headers.get("x-forwarded-host").is_none());
        assert_eq!(values(&headers, "accept"), vec!["application/json"]);
    }

    #[test]
    fn test_apply_user_extra() {
        let user = UserInfo::new("alice")
            .with_extra("Scopes", ["read", "write"])
            .with_extra("bad key", ["x"]);
        let context = ForwardedContext {
            uri: "/".to_string(),
            scheme: "https".to_string(),
            host: None,
            user,
        };

        let mut headers = HeaderMap::new();
        context.apply(&mut headers).unwrap();
        assert_eq!(values(&headers, "x-remote-extra-scopes"), vec!["read", "write"]);
        assert_eq!(headers.keys().filter(|k| k.as_str().starts_with("x-remote-extra-")).count(), 1);
    }

    #[test]
    fn test_apply_rejects_unencodable_value() {
        let context = ForwardedContext {
            uri: "/".to_string(),
            scheme: "https".to_string(),
            host: None,
            user: UserInfo::new("line\nbreak"),
        };
        let err = context.apply(&mut HeaderMap::new()).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidHeader { .. }));
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("keep-alive"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("authorization"));
    }

    #[test]
    fn test_strip_hop_by_hop_honours_connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-custom-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-custom-hop", HeaderValue::from_static("1"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.append("accept", HeaderValue::from_static("text/plain"));
        headers.append("accept", HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("upgrade").is_none());
        assert_eq!(values(&headers, "accept"), vec!["text/plain", "application/json"]);
    }
}
