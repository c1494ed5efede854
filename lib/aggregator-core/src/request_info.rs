//! Request info: API group/version/resource and verb derived from a request path

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const SPECIAL_VERBS: &[&str] = &["proxy", "watch"];
const SPECIAL_VERBS_NO_SUBRESOURCES: &[&str] = &["proxy"];
const NAMESPACE_SUBRESOURCES: &[&str] = &["status", "finalize"];

/// Structured summary of an inbound request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    /// False for non-API paths such as `/healthz`
    pub is_resource_request: bool,
    pub path: String,
    /// Kubernetes-style verb (`get`, `list`, `watch`, `create`, ...) or the
    /// lowercased HTTP method for non-resource requests
    pub verb: String,
    pub api_prefix: String,
    pub api_group: String,
    pub api_version: String,
    pub namespace: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
    /// Path segments starting at the resource
    pub parts: Vec<String>,
}

/// Parses request paths of the form `/apis/{group}/{version}/...` and `/api/{version}/...`
#[derive(Clone, Debug)]
pub struct RequestInfoFactory {
    pub api_prefixes: BTreeSet<String>,
    /// Prefixes whose paths carry no group segment
    pub groupless_api_prefixes: BTreeSet<String>,
}

impl Default for RequestInfoFactory {
    fn default() -> Self {
        Self {
            api_prefixes: ["api", "apis"].into_iter().map(String::from).collect(),
            groupless_api_prefixes: ["api"].into_iter().map(String::from).collect(),
        }
    }
}

impl RequestInfoFactory {
    /// Build request info from a method, path and optional query string.
    ///
    /// Paths that are not API paths produce a non-resource request, not an error.
    pub fn new_request_info(&self, method: &str, path: &str, query: Option<&str>) -> Result<RequestInfo> {
        let mut info = RequestInfo {
            is_resource_request: false,
            path: path.to_string(),
            verb: method.to_lowercase(),
            ..Default::default()
        };

        let segments = split_path(path);
        if segments.len() < 3 {
            return Ok(info);
        }
        if !self.api_prefixes.contains(segments[0]) {
            return Ok(info);
        }
        info.api_prefix = segments[0].to_string();
        let mut current = &segments[1..];

        if !self.groupless_api_prefixes.contains(&info.api_prefix) {
            // prefix already consumed, so group + version + resource
            if current.len() < 3 {
                return Ok(info);
            }
            info.api_group = current[0].to_string();
            current = &current[1..];
        }

        info.is_resource_request = true;
        info.api_version = current[0].to_string();
        current = &current[1..];

        if SPECIAL_VERBS.contains(&current[0]) {
            if current.len() < 2 {
                return Err(CoreError::InvalidRequestPath(format!(
                    "unable to determine kind and namespace from {}",
                    path
                )));
            }
            info.verb = current[0].to_string();
            current = &current[1..];
        } else {
            info.verb = match method.to_uppercase().as_str() {
                "POST" => "create",
                "GET" | "HEAD" => "get",
                "PUT" => "update",
                "PATCH" => "patch",
                "DELETE" => "delete",
                _ => "",
            }
            .to_string();
        }

        if current[0] == "namespaces" && current.len() > 1 {
            info.namespace = current[1].to_string();
            if current.len() > 2 && !NAMESPACE_SUBRESOURCES.contains(&current[2]) {
                current = &current[2..];
            }
        }

        info.parts = current.iter().map(|s| s.to_string()).collect();
        if current.len() >= 3 && !SPECIAL_VERBS_NO_SUBRESOURCES.contains(&info.verb.as_str()) {
            info.subresource = current[2].to_string();
        }
        if current.len() >= 2 {
            info.name = current[1].to_string();
        }
        info.resource = current[0].to_string();

        if info.name.is_empty() && info.verb == "get" {
            info.verb = if is_watch(query) { "watch" } else { "list" }.to_string();
        }
        if info.name.is_empty() && info.verb == "delete" {
            info.verb = "deletecollection".to_string();
        }

        Ok(info)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('/').collect()
}

fn is_watch(query: Option<&str>) -> bool {
    query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(key, value)| key == "watch" && parse_bool(value))
}

/// Accepts the same spellings of true as the API server's query parsing
fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "TRUE" | "true" | "True")
}
