use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// APIService registers an in-cluster service as the backend for one
/// API group/version served through the gateway
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "apiregistration.k8s.io",
    version = "v1alpha1",
    kind = "APIService",
    plural = "apiservices",
    derive = "Default",
)]
#[serde(rename_all = "camelCase")]
pub struct APIServiceSpec {
    /// Backend service requests for this group/version are forwarded to
    pub service: ServiceReference,

    /// API group name, e.g. `wardle.example.com`
    pub group: String,

    /// API version, e.g. `v1alpha1`
    pub version: String,

    /// Skip TLS verification of the backend's serving certificate
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,

    /// PEM bundle of CAs trusted to sign the backend's serving certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    #[serde(default)]
    pub group_priority_minimum: i32,

    #[serde(default)]
    pub version_priority: i32,
}

/// Reference to a Kubernetes Service
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ServiceReference {
    /// Namespace of the Kubernetes Service
    pub namespace: String,

    /// Name of the Kubernetes Service
    pub name: String,

    /// Service port (defaults to 443)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Error, Debug, PartialEq)]
pub enum ApiError {
    #[error("spec.group must not be empty")]
    EmptyGroup,

    #[error("spec.version must not be empty")]
    EmptyVersion,

    #[error("spec.service.{0} must not be empty")]
    EmptyServiceField(&'static str),

    #[error("spec.insecureSkipTLSVerify and spec.caBundle are mutually exclusive")]
    ConflictingTrust,

    #[error("spec.service.port must not be 0")]
    InvalidPort,
}

const DEFAULT_SERVICE_PORT: u16 = 443;

impl APIServiceSpec {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.group.is_empty() {
            return Err(ApiError::EmptyGroup);
        }
        if self.version.is_empty() {
            return Err(ApiError::EmptyVersion);
        }
        if self.service.namespace.is_empty() {
            return Err(ApiError::EmptyServiceField("namespace"));
        }
        if self.service.name.is_empty() {
            return Err(ApiError::EmptyServiceField("name"));
        }
        if self.service.port == Some(0) {
            return Err(ApiError::InvalidPort);
        }
        if self.insecure_skip_tls_verify && self.ca_bundle().is_some() {
            return Err(ApiError::ConflictingTrust);
        }
        Ok(())
    }

    /// Name the gateway serves this registration under, `{version}.{group}`
    pub fn handler_name(&self) -> String {
        format!("{}.{}", self.version, self.group)
    }

    /// Cluster DNS address of the backend service
    pub fn service_host(&self) -> String {
        format!(
            "{}.{}.svc:{}",
            self.service.name,
            self.service.namespace,
            self.service.port.unwrap_or(DEFAULT_SERVICE_PORT)
        )
    }

    /// CA bundle, treating an empty or whitespace-only value as absent
    pub fn ca_bundle(&self) -> Option<&str> {
        self.ca_bundle
            .as_deref()
            .filter(|bundle| !bundle.trim().is_empty())
    }
}
