//! APIService registrations and per group/version dispatch

use aggregator_api::APIService;
use aggregator_core::{IdentityResolver, TrustPolicy};
use aggregator_proxy::error::BoxError;
use aggregator_proxy::{ProxyBody, ProxyError, ProxyHandler, ProxyMetrics, RequestForwarder};
use anyhow::{anyhow, Result};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// API group and version served by one APIService
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    pub fn new(group: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
        }
    }

    /// Group/version a request path is served by: `/apis/{group}/{version}/...`.
    ///
    /// Legacy `/api/{version}` paths never match; the core group is not
    /// delegated through APIServices.
    pub fn from_path(path: &str) -> Option<Self> {
        let mut segments = path.trim_start_matches('/').split('/');
        if segments.next()? != "apis" {
            return None;
        }
        let group = segments.next().filter(|s| !s.is_empty())?;
        let version = segments.next().filter(|s| !s.is_empty())?;
        Some(Self::new(group, version))
    }

    /// `{version}.{group}`
    pub fn handler_name(&self) -> String {
        format!("{}.{}", self.version, self.group)
    }
}

#[derive(Default)]
struct Registrations {
    handlers: HashMap<GroupVersion, Arc<ProxyHandler>>,
    /// APIService object name to the group/version it registers
    owners: HashMap<String, GroupVersion>,
}

impl Registrations {
    /// Drop `name`'s registration, returning the handler if no other
    /// APIService still registers the same group/version
    fn release(&mut self, name: &str) -> Option<Arc<ProxyHandler>> {
        let gv = self.owners.remove(name)?;
        if self.owners.values().any(|other| *other == gv) {
            return None;
        }
        self.handlers.remove(&gv)
    }
}

pub struct ApiServiceRegistry {
    registrations: RwLock<Registrations>,
    resolver: Arc<dyn IdentityResolver>,
    forwarder: Arc<RequestForwarder>,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl ApiServiceRegistry {
    pub fn new(resolver: Arc<dyn IdentityResolver>, forwarder: Arc<RequestForwarder>) -> Self {
        Self {
            registrations: RwLock::new(Registrations::default()),
            resolver,
            forwarder,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Install or update the route for an APIService.
    ///
    /// An invalid APIService removes any route it previously installed.
    pub async fn apply(&self, api_service: &APIService) -> Result<()> {
        let name = api_service.name_any();
        let spec = &api_service.spec;

        let validated = spec
            .validate()
            .map_err(anyhow::Error::from)
            .and_then(|_| trust_policy(api_service));
        let trust_policy = match validated {
            Ok(policy) => policy,
            Err(e) => {
                self.delete(&name).await;
                return Err(e.context(format!("Invalid APIService {}", name)));
            }
        };

        let gv = GroupVersion::new(&spec.group, &spec.version);
        let (handler, previous) = {
            let mut registrations = self.registrations.write().await;
            let moved = registrations.owners.get(&name).is_some_and(|owned| *owned != gv);
            let previous = if moved { registrations.release(&name) } else { None };
            registrations.owners.insert(name.clone(), gv.clone());
            let handler = registrations
                .handlers
                .entry(gv.clone())
                .or_insert_with(|| Arc::new(self.new_handler(&gv)))
                .clone();
            (handler, previous)
        };

        if let Some(previous) = previous {
            previous.remove().await;
        }

        let result = handler.update(&spec.service_host(), trust_policy).await;
        if let Err(e) = result {
            self.delete(&name).await;
            return Err(anyhow!(e).context(format!("Invalid APIService {}", name)));
        }

        info!(api_service = %name, handler = %handler.name(), "Applied APIService");
        Ok(())
    }

    /// Remove the route an APIService installed; returns whether one was registered
    pub async fn delete(&self, name: &str) -> bool {
        let (registered, released) = {
            let mut registrations = self.registrations.write().await;
            let registered = registrations.owners.contains_key(name);
            (registered, registrations.release(name))
        };

        if let Some(handler) = released {
            handler.remove().await;
        }
        if registered {
            info!(api_service = %name, "Deleted APIService");
        }
        registered
    }

    /// Delete every registration whose APIService name is not in `names`
    pub async fn retain(&self, names: &HashSet<String>) {
        let stale: Vec<String> = {
            let registrations = self.registrations.read().await;
            registrations
                .owners
                .keys()
                .filter(|name| !names.contains(*name))
                .cloned()
                .collect()
        };

        for name in stale {
            debug!(api_service = %name, "APIService missing from relist");
            self.delete(&name).await;
        }
    }

    pub async fn handler(&self, gv: &GroupVersion) -> Option<Arc<ProxyHandler>> {
        self.registrations.read().await.handlers.get(gv).cloned()
    }

    pub async fn count(&self) -> usize {
        self.registrations.read().await.owners.len()
    }

    /// Route a request to the handler for its group/version; 404 when none
    pub async fn dispatch<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let gv = GroupVersion::from_path(request.uri().path());
        let handler = match &gv {
            Some(gv) => self.handler(gv).await,
            None => None,
        };

        match handler {
            Some(handler) => handler.handle(request).await,
            None => {
                debug!(path = %request.uri().path(), "No APIService registered for path");
                ProxyError::NoRoute {
                    api_service: gv.map(|gv| gv.handler_name()).unwrap_or_default(),
                }
                .into_response()
            }
        }
    }

    fn new_handler(&self, gv: &GroupVersion) -> ProxyHandler {
        let handler = ProxyHandler::new(gv.handler_name(), self.resolver.clone(), self.forwarder.clone());
        match &self.metrics {
            Some(metrics) => handler.with_metrics(metrics.clone()),
            None => handler,
        }
    }
}

fn trust_policy(api_service: &APIService) -> Result<TrustPolicy> {
    let spec = &api_service.spec;
    if spec.insecure_skip_tls_verify {
        return Ok(TrustPolicy::SkipVerification);
    }
    match spec.ca_bundle() {
        Some(bundle) => Ok(TrustPolicy::from_pem(bundle.as_bytes())?),
        None => Err(anyhow!(
            "spec.caBundle is required unless spec.insecureSkipTLSVerify is set"
        )),
    }
}
