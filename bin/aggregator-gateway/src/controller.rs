//! APIService watch loop feeding the registry

use crate::registry::ApiServiceRegistry;
use aggregator_api::APIService;
use futures::StreamExt;
use kube::{Api, Client, ResourceExt};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ApiServiceController {
    client: Client,
    registry: Arc<ApiServiceRegistry>,
}

impl ApiServiceController {
    pub fn new(client: Client, registry: Arc<ApiServiceRegistry>) -> Self {
        Self { client, registry }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting APIService watch");

        let api_services: Api<APIService> = Api::all(self.client.clone());
        let mut stream = watcher::watcher(api_services, watcher::Config::default())
            .default_backoff()
            .boxed();

        let mut relist = Relist::default();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => handle_event(&self.registry, &mut relist, event).await,
                Err(e) => warn!("APIService watch error: {}", e),
            }
        }

        Ok(())
    }
}

/// Names seen since the current relist began
#[derive(Default)]
pub struct Relist {
    seen: HashSet<String>,
}

pub async fn handle_event(registry: &ApiServiceRegistry, relist: &mut Relist, event: Event<APIService>) {
    match event {
        Event::Init => {
            debug!("APIService relist started");
            relist.seen.clear();
        }
        Event::InitApply(api_service) => {
            relist.seen.insert(api_service.name_any());
            apply(registry, &api_service).await;
        }
        Event::InitDone => {
            registry.retain(&relist.seen).await;
            let registered = registry.count().await;
            info!(registered, "APIService relist complete");
            relist.seen.clear();
        }
        Event::Apply(api_service) => apply(registry, &api_service).await,
        Event::Delete(api_service) => {
            registry.delete(&api_service.name_any()).await;
        }
    }
}

async fn apply(registry: &ApiServiceRegistry, api_service: &APIService) {
    if let Err(e) = registry.apply(api_service).await {
        warn!(api_service = %api_service.name_any(), "{:#}", e);
    }
}
