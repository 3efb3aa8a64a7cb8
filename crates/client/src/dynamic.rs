//! Kube-backed client for arbitrary kinds, with a process-wide
//! discovery cache so repeated lookups skip the discovery round-trip.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Context};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::core::{ApiResource, DynamicObject};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use metrics::counter;
use once_cell::sync::Lazy;
use tracing::debug;

use capstan_core::ObjectId;

use crate::{object_id, ClientError, Propagation, ResourceClient};

// group/kind -> (ApiResource, namespaced)
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn cache_key(group: &str, kind: &str) -> String {
    format!("{group}/{kind}")
}

async fn find_api_resource(
    client: Client,
    group: &str,
    kind: &str,
) -> Result<(ApiResource, bool), ClientError> {
    let key = cache_key(group, kind);
    if let Some(hit) = DISCOVERY_CACHE
        .read()
        .map_err(|_| anyhow!("discovery cache poisoned"))?
        .get(&key)
        .cloned()
    {
        return Ok(hit);
    }
    let discovery = Discovery::new(client)
        .run()
        .await
        .context("running api discovery")?;
    for api_group in discovery.groups() {
        for (ar, caps) in api_group.recommended_resources() {
            if ar.group == group && ar.kind == kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                DISCOVERY_CACHE
                    .write()
                    .map_err(|_| anyhow!("discovery cache poisoned"))?
                    .insert(key, (ar.clone(), namespaced));
                return Ok((ar, namespaced));
            }
        }
    }
    Err(ClientError::NoMatch {
        group: group.to_string(),
        kind: kind.to_string(),
    })
}

fn map_kube_err(id: &ObjectId, err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(id.clone()),
        kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict(id.clone()),
        other => ClientError::Other(anyhow!(other).context(format!("calling api for {id}"))),
    }
}

/// Resource client over a shared kube [`Client`].
///
/// With `server_dry_run` set every mutation carries the server dry-run
/// flag, so writes are validated and echoed but never persisted.
#[derive(Clone)]
pub struct DynamicResourceClient {
    client: Client,
    server_dry_run: bool,
}

impl DynamicResourceClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            server_dry_run: false,
        }
    }

    pub async fn try_default() -> Result<Self, ClientError> {
        let client = Client::try_default()
            .await
            .context("building kube client from the ambient config")?;
        Ok(Self::new(client))
    }

    pub fn with_server_dry_run(mut self, on: bool) -> Self {
        self.server_dry_run = on;
        self
    }

    async fn api_for(&self, id: &ObjectId) -> Result<Api<DynamicObject>, ClientError> {
        let (ar, namespaced) = find_api_resource(self.client.clone(), &id.group, &id.kind).await?;
        let api = if namespaced && !id.namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), &id.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }

    fn post_params(&self, field_manager: Option<&str>) -> PostParams {
        PostParams {
            dry_run: self.server_dry_run,
            field_manager: field_manager.map(String::from),
        }
    }
}

#[async_trait::async_trait]
impl ResourceClient for DynamicResourceClient {
    async fn get(&self, id: &ObjectId) -> Result<DynamicObject, ClientError> {
        let api = self.api_for(id).await?;
        counter!("client_get_total", 1u64);
        api.get(&id.name).await.map_err(|e| map_kube_err(id, e))
    }

    async fn list(
        &self,
        group: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let (ar, namespaced) = find_api_resource(self.client.clone(), group, kind).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let mut params = ListParams::default();
        if let Some(sel) = label_selector {
            params = params.labels(sel);
        }
        let list = api
            .list(&params)
            .await
            .with_context(|| format!("listing {group}/{kind}"))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let id = object_id(obj)?;
        let api = self.api_for(&id).await?;
        counter!("client_create_total", 1u64);
        api.create(&self.post_params(None), obj)
            .await
            .map_err(|e| map_kube_err(&id, e))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let id = object_id(obj)?;
        let api = self.api_for(&id).await?;
        counter!("client_update_total", 1u64);
        api.replace(&id.name, &self.post_params(None), obj)
            .await
            .map_err(|e| map_kube_err(&id, e))
    }

    async fn apply(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, ClientError> {
        let id = object_id(obj)?;
        let api = self.api_for(&id).await?;
        let mut params = PatchParams::apply(field_manager);
        if self.server_dry_run {
            params = params.dry_run();
        }
        counter!("client_apply_total", 1u64);
        api.patch(&id.name, &params, &Patch::Apply(obj))
            .await
            .map_err(|e| map_kube_err(&id, e))
    }

    async fn delete(&self, id: &ObjectId, propagation: Propagation) -> Result<(), ClientError> {
        let api = self.api_for(id).await?;
        let params = DeleteParams {
            dry_run: self.server_dry_run,
            propagation_policy: Some(match propagation {
                Propagation::Background => PropagationPolicy::Background,
                Propagation::Foreground => PropagationPolicy::Foreground,
                Propagation::Orphan => PropagationPolicy::Orphan,
            }),
            ..Default::default()
        };
        debug!(object = %id, "deleting object");
        counter!("client_delete_total", 1u64);
        api.delete(&id.name, &params)
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(id, e))
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let id = object_id(obj)?;
        let api = self.api_for(&id).await?;
        let body = serde_json::to_vec(obj)
            .with_context(|| format!("serializing status for {id}"))?;
        api.replace_status(&id.name, &self.post_params(None), body)
            .await
            .map_err(|e| map_kube_err(&id, e))
    }
}
