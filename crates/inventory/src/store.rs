//! Generic store for inventory records kept in arbitrary unstructured
//! objects, parameterized by a translator pair.

use std::sync::Arc;

use kube::core::DynamicObject;
use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use capstan_client::{Propagation, ResourceClient};
use capstan_core::{DryRunStrategy, ObjectId};

use crate::configmap::{self, CONFIG_MAP_GROUP, CONFIG_MAP_KIND};
use crate::{Inventory, InventoryError, InventoryRef, InventoryStore, UpdateOptions};

pub type FromUnstructured = fn(&DynamicObject) -> Result<Inventory, InventoryError>;
pub type ToUnstructured = fn(&Inventory) -> Result<DynamicObject, InventoryError>;

fn update_retries() -> usize {
    std::env::var("CAPSTAN_INV_UPDATE_RETRIES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(3)
}

/// Store over one backing kind, translating between the remote object
/// and [`Inventory`] with the given codec pair.
pub struct UnstructuredStore<C> {
    client: Arc<C>,
    group: String,
    kind: String,
    from_raw: FromUnstructured,
    to_raw: ToUnstructured,
    /// Whether the backing kind has a status subresource worth writing.
    status_subresource: bool,
}

impl<C: ResourceClient> UnstructuredStore<C> {
    pub fn new(
        client: Arc<C>,
        group: impl Into<String>,
        kind: impl Into<String>,
        from_raw: FromUnstructured,
        to_raw: ToUnstructured,
        status_subresource: bool,
    ) -> Self {
        Self {
            client,
            group: group.into(),
            kind: kind.into(),
            from_raw,
            to_raw,
            status_subresource,
        }
    }

    /// The default ConfigMap-backed store.
    pub fn config_map(client: Arc<C>) -> Self {
        Self::new(
            client,
            CONFIG_MAP_GROUP,
            CONFIG_MAP_KIND,
            configmap::from_config_map,
            configmap::to_config_map,
            false,
        )
    }

    fn record_object_id(&self, inv_ref: &InventoryRef) -> ObjectId {
        ObjectId {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: inv_ref.namespace.clone(),
            name: inv_ref.name.clone(),
        }
    }

    async fn write_status(
        &self,
        inv: &mut Inventory,
        sent: DynamicObject,
        new_obj: DynamicObject,
    ) -> Result<(), InventoryError> {
        let mut written = sent;
        written.metadata.resource_version = new_obj.metadata.resource_version.clone();
        // Keep the "status observed" contract: if the object reports
        // observedGeneration, move it to the generation just written.
        if new_obj
            .data
            .pointer("/status/observedGeneration")
            .is_some()
        {
            if let Some(generation) = new_obj.metadata.generation {
                if !written.data.is_object() {
                    written.data = Value::Object(Map::new());
                }
                if let Some(root) = written.data.as_object_mut() {
                    let status = root
                        .entry("status".to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Some(status) = status.as_object_mut() {
                        status.insert(
                            "observedGeneration".to_string(),
                            Value::Number(generation.into()),
                        );
                    }
                }
            }
        }
        let final_obj = self.client.update_status(&written).await?;
        inv.cluster_obj = Some(final_obj);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<C: ResourceClient> InventoryStore for UnstructuredStore<C> {
    async fn get(&self, inv_ref: &InventoryRef) -> Result<Option<Inventory>, InventoryError> {
        match self.client.get(&self.record_object_id(inv_ref)).await {
            Ok(obj) => Ok(Some((self.from_raw)(&obj)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Inventory>, InventoryError> {
        let objs = self
            .client
            .list(&self.group, &self.kind, None, Some(capstan_core::INVENTORY_LABEL))
            .await?;
        objs.iter().map(|o| (self.from_raw)(o)).collect()
    }

    async fn update(&self, inv: &mut Inventory, opts: UpdateOptions) -> Result<(), InventoryError> {
        // statuses never outlive membership
        let objects = inv.objects.clone();
        inv.statuses.retain(|id, _| objects.contains(id));

        if opts.dry_run.client_or_server() {
            debug!(inventory = inv.id(), "dry-run: skipping inventory write");
            return Ok(());
        }

        let retries = update_retries();
        let mut attempt = 0usize;
        loop {
            let obj = (self.to_raw)(inv)?;
            match self.client.update(&obj).await {
                Ok(new_obj) => {
                    counter!("inventory_update_total", 1u64);
                    inv.cluster_obj = Some(new_obj.clone());
                    if opts.update_status && self.status_subresource {
                        self.write_status(inv, obj, new_obj).await?;
                    }
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {
                    // Create-if-absent, exactly once.
                    let created = self.client.create(&obj).await.map_err(|ce| {
                        if ce.is_not_found() {
                            InventoryError::CreateFailed(inv.id().to_string())
                        } else {
                            InventoryError::from(ce)
                        }
                    })?;
                    counter!("inventory_create_total", 1u64);
                    inv.cluster_obj = Some(created);
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < retries => {
                    attempt += 1;
                    counter!("inventory_update_retries_total", 1u64);
                    warn!(
                        inventory = inv.id(),
                        attempt, "inventory update conflict; refreshing record"
                    );
                    match self.client.get(&self.record_object_id(inv.inv_ref())).await {
                        Ok(live) => inv.cluster_obj = Some(live),
                        Err(ge) if ge.is_not_found() => inv.cluster_obj = None,
                        Err(ge) => return Err(ge.into()),
                    }
                }
                Err(e) if e.is_conflict() => {
                    return Err(InventoryError::RetriesExhausted(inv.id().to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete(
        &self,
        inv_ref: &InventoryRef,
        dry_run: DryRunStrategy,
    ) -> Result<(), InventoryError> {
        if dry_run.client_or_server() {
            debug!(inventory = %inv_ref.id, "dry-run: skipping inventory delete");
            return Ok(());
        }
        match self
            .client
            .delete(&self.record_object_id(inv_ref), Propagation::Background)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
