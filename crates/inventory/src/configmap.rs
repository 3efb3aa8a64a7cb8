//! ConfigMap backing for inventory records.
//!
//! The record's `data` section maps canonical object id strings to a
//! JSON status triple, or `""` when no status has been recorded yet.
//! The decoder tolerates empty values and unknown triple fields so old
//! clients can read records written by newer ones.

use kube::core::{DynamicObject, TypeMeta};
use serde_json::{Map, Value};

use capstan_core::{ObjectId, ObjectStatus, INVENTORY_LABEL};

use crate::{Inventory, InventoryError, InventoryRef};

pub const CONFIG_MAP_GROUP: &str = "";
pub const CONFIG_MAP_KIND: &str = "ConfigMap";

/// Decode a live ConfigMap into an inventory record.
pub fn from_config_map(obj: &DynamicObject) -> Result<Inventory, InventoryError> {
    let id = obj
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(INVENTORY_LABEL))
        .cloned()
        .unwrap_or_default();
    let inv_ref = InventoryRef::new(
        obj.metadata.name.clone().unwrap_or_default(),
        obj.metadata.namespace.clone().unwrap_or_default(),
        id,
    );
    let mut inv = Inventory::new(inv_ref);

    if let Some(data) = obj.data.get("data") {
        let map = data.as_object().ok_or_else(|| InventoryError::Decode {
            path: "data".to_string(),
            reason: "expected a string map".to_string(),
        })?;
        for (key, value) in map {
            let oid: ObjectId = key.parse().map_err(|e| InventoryError::Decode {
                path: format!("data.{key}"),
                reason: format!("{e}"),
            })?;
            let raw = value.as_str().unwrap_or_default();
            if !raw.is_empty() {
                let status: ObjectStatus =
                    serde_json::from_str(raw).map_err(|e| InventoryError::Decode {
                        path: format!("data.{key}"),
                        reason: format!("{e}"),
                    })?;
                inv.statuses.insert(oid.clone(), status);
            }
            inv.objects.insert(oid);
        }
    }
    inv.cluster_obj = Some(obj.clone());
    Ok(inv)
}

/// Encode an inventory record onto its ConfigMap, reusing the last
/// fetched object when present so the version token survives.
pub fn to_config_map(inv: &Inventory) -> Result<DynamicObject, InventoryError> {
    let mut obj = match &inv.cluster_obj {
        Some(o) => o.clone(),
        None => new_config_map(inv.inv_ref()),
    };
    let mut data = Map::new();
    for id in inv.objects.sorted() {
        let value = match inv.statuses.get(&id) {
            Some(status) => serde_json::to_string(status).map_err(|e| InventoryError::Decode {
                path: format!("data.{}", id.canonical()),
                reason: format!("{e}"),
            })?,
            None => String::new(),
        };
        data.insert(id.canonical(), Value::String(value));
    }
    if !obj.data.is_object() {
        obj.data = Value::Object(Map::new());
    }
    if let Some(map) = obj.data.as_object_mut() {
        map.insert("data".to_string(), Value::Object(data));
    }
    Ok(obj)
}

fn new_config_map(inv_ref: &InventoryRef) -> DynamicObject {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(INVENTORY_LABEL.to_string(), inv_ref.id.clone());
    DynamicObject {
        types: Some(TypeMeta {
            api_version: "v1".to_string(),
            kind: CONFIG_MAP_KIND.to_string(),
        }),
        metadata: kube::core::ObjectMeta {
            name: Some(inv_ref.name.clone()),
            namespace: Some(inv_ref.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Value::Object(Map::new()),
    }
}
