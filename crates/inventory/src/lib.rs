//! Inventory lifecycle: the persisted record of object ownership, the
//! store abstraction over its remote backing object, and the ownership
//! policies that gate apply and prune.

#![forbid(unsafe_code)]

pub mod configmap;
pub mod fake;
pub mod policy;
pub mod store;

pub use fake::FakeInventoryStore;
pub use policy::{can_apply, can_prune, id_match, IdMatch, InventoryPolicy};
pub use store::UnstructuredStore;

use async_trait::async_trait;
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;

use capstan_client::ClientError;
use capstan_core::{DryRunStrategy, ObjectId, ObjectIdSet, ObjectStatus};

/// Locator for one inventory record: where it lives and the opaque
/// inventory id it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryRef {
    pub name: String,
    pub namespace: String,
    pub id: String,
}

impl InventoryRef {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

/// In-memory form of one persisted inventory record.
///
/// `statuses` keys are always a subset of `objects`; [`Inventory::set_objects`]
/// and the encoders maintain that. An empty `objects` set is legal (the
/// destroy flow passes through it).
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    inv_ref: InventoryRef,
    pub objects: ObjectIdSet,
    pub statuses: FxHashMap<ObjectId, ObjectStatus>,
    /// Remote form last fetched from the cluster; carries the version
    /// token used for optimistic concurrency.
    pub cluster_obj: Option<DynamicObject>,
}

impl Inventory {
    pub fn new(inv_ref: InventoryRef) -> Self {
        Self {
            inv_ref,
            ..Default::default()
        }
    }

    /// The opaque inventory id. Immutable over the record's lifetime.
    pub fn id(&self) -> &str {
        &self.inv_ref.id
    }

    pub fn inv_ref(&self) -> &InventoryRef {
        &self.inv_ref
    }

    pub fn set_objects(&mut self, objects: ObjectIdSet) {
        self.statuses.retain(|id, _| objects.contains(id));
        self.objects = objects;
    }

    pub fn set_statuses(&mut self, statuses: FxHashMap<ObjectId, ObjectStatus>) {
        self.statuses = statuses;
        let objects = &self.objects;
        self.statuses.retain(|id, _| objects.contains(id));
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("decoding inventory field {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("inventory update for {0:?}: conflict retries exhausted")]
    RetriesExhausted(String),
    #[error("inventory record {0:?} not found again after create")]
    CreateFailed(String),
    #[error("no inventory records to merge")]
    NothingToMerge,
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Also write the status subrecord.
    pub update_status: bool,
    pub dry_run: DryRunStrategy,
}

/// Operations against the keyed remote store of inventory records.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Fetch one record; `Ok(None)` when it does not exist.
    async fn get(&self, inv_ref: &InventoryRef) -> Result<Option<Inventory>, InventoryError>;

    /// All records visible to the caller.
    async fn list(&self) -> Result<Vec<Inventory>, InventoryError>;

    /// Create-or-update the record; on success the in-memory record is
    /// refreshed with the server-assigned object.
    async fn update(&self, inv: &mut Inventory, opts: UpdateOptions) -> Result<(), InventoryError>;

    /// Idempotent delete; a missing record is success.
    async fn delete(
        &self,
        inv_ref: &InventoryRef,
        dry_run: DryRunStrategy,
    ) -> Result<(), InventoryError>;

    /// Merge several records referencing the same objects into the
    /// first-discovered one; the rest are emptied in place. Idempotent.
    async fn merge(
        &self,
        mut records: Vec<Inventory>,
        dry_run: DryRunStrategy,
    ) -> Result<Inventory, InventoryError> {
        if records.is_empty() {
            return Err(InventoryError::NothingToMerge);
        }
        let mut winner = records.remove(0);
        let mut union = winner.objects.clone();
        for rec in &records {
            union = union.union(&rec.objects);
        }
        let opts = UpdateOptions {
            update_status: false,
            dry_run,
        };
        if union != winner.objects {
            winner.set_objects(union);
            self.update(&mut winner, opts).await?;
        }
        for mut rec in records {
            if rec.objects.is_empty() {
                continue;
            }
            rec.set_objects(ObjectIdSet::new());
            self.update(&mut rec, opts).await?;
        }
        Ok(winner)
    }
}
