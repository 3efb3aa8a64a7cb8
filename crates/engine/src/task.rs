//! Inventory tasks: record intent before mutation, persist the final
//! membership afterwards, and delete the record on destroy.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;

use capstan_core::{DryRunStrategy, ObjectId, ObjectIdSet, ObjectStatus};
use capstan_inventory::{Inventory, InventoryStore, UpdateOptions};

use crate::context::{TaskContext, TaskResult};
use crate::event::Action;
use crate::runner::Task;
use crate::RunError;

/// Writes desired ids into the record before any resource mutation so
/// the record of intent survives a crash.
pub struct InvAddTask<S> {
    name: String,
    store: Arc<S>,
    inventory: Inventory,
    desired: ObjectIdSet,
    dry_run: DryRunStrategy,
}

impl<S> InvAddTask<S> {
    pub fn new(
        name: impl Into<String>,
        store: Arc<S>,
        inventory: Inventory,
        desired: ObjectIdSet,
        dry_run: DryRunStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            inventory,
            desired,
            dry_run,
        }
    }
}

#[async_trait]
impl<S: InventoryStore + 'static> Task for InvAddTask<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn action(&self) -> Action {
        Action::Inventory
    }

    async fn run(&self, ctx: &mut TaskContext) {
        let mut inv = self.inventory.clone();
        let union = inv.objects.union(&self.desired);
        debug!(inventory = inv.id(), objects = union.len(), "recording intent");
        inv.set_objects(union);
        let opts = UpdateOptions {
            update_status: false,
            dry_run: self.dry_run,
        };
        let result = match self.store.update(&mut inv, opts).await {
            Ok(()) => {
                ctx.set_inventory(inv);
                TaskResult::ok()
            }
            Err(e) => TaskResult::err(RunError::Inventory(e)),
        };
        ctx.send_task_result(result).await;
    }
}

/// Final membership from this run's outcomes:
///
/// ```text
/// new = appliedOK
///     ∪ (failedApplies ∩ prev)
///     ∪ (skippedApplies ∩ prev)
///     ∪ (failedDeletes ∩ prev)
///     ∪ (skippedDeletes ∩ prev)
///     − abandoned
/// ```
///
/// No ownership by attempt: an object enters the record only through a
/// successful apply or prior membership. Prune candidates come from the
/// record, so in practice the delete sets are already subsets of it.
pub fn final_inventory(prev: &ObjectIdSet, ctx: &TaskContext) -> ObjectIdSet {
    ctx.applied_ok()
        .union(&ctx.failed_applies().intersection(prev))
        .union(&ctx.skipped_applies().intersection(prev))
        .union(&ctx.failed_deletes().intersection(prev))
        .union(&ctx.skipped_deletes().intersection(prev))
        .diff(ctx.abandoned())
}

/// Persists the final membership and statuses. Always runs, even after
/// an abort, so partial progress lands in the record.
pub struct InvSetTask<S> {
    name: String,
    store: Arc<S>,
    inventory: Inventory,
    prev: ObjectIdSet,
    dry_run: DryRunStrategy,
}

impl<S> InvSetTask<S> {
    pub fn new(
        name: impl Into<String>,
        store: Arc<S>,
        inventory: Inventory,
        prev: ObjectIdSet,
        dry_run: DryRunStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            inventory,
            prev,
            dry_run,
        }
    }
}

#[async_trait]
impl<S: InventoryStore + 'static> Task for InvSetTask<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn action(&self) -> Action {
        Action::Inventory
    }

    fn always_runs(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut TaskContext) {
        let new_set = final_inventory(&self.prev, ctx);
        let mut statuses: FxHashMap<ObjectId, ObjectStatus> = FxHashMap::default();
        for id in new_set.iter() {
            statuses.insert(id.clone(), ctx.status(id).unwrap_or_default());
        }
        let mut inv = ctx.take_inventory().unwrap_or_else(|| self.inventory.clone());
        debug!(inventory = inv.id(), objects = new_set.len(), "persisting final inventory");
        inv.set_objects(new_set);
        inv.set_statuses(statuses);
        let opts = UpdateOptions {
            update_status: true,
            dry_run: self.dry_run,
        };
        let result = match self.store.update(&mut inv, opts).await {
            Ok(()) => {
                ctx.set_inventory(inv);
                TaskResult::ok()
            }
            Err(e) => TaskResult::err(RunError::Inventory(e)),
        };
        ctx.send_task_result(result).await;
    }
}

/// Deletes the record once every owned object is confirmed gone;
/// otherwise persists the survivors and reports an error.
pub struct InvDeleteTask<S> {
    name: String,
    store: Arc<S>,
    inventory: Inventory,
    dry_run: DryRunStrategy,
}

impl<S> InvDeleteTask<S> {
    pub fn new(
        name: impl Into<String>,
        store: Arc<S>,
        inventory: Inventory,
        dry_run: DryRunStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            inventory,
            dry_run,
        }
    }
}

#[async_trait]
impl<S: InventoryStore + 'static> Task for InvDeleteTask<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn action(&self) -> Action {
        Action::Inventory
    }

    fn always_runs(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut TaskContext) {
        let survivors = ctx.failed_deletes().union(ctx.skipped_deletes());
        let result = if survivors.is_empty() {
            match self.store.delete(self.inventory.inv_ref(), self.dry_run).await {
                Ok(()) => TaskResult::ok(),
                Err(e) => TaskResult::err(RunError::Inventory(e)),
            }
        } else {
            let remaining = survivors.len();
            let mut statuses: FxHashMap<ObjectId, ObjectStatus> = FxHashMap::default();
            for id in survivors.iter() {
                statuses.insert(id.clone(), ctx.status(id).unwrap_or_default());
            }
            let mut inv = ctx.take_inventory().unwrap_or_else(|| self.inventory.clone());
            inv.set_objects(survivors);
            inv.set_statuses(statuses);
            let opts = UpdateOptions {
                update_status: true,
                dry_run: self.dry_run,
            };
            match self.store.update(&mut inv, opts).await {
                Ok(()) => {
                    ctx.set_inventory(inv);
                    TaskResult::err(RunError::Other(anyhow::anyhow!(
                        "inventory record kept: {remaining} objects could not be deleted"
                    )))
                }
                Err(e) => TaskResult::err(RunError::Inventory(e)),
            }
        };
        ctx.send_task_result(result).await;
    }
}
