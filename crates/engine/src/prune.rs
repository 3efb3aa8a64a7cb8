//! Prune: delete previously owned objects no longer in the desired set.
//!
//! A prune skip or failure is captured in the task context so the
//! object is not lost from the inventory.

use std::sync::Arc;

use async_trait::async_trait;
use kube::core::DynamicObject;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use capstan_client::{object_id, remove_annotation, ClientError, Propagation, ResourceClient};
use capstan_core::{ordering, DryRunStrategy, ObjectId, ObjectIdSet, OWNING_INVENTORY};
use capstan_inventory::InventoryPolicy;

use crate::context::{TaskContext, TaskResult};
use crate::event::{Action, DeleteOp, Event, PruneOp};
use crate::filter::{
    CurrentUidFilter, DependencyFilter, FilterPipeline, InventoryPolicyFilter,
    LocalNamespaceFilter, PolicyOp, PreventRemoveFilter, Verdict, PREVENT_REMOVE_FILTER,
};
use crate::runner::Task;
use crate::RunError;

#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub propagation: Propagation,
    pub dry_run: DryRunStrategy,
    /// Destroy flavor: emit Delete events instead of Prune events.
    pub destroy: bool,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            propagation: Propagation::Background,
            dry_run: DryRunStrategy::None,
            destroy: false,
        }
    }
}

/// Builds prune or delete flavored events for one task group.
struct EventFactory {
    destroy: bool,
    group: String,
}

impl EventFactory {
    fn success(&self, id: ObjectId) -> Event {
        if self.destroy {
            Event::Delete {
                group: self.group.clone(),
                id,
                op: DeleteOp::Deleted,
                err: None,
            }
        } else {
            Event::Prune {
                group: self.group.clone(),
                id,
                op: PruneOp::Pruned,
                err: None,
            }
        }
    }

    fn skipped(&self, id: ObjectId, reason: String) -> Event {
        if self.destroy {
            Event::Delete {
                group: self.group.clone(),
                id,
                op: DeleteOp::DeleteSkipped,
                err: Some(reason),
            }
        } else {
            Event::Prune {
                group: self.group.clone(),
                id,
                op: PruneOp::PruneSkipped,
                err: Some(reason),
            }
        }
    }

    fn failed(&self, id: ObjectId, message: String) -> Event {
        if self.destroy {
            Event::Delete {
                group: self.group.clone(),
                id,
                op: DeleteOp::Deleted,
                err: Some(message),
            }
        } else {
            Event::Prune {
                group: self.group.clone(),
                id,
                op: PruneOp::Pruned,
                err: Some(message),
            }
        }
    }
}

/// Computes the prune set, fetches the live objects, and deletes them.
pub struct Pruner<C> {
    client: Arc<C>,
}

impl<C: ResourceClient> Pruner<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Fetch live objects for the prune ids, silently dropping ids whose
    /// kind is unregistered or whose object is already gone. The result
    /// is in reverse apply order so children precede their hosts.
    pub async fn get_prune_objs(
        &self,
        prune_ids: &ObjectIdSet,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let mut ids = prune_ids.sorted();
        ordering::sort_for_prune(&mut ids);
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.client.get(&id).await {
                Ok(obj) => out.push(obj),
                Err(e) if e.is_not_found() => {
                    debug!(object = %id, "skip pruning: object not found");
                }
                Err(e) if e.is_no_match() => {
                    debug!(object = %id, "skip pruning: resource type not registered");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Delete the fetched objects, routing each outcome into the task
    /// context. Objects blocked by PreventRemove have the ownership
    /// annotation stripped and are registered as abandoned.
    pub async fn prune(
        &self,
        objs: Vec<DynamicObject>,
        filters: &FilterPipeline,
        ctx: &mut TaskContext,
        group: &str,
        opts: &PruneOptions,
    ) -> Result<(), RunError> {
        let events = EventFactory {
            destroy: opts.destroy,
            group: group.to_string(),
        };
        for obj in objs {
            if ctx.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            let id = match object_id(&obj) {
                Ok(id) => id,
                Err(e) => {
                    ctx.send_event(Event::Error {
                        message: format!("prune candidate has no identity: {e}"),
                    })
                    .await;
                    continue;
                }
            };
            debug!(object = %id, "evaluating prune filters");
            match filters.evaluate(&obj) {
                Err(e) => {
                    counter!("prune_failed_total", 1u64);
                    ctx.add_failed_delete(id.clone());
                    ctx.send_event(events.failed(id, format!("{e:#}"))).await;
                    continue;
                }
                Ok(Verdict::Blocked { filter, reason }) => {
                    debug!(object = %id, filter, %reason, "prune skipped");
                    if filter == PREVENT_REMOVE_FILTER && !opts.dry_run.client_or_server() {
                        match self.remove_inventory_annotation(&obj).await {
                            Ok(()) => ctx.add_abandoned_object(id.clone()),
                            Err(e) => {
                                warn!(object = %id, error = %e, "failed to strip ownership annotation");
                                ctx.add_failed_delete(id.clone());
                                ctx.send_event(events.failed(id, format!("{e:#}"))).await;
                                continue;
                            }
                        }
                    }
                    counter!("prune_skipped_total", 1u64);
                    ctx.add_skipped_delete(id.clone());
                    ctx.send_event(events.skipped(id, reason)).await;
                    continue;
                }
                Ok(Verdict::Allow) => {}
            }
            if !opts.dry_run.client_or_server() {
                match self.client.delete(&id, opts.propagation).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(object = %id, "object already gone");
                    }
                    Err(e) => {
                        counter!("prune_failed_total", 1u64);
                        ctx.add_failed_delete(id.clone());
                        ctx.send_event(events.failed(id, format!("{e:#}"))).await;
                        continue;
                    }
                }
            }
            counter!("prune_ok_total", 1u64);
            ctx.add_successful_delete(id.clone());
            ctx.send_event(events.success(id)).await;
        }
        Ok(())
    }

    async fn remove_inventory_annotation(&self, obj: &DynamicObject) -> Result<(), ClientError> {
        let mut copy = obj.clone();
        if remove_annotation(&mut copy, OWNING_INVENTORY) {
            self.client.update(&copy).await?;
        }
        Ok(())
    }
}

/// The prune task: inventory minus desired, in reverse apply order.
pub struct PruneTask<C> {
    name: String,
    prune_ids: ObjectIdSet,
    inventory_id: String,
    policy: InventoryPolicy,
    dependents: FxHashMap<ObjectId, Vec<ObjectId>>,
    apply_namespaces: FxHashSet<String>,
    options: PruneOptions,
    client: Arc<C>,
}

impl<C> PruneTask<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        prune_ids: ObjectIdSet,
        inventory_id: impl Into<String>,
        policy: InventoryPolicy,
        dependents: FxHashMap<ObjectId, Vec<ObjectId>>,
        apply_namespaces: FxHashSet<String>,
        options: PruneOptions,
        client: Arc<C>,
    ) -> Self {
        Self {
            name: name.into(),
            prune_ids,
            inventory_id: inventory_id.into(),
            policy,
            dependents,
            apply_namespaces,
            options,
            client,
        }
    }
}

#[async_trait]
impl<C: ResourceClient + 'static> Task for PruneTask<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn action(&self) -> Action {
        if self.options.destroy {
            Action::Delete
        } else {
            Action::Prune
        }
    }

    fn identifiers(&self) -> Vec<ObjectId> {
        let mut ids = self.prune_ids.sorted();
        ordering::sort_for_prune(&mut ids);
        ids
    }

    async fn run(&self, ctx: &mut TaskContext) {
        let filters = FilterPipeline::new(vec![
            Box::new(PreventRemoveFilter),
            Box::new(InventoryPolicyFilter {
                inventory_id: self.inventory_id.clone(),
                policy: self.policy,
                op: PolicyOp::Prune,
            }),
            Box::new(DependencyFilter {
                dependents: self.dependents.clone(),
            }),
            Box::new(LocalNamespaceFilter {
                namespaces: self.apply_namespaces.clone(),
            }),
            Box::new(CurrentUidFilter {
                recorded: ctx.applied_uids(),
            }),
        ]);
        let pruner = Pruner::new(Arc::clone(&self.client));
        let objs = match pruner.get_prune_objs(&self.prune_ids).await {
            Ok(objs) => objs,
            Err(e) => {
                ctx.send_task_result(TaskResult::err(RunError::Other(anyhow::Error::from(e))))
                    .await;
                return;
            }
        };
        let result = pruner
            .prune(objs, &filters, ctx, &self.name, &self.options)
            .await;
        ctx.send_task_result(TaskResult {
            err: result.err(),
        })
        .await;
    }
}
