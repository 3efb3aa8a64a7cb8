//! The apply task: drive one layer of desired objects into the cluster.

use std::sync::Arc;

use async_trait::async_trait;
use kube::core::DynamicObject;
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use capstan_client::{annotation, object_id, set_annotation, ClientError, ResourceClient};
use capstan_core::{DryRunStrategy, ObjectId, OWNING_INVENTORY};
use capstan_inventory::{id_match, IdMatch, InventoryPolicy};

use crate::context::{TaskContext, TaskResult};
use crate::event::{Action, ApplyOp, Event};
use crate::filter::{FilterPipeline, InventoryPolicyFilter, PolicyOp, Verdict};
use crate::runner::Task;
use crate::RunError;

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Use server-side apply; otherwise get/create/update.
    pub server_side: bool,
    pub field_manager: String,
    pub dry_run: DryRunStrategy,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            server_side: true,
            field_manager: "capstan".to_string(),
            dry_run: DryRunStrategy::None,
        }
    }
}

/// Applies one dependency layer in ascending kind order.
pub struct ApplyTask<C> {
    name: String,
    objects: Vec<DynamicObject>,
    inventory_id: String,
    policy: InventoryPolicy,
    options: ApplyOptions,
    client: Arc<C>,
}

impl<C> ApplyTask<C> {
    pub fn new(
        name: impl Into<String>,
        objects: Vec<DynamicObject>,
        inventory_id: impl Into<String>,
        policy: InventoryPolicy,
        options: ApplyOptions,
        client: Arc<C>,
    ) -> Self {
        Self {
            name: name.into(),
            objects,
            inventory_id: inventory_id.into(),
            policy,
            options,
            client,
        }
    }
}

#[async_trait]
impl<C: ResourceClient + 'static> Task for ApplyTask<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn action(&self) -> Action {
        Action::Apply
    }

    fn identifiers(&self) -> Vec<ObjectId> {
        self.objects.iter().filter_map(|o| object_id(o).ok()).collect()
    }

    async fn run(&self, ctx: &mut TaskContext) {
        for obj in &self.objects {
            if ctx.is_cancelled() {
                // Outcomes recorded so far stay in the context for InvSet.
                ctx.send_task_result(TaskResult::err(RunError::Cancelled)).await;
                return;
            }
            let id = match object_id(obj) {
                Ok(id) => id,
                Err(e) => {
                    ctx.send_event(Event::Error {
                        message: format!("object in {} has no identity: {e}", self.name),
                    })
                    .await;
                    continue;
                }
            };
            self.apply_one(ctx, id, obj).await;
        }
        ctx.send_task_result(TaskResult::ok()).await;
    }
}

impl<C: ResourceClient> ApplyTask<C> {
    async fn apply_one(&self, ctx: &mut TaskContext, id: ObjectId, obj: &DynamicObject) {
        debug!(object = %id, "applying object");
        let live = match self.client.get(&id).await {
            Ok(o) => Some(o),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                self.fail(ctx, id, format!("{e:#}")).await;
                return;
            }
        };

        if let Some(live_obj) = &live {
            let pipeline = FilterPipeline::new(vec![Box::new(InventoryPolicyFilter {
                inventory_id: self.inventory_id.clone(),
                policy: self.policy,
                op: PolicyOp::Apply,
            })]);
            match pipeline.evaluate(live_obj) {
                Ok(Verdict::Allow) => {}
                Ok(Verdict::Blocked { reason, .. }) => {
                    counter!("apply_skipped_total", 1u64);
                    ctx.add_skipped_apply(id.clone());
                    // Owned by another inventory: stop claiming it.
                    if id_match(&self.inventory_id, live_obj) == IdMatch::NoMatch {
                        ctx.add_abandoned_object(id.clone());
                    }
                    ctx.send_event(Event::Apply {
                        group: self.name.clone(),
                        id,
                        op: ApplyOp::Unspecified,
                        err: Some(format!("apply skipped: {reason}")),
                    })
                    .await;
                    return;
                }
                Err(e) => {
                    self.fail(ctx, id, format!("{e:#}")).await;
                    return;
                }
            }
        }

        match self.mutate(live.as_ref(), obj).await {
            Ok((applied, op)) => {
                counter!("apply_ok_total", 1u64);
                let (uid, generation) = match applied.as_ref().or(live.as_ref()) {
                    Some(o) => (
                        o.metadata
                            .uid
                            .as_deref()
                            .and_then(|u| Uuid::parse_str(u).ok()),
                        o.metadata.generation.unwrap_or(0),
                    ),
                    None => (None, 0),
                };
                ctx.add_successful_apply(id.clone(), uid, generation);
                if let Some(applied) = applied {
                    ctx.cache_mut().put(id.clone(), applied);
                }
                ctx.send_event(Event::Apply {
                    group: self.name.clone(),
                    id,
                    op,
                    err: None,
                })
                .await;
            }
            Err(e) => self.fail(ctx, id, format!("{e:#}")).await,
        }
    }

    async fn fail(&self, ctx: &mut TaskContext, id: ObjectId, message: String) {
        counter!("apply_failed_total", 1u64);
        warn!(object = %id, error = %message, "apply failed");
        ctx.add_failed_apply(id.clone());
        ctx.send_event(Event::Apply {
            group: self.name.clone(),
            id,
            op: ApplyOp::Unspecified,
            err: Some(message),
        })
        .await;
    }

    /// One write with a single transient retry. Returns the server's
    /// view of the object (when a write happened) and the operation.
    async fn mutate(
        &self,
        live: Option<&DynamicObject>,
        obj: &DynamicObject,
    ) -> Result<(Option<DynamicObject>, ApplyOp), ClientError> {
        let mut desired = obj.clone();
        set_annotation(&mut desired, OWNING_INVENTORY, &self.inventory_id);

        if self.options.dry_run == DryRunStrategy::Client {
            let op = match live {
                None => ApplyOp::Created,
                Some(l) if unchanged(l, &desired) => ApplyOp::Unchanged,
                Some(_) => ApplyOp::Configured,
            };
            return Ok((None, op));
        }

        let mut retried = false;
        loop {
            let attempt = if self.options.server_side {
                self.client
                    .apply(&desired, &self.options.field_manager)
                    .await
                    .map(|o| (Some(o), ApplyOp::ServersideApplied))
            } else {
                match live {
                    None => self
                        .client
                        .create(&desired)
                        .await
                        .map(|o| (Some(o), ApplyOp::Created)),
                    Some(l) if unchanged(l, &desired) => Ok((Some(l.clone()), ApplyOp::Unchanged)),
                    Some(l) => {
                        let mut replacement = desired.clone();
                        replacement.metadata.resource_version = l.metadata.resource_version.clone();
                        self.client
                            .update(&replacement)
                            .await
                            .map(|o| (Some(o), ApplyOp::Configured))
                    }
                }
            };
            match attempt {
                Ok(v) => return Ok(v),
                Err(e) if !retried && e.is_transient() => {
                    retried = true;
                    counter!("apply_retries_total", 1u64);
                    warn!(error = %e, "transient apply error; retrying once");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether the desired payload is already present verbatim in the live
/// object: all non-status top-level fields equal and the ownership
/// annotation already set.
fn unchanged(live: &DynamicObject, desired: &DynamicObject) -> bool {
    if annotation(live, OWNING_INVENTORY) != annotation(desired, OWNING_INVENTORY) {
        return false;
    }
    match (desired.data.as_object(), live.data.as_object()) {
        (Some(d), Some(l)) => d
            .iter()
            .filter(|(k, _)| k.as_str() != "status")
            .all(|(k, v)| l.get(k) == Some(v)),
        (None, _) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::TypeMeta;

    fn cm(name: &str, value: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
            }),
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: serde_json::json!({"data": {"k": value}}),
        }
    }

    #[test]
    fn unchanged_requires_matching_payload_and_owner() {
        let mut live = cm("a", "v");
        let mut desired = cm("a", "v");
        set_annotation(&mut desired, OWNING_INVENTORY, "inv");
        assert!(!unchanged(&live, &desired));

        set_annotation(&mut live, OWNING_INVENTORY, "inv");
        assert!(unchanged(&live, &desired));

        let desired2 = {
            let mut d = cm("a", "other");
            set_annotation(&mut d, OWNING_INVENTORY, "inv");
            d
        };
        assert!(!unchanged(&live, &desired2));
    }

    #[test]
    fn unchanged_ignores_live_only_and_status_fields() {
        let mut live = cm("a", "v");
        live.data["extra"] = serde_json::json!("server-added");
        let mut desired = cm("a", "v");
        desired.data["status"] = serde_json::json!({"x": 1});
        set_annotation(&mut live, OWNING_INVENTORY, "inv");
        set_annotation(&mut desired, OWNING_INVENTORY, "inv");
        assert!(unchanged(&live, &desired));
    }
}
