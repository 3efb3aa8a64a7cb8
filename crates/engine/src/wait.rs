//! Wait tasks: hold the run until a layer's objects reconcile, up to a
//! deadline. The polling itself is delegated to a [`StatusPoller`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use capstan_core::{ObjectId, Reconcile};

use crate::context::{TaskContext, TaskResult};
use crate::event::{Action, Event, WaitOp};
use crate::runner::Task;
use crate::RunError;

/// External reconciliation check, one object at a time.
#[async_trait]
pub trait StatusPoller: Send + Sync {
    async fn reconciled(&self, id: &ObjectId) -> anyhow::Result<bool>;
}

/// Trivial poller: everything is immediately reconciled. Useful for
/// tests and for callers that do not track status.
pub struct AlwaysReady;

#[async_trait]
impl StatusPoller for AlwaysReady {
    async fn reconciled(&self, _id: &ObjectId) -> anyhow::Result<bool> {
        Ok(true)
    }
}

fn poll_interval() -> Duration {
    let ms = std::env::var("CAPSTAN_WAIT_POLL_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(500);
    Duration::from_millis(ms.max(1))
}

/// Waits for one layer's successfully applied objects to reconcile.
///
/// Objects that were not applied this run are skipped. On deadline the
/// remaining objects get Timeout outcomes and the task still completes
/// successfully so the inventory write runs.
pub struct WaitTask<P> {
    name: String,
    ids: Vec<ObjectId>,
    poller: Arc<P>,
    timeout: Duration,
}

impl<P> WaitTask<P> {
    pub fn new(name: impl Into<String>, ids: Vec<ObjectId>, poller: Arc<P>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            ids,
            poller,
            timeout,
        }
    }
}

#[async_trait]
impl<P: StatusPoller + 'static> Task for WaitTask<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn action(&self) -> Action {
        Action::Wait
    }

    fn identifiers(&self) -> Vec<ObjectId> {
        self.ids.clone()
    }

    async fn run(&self, ctx: &mut TaskContext) {
        let applied = ctx.applied_ok();
        let mut pending: Vec<ObjectId> = Vec::new();
        for id in &self.ids {
            if applied.contains(id) {
                pending.push(id.clone());
            } else {
                ctx.set_reconcile(id.clone(), Reconcile::Skipped);
                ctx.send_event(Event::Wait {
                    group: self.name.clone(),
                    id: id.clone(),
                    op: WaitOp::ReconcileSkipped,
                })
                .await;
            }
        }

        let deadline = Instant::now() + self.timeout;
        let interval = poll_interval();
        loop {
            let mut still = Vec::new();
            for id in pending {
                match self.poller.reconciled(&id).await {
                    Ok(true) => {
                        ctx.set_reconcile(id.clone(), Reconcile::Succeeded);
                        ctx.send_event(Event::Wait {
                            group: self.name.clone(),
                            id: id.clone(),
                            op: WaitOp::Reconciled,
                        })
                        .await;
                        if let Some(status) = ctx.status(&id) {
                            ctx.send_event(Event::Status { id, status }).await;
                        }
                    }
                    Ok(false) => still.push(id),
                    Err(e) => {
                        // Poll errors are transient from the engine's
                        // point of view; the deadline bounds them.
                        warn!(object = %id, error = %e, "status poll error");
                        still.push(id);
                    }
                }
            }
            pending = still;
            if pending.is_empty() {
                break;
            }
            if ctx.is_cancelled() {
                for id in pending {
                    ctx.set_reconcile(id.clone(), Reconcile::Skipped);
                    ctx.send_event(Event::Wait {
                        group: self.name.clone(),
                        id,
                        op: WaitOp::ReconcileSkipped,
                    })
                    .await;
                }
                ctx.send_task_result(TaskResult::err(RunError::Cancelled)).await;
                return;
            }
            if Instant::now() >= deadline {
                debug!(task = %self.name, remaining = pending.len(), "wait deadline reached");
                for id in pending {
                    ctx.add_reconcile_timeout(id.clone());
                    ctx.send_event(Event::Wait {
                        group: self.name.clone(),
                        id,
                        op: WaitOp::ReconcileTimeout,
                    })
                    .await;
                }
                break;
            }
            tokio::time::sleep(interval).await;
        }
        ctx.send_task_result(TaskResult::ok()).await;
    }
}
