//! Sequential task execution with cancellation between tasks.

use async_trait::async_trait;
use tracing::{debug, warn};

use capstan_core::ObjectId;

use crate::context::TaskContext;
use crate::event::{Action, Event, GroupPhase};
use crate::RunError;

/// One unit of work in the run's task list. A task drives its work to
/// completion inside [`Task::run`] and signals the result on the
/// context's task channel before returning.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn action(&self) -> Action;

    /// Objects this task touches, for the Init event.
    fn identifiers(&self) -> Vec<ObjectId> {
        Vec::new()
    }

    /// Tasks that persist partial progress run even after an abort.
    fn always_runs(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut TaskContext);
}

/// Execute tasks one at a time in list order.
///
/// A task failure or a cancellation observed between tasks aborts the
/// remainder, except tasks marked [`Task::always_runs`] (the inventory
/// write), so partial progress is persisted. The first error wins.
pub async fn run_tasks(tasks: &[Box<dyn Task>], ctx: &mut TaskContext) -> Result<(), RunError> {
    let mut first_err: Option<RunError> = None;
    for task in tasks {
        let aborted = first_err.is_some() || ctx.is_cancelled();
        if aborted && !task.always_runs() {
            debug!(task = task.name(), "skipping task after abort");
            continue;
        }
        ctx.send_event(Event::ActionGroup {
            name: task.name().to_string(),
            action: task.action(),
            phase: GroupPhase::Started,
        })
        .await;
        task.run(ctx).await;
        let result = ctx.recv_task_result().await;
        ctx.send_event(Event::ActionGroup {
            name: task.name().to_string(),
            action: task.action(),
            phase: GroupPhase::Finished,
        })
        .await;
        if let Some(err) = result.err {
            warn!(task = task.name(), error = %err, "task failed");
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
    }
    if first_err.is_none() && ctx.is_cancelled() {
        first_err = Some(RunError::Cancelled);
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
