//! Progress events emitted on the run's single output channel.
//!
//! One producer (the task context), one consumer (the caller). Events
//! from task N always precede events from task N+1.

use capstan_core::{ObjectId, ObjectStatus};

/// What a task does, for grouping in the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Inventory,
    Apply,
    Wait,
    Prune,
    Delete,
}

/// Describes one action group up front in the [`Event::Init`] event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionGroupDesc {
    pub name: String,
    pub action: Action,
    pub identifiers: Vec<ObjectId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Started,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOp {
    Created,
    Configured,
    Unchanged,
    ServersideApplied,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOp {
    Pruned,
    PruneSkipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOp {
    Deleted,
    DeleteSkipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOp {
    Reconciled,
    ReconcileSkipped,
    ReconcileTimeout,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// First event of every run: all action groups, in execution order.
    Init { action_groups: Vec<ActionGroupDesc> },
    /// Terminal failure of the run itself.
    Error { message: String },
    ActionGroup {
        name: String,
        action: Action,
        phase: GroupPhase,
    },
    Apply {
        group: String,
        id: ObjectId,
        op: ApplyOp,
        err: Option<String>,
    },
    Prune {
        group: String,
        id: ObjectId,
        op: PruneOp,
        err: Option<String>,
    },
    Delete {
        group: String,
        id: ObjectId,
        op: DeleteOp,
        err: Option<String>,
    },
    Wait {
        group: String,
        id: ObjectId,
        op: WaitOp,
    },
    Status { id: ObjectId, status: ObjectStatus },
}
