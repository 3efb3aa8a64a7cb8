//! Tallies of run outcomes derived from the event stream.

use crate::event::{ApplyOp, DeleteOp, Event, PruneOp, WaitOp};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub created: usize,
    pub configured: usize,
    pub unchanged: usize,
    pub serverside_applied: usize,
    pub failed: usize,
}

impl ApplyStats {
    pub fn sum(&self) -> usize {
        self.created + self.configured + self.unchanged + self.serverside_applied + self.failed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub pruned: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteStats {
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitStats {
    pub reconciled: usize,
    pub skipped: usize,
    pub timed_out: usize,
}

/// Aggregated view of one run's event stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub apply: ApplyStats,
    pub prune: PruneStats,
    pub delete: DeleteStats,
    pub wait: WaitStats,
    pub errors: usize,
}

impl Stats {
    pub fn record(&mut self, event: &Event) {
        match event {
            Event::Apply { op, err, .. } => {
                if err.is_some() {
                    self.apply.failed += 1;
                    return;
                }
                match op {
                    ApplyOp::Created => self.apply.created += 1,
                    ApplyOp::Configured => self.apply.configured += 1,
                    ApplyOp::Unchanged => self.apply.unchanged += 1,
                    ApplyOp::ServersideApplied => self.apply.serverside_applied += 1,
                    ApplyOp::Unspecified => {}
                }
            }
            Event::Prune { op, err, .. } => match (op, err) {
                (PruneOp::Pruned, None) => self.prune.pruned += 1,
                (PruneOp::PruneSkipped, _) => self.prune.skipped += 1,
                (PruneOp::Pruned, Some(_)) => self.prune.failed += 1,
            },
            Event::Delete { op, err, .. } => match (op, err) {
                (DeleteOp::Deleted, None) => self.delete.deleted += 1,
                (DeleteOp::DeleteSkipped, _) => self.delete.skipped += 1,
                (DeleteOp::Deleted, Some(_)) => self.delete.failed += 1,
            },
            Event::Wait { op, .. } => match op {
                WaitOp::Reconciled => self.wait.reconciled += 1,
                WaitOp::ReconcileSkipped => self.wait.skipped += 1,
                WaitOp::ReconcileTimeout => self.wait.timed_out += 1,
            },
            Event::Error { .. } => self.errors += 1,
            Event::Init { .. } | Event::ActionGroup { .. } | Event::Status { .. } => {}
        }
    }

    pub fn record_all<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut stats = Stats::default();
        for e in events {
            stats.record(e);
        }
        stats
    }
}
