//! Per-run mutable state owned by the task runner.

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use capstan_core::{Actuation, ObjectId, ObjectIdSet, ObjectStatus, Reconcile};
use capstan_inventory::Inventory;

use crate::cache::ResourceCache;
use crate::event::Event;
use crate::RunError;

/// Server-assigned identity captured on a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMeta {
    pub uid: Option<Uuid>,
    pub generation: i64,
}

/// Completion signal a task sends on the task channel.
#[derive(Debug, Default)]
pub struct TaskResult {
    pub err: Option<RunError>,
}

impl TaskResult {
    pub fn ok() -> Self {
        Self { err: None }
    }

    pub fn err(err: RunError) -> Self {
        Self { err: Some(err) }
    }
}

/// Accumulates per-object outcomes for one run and fans events out to
/// the single output channel. Mutated only by the running task.
pub struct TaskContext {
    event_tx: mpsc::Sender<Event>,
    task_tx: mpsc::Sender<TaskResult>,
    task_rx: mpsc::Receiver<TaskResult>,
    cancel_rx: watch::Receiver<bool>,
    cache: ResourceCache,
    inventory: Option<Inventory>,
    successful_applies: FxHashMap<ObjectId, AppliedMeta>,
    failed_applies: ObjectIdSet,
    skipped_applies: ObjectIdSet,
    successful_deletes: ObjectIdSet,
    failed_deletes: ObjectIdSet,
    skipped_deletes: ObjectIdSet,
    abandoned: ObjectIdSet,
    reconcile_timeouts: ObjectIdSet,
    statuses: FxHashMap<ObjectId, ObjectStatus>,
}

impl TaskContext {
    pub fn new(event_tx: mpsc::Sender<Event>, cancel_rx: watch::Receiver<bool>) -> Self {
        let (task_tx, task_rx) = mpsc::channel(1);
        Self {
            event_tx,
            task_tx,
            task_rx,
            cancel_rx,
            cache: ResourceCache::new(),
            inventory: None,
            successful_applies: FxHashMap::default(),
            failed_applies: ObjectIdSet::new(),
            skipped_applies: ObjectIdSet::new(),
            successful_deletes: ObjectIdSet::new(),
            failed_deletes: ObjectIdSet::new(),
            skipped_deletes: ObjectIdSet::new(),
            abandoned: ObjectIdSet::new(),
            reconcile_timeouts: ObjectIdSet::new(),
            statuses: FxHashMap::default(),
        }
    }

    /// Enqueue an event; blocks when the consumer lags (backpressure),
    /// drops silently once the consumer is gone.
    pub async fn send_event(&self, event: Event) {
        let _ = self.event_tx.send(event).await;
    }

    pub async fn send_task_result(&self, result: TaskResult) {
        let _ = self.task_tx.send(result).await;
    }

    pub async fn recv_task_result(&mut self) -> TaskResult {
        self.task_rx.recv().await.unwrap_or_default()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ResourceCache {
        &mut self.cache
    }

    /// Record holding the run's intent, refreshed by inventory tasks.
    pub fn inventory(&self) -> Option<&Inventory> {
        self.inventory.as_ref()
    }

    pub fn set_inventory(&mut self, inv: Inventory) {
        self.inventory = Some(inv);
    }

    pub fn take_inventory(&mut self) -> Option<Inventory> {
        self.inventory.take()
    }

    pub fn add_successful_apply(&mut self, id: ObjectId, uid: Option<Uuid>, generation: i64) {
        self.statuses.insert(
            id.clone(),
            ObjectStatus::apply(Actuation::Succeeded, Reconcile::Pending),
        );
        self.successful_applies
            .insert(id, AppliedMeta { uid, generation });
    }

    pub fn add_failed_apply(&mut self, id: ObjectId) {
        self.statuses.insert(
            id.clone(),
            ObjectStatus::apply(Actuation::Failed, Reconcile::Skipped),
        );
        self.failed_applies.insert(id);
    }

    pub fn add_skipped_apply(&mut self, id: ObjectId) {
        self.statuses.insert(
            id.clone(),
            ObjectStatus::apply(Actuation::Skipped, Reconcile::Skipped),
        );
        self.skipped_applies.insert(id);
    }

    pub fn add_successful_delete(&mut self, id: ObjectId) {
        self.statuses.insert(
            id.clone(),
            ObjectStatus::delete(Actuation::Succeeded, Reconcile::Skipped),
        );
        self.successful_deletes.insert(id);
    }

    pub fn add_failed_delete(&mut self, id: ObjectId) {
        self.statuses.insert(
            id.clone(),
            ObjectStatus::delete(Actuation::Failed, Reconcile::Skipped),
        );
        self.failed_deletes.insert(id);
    }

    pub fn add_skipped_delete(&mut self, id: ObjectId) {
        self.statuses.insert(
            id.clone(),
            ObjectStatus::delete(Actuation::Skipped, Reconcile::Skipped),
        );
        self.skipped_deletes.insert(id);
    }

    /// The caller ceased owning this object without deleting it.
    pub fn add_abandoned_object(&mut self, id: ObjectId) {
        self.abandoned.insert(id);
    }

    pub fn set_reconcile(&mut self, id: ObjectId, reconcile: Reconcile) {
        let entry = self.statuses.entry(id).or_default();
        entry.reconcile = reconcile;
    }

    pub fn add_reconcile_timeout(&mut self, id: ObjectId) {
        self.set_reconcile(id.clone(), Reconcile::Timeout);
        self.reconcile_timeouts.insert(id);
    }

    pub fn status(&self, id: &ObjectId) -> Option<ObjectStatus> {
        self.statuses.get(id).copied()
    }

    pub fn applied_ok(&self) -> ObjectIdSet {
        self.successful_applies.keys().cloned().collect()
    }

    pub fn applied_uids(&self) -> FxHashMap<ObjectId, Uuid> {
        self.successful_applies
            .iter()
            .filter_map(|(id, meta)| meta.uid.map(|u| (id.clone(), u)))
            .collect()
    }

    pub fn applied_generation(&self, id: &ObjectId) -> Option<i64> {
        self.successful_applies.get(id).map(|m| m.generation)
    }

    pub fn failed_applies(&self) -> &ObjectIdSet {
        &self.failed_applies
    }

    pub fn skipped_applies(&self) -> &ObjectIdSet {
        &self.skipped_applies
    }

    pub fn successful_deletes(&self) -> &ObjectIdSet {
        &self.successful_deletes
    }

    pub fn failed_deletes(&self) -> &ObjectIdSet {
        &self.failed_deletes
    }

    pub fn skipped_deletes(&self) -> &ObjectIdSet {
        &self.skipped_deletes
    }

    pub fn abandoned(&self) -> &ObjectIdSet {
        &self.abandoned
    }

    pub fn reconcile_timeouts(&self) -> &ObjectIdSet {
        &self.reconcile_timeouts
    }
}
