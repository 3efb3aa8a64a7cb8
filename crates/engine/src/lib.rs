//! Capstan engine: reconciles a desired set of objects against the
//! cluster, tracking ownership in an inventory record.
//!
//! The [`Applier`] builds a task list (inventory-add, one apply/wait
//! pair per dependency layer, prune, inventory-set), runs it
//! sequentially, and streams progress events. The [`Destroyer`] prunes
//! everything the record owns and deletes the record.

#![forbid(unsafe_code)]

pub mod apply;
pub mod cache;
pub mod context;
pub mod event;
pub mod filter;
pub mod prune;
pub mod runner;
pub mod stats;
pub mod task;
pub mod wait;

pub use apply::{ApplyOptions, ApplyTask};
pub use context::{AppliedMeta, TaskContext, TaskResult};
pub use event::Event;
pub use prune::{PruneOptions, PruneTask, Pruner};
pub use runner::{run_tasks, Task};
pub use stats::Stats;
pub use task::{final_inventory, InvAddTask, InvDeleteTask, InvSetTask};
pub use wait::{AlwaysReady, StatusPoller, WaitTask};

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use kube::core::DynamicObject;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tracing::info;

use capstan_client::{annotation, object_id, Propagation, ResourceClient};
use capstan_core::{graph, DryRunStrategy, GraphError, ObjectId, ObjectIdSet, DEPENDS_ON};
use capstan_inventory::{
    Inventory, InventoryError, InventoryPolicy, InventoryRef, InventoryStore,
};

use event::ActionGroupDesc;

/// Terminal result of one run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{failed} resources failed, {timed_out} resources failed to reconcile before timeout")]
    ResourcesFailed { failed: usize, timed_out: usize },
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct ApplierOptions {
    pub policy: InventoryPolicy,
    /// Client dry-run simulates locally; server dry-run expects a
    /// resource client constructed in server dry-run mode.
    pub dry_run: DryRunStrategy,
    pub server_side: bool,
    pub field_manager: String,
    pub prune: bool,
    pub propagation: Propagation,
    pub reconcile_timeout: Duration,
}

impl Default for ApplierOptions {
    fn default() -> Self {
        Self {
            policy: InventoryPolicy::MustMatch,
            dry_run: DryRunStrategy::None,
            server_side: true,
            field_manager: "capstan".to_string(),
            prune: true,
            propagation: Propagation::Background,
            reconcile_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DestroyerOptions {
    pub policy: InventoryPolicy,
    pub dry_run: DryRunStrategy,
    pub propagation: Propagation,
}

impl Default for DestroyerOptions {
    fn default() -> Self {
        Self {
            policy: InventoryPolicy::MustMatch,
            dry_run: DryRunStrategy::None,
            propagation: Propagation::Background,
        }
    }
}

/// Handle to a running reconciliation: the event stream, a cancel
/// signal, and the final result.
pub struct RunHandle {
    pub events: mpsc::Receiver<Event>,
    result: tokio::task::JoinHandle<Result<(), RunError>>,
    cancel_tx: watch::Sender<bool>,
}

impl RunHandle {
    /// Request cancellation; the runner aborts between tasks and the
    /// inventory write still runs.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Drain remaining events and wait for the final result.
    pub async fn wait(mut self) -> Result<(), RunError> {
        while self.events.recv().await.is_some() {}
        self.result
            .await
            .map_err(|e| RunError::Other(anyhow!("run task panicked: {e}")))?
    }

    /// Collect every event alongside the final result.
    pub async fn collect(mut self) -> (Vec<Event>, Result<(), RunError>) {
        let mut events = Vec::new();
        while let Some(e) = self.events.recv().await {
            events.push(e);
        }
        let result = match self.result.await {
            Ok(r) => r,
            Err(e) => Err(RunError::Other(anyhow!("run task panicked: {e}"))),
        };
        (events, result)
    }
}

/// Reconcile driver: apply the desired set, prune the rest.
pub struct Applier<C, S, P = AlwaysReady> {
    client: Arc<C>,
    store: Arc<S>,
    poller: Arc<P>,
}

impl<C, S, P> Applier<C, S, P>
where
    C: ResourceClient + 'static,
    S: InventoryStore + 'static,
    P: StatusPoller + 'static,
{
    pub fn new(client: Arc<C>, store: Arc<S>, poller: Arc<P>) -> Self {
        Self {
            client,
            store,
            poller,
        }
    }

    pub fn run(
        &self,
        inv_ref: InventoryRef,
        objects: Vec<DynamicObject>,
        opts: ApplierOptions,
    ) -> RunHandle {
        let (event_tx, events) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let client = Arc::clone(&self.client);
        let store = Arc::clone(&self.store);
        let poller = Arc::clone(&self.poller);
        let result = tokio::spawn(async move {
            let mut ctx = TaskContext::new(event_tx.clone(), cancel_rx);
            let res = drive_apply(client, store, poller, inv_ref, objects, opts, &mut ctx).await;
            if let Err(err) = &res {
                if !matches!(err, RunError::ResourcesFailed { .. }) {
                    let _ = event_tx
                        .send(Event::Error {
                            message: err.to_string(),
                        })
                        .await;
                }
            }
            res
        });
        RunHandle {
            events,
            result,
            cancel_tx,
        }
    }
}

/// Destroy driver: prune everything the record owns, then delete it.
pub struct Destroyer<C, S> {
    client: Arc<C>,
    store: Arc<S>,
}

impl<C, S> Destroyer<C, S>
where
    C: ResourceClient + 'static,
    S: InventoryStore + 'static,
{
    pub fn new(client: Arc<C>, store: Arc<S>) -> Self {
        Self { client, store }
    }

    pub fn run(&self, inv_ref: InventoryRef, opts: DestroyerOptions) -> RunHandle {
        let (event_tx, events) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let client = Arc::clone(&self.client);
        let store = Arc::clone(&self.store);
        let result = tokio::spawn(async move {
            let mut ctx = TaskContext::new(event_tx.clone(), cancel_rx);
            let res = drive_destroy(client, store, inv_ref, opts, &mut ctx).await;
            if let Err(err) = &res {
                if !matches!(err, RunError::ResourcesFailed { .. }) {
                    let _ = event_tx
                        .send(Event::Error {
                            message: err.to_string(),
                        })
                        .await;
                }
            }
            res
        });
        RunHandle {
            events,
            result,
            cancel_tx,
        }
    }
}

fn aggregate(ctx: &TaskContext) -> Result<(), RunError> {
    let failed = ctx.failed_applies().len() + ctx.failed_deletes().len();
    let timed_out = ctx.reconcile_timeouts().len();
    if failed > 0 || timed_out > 0 {
        return Err(RunError::ResourcesFailed { failed, timed_out });
    }
    Ok(())
}

async fn read_previous_inventory<S: InventoryStore>(
    store: &S,
    inv_ref: &InventoryRef,
    dry_run: DryRunStrategy,
) -> Result<Inventory, RunError> {
    // Migration scenario: several records may carry the same id; merge
    // them into the first discovered before using the result.
    let mut matching: Vec<Inventory> = store
        .list()
        .await?
        .into_iter()
        .filter(|r| r.id() == inv_ref.id)
        .collect();
    let prev = match matching.len() {
        0 => store
            .get(inv_ref)
            .await?
            .unwrap_or_else(|| Inventory::new(inv_ref.clone())),
        1 => matching.remove(0),
        _ => store.merge(matching, dry_run).await?,
    };
    Ok(prev)
}

#[allow(clippy::too_many_arguments)]
async fn drive_apply<C, S, P>(
    client: Arc<C>,
    store: Arc<S>,
    poller: Arc<P>,
    inv_ref: InventoryRef,
    objects: Vec<DynamicObject>,
    opts: ApplierOptions,
    ctx: &mut TaskContext,
) -> Result<(), RunError>
where
    C: ResourceClient + 'static,
    S: InventoryStore + 'static,
    P: StatusPoller + 'static,
{
    // Ingestion: identity, duplicates, dependency edges.
    let mut by_id: FxHashMap<ObjectId, DynamicObject> = FxHashMap::default();
    let mut nodes: Vec<(ObjectId, Vec<ObjectId>)> = Vec::with_capacity(objects.len());
    for obj in objects {
        let id = object_id(&obj).map_err(|e| RunError::Other(anyhow!(e)))?;
        let deps = match annotation(&obj, DEPENDS_ON) {
            Some(v) => graph::parse_depends_on(v)?,
            None => Vec::new(),
        };
        if by_id.insert(id.clone(), obj).is_some() {
            return Err(RunError::Other(anyhow!("duplicate object id {id}")));
        }
        nodes.push((id, deps));
    }
    let layers = graph::layers(&nodes)?;

    let desired: ObjectIdSet = nodes.iter().map(|(id, _)| id.clone()).collect();
    let mut dependents: FxHashMap<ObjectId, Vec<ObjectId>> = FxHashMap::default();
    let mut apply_namespaces: FxHashSet<String> = FxHashSet::default();
    for (id, deps) in &nodes {
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
        if !id.namespace.is_empty() {
            apply_namespaces.insert(id.namespace.clone());
        }
    }

    let prev = read_previous_inventory(store.as_ref(), &inv_ref, opts.dry_run).await?;
    let prev_objects = prev.objects.clone();
    let prune_ids = prev_objects.diff(&desired);

    info!(
        inventory = %inv_ref.id,
        desired = desired.len(),
        prune = prune_ids.len(),
        layers = layers.len(),
        "planned reconciliation"
    );

    let apply_options = ApplyOptions {
        server_side: opts.server_side,
        field_manager: opts.field_manager.clone(),
        dry_run: opts.dry_run,
    };

    let mut tasks: Vec<Box<dyn Task>> = Vec::new();
    tasks.push(Box::new(InvAddTask::new(
        "inventory-add-0",
        Arc::clone(&store),
        prev.clone(),
        desired.clone(),
        opts.dry_run,
    )));
    for (i, layer) in layers.iter().enumerate() {
        let layer_objs: Vec<DynamicObject> = layer
            .iter()
            .filter_map(|id| by_id.get(id).cloned())
            .collect();
        tasks.push(Box::new(ApplyTask::new(
            format!("apply-{i}"),
            layer_objs,
            inv_ref.id.clone(),
            opts.policy,
            apply_options.clone(),
            Arc::clone(&client),
        )));
        tasks.push(Box::new(WaitTask::new(
            format!("wait-{i}"),
            layer.clone(),
            Arc::clone(&poller),
            opts.reconcile_timeout,
        )));
    }
    if opts.prune {
        tasks.push(Box::new(PruneTask::new(
            "prune-0",
            prune_ids,
            inv_ref.id.clone(),
            opts.policy,
            dependents,
            apply_namespaces,
            PruneOptions {
                propagation: opts.propagation,
                dry_run: opts.dry_run,
                destroy: false,
            },
            Arc::clone(&client),
        )));
    }
    tasks.push(Box::new(InvSetTask::new(
        "inventory-set-0",
        Arc::clone(&store),
        prev,
        prev_objects,
        opts.dry_run,
    )));

    ctx.send_event(Event::Init {
        action_groups: describe(&tasks),
    })
    .await;

    run_tasks(&tasks, ctx).await?;
    aggregate(ctx)
}

async fn drive_destroy<C, S>(
    client: Arc<C>,
    store: Arc<S>,
    inv_ref: InventoryRef,
    opts: DestroyerOptions,
    ctx: &mut TaskContext,
) -> Result<(), RunError>
where
    C: ResourceClient + 'static,
    S: InventoryStore + 'static,
{
    let prev = read_previous_inventory(store.as_ref(), &inv_ref, opts.dry_run).await?;
    let prune_ids = prev.objects.clone();
    info!(inventory = %inv_ref.id, objects = prune_ids.len(), "planned destroy");

    ctx.set_inventory(prev.clone());
    let tasks: Vec<Box<dyn Task>> = vec![
        Box::new(PruneTask::new(
            "delete-0",
            prune_ids,
            inv_ref.id.clone(),
            opts.policy,
            FxHashMap::default(),
            FxHashSet::default(),
            PruneOptions {
                propagation: opts.propagation,
                dry_run: opts.dry_run,
                destroy: true,
            },
            Arc::clone(&client),
        )),
        Box::new(InvDeleteTask::new(
            "inventory-delete-0",
            Arc::clone(&store),
            prev,
            opts.dry_run,
        )),
    ];

    ctx.send_event(Event::Init {
        action_groups: describe(&tasks),
    })
    .await;

    run_tasks(&tasks, ctx).await?;
    aggregate(ctx)
}

fn describe(tasks: &[Box<dyn Task>]) -> Vec<ActionGroupDesc> {
    tasks
        .iter()
        .map(|t| ActionGroupDesc {
            name: t.name().to_string(),
            action: t.action(),
            identifiers: t.identifiers(),
        })
        .collect()
}
