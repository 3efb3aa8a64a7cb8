#![forbid(unsafe_code)]

//! End-to-end applier runs against the in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::core::{DynamicObject, TypeMeta};

use capstan_client::{annotation, object_id, FakeResourceClient};
use capstan_core::{
    GraphError, ObjectId, ObjectIdSet, Reconcile, DEPENDS_ON, LIFECYCLE_DELETION,
    OWNING_INVENTORY, PREVENT_DELETION,
};
use capstan_engine::event::{ApplyOp, GroupPhase, PruneOp, WaitOp};
use capstan_engine::{
    AlwaysReady, Applier, ApplierOptions, Event, RunError, StatusPoller,
};
use capstan_inventory::{FakeInventoryStore, Inventory, InventoryPolicy, InventoryRef};

fn inv_ref() -> InventoryRef {
    InventoryRef::new("inv", "default", "inv-id")
}

fn obj(api_version: &str, kind: &str, name: &str, annotations: &[(&str, &str)]) -> DynamicObject {
    let mut map = std::collections::BTreeMap::new();
    for (k, v) in annotations {
        map.insert(k.to_string(), v.to_string());
    }
    DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: kube::core::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("ns".to_string()),
            annotations: if map.is_empty() { None } else { Some(map) },
            ..Default::default()
        },
        data: serde_json::json!({"data": {"k": "v"}}),
    }
}

fn cm(name: &str) -> DynamicObject {
    obj("v1", "ConfigMap", name, &[])
}

fn deploy(name: &str) -> DynamicObject {
    obj("apps/v1", "Deployment", name, &[])
}

fn owned(mut o: DynamicObject, inventory_id: &str) -> DynamicObject {
    o.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(OWNING_INVENTORY.to_string(), inventory_id.to_string());
    o
}

fn seed_record(store: &FakeInventoryStore, ids: &[ObjectId]) {
    let mut inv = Inventory::new(inv_ref());
    for id in ids {
        inv.objects.insert(id.clone());
    }
    store.seed(inv);
}

fn applier(
    client: &Arc<FakeResourceClient>,
    store: &Arc<FakeInventoryStore>,
) -> Applier<FakeResourceClient, FakeInventoryStore, AlwaysReady> {
    Applier::new(Arc::clone(client), Arc::clone(store), Arc::new(AlwaysReady))
}

struct NeverReady;

#[async_trait]
impl StatusPoller for NeverReady {
    async fn reconciled(&self, _id: &ObjectId) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Bracket sequence of the event stream, in order.
fn group_sequence(events: &[Event]) -> Vec<(String, GroupPhase)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ActionGroup { name, phase, .. } => Some((name.clone(), *phase)),
            _ => None,
        })
        .collect()
}

/// Every per-object event must fall between its own group's brackets,
/// and brackets must be properly nested in task order.
fn assert_grouped(events: &[Event]) {
    let mut open: Option<String> = None;
    for e in events {
        match e {
            Event::ActionGroup {
                name,
                phase: GroupPhase::Started,
                ..
            } => {
                assert!(open.is_none(), "group {name} started inside {open:?}");
                open = Some(name.clone());
            }
            Event::ActionGroup {
                name,
                phase: GroupPhase::Finished,
                ..
            } => {
                assert_eq!(open.as_deref(), Some(name.as_str()));
                open = None;
            }
            Event::Apply { group, .. }
            | Event::Prune { group, .. }
            | Event::Delete { group, .. }
            | Event::Wait { group, .. } => {
                assert_eq!(
                    open.as_deref(),
                    Some(group.as_str()),
                    "event for group {group} emitted outside its brackets"
                );
            }
            Event::Init { .. } | Event::Error { .. } | Event::Status { .. } => {}
        }
    }
    assert!(open.is_none(), "unclosed group {open:?}");
}

#[tokio::test]
async fn fresh_apply_creates_objects_and_records_inventory() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let handle = applier(&client, &store).run(
        inv_ref(),
        vec![deploy("api"), cm("cfg")],
        ApplierOptions::default(),
    );
    let (events, result) = handle.collect().await;
    result.unwrap();

    let cfg_id = object_id(&cm("cfg")).unwrap();
    let api_id = object_id(&deploy("api")).unwrap();

    let record = store.stored(&inv_ref()).expect("inventory written");
    let expect: ObjectIdSet = vec![cfg_id.clone(), api_id.clone()].into();
    assert_eq!(record.objects, expect);
    assert_eq!(
        record.statuses.get(&cfg_id).unwrap().reconcile,
        Reconcile::Succeeded
    );

    // Ownership annotation landed on the live objects.
    let live = client.current(&cfg_id).unwrap();
    assert_eq!(annotation(&live, OWNING_INVENTORY), Some("inv-id"));

    // Init first, then the bracketed task sequence.
    assert!(matches!(events.first(), Some(Event::Init { .. })));
    let seq = group_sequence(&events);
    let names: Vec<&str> = seq
        .iter()
        .filter(|(_, p)| *p == GroupPhase::Started)
        .map(|(n, _)| n.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["inventory-add-0", "apply-0", "wait-0", "prune-0", "inventory-set-0"]
    );
    assert_grouped(&events);

    // ConfigMap precedes Deployment within the layer.
    let applied: Vec<ObjectId> = events
        .iter()
        .filter_map(|e| match e {
            Event::Apply { id, op, err: None, .. } => {
                assert_eq!(*op, ApplyOp::ServersideApplied);
                Some(id.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(applied, vec![cfg_id, api_id]);
}

#[tokio::test]
async fn prune_removes_undesired_objects_in_reverse_apply_order() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let gone_cm = client.seed(owned(cm("old-cfg"), "inv-id"));
    let gone_deploy = client.seed(owned(deploy("old-api"), "inv-id"));
    let keep = object_id(&cm("cfg")).unwrap();
    seed_record(&store, &[gone_cm.clone(), gone_deploy.clone(), keep.clone()]);

    let handle = applier(&client, &store).run(inv_ref(), vec![cm("cfg")], ApplierOptions::default());
    let (events, result) = handle.collect().await;
    result.unwrap();

    assert!(!client.contains(&gone_cm));
    assert!(!client.contains(&gone_deploy));
    let record = store.stored(&inv_ref()).unwrap();
    assert_eq!(record.objects, vec![keep].into());

    // Children first: the Deployment is pruned before the ConfigMap.
    let pruned: Vec<ObjectId> = events
        .iter()
        .filter_map(|e| match e {
            Event::Prune {
                id,
                op: PruneOp::Pruned,
                err: None,
                ..
            } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(pruned, vec![gone_deploy, gone_cm]);
    assert_grouped(&events);
}

#[tokio::test]
async fn must_match_policy_refuses_to_adopt_unowned_objects() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let id = client.seed(cm("cfg")); // live, no owner annotation

    let handle = applier(&client, &store).run(inv_ref(), vec![cm("cfg")], ApplierOptions::default());
    let (events, result) = handle.collect().await;
    // A skipped apply is not a failure.
    result.unwrap();

    // Not adopted: no annotation written, not recorded as owned.
    let live = client.current(&id).unwrap();
    assert_eq!(annotation(&live, OWNING_INVENTORY), None);
    let record = store.stored(&inv_ref()).unwrap();
    assert!(record.objects.is_empty());

    assert!(events.iter().any(|e| matches!(
        e,
        Event::Apply { err: Some(msg), .. } if msg.contains("apply skipped")
    )));
}

#[tokio::test]
async fn adopt_if_no_inventory_takes_ownership_of_unowned_objects() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let id = client.seed(cm("cfg"));

    let opts = ApplierOptions {
        policy: InventoryPolicy::AdoptIfNoInventory,
        ..Default::default()
    };
    let handle = applier(&client, &store).run(inv_ref(), vec![cm("cfg")], opts);
    let (_events, result) = handle.collect().await;
    result.unwrap();

    let live = client.current(&id).unwrap();
    assert_eq!(annotation(&live, OWNING_INVENTORY), Some("inv-id"));
    let record = store.stored(&inv_ref()).unwrap();
    assert!(record.objects.contains(&id));
}

#[tokio::test]
async fn objects_owned_elsewhere_are_abandoned_under_must_match() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    // Previously ours per the record, but live ownership moved away.
    let id = client.seed(owned(cm("cfg"), "someone-else"));
    seed_record(&store, &[id.clone()]);

    let handle = applier(&client, &store).run(inv_ref(), vec![cm("cfg")], ApplierOptions::default());
    let (_events, result) = handle.collect().await;
    result.unwrap();

    // Dropped from the record even though it was in prev inventory.
    let record = store.stored(&inv_ref()).unwrap();
    assert!(record.objects.is_empty());
    // Property: never applied, never deleted.
    assert!(client.contains(&id));
    assert_eq!(
        annotation(&client.current(&id).unwrap(), OWNING_INVENTORY),
        Some("someone-else")
    );
}

#[tokio::test]
async fn prevent_remove_annotation_abandons_instead_of_pruning() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let keep_id = object_id(&cm("cfg")).unwrap();
    let detached = owned(
        obj("v1", "ConfigMap", "precious", &[(LIFECYCLE_DELETION, PREVENT_DELETION)]),
        "inv-id",
    );
    let detached_id = client.seed(detached);
    seed_record(&store, &[keep_id.clone(), detached_id.clone()]);

    let handle = applier(&client, &store).run(inv_ref(), vec![cm("cfg")], ApplierOptions::default());
    let (events, result) = handle.collect().await;
    result.unwrap();

    // Still alive, but the ownership annotation is stripped.
    let live = client.current(&detached_id).expect("object not deleted");
    assert_eq!(annotation(&live, OWNING_INVENTORY), None);
    assert_eq!(annotation(&live, LIFECYCLE_DELETION), Some(PREVENT_DELETION));

    // Abandoned: gone from the record.
    let record = store.stored(&inv_ref()).unwrap();
    assert_eq!(record.objects, vec![keep_id].into());

    assert!(events.iter().any(|e| matches!(
        e,
        Event::Prune {
            id,
            op: PruneOp::PruneSkipped,
            err: Some(_),
            ..
        } if *id == detached_id
    )));
}

#[tokio::test]
async fn failed_deletes_stay_in_the_inventory() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let keep_id = object_id(&cm("cfg")).unwrap();
    let stuck_id = client.seed(owned(cm("stuck"), "inv-id"));
    client.fail_delete(stuck_id.clone());
    seed_record(&store, &[keep_id.clone(), stuck_id.clone()]);

    let handle = applier(&client, &store).run(inv_ref(), vec![cm("cfg")], ApplierOptions::default());
    let (_events, result) = handle.collect().await;
    match result {
        Err(RunError::ResourcesFailed { failed, timed_out }) => {
            assert_eq!(failed, 1);
            assert_eq!(timed_out, 0);
        }
        other => panic!("expected resources-failed, got {other:?}"),
    }

    let record = store.stored(&inv_ref()).unwrap();
    let expect: ObjectIdSet = vec![keep_id, stuck_id].into();
    assert_eq!(record.objects, expect);
}

#[tokio::test]
async fn depends_on_annotation_layers_the_apply() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let base = cm("base");
    let base_id = object_id(&base).unwrap();
    let dependent = obj(
        "v1",
        "ConfigMap",
        "dependent",
        &[(DEPENDS_ON, base_id.canonical().as_str())],
    );

    let handle = applier(&client, &store).run(
        inv_ref(),
        vec![dependent, base],
        ApplierOptions::default(),
    );
    let (events, result) = handle.collect().await;
    result.unwrap();

    let seq = group_sequence(&events);
    let names: Vec<&str> = seq
        .iter()
        .filter(|(_, p)| *p == GroupPhase::Started)
        .map(|(n, _)| n.as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "inventory-add-0",
            "apply-0",
            "wait-0",
            "apply-1",
            "wait-1",
            "prune-0",
            "inventory-set-0"
        ]
    );

    let applied: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            Event::Apply { id, err: None, .. } => Some(id.name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(applied, vec!["base", "dependent"]);
}

#[tokio::test]
async fn dependency_cycles_are_rejected_at_ingestion() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let a_id = object_id(&cm("a")).unwrap();
    let b_id = object_id(&cm("b")).unwrap();
    let a = obj("v1", "ConfigMap", "a", &[(DEPENDS_ON, b_id.canonical().as_str())]);
    let b = obj("v1", "ConfigMap", "b", &[(DEPENDS_ON, a_id.canonical().as_str())]);

    let handle = applier(&client, &store).run(inv_ref(), vec![a, b], ApplierOptions::default());
    let (events, result) = handle.collect().await;
    match result {
        Err(RunError::Graph(GraphError::Cycle(_))) => {}
        other => panic!("expected cycle rejection, got {other:?}"),
    }
    assert!(events.iter().any(|e| matches!(e, Event::Error { .. })));
    // Nothing was mutated.
    assert!(!client.contains(&a_id));
    assert!(store.stored(&inv_ref()).is_none());
}

#[tokio::test]
async fn wait_deadline_records_timeouts_but_still_persists_inventory() {
    std::env::set_var("CAPSTAN_WAIT_POLL_MS", "10");
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let applier: Applier<_, _, NeverReady> = Applier::new(
        Arc::clone(&client),
        Arc::clone(&store),
        Arc::new(NeverReady),
    );
    let opts = ApplierOptions {
        reconcile_timeout: Duration::from_millis(40),
        ..Default::default()
    };
    let handle = applier.run(inv_ref(), vec![cm("cfg")], opts);
    let (events, result) = handle.collect().await;
    match result {
        Err(RunError::ResourcesFailed { failed, timed_out }) => {
            assert_eq!(failed, 0);
            assert_eq!(timed_out, 1);
        }
        other => panic!("expected timeout aggregate, got {other:?}"),
    }

    let id = object_id(&cm("cfg")).unwrap();
    let record = store.stored(&inv_ref()).unwrap();
    assert!(record.objects.contains(&id));
    assert_eq!(
        record.statuses.get(&id).unwrap().reconcile,
        Reconcile::Timeout
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Wait { op: WaitOp::ReconcileTimeout, .. })));
}

#[tokio::test]
async fn cancellation_aborts_between_tasks_but_inventory_set_runs() {
    std::env::set_var("CAPSTAN_WAIT_POLL_MS", "10");
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let applier: Applier<_, _, NeverReady> = Applier::new(
        Arc::clone(&client),
        Arc::clone(&store),
        Arc::new(NeverReady),
    );
    let opts = ApplierOptions {
        reconcile_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let mut handle = applier.run(inv_ref(), vec![cm("cfg")], opts);

    // Cancel once the wait task is underway; the apply has finished.
    while let Some(event) = handle.events.recv().await {
        if matches!(
            &event,
            Event::ActionGroup { name, phase: GroupPhase::Started, .. } if name == "wait-0"
        ) {
            break;
        }
    }
    handle.cancel();
    let result = handle.wait().await;
    assert!(matches!(result, Err(RunError::Cancelled)));

    // Partial progress persisted: the applied object is in the record.
    let id = object_id(&cm("cfg")).unwrap();
    let record = store.stored(&inv_ref()).expect("inventory-set still ran");
    assert!(record.objects.contains(&id));
}

#[tokio::test]
async fn applies_a_manifest_parsed_from_yaml() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let yaml = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: from-yaml
  namespace: ns
data:
  k: v
";
    let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
    let manifest: DynamicObject =
        serde_json::from_value(serde_json::to_value(value).unwrap()).unwrap();
    let id = object_id(&manifest).unwrap();

    let handle = applier(&client, &store).run(inv_ref(), vec![manifest], ApplierOptions::default());
    let (_events, result) = handle.collect().await;
    result.unwrap();

    assert!(client.contains(&id));
    let record = store.stored(&inv_ref()).unwrap();
    assert!(record.objects.contains(&id));
}

#[tokio::test]
async fn client_dry_run_mutates_nothing_but_reports_operations() {
    let client = Arc::new(FakeResourceClient::new());
    let store = Arc::new(FakeInventoryStore::new());

    let live_id = client.seed(owned(cm("gone"), "inv-id"));
    let keep = object_id(&cm("cfg")).unwrap();
    seed_record(&store, &[live_id.clone()]);

    let opts = ApplierOptions {
        dry_run: capstan_core::DryRunStrategy::Client,
        ..Default::default()
    };
    let handle = applier(&client, &store).run(inv_ref(), vec![cm("cfg")], opts);
    let (events, result) = handle.collect().await;
    result.unwrap();

    // Nothing actually created or deleted.
    assert!(!client.contains(&keep));
    assert!(client.contains(&live_id));
    // The stored record is untouched by the dry run.
    let record = store.stored(&inv_ref()).unwrap();
    assert_eq!(record.objects, vec![live_id.clone()].into());

    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Apply { op: ApplyOp::Created, err: None, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Prune { op: PruneOp::Pruned, err: None, .. })));
}
