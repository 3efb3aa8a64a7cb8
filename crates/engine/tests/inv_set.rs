#![forbid(unsafe_code)]

//! Final-inventory computation, table-driven over the outcome sets.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use capstan_core::{DryRunStrategy, ObjectId, ObjectIdSet, Reconcile};
use capstan_engine::{InvSetTask, Task, TaskContext};
use capstan_inventory::{FakeInventoryStore, Inventory, InventoryRef};

fn id1() -> ObjectId {
    ObjectId::new("apps", "Deployment", "ns", "one")
}

fn id2() -> ObjectId {
    ObjectId::new("", "ConfigMap", "ns", "two")
}

fn id3() -> ObjectId {
    ObjectId::new("", "Service", "ns", "three")
}

fn inv_ref() -> InventoryRef {
    InventoryRef::new("inv", "default", "inv-id")
}

struct Case {
    name: &'static str,
    prev: Vec<ObjectId>,
    applied: Vec<ObjectId>,
    failed_applies: Vec<ObjectId>,
    failed_deletes: Vec<ObjectId>,
    skipped_applies: Vec<ObjectId>,
    skipped_deletes: Vec<ObjectId>,
    abandoned: Vec<ObjectId>,
    expected: Vec<ObjectId>,
}

impl Default for Case {
    fn default() -> Self {
        Self {
            name: "",
            prev: vec![],
            applied: vec![],
            failed_applies: vec![],
            failed_deletes: vec![],
            skipped_applies: vec![],
            skipped_deletes: vec![],
            abandoned: vec![],
            expected: vec![],
        }
    }
}

#[tokio::test]
async fn final_inventory_truth_table() {
    let cases = vec![
        Case {
            name: "no applies, no prune failures: empty",
            ..Default::default()
        },
        Case {
            name: "one applied object",
            applied: vec![id1()],
            expected: vec![id1()],
            ..Default::default()
        },
        Case {
            name: "prune failure in prev inventory is retained",
            prev: vec![id1()],
            failed_deletes: vec![id1()],
            expected: vec![id1()],
            ..Default::default()
        },
        Case {
            name: "prune failure not in prev inventory drops out",
            failed_deletes: vec![id1()],
            ..Default::default()
        },
        Case {
            name: "applied and failed delete of the same object",
            applied: vec![id3()],
            failed_deletes: vec![id3()],
            expected: vec![id3()],
            ..Default::default()
        },
        Case {
            name: "two applies, two prune failures",
            prev: vec![id2(), id3()],
            applied: vec![id1(), id2()],
            failed_deletes: vec![id2(), id3()],
            expected: vec![id1(), id2(), id3()],
            ..Default::default()
        },
        Case {
            name: "apply failure not in prev inventory drops out",
            failed_applies: vec![id3()],
            ..Default::default()
        },
        Case {
            name: "apply failure in prev inventory is kept",
            applied: vec![id2()],
            failed_applies: vec![id3()],
            prev: vec![id3()],
            expected: vec![id2(), id3()],
            ..Default::default()
        },
        Case {
            name: "two apply failures, one in prev inventory",
            applied: vec![id2()],
            failed_applies: vec![id1(), id3()],
            prev: vec![id3()],
            expected: vec![id2(), id3()],
            ..Default::default()
        },
        Case {
            name: "three apply failures, two in prev inventory",
            failed_applies: vec![id1(), id2(), id3()],
            prev: vec![id2(), id3()],
            expected: vec![id2(), id3()],
            ..Default::default()
        },
        Case {
            name: "skipped apply in prev inventory is kept",
            prev: vec![id1()],
            skipped_applies: vec![id1()],
            expected: vec![id1()],
            ..Default::default()
        },
        Case {
            name: "skipped apply not in prev inventory drops out",
            skipped_applies: vec![id1()],
            ..Default::default()
        },
        Case {
            name: "apply plus skipped apply",
            prev: vec![id1(), id2()],
            applied: vec![id2()],
            skipped_applies: vec![id1()],
            expected: vec![id1(), id2()],
            ..Default::default()
        },
        Case {
            name: "skipped delete is kept",
            prev: vec![id1()],
            skipped_deletes: vec![id1()],
            expected: vec![id1()],
            ..Default::default()
        },
        Case {
            name: "apply plus skipped delete",
            prev: vec![id1(), id2()],
            applied: vec![id2()],
            skipped_deletes: vec![id1()],
            expected: vec![id1(), id2()],
            ..Default::default()
        },
        Case {
            name: "abandoned object leaves the inventory",
            prev: vec![id1(), id2(), id3()],
            applied: vec![id1(), id2()],
            abandoned: vec![id3()],
            expected: vec![id1(), id2()],
            ..Default::default()
        },
        Case {
            name: "all abandoned leaves nothing",
            prev: vec![id2(), id3()],
            abandoned: vec![id2(), id3()],
            ..Default::default()
        },
        Case {
            name: "abandon wins over skipped delete",
            prev: vec![id3()],
            skipped_deletes: vec![id3()],
            abandoned: vec![id3()],
            ..Default::default()
        },
    ];

    for case in cases {
        let store = Arc::new(FakeInventoryStore::new());
        let (event_tx, _event_rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut ctx = TaskContext::new(event_tx, cancel_rx);

        for id in &case.applied {
            ctx.add_successful_apply(id.clone(), None, 0);
        }
        for id in &case.failed_applies {
            ctx.add_failed_apply(id.clone());
        }
        for id in &case.failed_deletes {
            ctx.add_failed_delete(id.clone());
        }
        for id in &case.skipped_applies {
            ctx.add_skipped_apply(id.clone());
        }
        for id in &case.skipped_deletes {
            ctx.add_skipped_delete(id.clone());
        }
        for id in &case.abandoned {
            ctx.add_abandoned_object(id.clone());
        }

        let prev: ObjectIdSet = case.prev.clone().into();
        let task = InvSetTask::new(
            "inventory-set-0",
            Arc::clone(&store),
            Inventory::new(inv_ref()),
            prev.clone(),
            DryRunStrategy::None,
        );
        assert_eq!(task.name(), "inventory-set-0");
        task.run(&mut ctx).await;
        let result = ctx.recv_task_result().await;
        assert!(result.err.is_none(), "{}: unexpected error", case.name);

        let stored = store.stored(&inv_ref()).expect("record written");
        let expected: ObjectIdSet = case.expected.clone().into();
        assert_eq!(stored.objects, expected, "{}", case.name);
        assert_eq!(store.last_update_status(), Some(true), "{}", case.name);

        // Invariants over the computed set.
        let applied: ObjectIdSet = case.applied.clone().into();
        assert!(
            stored.objects.diff(&prev.union(&applied)).is_empty(),
            "{}: new set escapes prev union applied",
            case.name
        );
        let abandoned: ObjectIdSet = case.abandoned.clone().into();
        assert!(
            stored.objects.intersection(&abandoned).is_empty(),
            "{}: abandoned object kept",
            case.name
        );
    }
}

#[tokio::test]
async fn statuses_are_persisted_for_surviving_objects() {
    let store = Arc::new(FakeInventoryStore::new());
    let (event_tx, _event_rx) = mpsc::channel(64);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut ctx = TaskContext::new(event_tx, cancel_rx);

    ctx.add_successful_apply(id1(), None, 1);
    ctx.set_reconcile(id1(), Reconcile::Succeeded);
    ctx.add_failed_delete(id2());

    let task = InvSetTask::new(
        "inventory-set-0",
        Arc::clone(&store),
        Inventory::new(inv_ref()),
        vec![id2()].into(),
        DryRunStrategy::None,
    );
    task.run(&mut ctx).await;
    assert!(ctx.recv_task_result().await.err.is_none());

    let stored = store.stored(&inv_ref()).unwrap();
    let s1 = stored.statuses.get(&id1()).copied().unwrap();
    assert_eq!(s1.reconcile, Reconcile::Succeeded);
    assert!(stored.statuses.contains_key(&id2()));
    // statuses never outgrow membership
    for key in stored.statuses.keys() {
        assert!(stored.objects.contains(key));
    }
}
