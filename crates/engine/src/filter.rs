//! Validation filters: named predicates gating apply and prune.
//!
//! Filters run in declaration order; the first block or error
//! short-circuits the pipeline. A block never removes the object from
//! the inventory, it only skips the operation.

use anyhow::Context;
use kube::core::DynamicObject;
use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

use capstan_client::{annotation, object_id};
use capstan_core::{ObjectId, LIFECYCLE_DELETION, PREVENT_DELETION};
use capstan_inventory::{can_apply, can_prune, id_match, IdMatch, InventoryPolicy};

pub const PREVENT_REMOVE_FILTER: &str = "PreventRemoveFilter";
pub const INVENTORY_POLICY_FILTER: &str = "InventoryPolicyFilter";
pub const DEPENDENCY_FILTER: &str = "DependencyFilter";
pub const LOCAL_NAMESPACE_FILTER: &str = "LocalNamespaceFilter";
pub const CURRENT_UID_FILTER: &str = "CurrentUidFilter";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block(String),
}

pub trait ValidationFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn filter(&self, obj: &DynamicObject) -> anyhow::Result<Decision>;
}

/// Outcome of running a whole pipeline over one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Blocked {
        filter: &'static str,
        reason: String,
    },
}

#[derive(Default)]
pub struct FilterPipeline {
    filters: Vec<Box<dyn ValidationFilter>>,
}

impl FilterPipeline {
    pub fn new(filters: Vec<Box<dyn ValidationFilter>>) -> Self {
        Self { filters }
    }

    pub fn evaluate(&self, obj: &DynamicObject) -> anyhow::Result<Verdict> {
        for f in &self.filters {
            match f.filter(obj).with_context(|| format!("filter {}", f.name()))? {
                Decision::Allow => {}
                Decision::Block(reason) => {
                    return Ok(Verdict::Blocked {
                        filter: f.name(),
                        reason,
                    })
                }
            }
        }
        Ok(Verdict::Allow)
    }
}

/// Blocks prune when the object carries the prevent-deletion annotation.
pub struct PreventRemoveFilter;

impl ValidationFilter for PreventRemoveFilter {
    fn name(&self) -> &'static str {
        PREVENT_REMOVE_FILTER
    }

    fn filter(&self, obj: &DynamicObject) -> anyhow::Result<Decision> {
        if annotation(obj, LIFECYCLE_DELETION) == Some(PREVENT_DELETION) {
            return Ok(Decision::Block(format!(
                "object removal prevented; delete annotation: {LIFECYCLE_DELETION}={PREVENT_DELETION}"
            )));
        }
        Ok(Decision::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOp {
    Apply,
    Prune,
}

/// Enforces the ownership policy against the live owner annotation.
pub struct InventoryPolicyFilter {
    pub inventory_id: String,
    pub policy: InventoryPolicy,
    pub op: PolicyOp,
}

impl ValidationFilter for InventoryPolicyFilter {
    fn name(&self) -> &'static str {
        INVENTORY_POLICY_FILTER
    }

    fn filter(&self, obj: &DynamicObject) -> anyhow::Result<Decision> {
        let m = id_match(&self.inventory_id, obj);
        let allowed = match self.op {
            PolicyOp::Apply => can_apply(self.policy, m),
            PolicyOp::Prune => can_prune(self.policy, m),
        };
        if allowed {
            return Ok(Decision::Allow);
        }
        let reason = match m {
            IdMatch::Empty => {
                "object has no owning-inventory annotation and the policy requires ownership"
                    .to_string()
            }
            _ => "object is owned by another inventory".to_string(),
        };
        Ok(Decision::Block(reason))
    }
}

/// Blocks prune of an object another desired object still depends on.
pub struct DependencyFilter {
    pub dependents: FxHashMap<ObjectId, Vec<ObjectId>>,
}

impl ValidationFilter for DependencyFilter {
    fn name(&self) -> &'static str {
        DEPENDENCY_FILTER
    }

    fn filter(&self, obj: &DynamicObject) -> anyhow::Result<Decision> {
        let id = object_id(obj)?;
        if let Some(deps) = self.dependents.get(&id) {
            if let Some(first) = deps.iter().min() {
                return Ok(Decision::Block(format!(
                    "object still depended on by {first}"
                )));
            }
        }
        Ok(Decision::Allow)
    }
}

/// Blocks prune of a namespace that still hosts apply-targets this run.
pub struct LocalNamespaceFilter {
    pub namespaces: FxHashSet<String>,
}

impl ValidationFilter for LocalNamespaceFilter {
    fn name(&self) -> &'static str {
        LOCAL_NAMESPACE_FILTER
    }

    fn filter(&self, obj: &DynamicObject) -> anyhow::Result<Decision> {
        let id = object_id(obj)?;
        if id.group.is_empty() && id.kind == "Namespace" && self.namespaces.contains(&id.name) {
            return Ok(Decision::Block(
                "namespace still hosts objects applied in this run".to_string(),
            ));
        }
        Ok(Decision::Allow)
    }
}

/// Blocks prune when the live uid differs from the uid recorded at
/// apply time. Ids with no recorded uid pass.
pub struct CurrentUidFilter {
    pub recorded: FxHashMap<ObjectId, Uuid>,
}

impl ValidationFilter for CurrentUidFilter {
    fn name(&self) -> &'static str {
        CURRENT_UID_FILTER
    }

    fn filter(&self, obj: &DynamicObject) -> anyhow::Result<Decision> {
        let id = object_id(obj)?;
        let Some(expected) = self.recorded.get(&id) else {
            return Ok(Decision::Allow);
        };
        let Some(live_uid) = obj.metadata.uid.as_deref() else {
            return Ok(Decision::Allow);
        };
        let live = Uuid::parse_str(live_uid)
            .with_context(|| format!("parsing live uid of {id}"))?;
        if live != *expected {
            return Ok(Decision::Block(
                "live uid differs from the uid recorded at apply time".to_string(),
            ));
        }
        Ok(Decision::Allow)
    }
}
