//! Ownership enforcement: who may apply or prune a live object, based
//! on its owning-inventory annotation and the configured policy.

use kube::core::DynamicObject;

use capstan_client::annotation;
use capstan_core::OWNING_INVENTORY;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InventoryPolicy {
    /// Operate only on objects already owned by this inventory.
    #[default]
    MustMatch,
    /// Additionally adopt objects with no owner annotation.
    AdoptIfNoInventory,
    /// Operate regardless of the annotation.
    AdoptAll,
}

/// How a live object's owner annotation compares to the current id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMatch {
    Empty,
    Match,
    NoMatch,
}

pub fn id_match(inventory_id: &str, obj: &DynamicObject) -> IdMatch {
    match annotation(obj, OWNING_INVENTORY) {
        None => IdMatch::Empty,
        Some(v) if v == inventory_id => IdMatch::Match,
        Some(_) => IdMatch::NoMatch,
    }
}

pub fn can_apply(policy: InventoryPolicy, m: IdMatch) -> bool {
    match m {
        IdMatch::Match => true,
        IdMatch::Empty => policy != InventoryPolicy::MustMatch,
        IdMatch::NoMatch => policy == InventoryPolicy::AdoptAll,
    }
}

// The decision matrix is the same closed form for both operations.
pub fn can_prune(policy: InventoryPolicy, m: IdMatch) -> bool {
    can_apply(policy, m)
}
