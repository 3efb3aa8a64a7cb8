//! Per-object actuation status persisted with the inventory record.
//!
//! Wire strings match the persisted triple format, e.g.
//! `{"strategy":"Apply","actuation":"Succeeded","reconcile":"Pending"}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    #[default]
    Apply,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actuation {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reconcile {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Skipped,
    Timeout,
}

/// The status triple tracked per owned object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStatus {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub actuation: Actuation,
    #[serde(default)]
    pub reconcile: Reconcile,
}

impl ObjectStatus {
    pub fn apply(actuation: Actuation, reconcile: Reconcile) -> Self {
        Self {
            strategy: Strategy::Apply,
            actuation,
            reconcile,
        }
    }

    pub fn delete(actuation: Actuation, reconcile: Reconcile) -> Self {
        Self {
            strategy: Strategy::Delete,
            actuation,
            reconcile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triple_uses_capitalized_wire_strings() {
        let s = ObjectStatus::apply(Actuation::Succeeded, Reconcile::Timeout);
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(
            json,
            r#"{"strategy":"Apply","actuation":"Succeeded","reconcile":"Timeout"}"#
        );
    }

    #[test]
    fn decode_tolerates_unknown_fields_and_defaults() {
        let s: ObjectStatus =
            serde_json::from_str(r#"{"strategy":"Delete","unknown":"x"}"#).unwrap();
        assert_eq!(s.strategy, Strategy::Delete);
        assert_eq!(s.actuation, Actuation::Pending);
        assert_eq!(s.reconcile, Reconcile::Pending);
    }
}
