//! Capstan core types: object identity, set algebra, kind ordering,
//! dependency layering, and actuation status.

#![forbid(unsafe_code)]

pub mod graph;
pub mod id;
pub mod ordering;
pub mod status;

pub use graph::{layers, parse_depends_on, GraphError};
pub use id::{ObjectId, ObjectIdSet, ParseIdError};
pub use status::{Actuation, ObjectStatus, Reconcile, Strategy};

use serde::{Deserialize, Serialize};

/// Annotation marking which inventory record owns a live object.
pub const OWNING_INVENTORY: &str = "config.k8s.io/owning-inventory";

/// Lifecycle annotation consulted before pruning.
pub const LIFECYCLE_DELETION: &str = "client.lifecycle.config.k8s.io/deletion";

/// Value of [`LIFECYCLE_DELETION`] that forbids pruning the object.
pub const PREVENT_DELETION: &str = "detach";

/// Annotation listing canonical object ids this object depends on.
pub const DEPENDS_ON: &str = "config.kubernetes.io/depends-on";

/// Label carrying the inventory id on the persisted inventory record.
pub const INVENTORY_LABEL: &str = "cfg.k8s.io/inventory-id";

/// Whether mutations are real, simulated locally, or simulated by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DryRunStrategy {
    #[default]
    None,
    Client,
    Server,
}

impl DryRunStrategy {
    pub fn client_or_server(self) -> bool {
        matches!(self, DryRunStrategy::Client | DryRunStrategy::Server)
    }

    pub fn server(self) -> bool {
        matches!(self, DryRunStrategy::Server)
    }
}

pub mod prelude {
    pub use super::{
        DryRunStrategy, ObjectId, ObjectIdSet, ObjectStatus, DEPENDS_ON, INVENTORY_LABEL,
        LIFECYCLE_DELETION, OWNING_INVENTORY, PREVENT_DELETION,
    };
}
