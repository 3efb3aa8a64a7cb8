//! Fixed kind precedence: cluster plumbing and configs before workloads.

use std::cmp::Ordering;

use crate::id::ObjectId;

// Apply precedence. Prune walks it strictly in reverse so children go
// before the namespaces and definitions that host them.
const APPLY_ORDER: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ResourceQuota",
    "LimitRange",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicaSet",
    "Deployment",
    "StatefulSet",
    "HorizontalPodAutoscaler",
    "Job",
    "CronJob",
    "Ingress",
    "APIService",
];

/// Rank of a kind in the apply order; unknown kinds sort after all known ones.
pub fn kind_rank(kind: &str) -> usize {
    APPLY_ORDER
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(APPLY_ORDER.len())
}

/// Total apply order: kind rank, then canonical id as tie-break.
pub fn apply_cmp(a: &ObjectId, b: &ObjectId) -> Ordering {
    kind_rank(&a.kind)
        .cmp(&kind_rank(&b.kind))
        .then_with(|| a.cmp(b))
}

pub fn sort_for_apply(ids: &mut [ObjectId]) {
    ids.sort_by(apply_cmp);
}

pub fn sort_for_prune(ids: &mut [ObjectId]) {
    ids.sort_by(|a, b| apply_cmp(b, a));
}
