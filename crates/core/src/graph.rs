//! Explicit dependency edges and topological layering.
//!
//! Dependencies are declared with the depends-on annotation as a
//! comma-separated list of canonical object ids. The relation must be
//! a DAG; cycles are rejected at ingestion.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::id::{ObjectId, ParseIdError};
use crate::ordering;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle involving {0}")]
    Cycle(ObjectId),
    #[error("invalid depends-on reference: {0}")]
    BadReference(#[from] ParseIdError),
}

/// Parse a depends-on annotation value into object ids.
pub fn parse_depends_on(value: &str) -> Result<Vec<ObjectId>, GraphError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(GraphError::from))
        .collect()
}

/// Group objects into dependency layers.
///
/// Every object in layer N has all of its in-set dependencies in layers
/// < N. Edges pointing outside the input set are ignored; they refer to
/// objects this run does not manage. Within a layer objects follow the
/// apply kind order. Returns [`GraphError::Cycle`] when the relation is
/// not a DAG.
pub fn layers(nodes: &[(ObjectId, Vec<ObjectId>)]) -> Result<Vec<Vec<ObjectId>>, GraphError> {
    let in_set: FxHashSet<ObjectId> = nodes.iter().map(|(id, _)| id.clone()).collect();

    let mut indegree: FxHashMap<ObjectId, usize> = FxHashMap::default();
    let mut dependents: FxHashMap<ObjectId, Vec<ObjectId>> = FxHashMap::default();
    for (id, deps) in nodes {
        indegree.entry(id.clone()).or_insert(0);
        for dep in deps {
            if dep == id || !in_set.contains(dep) {
                continue;
            }
            *indegree.entry(id.clone()).or_insert(0) += 1;
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
    }

    let mut ready: Vec<ObjectId> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut out = Vec::new();
    let mut placed = 0usize;

    while !ready.is_empty() {
        ordering::sort_for_apply(&mut ready);
        let mut next = Vec::new();
        for id in &ready {
            for dependent in dependents.get(id).cloned().unwrap_or_default() {
                let n = indegree
                    .get_mut(&dependent)
                    .expect("dependent was registered with an indegree");
                *n -= 1;
                if *n == 0 {
                    next.push(dependent);
                }
            }
        }
        placed += ready.len();
        out.push(std::mem::replace(&mut ready, next));
    }

    if placed != indegree.len() {
        // Deterministic witness: smallest unplaced id.
        let mut stuck: Vec<ObjectId> = indegree
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(id, _)| id)
            .collect();
        stuck.sort();
        let witness = stuck
            .into_iter()
            .next()
            .expect("unplaced node exists when counts disagree");
        return Err(GraphError::Cycle(witness));
    }
    Ok(out)
}
