//! Resource access layer: the client trait the engine drives, typed
//! error kinds, and helpers for working with dynamic objects.

#![forbid(unsafe_code)]

pub mod dynamic;
pub mod fake;

pub use dynamic::DynamicResourceClient;
pub use fake::FakeResourceClient;

use async_trait::async_trait;
use kube::core::DynamicObject;

use capstan_core::ObjectId;

/// Deletion propagation handed to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Propagation {
    #[default]
    Background,
    Foreground,
    Orphan,
}

/// Typed failure kinds; not-found and no-match are first-class outcomes
/// rather than opaque errors so prune can treat them as success.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("resource {0} not found")]
    NotFound(ObjectId),
    #[error("no registered resource type for group {group:?} kind {kind:?}")]
    NoMatch { group: String, kind: String },
    #[error("conflict writing {0}")]
    Conflict(ObjectId),
    #[error("object has no type or name metadata")]
    Unidentified,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_no_match(&self) -> bool {
        matches!(self, ClientError::NoMatch { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }

    /// Conflicts and transport errors are worth a single retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Conflict(_) | ClientError::Other(_))
    }
}

/// Per-kind operations against the resource store.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, id: &ObjectId) -> Result<DynamicObject, ClientError>;

    async fn list(
        &self,
        group: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;

    /// Server-side apply with the given field manager.
    async fn apply(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, ClientError>;

    async fn delete(&self, id: &ObjectId, propagation: Propagation) -> Result<(), ClientError>;

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
}

/// Identity of a dynamic object from its type and object metadata.
pub fn object_id(obj: &DynamicObject) -> Result<ObjectId, ClientError> {
    let types = obj.types.as_ref().ok_or(ClientError::Unidentified)?;
    let name = obj
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or(ClientError::Unidentified)?;
    let group = match types.api_version.split_once('/') {
        Some((g, _version)) => g.to_string(),
        None => String::new(),
    };
    Ok(ObjectId {
        group,
        kind: types.kind.clone(),
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name,
    })
}

/// Read an annotation off a dynamic object.
pub fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Set an annotation in place.
pub fn set_annotation(obj: &mut DynamicObject, key: &str, value: &str) {
    obj.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

/// Remove an annotation; returns whether it was present.
pub fn remove_annotation(obj: &mut DynamicObject, key: &str) -> bool {
    obj.metadata
        .annotations
        .as_mut()
        .map(|a| a.remove(key).is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::TypeMeta;

    fn obj(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }),
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_string()),
                namespace: ns.map(String::from),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn object_id_splits_group_from_api_version() {
        let id = object_id(&obj("apps/v1", "Deployment", Some("ns"), "api")).unwrap();
        assert_eq!(id, ObjectId::new("apps", "Deployment", "ns", "api"));

        let id = object_id(&obj("v1", "ConfigMap", Some("ns"), "cfg")).unwrap();
        assert_eq!(id.group, "");
    }

    #[test]
    fn object_id_requires_types_and_name() {
        let mut o = obj("v1", "ConfigMap", None, "cfg");
        o.types = None;
        assert!(matches!(object_id(&o), Err(ClientError::Unidentified)));

        let mut o = obj("v1", "ConfigMap", None, "cfg");
        o.metadata.name = None;
        assert!(matches!(object_id(&o), Err(ClientError::Unidentified)));
    }

    #[test]
    fn annotation_helpers_round_trip() {
        let mut o = obj("v1", "ConfigMap", None, "cfg");
        assert_eq!(annotation(&o, "k"), None);
        set_annotation(&mut o, "k", "v");
        assert_eq!(annotation(&o, "k"), Some("v"));
        assert!(remove_annotation(&mut o, "k"));
        assert!(!remove_annotation(&mut o, "k"));
    }
}
