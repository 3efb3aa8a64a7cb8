//! In-memory resource client for tests and offline wiring.
//!
//! Ships as library code so downstream users can exercise the engine
//! without a cluster. Tracks per-operation call counts; creates assign
//! uids and resource versions the way a server would.

use std::sync::Mutex;

use anyhow::anyhow;
use kube::core::DynamicObject;
use rustc_hash::{FxHashMap, FxHashSet};

use capstan_core::ObjectId;

use crate::{object_id, ClientError, Propagation, ResourceClient};

#[derive(Default)]
struct FakeState {
    objects: FxHashMap<ObjectId, DynamicObject>,
    unregistered: FxHashSet<(String, String)>,
    fail_deletes: FxHashSet<ObjectId>,
    fail_updates: FxHashSet<ObjectId>,
    calls: FxHashMap<&'static str, usize>,
    next_uid: u64,
}

#[derive(Default)]
pub struct FakeResourceClient {
    state: Mutex<FakeState>,
}

impl FakeResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a live object directly, bypassing call counting.
    pub fn seed(&self, obj: DynamicObject) -> ObjectId {
        let id = object_id(&obj).expect("seeded object must carry type and name");
        let mut st = self.state.lock().unwrap();
        let mut obj = obj;
        if obj.metadata.uid.is_none() {
            st.next_uid += 1;
            obj.metadata.uid = Some(format!("00000000-0000-0000-0000-{:012x}", st.next_uid));
        }
        if obj.metadata.resource_version.is_none() {
            obj.metadata.resource_version = Some("1".to_string());
        }
        st.objects.insert(id.clone(), obj);
        id
    }

    /// Mark a group/kind as having no registered resource type.
    pub fn mark_unregistered(&self, group: &str, kind: &str) {
        self.state
            .lock()
            .unwrap()
            .unregistered
            .insert((group.to_string(), kind.to_string()));
    }

    pub fn fail_delete(&self, id: ObjectId) {
        self.state.lock().unwrap().fail_deletes.insert(id);
    }

    pub fn fail_update(&self, id: ObjectId) {
        self.state.lock().unwrap().fail_updates.insert(id);
    }

    pub fn current(&self, id: &ObjectId) -> Option<DynamicObject> {
        self.state.lock().unwrap().objects.get(id).cloned()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.state.lock().unwrap().objects.contains_key(id)
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .find(|(k, _)| **k == op)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    fn count(st: &mut FakeState, op: &'static str) {
        *st.calls.entry(op).or_insert(0) += 1;
    }

    fn check_registered(st: &FakeState, group: &str, kind: &str) -> Result<(), ClientError> {
        if st
            .unregistered
            .contains(&(group.to_string(), kind.to_string()))
        {
            return Err(ClientError::NoMatch {
                group: group.to_string(),
                kind: kind.to_string(),
            });
        }
        Ok(())
    }

    fn bump_rv(obj: &mut DynamicObject) {
        let next = obj
            .metadata
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        obj.metadata.resource_version = Some(next.to_string());
    }
}

#[async_trait::async_trait]
impl ResourceClient for FakeResourceClient {
    async fn get(&self, id: &ObjectId) -> Result<DynamicObject, ClientError> {
        let mut st = self.state.lock().unwrap();
        Self::count(&mut st, "get");
        Self::check_registered(&st, &id.group, &id.kind)?;
        st.objects
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(id.clone()))
    }

    async fn list(
        &self,
        group: &str,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let mut st = self.state.lock().unwrap();
        Self::count(&mut st, "list");
        Self::check_registered(&st, group, kind)?;
        let label_key = label_selector.map(|s| s.split('=').next().unwrap_or(s));
        let mut out: Vec<(ObjectId, DynamicObject)> = st
            .objects
            .iter()
            .filter(|(id, _)| id.group == group && id.kind == kind)
            .filter(|(id, _)| namespace.map(|ns| id.namespace == ns).unwrap_or(true))
            .filter(|(_, obj)| match label_key {
                Some(key) => obj
                    .metadata
                    .labels
                    .as_ref()
                    .map(|l| l.contains_key(key))
                    .unwrap_or(false),
                None => true,
            })
            .map(|(id, obj)| (id.clone(), obj.clone()))
            .collect();
        out.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(out.into_iter().map(|(_, obj)| obj).collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let id = object_id(obj)?;
        let mut st = self.state.lock().unwrap();
        Self::count(&mut st, "create");
        Self::check_registered(&st, &id.group, &id.kind)?;
        if st.objects.contains_key(&id) {
            return Err(ClientError::Conflict(id));
        }
        let mut stored = obj.clone();
        st.next_uid += 1;
        stored.metadata.uid = Some(format!("00000000-0000-0000-0000-{:012x}", st.next_uid));
        stored.metadata.resource_version = Some("1".to_string());
        stored.metadata.generation = Some(1);
        st.objects.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let id = object_id(obj)?;
        let mut st = self.state.lock().unwrap();
        Self::count(&mut st, "update");
        Self::check_registered(&st, &id.group, &id.kind)?;
        if st.fail_updates.contains(&id) {
            return Err(ClientError::Other(anyhow!("injected update failure for {id}")));
        }
        let live = st
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(id.clone()))?;
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if live.metadata.resource_version.as_deref() != Some(rv) {
                return Err(ClientError::Conflict(id));
            }
        }
        let mut stored = obj.clone();
        stored.metadata.uid = live.metadata.uid.clone();
        stored.metadata.resource_version = live.metadata.resource_version.clone();
        stored.metadata.generation = Some(live.metadata.generation.unwrap_or(1) + 1);
        Self::bump_rv(&mut stored);
        st.objects.insert(id, stored.clone());
        Ok(stored)
    }

    async fn apply(
        &self,
        obj: &DynamicObject,
        _field_manager: &str,
    ) -> Result<DynamicObject, ClientError> {
        let id = object_id(obj)?;
        let mut st = self.state.lock().unwrap();
        Self::count(&mut st, "apply");
        Self::check_registered(&st, &id.group, &id.kind)?;
        let mut stored = obj.clone();
        match st.objects.get(&id) {
            Some(live) => {
                stored.metadata.uid = live.metadata.uid.clone();
                stored.metadata.resource_version = live.metadata.resource_version.clone();
                stored.metadata.generation = Some(live.metadata.generation.unwrap_or(1) + 1);
                Self::bump_rv(&mut stored);
            }
            None => {
                st.next_uid += 1;
                stored.metadata.uid =
                    Some(format!("00000000-0000-0000-0000-{:012x}", st.next_uid));
                stored.metadata.resource_version = Some("1".to_string());
                stored.metadata.generation = Some(1);
            }
        }
        st.objects.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &ObjectId, _propagation: Propagation) -> Result<(), ClientError> {
        let mut st = self.state.lock().unwrap();
        Self::count(&mut st, "delete");
        Self::check_registered(&st, &id.group, &id.kind)?;
        if st.fail_deletes.contains(id) {
            return Err(ClientError::Other(anyhow!("injected delete failure for {id}")));
        }
        if st.objects.remove(id).is_none() {
            return Err(ClientError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let id = object_id(obj)?;
        let mut st = self.state.lock().unwrap();
        Self::count(&mut st, "update_status");
        let live = st
            .objects
            .get_mut(&id)
            .ok_or_else(|| ClientError::NotFound(id.clone()))?;
        if let Some(status) = obj.data.get("status") {
            live.data["status"] = status.clone();
        }
        Ok(live.clone())
    }
}
