//! Per-run cache of fetched live objects, keyed by object id.

use kube::core::DynamicObject;
use rustc_hash::FxHashMap;

use capstan_core::ObjectId;

#[derive(Debug, Default)]
pub struct ResourceCache {
    map: FxHashMap<ObjectId, DynamicObject>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, id: ObjectId, obj: DynamicObject) {
        self.map.insert(id, obj);
    }

    pub fn get(&self, id: &ObjectId) -> Option<&DynamicObject> {
        self.map.get(id)
    }

    pub fn remove(&mut self, id: &ObjectId) -> Option<DynamicObject> {
        self.map.remove(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
