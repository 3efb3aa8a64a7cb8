//! In-memory inventory store for engine tests.

use std::sync::Mutex;

use anyhow::anyhow;
use rustc_hash::FxHashMap;

use capstan_client::ClientError;
use capstan_core::DryRunStrategy;

use crate::{Inventory, InventoryError, InventoryRef, InventoryStore, UpdateOptions};

#[derive(Default)]
struct FakeInvState {
    records: FxHashMap<String, Inventory>,
    update_calls: usize,
    last_update_status: Option<bool>,
    fail_message: Option<String>,
}

#[derive(Default)]
pub struct FakeInventoryStore {
    state: Mutex<FakeInvState>,
}

fn key(inv_ref: &InventoryRef) -> String {
    format!("{}/{}", inv_ref.namespace, inv_ref.name)
}

impl FakeInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, inv: Inventory) {
        let mut st = self.state.lock().unwrap();
        st.records.insert(key(inv.inv_ref()), inv);
    }

    /// Force every subsequent call to fail with the given message.
    pub fn fail_with(&self, message: &str) {
        self.state.lock().unwrap().fail_message = Some(message.to_string());
    }

    pub fn stored(&self, inv_ref: &InventoryRef) -> Option<Inventory> {
        self.state.lock().unwrap().records.get(&key(inv_ref)).cloned()
    }

    pub fn update_calls(&self) -> usize {
        self.state.lock().unwrap().update_calls
    }

    pub fn last_update_status(&self) -> Option<bool> {
        self.state.lock().unwrap().last_update_status
    }

    fn check_fail(st: &FakeInvState) -> Result<(), InventoryError> {
        if let Some(msg) = &st.fail_message {
            return Err(InventoryError::Client(ClientError::Other(anyhow!(
                "{msg}"
            ))));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl InventoryStore for FakeInventoryStore {
    async fn get(&self, inv_ref: &InventoryRef) -> Result<Option<Inventory>, InventoryError> {
        let st = self.state.lock().unwrap();
        Self::check_fail(&st)?;
        Ok(st.records.get(&key(inv_ref)).cloned())
    }

    async fn list(&self) -> Result<Vec<Inventory>, InventoryError> {
        let st = self.state.lock().unwrap();
        Self::check_fail(&st)?;
        let mut keys: Vec<&String> = st.records.keys().collect();
        keys.sort();
        Ok(keys
            .into_iter()
            .map(|k| st.records[k].clone())
            .collect())
    }

    async fn update(&self, inv: &mut Inventory, opts: UpdateOptions) -> Result<(), InventoryError> {
        let mut st = self.state.lock().unwrap();
        Self::check_fail(&st)?;
        st.update_calls += 1;
        st.last_update_status = Some(opts.update_status);
        if opts.dry_run.client_or_server() {
            return Ok(());
        }
        st.records.insert(key(inv.inv_ref()), inv.clone());
        Ok(())
    }

    async fn delete(
        &self,
        inv_ref: &InventoryRef,
        dry_run: DryRunStrategy,
    ) -> Result<(), InventoryError> {
        let mut st = self.state.lock().unwrap();
        Self::check_fail(&st)?;
        if !dry_run.client_or_server() {
            st.records.remove(&key(inv_ref));
        }
        Ok(())
    }
}
