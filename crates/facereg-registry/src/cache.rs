//! Process-wide cache of loaded registries, one async lock per name.
//!
//! A registry is loaded from the store on first lock and stays cached.
//! Holding a [`RegistryGuard`] is what entitles a caller to mutate that
//! registry through the store; different names never contend.

use crate::error::Result;
use crate::store::{validate_name, RegistryStore};
use facereg_core::Registry;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    loaded: bool,
    registry: Registry,
}

/// Exclusive access to one cached registry.
pub struct RegistryGuard {
    slot: OwnedMutexGuard<Slot>,
}

impl Deref for RegistryGuard {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        &self.slot.registry
    }
}

impl DerefMut for RegistryGuard {
    fn deref_mut(&mut self) -> &mut Registry {
        &mut self.slot.registry
    }
}

pub struct RegistryCache {
    store: RegistryStore,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Slot>>>>,
}

impl RegistryCache {
    pub fn new(store: RegistryStore) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Lock a registry by name, loading it on first use.
    pub async fn lock(&self, name: &str) -> Result<RegistryGuard> {
        validate_name(name)?;

        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(AsyncMutex::new(Slot {
                        loaded: false,
                        registry: Registry::empty(name),
                    }))
                })
                .clone()
        };

        let mut slot = slot.lock_owned().await;
        if !slot.loaded {
            slot.registry = self.store.load(name).await?;
            slot.loaded = true;
        }
        Ok(RegistryGuard { slot })
    }

    /// Names of every registry referenced so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = slots.keys().cloned().collect();
        names.sort();
        names
    }
}
