//! Plants shared per simulated address.

use crate::plant::{FopdtPlant, SharedPlant};
use parking_lot::Mutex;
use pitaya_core::config::SimulatorSettings;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of simulated plants keyed by device address.
///
/// Every backend opened for the same address steps the same plant, so several
/// connections observe one evolving state. The bank is owned by whoever
/// creates simulator backends and cloned cheaply into them.
#[derive(Clone, Default)]
pub struct PlantBank {
    plants: Arc<Mutex<HashMap<String, SharedPlant>>>,
}

impl PlantBank {
    /// Empty bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant for `address`, created from `settings` on first use.
    ///
    /// Settings only apply at creation; later callers share the existing
    /// plant unchanged.
    pub fn plant(&self, address: &str, settings: &SimulatorSettings) -> SharedPlant {
        let mut plants = self.plants.lock();
        Arc::clone(plants.entry(address.to_string()).or_insert_with(|| {
            tracing::debug!(address, "Creating simulated plant");
            Arc::new(Mutex::new(FopdtPlant::new(settings)))
        }))
    }

    /// Existing plant for `address`.
    pub fn get(&self, address: &str) -> Option<SharedPlant> {
        self.plants.lock().get(address).cloned()
    }

    /// Drop the plant for `address`; the next backend starts from rest.
    pub fn forget(&self, address: &str) -> bool {
        self.plants.lock().remove(address).is_some()
    }

    /// Number of simulated addresses.
    pub fn len(&self) -> usize {
        self.plants.lock().len()
    }

    /// Whether no plant exists yet.
    pub fn is_empty(&self) -> bool {
        self.plants.lock().is_empty()
    }
}

impl std::fmt::Debug for PlantBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plants = self.plants.lock();
        let mut addresses: Vec<&String> = plants.keys().collect();
        addresses.sort();
        f.debug_struct("PlantBank")
            .field("addresses", &addresses)
            .finish()
    }
}
