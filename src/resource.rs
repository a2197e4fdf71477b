//! Exclusive instrument ownership.
//!
//! A run leases every instrument it touches from a [`ResourceRegistry`]. The
//! lease is an RAII guard: dropping it (on completion, abort, failure or
//! panic unwinding) returns the instruments to the registry. A request that
//! overlaps an active lease fails immediately with
//! [`DaqError::BusyResource`]; nothing is queued.

use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct RegistryInner {
    owners: HashMap<InstrumentId, Uuid>,
}

/// Tracks which run owns which instrument.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ResourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease all of `ids` for `owner`, or none of them.
    pub fn lease(&self, owner: Uuid, ids: &[InstrumentId]) -> AppResult<ResourceLease> {
        let mut inner = self.lock();
        if let Some(busy) = ids.iter().find(|id| inner.owners.contains_key(*id)) {
            return Err(DaqError::BusyResource(busy.clone()));
        }
        for id in ids {
            inner.owners.insert(id.clone(), owner);
        }
        debug!(%owner, instruments = ?ids, "instruments leased");

        Ok(ResourceLease {
            registry: self.clone(),
            owner,
            ids: ids.to_vec(),
        })
    }

    /// Run currently holding `id`.
    pub fn owner_of(&self, id: &InstrumentId) -> Option<Uuid> {
        self.lock().owners.get(id).copied()
    }

    /// Whether any run holds `id`.
    pub fn is_leased(&self, id: &InstrumentId) -> bool {
        self.owner_of(id).is_some()
    }

    fn release(&self, owner: Uuid, ids: &[InstrumentId]) {
        let mut inner = self.lock();
        for id in ids {
            if inner.owners.get(id) == Some(&owner) {
                inner.owners.remove(id);
            }
        }
        debug!(%owner, instruments = ?ids, "instruments released");
    }
}

/// RAII guard for leased instruments.
#[derive(Debug)]
pub struct ResourceLease {
    registry: ResourceRegistry,
    owner: Uuid,
    ids: Vec<InstrumentId>,
}

impl ResourceLease {
    /// Run holding the lease.
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Instruments covered by the lease.
    pub fn instruments(&self) -> &[InstrumentId] {
        &self.ids
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.registry.release(self.owner, &self.ids);
    }
}
