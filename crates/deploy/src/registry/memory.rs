use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{ProxyRegistry, RegistryError, check_transition, validate_name};
use crate::types::ProxyRecord;

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, ProxyRecord>,
    leased: HashSet<String>,
}

/// Registry kept in memory. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Lease on one module of a [`MemoryRegistry`], released on drop.
#[derive(Debug)]
pub struct MemoryLease {
    name: String,
    inner: Arc<Mutex<Inner>>,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.leased.remove(&self.name);
    }
}

impl ProxyRegistry for MemoryRegistry {
    type Lease = MemoryLease;

    fn lease(&self, name: &str) -> Result<MemoryLease, RegistryError> {
        validate_name(name)?;
        if !self.inner().leased.insert(name.to_string()) {
            return Err(RegistryError::Busy(name.to_string()));
        }
        Ok(MemoryLease {
            name: name.to_string(),
            inner: self.inner.clone(),
        })
    }

    fn lookup(&self, name: &str) -> Result<Option<ProxyRecord>, RegistryError> {
        validate_name(name)?;
        Ok(self.inner().records.get(name).cloned())
    }

    fn record(&self, name: &str, record: ProxyRecord) -> Result<(), RegistryError> {
        validate_name(name)?;
        let mut inner = self.inner();
        check_transition(name, inner.records.get(name), &record)?;
        inner.records.insert(name.to_string(), record);
        Ok(())
    }
}
