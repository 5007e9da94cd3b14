//! In-Memory Repository

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{EngineError, Result};

use super::{Criteria, Entity, Repository};

/// Thread-safe map-backed repository.
///
/// Each record carries the sequence number of its first insertion so
/// `find_all` returns records in creation order.
pub struct MemoryRepository<T: Entity> {
    records: RwLock<HashMap<String, (u64, T)>>,
    sequence: AtomicU64,
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, (u64, T)>>> {
        self.records
            .read()
            .map_err(|_| EngineError::Persistence("repository lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, (u64, T)>>> {
        self.records
            .write()
            .map_err(|_| EngineError::Persistence("repository lock poisoned".to_string()))
    }
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Repository<T> for MemoryRepository<T> {
    fn save(&self, entity: T) -> Result<String> {
        let id = entity.id().to_string();
        let mut records = self.write()?;
        let seq = match records.get(&id) {
            Some((seq, _)) => *seq,
            None => self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        records.insert(id.clone(), (seq, entity));
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.read()?.get(id).map(|(_, entity)| entity.clone()))
    }

    fn find_one(&self, criteria: &Criteria) -> Result<Option<T>> {
        Ok(self.find_all(criteria)?.into_iter().next())
    }

    fn find_all(&self, criteria: &Criteria) -> Result<Vec<T>> {
        let records = self.read()?;
        let mut matches: Vec<&(u64, T)> = records
            .values()
            .filter(|(_, entity)| criteria.matches(entity))
            .collect();
        matches.sort_by_key(|(seq, _)| *seq);
        Ok(matches.into_iter().map(|(_, entity)| entity.clone()).collect())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.write()?.remove(id).is_some())
    }

    fn save_if_absent(&self, entity: T, conflict: &Criteria) -> Result<bool> {
        let mut records = self.write()?;
        if records.values().any(|(_, stored)| conflict.matches(stored)) {
            return Ok(false);
        }
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        records.insert(entity.id().to_string(), (seq, entity));
        Ok(true)
    }

    fn update(&self, id: &str, apply: &mut dyn FnMut(&mut T) -> bool) -> Result<Option<T>> {
        let mut records = self.write()?;
        let Some((_, stored)) = records.get_mut(id) else {
            return Ok(None);
        };

        let mut candidate = stored.clone();
        if !apply(&mut candidate) {
            return Ok(None);
        }
        *stored = candidate.clone();
        Ok(Some(candidate))
    }
}
