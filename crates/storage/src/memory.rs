//! In-memory backend for tests and throwaway runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

#[derive(Default)]
pub struct MemoryStore {
    columns: Mutex<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>, StoreError>
    {
        self.columns
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.lock()?;
        Ok(columns
            .get(&column)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.lock()?;
        columns
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.lock()?;
        if let Some(entries) = columns.get_mut(&column) {
            entries.remove(key);
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.lock()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns
                        .entry(*column)
                        .or_default()
                        .insert(key.as_slice().to_vec(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    if let Some(entries) = columns.get_mut(column) {
                        entries.remove(key.as_slice());
                    }
                }
            }
        }
        Ok(())
    }
}
