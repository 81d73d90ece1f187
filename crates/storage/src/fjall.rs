//! Persistent backend over a fjall keyspace.
//!
//! Each [`Column`] maps to its own partition; the three are opened up front
//! so lookups never fail on a missing handle.

use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

pub struct FjallStore {
    keyspace: Keyspace,
    header_nodes: PartitionHandle,
    height_index: PartitionHandle,
    meta: PartitionHandle,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let keyspace = Config::new(path).open().map_err(map_err)?;
        let header_nodes = open_partition(&keyspace, Column::HeaderNode)?;
        let height_index = open_partition(&keyspace, Column::HeightIndex)?;
        let meta = open_partition(&keyspace, Column::Meta)?;
        Ok(Self {
            keyspace,
            header_nodes,
            height_index,
            meta,
        })
    }

    fn partition(&self, column: Column) -> &PartitionHandle {
        match column {
            Column::HeaderNode => &self.header_nodes,
            Column::HeightIndex => &self.height_index,
            Column::Meta => &self.meta,
        }
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column).get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column).insert(key, value).map_err(map_err)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column).remove(key).map_err(map_err)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut pending = self.keyspace.batch();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    pending.insert(self.partition(*column), key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    pending.remove(self.partition(*column), key.as_slice());
                }
            }
        }
        pending.commit().map_err(map_err)
    }
}

fn open_partition(keyspace: &Keyspace, column: Column) -> Result<PartitionHandle, StoreError> {
    keyspace
        .open_partition(column.as_str(), PartitionCreateOptions::default())
        .map_err(map_err)
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
