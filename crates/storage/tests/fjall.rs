#![cfg(feature = "fjall")]

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use finch_storage::fjall::FjallStore;
use finch_storage::{Column, KeyValueStore, WriteBatch};

fn temp_store_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()))
}

#[test]
fn point_operations_round_trip_per_column() {
    let dir = temp_store_dir("finch-fjall-ops");
    let store = FjallStore::open(&dir).expect("open");

    store.put(Column::Meta, b"block", b"pointer").expect("put");
    assert_eq!(
        store.get(Column::Meta, b"block").expect("get"),
        Some(b"pointer".to_vec())
    );
    // Columns are separate partitions.
    assert_eq!(store.get(Column::HeaderNode, b"block").expect("get"), None);

    store.delete(Column::Meta, b"block").expect("delete");
    assert_eq!(store.get(Column::Meta, b"block").expect("get"), None);

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn batches_commit_atomically_and_survive_reopen() {
    let dir = temp_store_dir("finch-fjall-batch");
    {
        let store = FjallStore::open(&dir).expect("open");
        let mut batch = WriteBatch::new();
        batch.put(Column::HeaderNode, [0x11; 32], vec![1, 2, 3]);
        batch.put(Column::HeightIndex, 7u32.to_be_bytes(), vec![0x11; 32]);
        batch.put(Column::Meta, *b"best", vec![0x11; 32]);
        batch.delete(Column::Meta, *b"stale");
        store.write_batch(&batch).expect("commit");
        assert_eq!(
            store.get(Column::HeaderNode, &[0x11; 32]).expect("get"),
            Some(vec![1, 2, 3])
        );
    }

    let store = FjallStore::open(&dir).expect("reopen");
    assert_eq!(
        store.get(Column::Meta, b"best").expect("get"),
        Some(vec![0x11; 32])
    );
    assert_eq!(
        store.get(Column::HeightIndex, &7u32.to_be_bytes()).expect("get"),
        Some(vec![0x11; 32])
    );

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}
