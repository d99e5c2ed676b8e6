//! Optimized storage layer using RocksDB

use crate::config::{CompressionType, StorageConfig};
use crate::errors::StorageError;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};

/// A set of puts and deletes applied atomically by [`OptimizedStorage::commit`]
#[derive(Default)]
pub struct StorageBatch {
    batch: WriteBatch,
    ops: usize,
}

impl StorageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.batch.put(key, value);
        self.ops += 1;
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.batch.delete(key);
        self.ops += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.ops == 0
    }
}

#[derive(Clone)]
pub struct OptimizedStorage {
    db: Arc<DB>,
    /// Number of upcoming commits that fail with `WriteFailed`
    #[cfg(test)]
    write_faults: Arc<AtomicU32>,
}

impl OptimizedStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let config = StorageConfig {
            data_directory: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        };
        Self::new_with_config(&config)
    }

    pub fn new_with_config(config: &StorageConfig) -> Result<Self, StorageError> {
        if config.clear_on_start {
            tracing::warn!("🧹 Clearing database at {} (clear_on_start)", config.data_directory);
            match std::fs::remove_dir_all(&config.data_directory) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StorageError::DatabaseOpenFailed(format!(
                        "could not clear {}: {}",
                        config.data_directory, e
                    )))
                }
            }
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_max_write_buffer_number(config.max_write_buffer_number as i32);
        opts.set_target_file_size_base((config.target_file_size_mb * 1024 * 1024) as u64);
        opts.set_compression_type(match config.compression_type {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Snappy => rocksdb::DBCompressionType::Snappy,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionType::Zstd => rocksdb::DBCompressionType::Zstd,
        });

        let db = DB::open(&opts, &config.data_directory)
            .map_err(|e| StorageError::DatabaseOpenFailed(format!("{}: {}", config.data_directory, e)))?;
        Ok(Self {
            db: Arc::new(db),
            #[cfg(test)]
            write_faults: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.db
            .get(key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()))
    }

    /// Apply every operation in `batch` or none of them.
    pub fn commit(&self, batch: StorageBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        #[cfg(test)]
        self.take_write_fault()?;
        self.db
            .write(batch.batch)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))
    }

    /// Ordered scan of keys starting with `prefix`. When `start_after` is
    /// given the scan resumes strictly after that key.
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let start = start_after.unwrap_or(prefix);
        let iter = self.db.iterator(IteratorMode::From(start, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            if start_after.is_some_and(|after| key.as_ref() == after) {
                continue;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }
        Ok(rows)
    }

    /// Make the next `count` commits fail. Shared by every clone.
    #[cfg(test)]
    pub(crate) fn fail_next_writes(&self, count: u32) {
        self.write_faults.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_write_fault(&self) -> Result<(), StorageError> {
        match self
            .write_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(StorageError::WriteFailed("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, OptimizedStorage) {
        let dir = TempDir::new().unwrap();
        let storage = OptimizedStorage::new(dir.path()).unwrap();
        (dir, storage)
    }

    fn write(storage: &OptimizedStorage, rows: &[(&str, &str)]) {
        let mut batch = StorageBatch::new();
        for (key, value) in rows {
            batch.put(key, value);
        }
        storage.commit(batch).unwrap();
    }

    #[test]
    fn test_batch_is_applied_together() {
        let (_dir, storage) = open();
        write(&storage, &[("gone", "x")]);

        let mut batch = StorageBatch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"gone");
        assert!(!batch.is_empty());
        storage.commit(batch).unwrap();

        assert_eq!(storage.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(storage.get(b"gone").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_with_cursor() {
        let (_dir, storage) = open();
        write(
            &storage,
            &[("p:1", "one"), ("p:2", "two"), ("p:3", "three"), ("q:1", "other")],
        );

        let first = storage.scan_prefix(b"p:", None, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].0, b"p:1".to_vec());

        let rest = storage.scan_prefix(b"p:", Some(&first[1].0), 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].1, b"three".to_vec());
    }

    #[test]
    fn test_injected_write_failures_are_consumed() {
        let (_dir, storage) = open();
        storage.fail_next_writes(1);

        let mut batch = StorageBatch::new();
        batch.put(b"k", b"v");
        assert!(matches!(storage.commit(batch), Err(StorageError::WriteFailed(_))));
        assert_eq!(storage.get(b"k").unwrap(), None);

        write(&storage, &[("k", "v")]);
        assert_eq!(storage.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_clear_on_start_wipes_existing_data() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_directory: dir.path().join("db").to_string_lossy().to_string(),
            clear_on_start: true,
            ..Default::default()
        };

        // Missing directory is fine
        let storage = OptimizedStorage::new_with_config(&config).unwrap();
        write(&storage, &[("stale", "1")]);
        drop(storage);

        let storage = OptimizedStorage::new_with_config(&config).unwrap();
        assert_eq!(storage.get(b"stale").unwrap(), None);
    }
}
