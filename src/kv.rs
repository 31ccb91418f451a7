//! Key-value engines backing the event store.
//!
//! The store only needs key-ordered reads, prefix iteration and atomic batch
//! commits. `RocksKv` provides them on RocksDB with synced write batches;
//! tests run on an ordered in-memory map.

#[cfg(test)]
use std::collections::BTreeMap;
#[cfg(test)]
use std::ops::Bound;
use std::path::Path;

#[cfg(test)]
use parking_lot::RwLock;
use rocksdb::{
    DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use tracing::{debug, info, trace};

use crate::error::{Error, Result};

#[cfg(test)]
type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// One write in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of writes applied atomically.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::Put(key.into(), value.into()));
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::Delete(key.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    #[cfg(test)]
    fn apply(&self, map: &mut Map) {
        for op in &self.ops {
            match op {
                Op::Put(k, v) => {
                    map.insert(k.clone(), v.clone());
                }
                Op::Delete(k) => {
                    map.remove(k);
                }
            }
        }
    }
}

/// What the event store requires from its storage engine.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply every op of `batch` or none of them.
    fn commit(&self, batch: Batch) -> Result<()>;

    /// Visit entries whose key starts with `prefix` in key order until
    /// `visit` returns false.
    fn prefix_iterate(&self, prefix: &[u8], visit: &mut dyn FnMut(&[u8], &[u8]) -> bool)
        -> Result<()>;

    /// All entries under `prefix`, copied out.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.prefix_iterate(prefix, &mut |k: &[u8], v: &[u8]| {
            out.push((k.to_vec(), v.to_vec()));
            true
        })?;
        Ok(out)
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Reclaim space taken by overwritten or deleted entries.
    fn compact(&self) -> Result<()> {
        Ok(())
    }
}

/// Volatile engine for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryKv {
    map: RwLock<Map>,
}

#[cfg(test)]
impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl KvBackend for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        batch.apply(&mut self.map.write());
        Ok(())
    }

    fn prefix_iterate(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let map = self.map.read();
        for (k, v) in map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded)) {
            if !k.starts_with(prefix) || !visit(k.as_slice(), v.as_slice()) {
                break;
            }
        }
        Ok(())
    }
}

/// Tuning for the on-disk engine.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    pub max_open_files: i32,
    pub keep_log_file_num: usize,
    pub max_wal_size: u64,
    pub write_buffer_size: usize,
    pub max_write_buffer_number: i32,
    pub target_file_size_base: u64,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            max_open_files: 256,
            keep_log_file_num: 3,
            max_wal_size: 64 * 1024 * 1024,
            write_buffer_size: 32 * 1024 * 1024,
            max_write_buffer_number: 2,
            target_file_size_base: 32 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    fn build_options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(self.max_open_files);
        opts.set_keep_log_file_num(self.keep_log_file_num);
        opts.set_max_total_wal_size(self.max_wal_size);
        opts.set_write_buffer_size(self.write_buffer_size);
        opts.set_max_write_buffer_number(self.max_write_buffer_number);
        opts.set_target_file_size_base(self.target_file_size_base);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }
}

/// Durable engine on RocksDB. Every batch is written with `sync` so a commit
/// that returned `Ok` survives a crash.
pub struct RocksKv {
    db: DBWithThreadMode<MultiThreaded>,
}

impl RocksKv {
    /// Create or open the database directory at `path`.
    pub fn open(path: impl AsRef<Path>, config: &RocksConfig) -> Result<Self> {
        let path = path.as_ref();
        let db = DBWithThreadMode::<MultiThreaded>::open(&config.build_options(), path)
            .map_err(|e| Error::storage(format!("opening {}: {e}", path.display())))?;
        info!(path = %path.display(), "opened event database");
        Ok(Self { db })
    }
}

impl KvBackend for RocksKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| Error::storage(format!("read failed: {e}")))
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut wb = WriteBatch::default();
        for op in batch.ops() {
            match op {
                Op::Put(k, v) => wb.put(k, v),
                Op::Delete(k) => wb.delete(k),
            }
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        trace!(ops = batch.ops().len(), "committing batch");
        self.db
            .write_opt(wb, &opts)
            .map_err(|e| Error::storage(format!("write failed: {e}")))
    }

    fn prefix_iterate(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let mut visited = 0usize;
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| Error::storage(format!("iterator: {e}")))?;
            if !key.starts_with(prefix) {
                break;
            }
            visited += 1;
            if !visit(&key[..], &value[..]) {
                break;
            }
        }
        trace!(prefix_len = prefix.len(), visited, "prefix iteration");
        Ok(())
    }

    fn compact(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| Error::storage(format!("flush failed: {e}")))?;
        self.db.compact_range(None::<&[u8]>, None::<&[u8]>);
        debug!("compacted event database");
        Ok(())
    }
}
