//! RocksDB-backed durable snapshot store.
//!
//! Column families:
//! - `rooms` — one row per room: bincode `PersistenceRecord` whose snapshot
//!   is LZ4 compressed. Key is the room id as UTF-8 bytes.
//!
//! Each flush overwrites the row, so the store holds exactly the latest
//! snapshot of every room it has seen.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{PersistenceBackend, PersistenceRecord, StoreError};

const CF_ROOMS: &str = "rooms";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Durable [`PersistenceBackend`].
pub struct RocksBackend {
    /// Single-threaded column family mode; concurrency comes from tokio.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors = vec![ColumnFamilyDescriptor::new(
            CF_ROOMS,
            Self::cf_options(&config),
        )];

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        opts
    }

    /// Stored row for `room_id` with the snapshot decompressed.
    pub fn record(&self, room_id: &str) -> Result<Option<PersistenceRecord>, StoreError> {
        let cf = self.cf()?;
        let Some(bytes) = self.db.get_cf(cf, room_id.as_bytes())? else {
            return Ok(None);
        };
        let mut record = PersistenceRecord::decode(&bytes)?;
        record.snapshot = lz4_flex::decompress_size_prepended(&record.snapshot)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(Some(record))
    }

    /// Ids of every stored room, in key order.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf()?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.into_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            rooms.push(id);
        }
        Ok(rooms)
    }

    pub fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.delete_cf(cf, room_id.as_bytes())?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_ROOMS)
            .ok_or_else(|| StoreError::Database(format!("column family '{CF_ROOMS}' not found")))
    }
}

impl PersistenceBackend for RocksBackend {
    fn name(&self) -> &'static str {
        "rocksdb"
    }

    fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.record(room_id)?.map(|record| record.snapshot))
    }

    fn store(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let value = PersistenceRecord::new(lz4_flex::compress_prepend_size(snapshot)).encode()?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, room_id.as_bytes(), value, &write_opts)?;
        log::debug!(
            "Stored snapshot for room {room_id} ({} bytes uncompressed)",
            snapshot.len()
        );
        Ok(())
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
