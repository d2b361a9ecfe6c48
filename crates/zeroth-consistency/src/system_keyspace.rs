//! Local system keyspace
//!
//! Node-local durable state used during group 0 bootstrap:
//!
//! | Table       | Key                    | Value                          |
//! |-------------|------------------------|--------------------------------|
//! | `local`     | `raft_server_id`       | 16-byte server id              |
//! | `local`     | `raft_group0_id`       | 16-byte group id               |
//! | `local`     | `bootstrap_complete`   | `1`                            |
//! | `discovery` | `peers` / location     | 16-byte server id, or empty    |
//!
//! [`SystemStorage`] is the generic scalar/row interface; RocksDB and in-memory
//! implementations are provided. [`SystemKeyspace`] is the typed facade.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options};
use tracing::{debug, info};
use zeroth_common::{GroupId, Peer, Result, ServerId, ServerInfo, ZerothError};

const CF_LOCAL: &str = "local";
const CF_DISCOVERY: &str = "discovery";

const KEY_RAFT_SERVER_ID: &str = "raft_server_id";
const KEY_RAFT_GROUP0_ID: &str = "raft_group0_id";
const KEY_BOOTSTRAP_COMPLETE: &str = "bootstrap_complete";

/// Partition of the discovery table holding discovered peers
pub const DISCOVERY_KEY: &str = "peers";

/// A clustering key and its value
pub type Row = (Vec<u8>, Vec<u8>);

/// Generic durable storage: scalars by name, rows grouped by partition
#[async_trait::async_trait]
pub trait SystemStorage: Send + Sync {
    async fn get_scalar(&self, name: &str) -> Result<Option<Vec<u8>>>;

    async fn set_scalar(&self, name: &str, value: &[u8]) -> Result<()>;

    /// Rows of `partition` ordered by clustering key
    async fn read_rows(&self, partition: &str) -> Result<Vec<Row>>;

    /// Upsert `rows` into `partition`; rows not mentioned are left alone
    async fn write_rows(&self, partition: &str, rows: Vec<Row>) -> Result<()>;
}

/// In-memory storage for tests and ephemeral nodes
#[derive(Default)]
pub struct MemorySystemStorage {
    scalars: Mutex<HashMap<String, Vec<u8>>>,
    partitions: Mutex<HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemorySystemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SystemStorage for MemorySystemStorage {
    async fn get_scalar(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.scalars.lock().get(name).cloned())
    }

    async fn set_scalar(&self, name: &str, value: &[u8]) -> Result<()> {
        self.scalars.lock().insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn read_rows(&self, partition: &str) -> Result<Vec<Row>> {
        Ok(self
            .partitions
            .lock()
            .get(partition)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn write_rows(&self, partition: &str, rows: Vec<Row>) -> Result<()> {
        let mut partitions = self.partitions.lock();
        let target = partitions.entry(partition.to_string()).or_default();
        target.extend(rows);
        Ok(())
    }
}

/// Helper to map RocksDB errors
fn storage_error(e: rocksdb::Error) -> ZerothError {
    ZerothError::Storage(e.to_string())
}

/// RocksDB-backed storage
pub struct RocksSystemStorage {
    db: Arc<DB>,
}

impl RocksSystemStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_LOCAL, Options::default()),
            ColumnFamilyDescriptor::new(CF_DISCOVERY, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cfs).map_err(storage_error)?;
        info!("System keyspace opened at {}", path.as_ref().display());
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ZerothError::Storage(format!("column family {} missing", name)))
    }

    /// Partition and clustering key share one RocksDB key: `partition \0 clustering`
    fn row_prefix(partition: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(partition.len() + 1);
        prefix.extend_from_slice(partition.as_bytes());
        prefix.push(0);
        prefix
    }
}

#[async_trait::async_trait]
impl SystemStorage for RocksSystemStorage {
    async fn get_scalar(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get_cf(self.cf(CF_LOCAL)?, name.as_bytes())
            .map_err(storage_error)
    }

    async fn set_scalar(&self, name: &str, value: &[u8]) -> Result<()> {
        self.db
            .put_cf(self.cf(CF_LOCAL)?, name.as_bytes(), value)
            .map_err(storage_error)?;
        debug!("Stored system scalar {}", name);
        Ok(())
    }

    async fn read_rows(&self, partition: &str) -> Result<Vec<Row>> {
        let prefix = Self::row_prefix(partition);
        let mut iter = self.db.raw_iterator_cf(self.cf(CF_DISCOVERY)?);
        iter.seek(&prefix);

        let mut rows = Vec::new();
        while iter.valid() {
            match (iter.key(), iter.value()) {
                (Some(key), Some(value)) if key.starts_with(&prefix) => {
                    rows.push((key[prefix.len()..].to_vec(), value.to_vec()));
                }
                _ => break,
            }
            iter.next();
        }
        iter.status().map_err(storage_error)?;
        Ok(rows)
    }

    async fn write_rows(&self, partition: &str, rows: Vec<Row>) -> Result<()> {
        let cf = self.cf(CF_DISCOVERY)?;
        let prefix = Self::row_prefix(partition);
        let mut batch = rocksdb::WriteBatch::default();
        for (clustering, value) in rows {
            let mut key = prefix.clone();
            key.extend_from_slice(&clustering);
            batch.put_cf(cf, key, value);
        }
        self.db.write(batch).map_err(storage_error)
    }
}

/// Typed accessors over [`SystemStorage`]
#[derive(Clone)]
pub struct SystemKeyspace {
    storage: Arc<dyn SystemStorage>,
}

impl SystemKeyspace {
    pub fn new(storage: Arc<dyn SystemStorage>) -> Self {
        Self { storage }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySystemStorage::new()))
    }

    pub async fn get_raft_server_id(&self) -> Result<Option<ServerId>> {
        Ok(self
            .storage
            .get_scalar(KEY_RAFT_SERVER_ID)
            .await?
            .and_then(|bytes| ServerId::from_slice(&bytes))
            .filter(|id| !id.is_nil()))
    }

    pub async fn set_raft_server_id(&self, id: ServerId) -> Result<()> {
        self.storage
            .set_scalar(KEY_RAFT_SERVER_ID, id.as_bytes())
            .await
    }

    pub async fn get_raft_group0_id(&self) -> Result<Option<GroupId>> {
        Ok(self
            .storage
            .get_scalar(KEY_RAFT_GROUP0_ID)
            .await?
            .and_then(|bytes| GroupId::from_slice(&bytes))
            .filter(|id| !id.is_nil()))
    }

    pub async fn set_raft_group0_id(&self, id: GroupId) -> Result<()> {
        self.storage
            .set_scalar(KEY_RAFT_GROUP0_ID, id.as_bytes())
            .await
    }

    pub async fn bootstrap_complete(&self) -> Result<bool> {
        Ok(self
            .storage
            .get_scalar(KEY_BOOTSTRAP_COMPLETE)
            .await?
            .is_some_and(|value| value == [1]))
    }

    pub async fn set_bootstrap_complete(&self) -> Result<()> {
        self.storage.set_scalar(KEY_BOOTSTRAP_COMPLETE, &[1]).await
    }

    /// Peers persisted by discovery, one row per location
    pub async fn load_discovered_peers(&self) -> Result<Vec<Peer>> {
        let rows = self.storage.read_rows(DISCOVERY_KEY).await?;
        Ok(rows
            .into_iter()
            .map(|(info, id)| Peer {
                id: ServerId::from_slice(&id).filter(|id| !id.is_nil()),
                info: ServerInfo::new(info),
            })
            .collect())
    }

    pub async fn store_discovered_peers(&self, peers: &[Peer]) -> Result<()> {
        let rows = peers
            .iter()
            .map(|peer| {
                let id = peer.id.map(|id| id.as_bytes().to_vec()).unwrap_or_default();
                (peer.info.as_bytes().to_vec(), id)
            })
            .collect();
        self.storage.write_rows(DISCOVERY_KEY, rows).await
    }
}
