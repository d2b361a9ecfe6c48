// RocksDB-based log storage for Raft
// Implements openraft's log storage and records the bootstrap configuration of the group

// StorageError is openraft's own error type
#![allow(clippy::result_large_err)]

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{
    Entry, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftLogReader, StorageError, Vote,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options};
use tokio::sync::RwLock;
use tracing::{debug, info};
use zeroth_api::ConfigMember;
use zeroth_common::{Result as ZerothResult, ServerId, ZerothError};

use super::types::TypeConfig;
use crate::server::{RaftConfiguration, RaftPersistence};

const CF_LOGS: &str = "logs";
const CF_STATE: &str = "state";

const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged";
const KEY_BOOTSTRAP: &[u8] = b"bootstrap";

/// Write buffer size: 16MB, group 0 carries little data
const WRITE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

fn vote_error(
    e: impl std::error::Error + Send + Sync + 'static,
    verb: ErrorVerb,
) -> StorageError<ServerId> {
    StorageError::from_io_error(
        ErrorSubject::Vote,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

fn logs_error(
    e: impl std::error::Error + Send + Sync + 'static,
    verb: ErrorVerb,
) -> StorageError<ServerId> {
    StorageError::from_io_error(
        ErrorSubject::Logs,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

fn missing_cf(name: &str) -> StorageError<ServerId> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Read,
        std::io::Error::other(format!("column family {} missing", name)),
    )
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily, StorageError<ServerId>> {
    db.cf_handle(name).ok_or_else(|| missing_cf(name))
}

/// RocksDB-based log store for Raft
pub struct RocksLogStore {
    db: Arc<DB>,
    /// Cached last log ID
    last_log_id: RwLock<Option<LogId<ServerId>>>,
    vote: RwLock<Option<Vote<ServerId>>>,
    last_purged: RwLock<Option<LogId<ServerId>>>,
}

impl RocksLogStore {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError<ServerId>> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(WRITE_BUFFER_SIZE);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(WRITE_BUFFER_SIZE);
        cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_LOGS, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_STATE, cf_opts),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cfs)
            .map_err(|e| logs_error(e, ErrorVerb::Read))?;

        let store = Self {
            db: Arc::new(db),
            last_log_id: RwLock::new(None),
            vote: RwLock::new(None),
            last_purged: RwLock::new(None),
        };
        store.load_cached_values().await?;

        info!("RocksDB log store opened at {}", path.as_ref().display());
        Ok(store)
    }

    /// Handle used to record and read the bootstrap configuration. It shares
    /// the database with the log store, which openraft takes ownership of.
    pub fn persistence(&self) -> RocksRaftPersistence {
        RocksRaftPersistence {
            db: self.db.clone(),
        }
    }

    async fn load_cached_values(&self) -> Result<(), StorageError<ServerId>> {
        *self.vote.write().await = self.load_vote_internal()?;
        *self.last_purged.write().await = self.load_last_purged_internal()?;
        *self.last_log_id.write().await = self.calculate_last_log_id()?;
        Ok(())
    }

    fn cf_logs(&self) -> Result<&ColumnFamily, StorageError<ServerId>> {
        cf(&self.db, CF_LOGS)
    }

    fn cf_state(&self) -> Result<&ColumnFamily, StorageError<ServerId>> {
        cf(&self.db, CF_STATE)
    }

    /// Encode log index to bytes (big-endian for proper ordering)
    fn encode_log_index(index: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        // Writing into a Vec cannot fail
        let _ = buf.write_u64::<BigEndian>(index);
        buf
    }

    #[cfg(test)]
    fn decode_log_index(bytes: &[u8]) -> std::io::Result<u64> {
        std::io::Cursor::new(bytes).read_u64::<BigEndian>()
    }

    fn serialize_entry(entry: &Entry<TypeConfig>) -> Result<Vec<u8>, StorageError<ServerId>> {
        serde_json::to_vec(entry).map_err(|e| logs_error(e, ErrorVerb::Write))
    }

    fn deserialize_entry(bytes: &[u8]) -> Result<Entry<TypeConfig>, StorageError<ServerId>> {
        serde_json::from_slice(bytes).map_err(|e| logs_error(e, ErrorVerb::Read))
    }

    fn load_vote_internal(&self) -> Result<Option<Vote<ServerId>>, StorageError<ServerId>> {
        match self.db.get_cf(self.cf_state()?, KEY_VOTE) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| vote_error(e, ErrorVerb::Read)),
            Ok(None) => Ok(None),
            Err(e) => Err(vote_error(e, ErrorVerb::Read)),
        }
    }

    fn load_last_purged_internal(
        &self,
    ) -> Result<Option<LogId<ServerId>>, StorageError<ServerId>> {
        match self.db.get_cf(self.cf_state()?, KEY_LAST_PURGED) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| logs_error(e, ErrorVerb::Read)),
            Ok(None) => Ok(None),
            Err(e) => Err(logs_error(e, ErrorVerb::Read)),
        }
    }

    /// The last entry in the logs column family, or the last purged id when
    /// every entry has been purged
    fn calculate_last_log_id(&self) -> Result<Option<LogId<ServerId>>, StorageError<ServerId>> {
        let mut iter = self.db.raw_iterator_cf(self.cf_logs()?);
        iter.seek_to_last();

        if iter.valid()
            && let Some(value) = iter.value()
        {
            let entry = Self::deserialize_entry(value)?;
            return Ok(Some(entry.log_id));
        }

        self.load_last_purged_internal()
    }
}

impl RaftLogReader<TypeConfig> for RocksLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<ServerId>> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(&n) => n,
            std::ops::Bound::Excluded(&n) => n + 1,
            std::ops::Bound::Unbounded => 0,
        };

        let end = match range.end_bound() {
            std::ops::Bound::Included(&n) => Some(n + 1),
            std::ops::Bound::Excluded(&n) => Some(n),
            std::ops::Bound::Unbounded => None,
        };

        let mut entries = Vec::new();
        let start_key = Self::encode_log_index(start);
        let end_key = end.map(Self::encode_log_index);

        let mut iter = self.db.raw_iterator_cf(self.cf_logs()?);
        iter.seek(&start_key);

        while iter.valid() {
            if let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                if end_key.as_deref().is_some_and(|end| key >= end) {
                    break;
                }
                entries.push(Self::deserialize_entry(value)?);
            }
            iter.next();
        }

        debug!("Read {} log entries from range {:?}", entries.len(), range);
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for RocksLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<ServerId>> {
        Ok(LogState {
            last_purged_log_id: *self.last_purged.read().await,
            last_log_id: *self.last_log_id.read().await,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<ServerId>) -> Result<(), StorageError<ServerId>> {
        let bytes = serde_json::to_vec(vote).map_err(|e| vote_error(e, ErrorVerb::Write))?;
        self.db
            .put_cf(self.cf_state()?, KEY_VOTE, &bytes)
            .map_err(|e| vote_error(e, ErrorVerb::Write))?;

        *self.vote.write().await = Some(*vote);
        debug!("Saved vote: {:?}", vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<ServerId>>, StorageError<ServerId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        RocksLogStore {
            db: self.db.clone(),
            last_log_id: RwLock::new(*self.last_log_id.read().await),
            vote: RwLock::new(*self.vote.read().await),
            last_purged: RwLock::new(*self.last_purged.read().await),
        }
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<ServerId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let cf_logs = self.cf_logs()?;
        let mut batch = rocksdb::WriteBatch::default();
        let mut last_log_id = None;
        let mut count = 0usize;

        for entry in entries {
            let key = Self::encode_log_index(entry.log_id.index);
            batch.put_cf(cf_logs, &key, Self::serialize_entry(&entry)?);
            last_log_id = Some(entry.log_id);
            count += 1;
        }

        if count > 0 {
            self.db
                .write(batch)
                .map_err(|e| logs_error(e, ErrorVerb::Write))?;
        }

        if let Some(log_id) = last_log_id {
            *self.last_log_id.write().await = Some(log_id);
        }

        debug!("Appended {} log entries", count);
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<ServerId>) -> Result<(), StorageError<ServerId>> {
        // Delete all entries with index >= log_id.index
        let cf_logs = self.cf_logs()?;
        let start_key = Self::encode_log_index(log_id.index);

        let mut batch = rocksdb::WriteBatch::default();
        let mut iter = self.db.raw_iterator_cf(cf_logs);
        iter.seek(&start_key);
        while iter.valid() {
            if let Some(key) = iter.key() {
                batch.delete_cf(cf_logs, key);
            }
            iter.next();
        }

        self.db
            .write(batch)
            .map_err(|e| logs_error(e, ErrorVerb::Write))?;

        let last = self.calculate_last_log_id()?;
        *self.last_log_id.write().await = last;

        debug!("Truncated logs from index {}", log_id.index);
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<ServerId>) -> Result<(), StorageError<ServerId>> {
        // Delete all entries with index <= log_id.index
        let cf_logs = self.cf_logs()?;
        let end_key = Self::encode_log_index(log_id.index + 1);

        let mut batch = rocksdb::WriteBatch::default();
        let mut iter = self.db.raw_iterator_cf(cf_logs);
        iter.seek_to_first();
        while iter.valid() {
            if let Some(key) = iter.key() {
                if key >= end_key.as_slice() {
                    break;
                }
                batch.delete_cf(cf_logs, key);
            }
            iter.next();
        }

        let last_purged_bytes =
            serde_json::to_vec(&log_id).map_err(|e| logs_error(e, ErrorVerb::Write))?;
        batch.put_cf(self.cf_state()?, KEY_LAST_PURGED, &last_purged_bytes);

        self.db
            .write(batch)
            .map_err(|e| logs_error(e, ErrorVerb::Write))?;

        *self.last_purged.write().await = Some(log_id);
        {
            let mut last = self.last_log_id.write().await;
            if last.is_none_or(|last| last.index < log_id.index) {
                *last = Some(log_id);
            }
        }

        debug!("Purged logs up to index {}", log_id.index);
        Ok(())
    }
}

/// Bootstrap record of a group, stored next to its log
#[derive(Clone)]
pub struct RocksRaftPersistence {
    db: Arc<DB>,
}

impl RocksRaftPersistence {
    /// The configuration recorded by [`RaftPersistence::bootstrap`], if any
    pub fn load_bootstrap(&self) -> ZerothResult<Option<RaftConfiguration>> {
        let cf_state = cf(&self.db, CF_STATE).map_err(|e| ZerothError::Storage(e.to_string()))?;
        let Some(bytes) = self
            .db
            .get_cf(cf_state, KEY_BOOTSTRAP)
            .map_err(|e| ZerothError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        let members: Vec<ConfigMember> = serde_json::from_slice(&bytes)?;
        Ok(Some(RaftConfiguration::new(members)))
    }
}

#[async_trait::async_trait]
impl RaftPersistence for RocksRaftPersistence {
    async fn bootstrap(&self, initial: RaftConfiguration) -> ZerothResult<()> {
        let members: Vec<&ConfigMember> = initial.current.values().collect();
        let bytes = serde_json::to_vec(&members)?;
        let cf_state = cf(&self.db, CF_STATE).map_err(|e| ZerothError::Storage(e.to_string()))?;
        self.db
            .put_cf(cf_state, KEY_BOOTSTRAP, bytes)
            .map_err(|e| ZerothError::Storage(e.to_string()))?;
        info!(
            "Recorded bootstrap configuration with {} member(s)",
            members.len()
        );
        Ok(())
    }
}
