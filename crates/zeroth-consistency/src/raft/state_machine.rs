// Raft state machine implementation
// Applies committed group 0 commands to a RocksDB metadata table

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, SnapshotMeta,
    StorageError, StoredMembership,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use zeroth_common::ServerId;

use super::types::{Group0Command, Group0Response, TypeConfig};

fn sm_error(
    e: impl std::error::Error + Send + Sync + 'static,
    verb: ErrorVerb,
) -> StorageError<ServerId> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

pub const CF_METADATA: &str = "metadata";
const CF_META: &str = "meta";

const KEY_LAST_APPLIED: &[u8] = b"last_applied";
const KEY_LAST_MEMBERSHIP: &[u8] = b"last_membership";
const KEY_SNAPSHOT: &[u8] = b"snapshot";

/// Last built snapshot, kept so it can be served to lagging followers
#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<ServerId, BasicNode>,
    data: Vec<u8>,
}

/// RocksDB-based state machine for group 0
pub struct Group0StateMachine {
    db: Arc<DB>,
    last_applied: RwLock<Option<LogId<ServerId>>>,
    last_membership: RwLock<StoredMembership<ServerId, BasicNode>>,
}

impl Group0StateMachine {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError<ServerId>> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cfs)
            .map_err(|e| sm_error(e, ErrorVerb::Read))?;

        let sm = Self {
            db: Arc::new(db),
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
        };
        sm.load_cached_values().await?;

        info!("Group 0 state machine opened at {}", path.as_ref().display());
        Ok(sm)
    }

    /// Reader over the applied metadata, usable after openraft took the state machine
    pub fn reader(&self) -> MetadataReader {
        MetadataReader {
            db: self.db.clone(),
        }
    }

    async fn load_cached_values(&self) -> Result<(), StorageError<ServerId>> {
        if let Some(bytes) = self
            .db
            .get_cf(self.cf_meta()?, KEY_LAST_APPLIED)
            .map_err(|e| sm_error(e, ErrorVerb::Read))?
        {
            let log_id: LogId<ServerId> =
                serde_json::from_slice(&bytes).map_err(|e| sm_error(e, ErrorVerb::Read))?;
            *self.last_applied.write().await = Some(log_id);
        }

        if let Some(bytes) = self
            .db
            .get_cf(self.cf_meta()?, KEY_LAST_MEMBERSHIP)
            .map_err(|e| sm_error(e, ErrorVerb::Read))?
        {
            let membership: StoredMembership<ServerId, BasicNode> =
                serde_json::from_slice(&bytes).map_err(|e| sm_error(e, ErrorVerb::Read))?;
            *self.last_membership.write().await = membership;
        }

        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError<ServerId>> {
        self.db.cf_handle(name).ok_or_else(|| {
            sm_error(
                std::io::Error::other(format!("column family {} missing", name)),
                ErrorVerb::Read,
            )
        })
    }

    fn cf_metadata(&self) -> Result<&ColumnFamily, StorageError<ServerId>> {
        self.cf(CF_METADATA)
    }

    fn cf_meta(&self) -> Result<&ColumnFamily, StorageError<ServerId>> {
        self.cf(CF_META)
    }

    fn apply_command(&self, command: Group0Command) -> Result<Group0Response, StorageError<ServerId>> {
        let cf = self.cf_metadata()?;
        let previous = self
            .db
            .get_cf(cf, command.key().as_bytes())
            .map_err(|e| sm_error(e, ErrorVerb::Read))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        let result = match &command {
            Group0Command::Put { key, value } => self.db.put_cf(cf, key.as_bytes(), value.as_bytes()),
            Group0Command::Delete { key } => self.db.delete_cf(cf, key.as_bytes()),
        };

        match result {
            Ok(()) => {
                debug!("Applied {} of {}", command.op_type(), command.key());
                Ok(Group0Response::success(previous))
            }
            Err(e) => {
                error!("Failed to apply {} of {}: {}", command.op_type(), command.key(), e);
                Ok(Group0Response::failure(format!(
                    "Failed to apply {}: {}",
                    command.op_type(),
                    e
                )))
            }
        }
    }

    async fn save_last_applied(&self, log_id: LogId<ServerId>) -> Result<(), StorageError<ServerId>> {
        let bytes = serde_json::to_vec(&log_id).map_err(|e| sm_error(e, ErrorVerb::Write))?;
        self.db
            .put_cf(self.cf_meta()?, KEY_LAST_APPLIED, &bytes)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        *self.last_applied.write().await = Some(log_id);
        Ok(())
    }

    async fn save_membership(
        &self,
        membership: StoredMembership<ServerId, BasicNode>,
    ) -> Result<(), StorageError<ServerId>> {
        let bytes = serde_json::to_vec(&membership).map_err(|e| sm_error(e, ErrorVerb::Write))?;
        self.db
            .put_cf(self.cf_meta()?, KEY_LAST_MEMBERSHIP, &bytes)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        *self.last_membership.write().await = membership;
        Ok(())
    }

    fn dump_metadata(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError<ServerId>> {
        let iter = self
            .db
            .iterator_cf(self.cf_metadata()?, rocksdb::IteratorMode::Start);
        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| sm_error(e, ErrorVerb::Read))?;
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Group0StateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<ServerId>> {
        let last_applied = *self.last_applied.read().await;
        let last_membership = self.last_membership.read().await.clone();

        let snapshot_id = format!(
            "snapshot-{}-{}",
            last_applied.map(|l| l.index).unwrap_or(0),
            chrono::Utc::now().timestamp_millis()
        );

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id: snapshot_id.clone(),
        };

        let data = serde_json::to_vec(&self.dump_metadata()?)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        let stored_bytes = serde_json::to_vec(&stored).map_err(|e| sm_error(e, ErrorVerb::Write))?;
        self.db
            .put_cf(self.cf_meta()?, KEY_SNAPSHOT, stored_bytes)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        info!("Built snapshot {} with {} bytes", snapshot_id, data.len());

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for Group0StateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<ServerId>>,
            StoredMembership<ServerId, BasicNode>,
        ),
        StorageError<ServerId>,
    > {
        let last_applied = *self.last_applied.read().await;
        let last_membership = self.last_membership.read().await.clone();
        Ok((last_applied, last_membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Group0Response>, StorageError<ServerId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;

            let response = match entry.payload {
                EntryPayload::Normal(command) => self.apply_command(command)?,
                EntryPayload::Membership(membership) => {
                    let stored = StoredMembership::new(Some(log_id), membership);
                    self.save_membership(stored).await?;
                    Group0Response::success(None)
                }
                EntryPayload::Blank => Group0Response::success(None),
            };

            self.save_last_applied(log_id).await?;
            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<ServerId>> {
        let Some(bytes) = self
            .db
            .get_cf(self.cf_meta()?, KEY_SNAPSHOT)
            .map_err(|e| sm_error(e, ErrorVerb::Read))?
        else {
            return Ok(None);
        };
        let stored: StoredSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| sm_error(e, ErrorVerb::Read))?;
        Ok(Some(Snapshot {
            meta: stored.meta,
            snapshot: Box::new(Cursor::new(stored.data)),
        }))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Group0StateMachine {
            db: self.db.clone(),
            last_applied: RwLock::new(*self.last_applied.read().await),
            last_membership: RwLock::new(self.last_membership.read().await.clone()),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<ServerId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<ServerId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<ServerId>> {
        let data = snapshot.into_inner();
        let rows: Vec<(Vec<u8>, Vec<u8>)> = if data.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&data).map_err(|e| sm_error(e, ErrorVerb::Read))?
        };

        let cf = self.cf_metadata()?;
        let mut batch = rocksdb::WriteBatch::default();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, _) = item.map_err(|e| sm_error(e, ErrorVerb::Read))?;
            batch.delete_cf(cf, &key);
        }
        for (key, value) in rows {
            batch.put_cf(cf, &key, &value);
        }
        self.db
            .write(batch)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data,
        };
        let stored_bytes = serde_json::to_vec(&stored).map_err(|e| sm_error(e, ErrorVerb::Write))?;
        self.db
            .put_cf(self.cf_meta()?, KEY_SNAPSHOT, stored_bytes)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        if let Some(log_id) = meta.last_log_id {
            self.save_last_applied(log_id).await?;
        }
        self.save_membership(meta.last_membership.clone()).await?;

        info!("Snapshot installed: {:?}", meta.snapshot_id);
        Ok(())
    }
}

/// Read access to applied group 0 metadata
#[derive(Clone)]
pub struct MetadataReader {
    db: Arc<DB>,
}

impl MetadataReader {
    pub fn get(&self, key: &str) -> zeroth_common::Result<Option<String>> {
        let cf = self.db.cf_handle(CF_METADATA).ok_or_else(|| {
            zeroth_common::ZerothError::Storage(format!("column family {} missing", CF_METADATA))
        })?;
        Ok(self
            .db
            .get_cf(cf, key.as_bytes())
            .map_err(|e| zeroth_common::ZerothError::Storage(e.to_string()))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}
