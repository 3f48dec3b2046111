//! Raft storage for one partition replica (openraft v1 `RaftStorage` API).
//!
//! Everything Raft needs for safety survives a restart through the object
//! store, under the replica's prefix:
//!
//! ```text
//! {prefix}/vote                      current term / vote
//! {prefix}/purged                    last purged log id
//! {prefix}/journal/{index:020}       one object per log entry
//! {prefix}/snapshot/current.snapshot state machine image
//! {prefix}/snapshot/current.meta     snapshot metadata (commit marker)
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftStorage,
    Snapshot, SnapshotMeta, StorageError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::commands::LogResponse;
use super::state_machine::PartitionLog;
use super::types::{ReplicaNodeId, TypeConfig};
use crate::error::{Error, Result};
use crate::store::{get_optional, put_atomic};

#[derive(Clone, Serialize, Deserialize)]
struct SnapshotMetadata {
    last_log_id: Option<LogId<ReplicaNodeId>>,
    last_membership: StoredMembership<ReplicaNodeId, BasicNode>,
    snapshot_id: String,
}

#[derive(Clone)]
struct CachedSnapshot {
    meta: SnapshotMeta<ReplicaNodeId, BasicNode>,
    data: Vec<u8>,
}

fn storage_error(
    subject: ErrorSubject<ReplicaNodeId>,
    verb: ErrorVerb,
    e: impl ToString,
) -> StorageError<ReplicaNodeId> {
    StorageError::from_io_error(subject, verb, std::io::Error::other(e.to_string()))
}

/// Combined log and state machine storage for one replica.
#[derive(Clone)]
pub struct ReplicaStore {
    vote: Arc<RwLock<Option<Vote<ReplicaNodeId>>>>,
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    last_purged_log_id: Arc<RwLock<Option<LogId<ReplicaNodeId>>>>,
    sm: Arc<RwLock<PartitionLog>>,
    last_applied_log: Arc<RwLock<Option<LogId<ReplicaNodeId>>>>,
    last_membership: Arc<RwLock<StoredMembership<ReplicaNodeId, BasicNode>>>,
    cached_snapshot: Arc<RwLock<Option<CachedSnapshot>>>,
    object_store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ReplicaStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            vote: Arc::new(RwLock::new(None)),
            log: Arc::new(RwLock::new(BTreeMap::new())),
            last_purged_log_id: Arc::new(RwLock::new(None)),
            sm: Arc::new(RwLock::new(PartitionLog::new())),
            last_applied_log: Arc::new(RwLock::new(None)),
            last_membership: Arc::new(RwLock::new(StoredMembership::default())),
            cached_snapshot: Arc::new(RwLock::new(None)),
            object_store,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Create a store and load whatever a previous run persisted.
    pub async fn open(object_store: Arc<dyn ObjectStore>, prefix: &str) -> Result<Self> {
        let store = Self::new(object_store, prefix);
        store.cleanup_temp_files().await;
        let restored_snapshot = store.load_snapshot().await?;
        store.load_vote().await?;
        store.load_journal().await?;

        let journal_entries = store.log.read().await.len();
        info!(
            prefix = %store.prefix,
            restored_snapshot,
            journal_entries,
            "Opened replica storage"
        );
        Ok(store)
    }

    pub fn state_machine(&self) -> Arc<RwLock<PartitionLog>> {
        self.sm.clone()
    }

    fn path(&self, suffix: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", self.prefix, suffix))
    }

    fn journal_path(&self, index: u64) -> ObjectPath {
        self.path(&format!("journal/{:020}", index))
    }

    async fn cleanup_temp_files(&self) {
        let prefix = ObjectPath::from(self.prefix.as_str());
        let listed: Vec<_> = match self.object_store.list(Some(&prefix)).try_collect().await {
            Ok(listed) => listed,
            Err(e) => {
                debug!(error = %e, "Error listing files during temp cleanup");
                return;
            }
        };
        for meta in listed {
            if meta.location.to_string().contains(".temp-") {
                match self.object_store.delete(&meta.location).await {
                    Ok(()) => info!(path = %meta.location, "Cleaned up orphaned temp file"),
                    Err(e) => debug!(error = %e, path = %meta.location, "Failed to delete temp file"),
                }
            }
        }
    }

    async fn load_snapshot(&self) -> Result<bool> {
        let meta_path = self.path("snapshot/current.meta");
        let data_path = self.path("snapshot/current.snapshot");

        let Some(meta_bytes) = get_optional(self.object_store.as_ref(), &meta_path).await? else {
            debug!(prefix = %self.prefix, "No existing snapshot (clean start)");
            return Ok(false);
        };
        let metadata: SnapshotMetadata = bincode::deserialize(&meta_bytes).map_err(|e| {
            error!(error = %e, path = %meta_path, "CORRUPTION: snapshot metadata failed to decode");
            Error::Storage(format!("snapshot metadata is corrupted: {}", e))
        })?;
        let Some(data) = get_optional(self.object_store.as_ref(), &data_path).await? else {
            error!(
                path = %data_path,
                snapshot_id = %metadata.snapshot_id,
                "CORRUPTION: snapshot metadata exists but data file is missing"
            );
            return Err(Error::Storage(
                "snapshot metadata exists but data file is missing".into(),
            ));
        };
        let data = data.to_vec();

        self.sm.write().await.restore(&data)?;
        *self.last_applied_log.write().await = metadata.last_log_id;
        *self.last_membership.write().await = metadata.last_membership.clone();
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: SnapshotMeta {
                last_log_id: metadata.last_log_id,
                last_membership: metadata.last_membership,
                snapshot_id: metadata.snapshot_id,
            },
            data,
        });
        Ok(true)
    }

    async fn load_vote(&self) -> Result<()> {
        if let Some(bytes) = get_optional(self.object_store.as_ref(), &self.path("vote")).await? {
            *self.vote.write().await = Some(bincode::deserialize(&bytes)?);
        }
        if let Some(bytes) = get_optional(self.object_store.as_ref(), &self.path("purged")).await? {
            *self.last_purged_log_id.write().await = Some(bincode::deserialize(&bytes)?);
        }
        Ok(())
    }

    async fn load_journal(&self) -> Result<()> {
        let prefix = self.path("journal");
        let listed: Vec<_> = self
            .object_store
            .list(Some(&prefix))
            .try_collect()
            .await?;
        let purged = self.last_purged_log_id.read().await.map(|l| l.index);

        let mut log = self.log.write().await;
        for meta in listed {
            let bytes = self.object_store.get(&meta.location).await?.bytes().await?;
            let entry: Entry<TypeConfig> = bincode::deserialize(&bytes)?;
            if purged.is_some_and(|p| entry.log_id.index <= p) {
                continue;
            }
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_journal_entries(&self, indices: Vec<u64>) -> std::result::Result<(), StorageError<ReplicaNodeId>> {
        for index in indices {
            match self.object_store.delete(&self.journal_path(index)).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(storage_error(ErrorSubject::Logs, ErrorVerb::Delete, e)),
            }
        }
        Ok(())
    }

    /// Data is renamed into place before the metadata, so the metadata object
    /// is the commit marker: a crash in between leaves the old snapshot valid.
    async fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<ReplicaNodeId, BasicNode>,
        data: &[u8],
    ) -> std::result::Result<(), StorageError<ReplicaNodeId>> {
        let metadata = SnapshotMetadata {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        };
        let meta_bytes = bincode::serialize(&metadata)
            .map_err(|e| storage_error(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;

        put_atomic(
            self.object_store.as_ref(),
            &self.path("snapshot/current.snapshot"),
            data.to_vec(),
        )
        .await
        .map_err(|e| storage_error(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
        put_atomic(
            self.object_store.as_ref(),
            &self.path("snapshot/current.meta"),
            meta_bytes,
        )
        .await
        .map_err(|e| storage_error(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;

        info!(
            prefix = %self.prefix,
            snapshot_id = %meta.snapshot_id,
            size_bytes = data.len(),
            "Persisted replica snapshot"
        );
        Ok(())
    }
}

impl RaftStorage<TypeConfig> for ReplicaStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(
        &mut self,
        vote: &Vote<ReplicaNodeId>,
    ) -> std::result::Result<(), StorageError<ReplicaNodeId>> {
        let bytes = bincode::serialize(vote)
            .map_err(|e| storage_error(ErrorSubject::Vote, ErrorVerb::Write, e))?;
        put_atomic(self.object_store.as_ref(), &self.path("vote"), bytes)
            .await
            .map_err(|e| storage_error(ErrorSubject::Vote, ErrorVerb::Write, e))?;
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(
        &mut self,
    ) -> std::result::Result<Option<Vote<ReplicaNodeId>>, StorageError<ReplicaNodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_state(
        &mut self,
    ) -> std::result::Result<openraft::storage::LogState<TypeConfig>, StorageError<ReplicaNodeId>>
    {
        let log = self.log.read().await;
        let last_purged = *self.last_purged_log_id.read().await;
        let last_log_id = log.values().last().map(|e| e.log_id).or(last_purged);

        Ok(openraft::storage::LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn append_to_log<I>(
        &mut self,
        entries: I,
    ) -> std::result::Result<(), StorageError<ReplicaNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let entries: Vec<Entry<TypeConfig>> = entries.into_iter().collect();
        let mut log = self.log.write().await;
        for entry in entries {
            let bytes = bincode::serialize(&entry)
                .map_err(|e| storage_error(ErrorSubject::Log(entry.log_id), ErrorVerb::Write, e))?;
            self.object_store
                .put(&self.journal_path(entry.log_id.index), Bytes::from(bytes).into())
                .await
                .map_err(|e| storage_error(ErrorSubject::Log(entry.log_id), ErrorVerb::Write, e))?;
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<ReplicaNodeId>,
    ) -> std::result::Result<(), StorageError<ReplicaNodeId>> {
        let mut log = self.log.write().await;
        let keys_to_remove: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in &keys_to_remove {
            log.remove(key);
        }
        drop(log);
        self.delete_journal_entries(keys_to_remove).await
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<ReplicaNodeId>,
    ) -> std::result::Result<(), StorageError<ReplicaNodeId>> {
        let bytes = bincode::serialize(&log_id)
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Write, e))?;
        put_atomic(self.object_store.as_ref(), &self.path("purged"), bytes)
            .await
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Write, e))?;
        *self.last_purged_log_id.write().await = Some(log_id);

        let mut log = self.log.write().await;
        let keys_to_remove: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in &keys_to_remove {
            log.remove(key);
        }
        drop(log);
        self.delete_journal_entries(keys_to_remove).await
    }

    async fn last_applied_state(
        &mut self,
    ) -> std::result::Result<
        (
            Option<LogId<ReplicaNodeId>>,
            StoredMembership<ReplicaNodeId, BasicNode>,
        ),
        StorageError<ReplicaNodeId>,
    > {
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> std::result::Result<Vec<LogResponse>, StorageError<ReplicaNodeId>> {
        let mut responses = Vec::with_capacity(entries.len());
        let mut sm = self.sm.write().await;

        for entry in entries {
            *self.last_applied_log.write().await = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => responses.push(LogResponse::Ok),
                EntryPayload::Normal(command) => responses.push(sm.apply(command.clone())),
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    responses.push(LogResponse::Ok);
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError<ReplicaNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<ReplicaNodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> std::result::Result<(), StorageError<ReplicaNodeId>> {
        let data = snapshot.into_inner();

        self.sm
            .write()
            .await
            .restore(&data)
            .map_err(|e| storage_error(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        *self.last_applied_log.write().await = meta.last_log_id;
        *self.last_membership.write().await =
            StoredMembership::new(meta.last_log_id, meta.last_membership.membership().clone());

        self.persist_snapshot(meta, &data).await?;

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<Snapshot<TypeConfig>>, StorageError<ReplicaNodeId>> {
        let snapshot_guard = self.cached_snapshot.read().await;
        Ok(snapshot_guard.as_ref().map(|cached| Snapshot {
            meta: cached.meta.clone(),
            snapshot: Box::new(Cursor::new(cached.data.clone())),
        }))
    }
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for ReplicaStore {
    async fn build_snapshot(
        &mut self,
    ) -> std::result::Result<Snapshot<TypeConfig>, StorageError<ReplicaNodeId>> {
        let (data, last_applied, membership) = {
            let sm = self.sm.read().await;
            let data = sm
                .snapshot()
                .map_err(|e| storage_error(ErrorSubject::StateMachine, ErrorVerb::Read, e))?;
            (
                data,
                *self.last_applied_log.read().await,
                self.last_membership.read().await.clone(),
            )
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id: format!("snapshot-{}", last_applied.map(|l| l.index).unwrap_or(0)),
        };

        self.persist_snapshot(&meta, &data).await?;

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl openraft::RaftLogReader<TypeConfig> for ReplicaStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<ReplicaNodeId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::commands::LogCommand;
    use object_store::memory::InMemory;
    use openraft::{RaftLogReader, RaftSnapshotBuilder};

    fn make_log_id(term: u64, node: u64, index: u64) -> LogId<ReplicaNodeId> {
        LogId::new(openraft::CommittedLeaderId::new(term, node), index)
    }

    fn make_entry(index: u64, payload: EntryPayload<TypeConfig>) -> Entry<TypeConfig> {
        Entry {
            log_id: make_log_id(1, 0, index),
            payload,
        }
    }

    fn append(index: u64, log_index: u64) -> Entry<TypeConfig> {
        make_entry(
            index,
            EntryPayload::Normal(LogCommand::append(log_index, "p", format!("m{}", log_index), 0)),
        )
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_storage_futures_are_send() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        assert_send(&ReplicaStore::open(object_store.clone(), "r/t-0/0"));

        let mut store = ReplicaStore::open(object_store, "r/t-0/0").await.unwrap();
        assert_send(&store.append_to_log(vec![append(1, 0)]));
    }

    #[tokio::test]
    async fn test_vote_survives_reopen() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = ReplicaStore::open(object_store.clone(), "r/t-0/0").await.unwrap();
        assert!(store.read_vote().await.unwrap().is_none());

        store.save_vote(&Vote::new(3, 1)).await.unwrap();

        let mut reopened = ReplicaStore::open(object_store, "r/t-0/0").await.unwrap();
        let vote = reopened.read_vote().await.unwrap().unwrap();
        assert_eq!(vote.leader_id().voted_for(), Some(1));
    }

    #[tokio::test]
    async fn test_journal_survives_reopen() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = ReplicaStore::open(object_store.clone(), "r/t-0/0").await.unwrap();
        store
            .append_to_log(vec![append(1, 0), append(2, 1), append(3, 2)])
            .await
            .unwrap();
        store
            .delete_conflict_logs_since(make_log_id(1, 0, 3))
            .await
            .unwrap();

        let mut reopened = ReplicaStore::open(object_store, "r/t-0/0").await.unwrap();
        let state = reopened.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 2);
        let entries = reopened.try_get_log_entries(1..3).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_purge_keeps_last_log_id() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = ReplicaStore::open(object_store.clone(), "r").await.unwrap();
        store
            .append_to_log(vec![append(1, 0), append(2, 1)])
            .await
            .unwrap();
        store.purge_logs_upto(make_log_id(1, 0, 2)).await.unwrap();

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.unwrap().index, 2);
        assert_eq!(state.last_log_id.unwrap().index, 2);

        let mut reopened = ReplicaStore::open(object_store, "r").await.unwrap();
        assert!(reopened.try_get_log_entries(..).await.unwrap().is_empty());
        assert_eq!(
            reopened.get_log_state().await.unwrap().last_purged_log_id,
            Some(make_log_id(1, 0, 2))
        );
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let mut store = ReplicaStore::new(Arc::new(InMemory::new()), "r");
        let responses = store
            .apply_to_state_machine(&[
                make_entry(1, EntryPayload::Blank),
                append(2, 0),
                append(3, 0),
            ])
            .await
            .unwrap();
        assert_eq!(
            responses,
            vec![
                LogResponse::Ok,
                LogResponse::Appended { index: 0 },
                LogResponse::AlreadyPresent { index: 0 },
            ]
        );
        assert_eq!(store.state_machine().read().await.len(), 1);
        let (applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(applied.unwrap().index, 3);
    }

    #[tokio::test]
    async fn test_snapshot_restores_state_machine() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = ReplicaStore::open(object_store.clone(), "r").await.unwrap();
        store
            .apply_to_state_machine(&[append(1, 0), append(2, 1)])
            .await
            .unwrap();
        let snapshot = store.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id.unwrap().index, 2);

        let mut reopened = ReplicaStore::open(object_store, "r").await.unwrap();
        assert_eq!(reopened.state_machine().read().await.len(), 2);
        assert!(reopened.get_current_snapshot().await.unwrap().is_some());
        let (applied, _) = reopened.last_applied_state().await.unwrap();
        assert_eq!(applied.unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_snapshot_without_data_is_corruption() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = ReplicaStore::open(object_store.clone(), "r").await.unwrap();
        store.apply_to_state_machine(&[append(1, 0)]).await.unwrap();
        store.build_snapshot().await.unwrap();
        object_store
            .delete(&ObjectPath::from("r/snapshot/current.snapshot"))
            .await
            .unwrap();

        assert!(matches!(
            ReplicaStore::open(object_store, "r").await,
            Err(Error::Storage(_))
        ));
    }
}
