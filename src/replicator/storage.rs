use crate::replicator::state_machine::{ClusterState, SharedState};
use crate::types::{ClusterCommand, MemberId};
use anyhow::{Context, Result};
use openraft::storage::{Adaptor, LogState, RaftStorage};
use openraft::{
    Entry, EntryPayload, LogId, OptionalSend, RaftLogReader, RaftSnapshotBuilder, Snapshot,
    SnapshotMeta, StorageError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Mutex;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = ClusterCommand,
        R = (),
        Node = RaftMember,
);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RaftMember {
    pub address: String,
    pub name: String,
}

impl std::fmt::Display for RaftMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged";
const KEY_LAST_APPLIED: &[u8] = b"last_applied";
const KEY_MEMBERSHIP: &[u8] = b"membership";
const KEY_SNAPSHOT_IDX: &[u8] = b"snapshot_idx";
const KEY_STATE_SNAPSHOT: &[u8] = b"state_snapshot";

fn storage_io_err(
    subject: openraft::ErrorSubject<MemberId>,
    verb: openraft::ErrorVerb,
    error: impl std::error::Error + 'static,
) -> StorageError<MemberId> {
    StorageError::from_io_error(
        subject,
        verb,
        std::io::Error::new(std::io::ErrorKind::Other, error.to_string()),
    )
}

fn log_write_err(error: impl std::error::Error + 'static) -> StorageError<MemberId> {
    storage_io_err(openraft::ErrorSubject::Logs, openraft::ErrorVerb::Write, error)
}

fn log_read_err(error: impl std::error::Error + 'static) -> StorageError<MemberId> {
    storage_io_err(openraft::ErrorSubject::Logs, openraft::ErrorVerb::Read, error)
}

fn sm_write_err(error: impl std::error::Error + 'static) -> StorageError<MemberId> {
    storage_io_err(
        openraft::ErrorSubject::StateMachine,
        openraft::ErrorVerb::Write,
        error,
    )
}

pub struct GlobalStorage {
    db: sled::Db,
    log_tree: sled::Tree,
    meta_tree: sled::Tree,
    state: SharedState,
    snapshot_idx: Mutex<u64>,
}

impl GlobalStorage {
    pub fn new<P: AsRef<Path>>(path: P, state: SharedState) -> Result<Self> {
        let db = sled::open(path).context("Failed to open global database")?;
        let log_tree = db.open_tree("raft_log")?;
        let meta_tree = db.open_tree("raft_meta")?;

        let snapshot_idx = meta_tree
            .get(KEY_SNAPSHOT_IDX)?
            .map(|v| bincode::deserialize(&v).unwrap_or(0))
            .unwrap_or(0);

        if let Some(raw) = meta_tree.get(KEY_STATE_SNAPSHOT)? {
            if let Ok(cluster_state) = serde_json::from_slice::<ClusterState>(&raw) {
                state.restore(cluster_state);
                tracing::info!("Restored cluster state from snapshot");
            }
        }

        Ok(Self {
            db,
            log_tree,
            meta_tree,
            state,
            snapshot_idx: Mutex::new(snapshot_idx),
        })
    }

    // Direct read path for the activation probe: loads the persisted state
    // snapshot without starting Raft. Callers must not issue any writes.
    pub fn read_state_direct<P: AsRef<Path>>(path: P) -> Result<ClusterState> {
        let db = sled::open(path).context("Failed to open global database")?;
        let meta_tree = db.open_tree("raft_meta")?;

        match meta_tree.get(KEY_STATE_SNAPSHOT)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(ClusterState::new()),
        }
    }

    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn get_vote(&self) -> Option<Vote<MemberId>> {
        self.meta_tree
            .get(KEY_VOTE)
            .ok()
            .flatten()
            .and_then(|v| bincode::deserialize(&v).ok())
    }

    fn get_last_purged(&self) -> Option<LogId<MemberId>> {
        self.meta_tree
            .get(KEY_LAST_PURGED)
            .ok()
            .flatten()
            .and_then(|v| bincode::deserialize(&v).ok())
    }

    fn get_last_applied(&self) -> Option<LogId<MemberId>> {
        self.meta_tree
            .get(KEY_LAST_APPLIED)
            .ok()
            .flatten()
            .and_then(|v| bincode::deserialize(&v).ok())
    }

    fn set_last_applied(&self, log_id: &LogId<MemberId>) -> Result<(), sled::Error> {
        self.meta_tree
            .insert(KEY_LAST_APPLIED, bincode::serialize(log_id).unwrap())?;
        Ok(())
    }

    fn get_membership(&self) -> StoredMembership<MemberId, RaftMember> {
        self.meta_tree
            .get(KEY_MEMBERSHIP)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_slice(&v).ok())
            .unwrap_or_default()
    }

    fn set_membership(
        &self,
        membership: &StoredMembership<MemberId, RaftMember>,
    ) -> Result<(), sled::Error> {
        self.meta_tree
            .insert(KEY_MEMBERSHIP, serde_json::to_vec(membership).unwrap())?;
        Ok(())
    }

    fn save_state_snapshot(&self) -> Result<(), sled::Error> {
        let cluster_state = self.state.snapshot();
        self.meta_tree.insert(
            KEY_STATE_SNAPSHOT,
            serde_json::to_vec(&cluster_state).unwrap(),
        )?;
        self.meta_tree.flush()?;
        Ok(())
    }

    fn clone_handle(&self) -> Self {
        Self {
            db: self.db.clone(),
            log_tree: self.log_tree.clone(),
            meta_tree: self.meta_tree.clone(),
            state: self.state.clone(),
            snapshot_idx: Mutex::new(*self.snapshot_idx.lock().unwrap()),
        }
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }
}

impl RaftLogReader<TypeConfig> for GlobalStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<MemberId>> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(&s) => s,
            std::ops::Bound::Excluded(&s) => s + 1,
            std::ops::Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            std::ops::Bound::Included(&e) => Some(e + 1),
            std::ops::Bound::Excluded(&e) => Some(e),
            std::ops::Bound::Unbounded => None,
        };

        let mut entries = Vec::new();
        for item in self.log_tree.range(Self::log_key(start)..) {
            let (key, value) = item.map_err(log_read_err)?;

            let index = u64::from_be_bytes(key.as_ref().try_into().unwrap());
            if let Some(e) = end {
                if index >= e {
                    break;
                }
            }

            let entry: Entry<TypeConfig> =
                serde_json::from_slice(&value).map_err(log_read_err)?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

impl RaftSnapshotBuilder<TypeConfig> for GlobalStorage {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<MemberId>> {
        let cluster_state = self.state.snapshot();
        let data = serde_json::to_vec(&cluster_state).unwrap();

        let last_applied = self.get_last_applied();
        let last_membership = self.get_membership();

        let mut idx = self.snapshot_idx.lock().unwrap();
        *idx += 1;
        let snapshot_idx = *idx;

        let _ = self
            .meta_tree
            .insert(KEY_SNAPSHOT_IDX, bincode::serialize(&snapshot_idx).unwrap());

        let snapshot_id = format!(
            "{}-{}-{}",
            last_applied
                .map(|l| l.leader_id.to_string())
                .unwrap_or_default(),
            last_applied.map(|l| l.index).unwrap_or(0),
            snapshot_idx
        );

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id,
        };

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for GlobalStorage {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<MemberId>> {
        let last_purged = self.get_last_purged();

        let last_log_id = self
            .log_tree
            .last()
            .map_err(log_read_err)?
            .and_then(|(_, v)| serde_json::from_slice::<Entry<TypeConfig>>(&v).ok())
            .map(|e| e.log_id);

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<MemberId>) -> Result<(), StorageError<MemberId>> {
        self.meta_tree
            .insert(KEY_VOTE, bincode::serialize(vote).unwrap())
            .map_err(|e| {
                storage_io_err(openraft::ErrorSubject::Vote, openraft::ErrorVerb::Write, e)
            })?;
        self.meta_tree.flush().map_err(|e| {
            storage_io_err(openraft::ErrorSubject::Vote, openraft::ErrorVerb::Write, e)
        })?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<MemberId>>, StorageError<MemberId>> {
        Ok(self.get_vote())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone_handle()
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<MemberId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        for entry in entries {
            let key = Self::log_key(entry.log_id.index);
            let value = serde_json::to_vec(&entry).unwrap();
            self.log_tree.insert(key, value).map_err(log_write_err)?;
        }
        self.log_tree.flush().map_err(log_write_err)?;
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<MemberId>,
    ) -> Result<(), StorageError<MemberId>> {
        let keys_to_remove: Vec<_> = self
            .log_tree
            .range(Self::log_key(log_id.index)..)
            .filter_map(|r| r.ok().map(|(k, _)| k))
            .collect();

        for key in keys_to_remove {
            self.log_tree.remove(key).map_err(log_write_err)?;
        }
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<MemberId>,
    ) -> Result<(), StorageError<MemberId>> {
        self.meta_tree
            .insert(KEY_LAST_PURGED, bincode::serialize(&log_id).unwrap())
            .map_err(log_write_err)?;

        let keys_to_remove: Vec<_> = self
            .log_tree
            .range(..=Self::log_key(log_id.index))
            .filter_map(|r| r.ok().map(|(k, _)| k))
            .collect();

        for key in keys_to_remove {
            self.log_tree.remove(key).map_err(log_write_err)?;
        }
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<MemberId>>,
            StoredMembership<MemberId, RaftMember>,
        ),
        StorageError<MemberId>,
    > {
        Ok((self.get_last_applied(), self.get_membership()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<()>, StorageError<MemberId>> {
        let mut results = Vec::new();

        for entry in entries {
            self.set_last_applied(&entry.log_id).map_err(sm_write_err)?;

            match &entry.payload {
                EntryPayload::Blank => {}
                EntryPayload::Normal(cmd) => {
                    self.state.apply(cmd);
                    self.state.set_last_applied(entry.log_id.index);
                }
                EntryPayload::Membership(mem) => {
                    let membership = StoredMembership::new(Some(entry.log_id), mem.clone());
                    self.set_membership(&membership).map_err(sm_write_err)?;
                }
            }
            results.push(());
        }

        self.save_state_snapshot().map_err(sm_write_err)?;

        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone_handle()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<MemberId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<MemberId, RaftMember>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<MemberId>> {
        let data = snapshot.into_inner();
        let cluster_state: ClusterState = serde_json::from_slice(&data).map_err(|e| {
            storage_io_err(
                openraft::ErrorSubject::Snapshot(Some(meta.signature())),
                openraft::ErrorVerb::Read,
                e,
            )
        })?;

        self.state.restore(cluster_state);

        if let Some(log_id) = meta.last_log_id {
            self.set_last_applied(&log_id).map_err(sm_write_err)?;
        }

        self.set_membership(&meta.last_membership)
            .map_err(sm_write_err)?;

        self.save_state_snapshot().map_err(sm_write_err)?;

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<MemberId>> {
        Ok(None)
    }
}

pub type GlobalLogStore = Adaptor<TypeConfig, GlobalStorage>;
pub type GlobalStateMachine = Adaptor<TypeConfig, GlobalStorage>;

pub fn create_storage<P: AsRef<Path>>(
    path: P,
    state: SharedState,
) -> Result<(GlobalLogStore, GlobalStateMachine)> {
    let storage = GlobalStorage::new(path, state)?;
    Ok(Adaptor::new(storage))
}
