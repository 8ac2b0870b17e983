//! ACID-durable store backed by redb.
//!
//! Bitemporal layout: each record key is `identity + NUL + valid_time` (big
//! endian, so byte order is version order) and each value is a
//! bincode-encoded `Option<record>` where `None` is a tombstone. A point
//! read resolves the latest version at or before the requested valid time.
//! One write transaction covers a whole commit batch, which is what makes a
//! derivation pass atomic: either everything lands or nothing does.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::node::Node;
use crate::origin::Origin;
use crate::profile::{ScanLevel, ScanProfile};
use crate::reference::Reference;

use super::{GraphStore, Mutation, Query, RelationPath, StoreResult, Timestamp};

const NODES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("nodes");
const PROFILES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("profiles");
const ORIGINS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("origins");
/// Commit sequence → (valid_time, transaction_time) for audit.
const COMMITS: TableDefinition<u64, (u64, u64)> = TableDefinition::new("commits");

fn redb_err(context: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend {
        message: format!("{context}: {err}"),
    }
}

fn version_key(identity: &str, at: Timestamp) -> Vec<u8> {
    let mut key = Vec::with_capacity(identity.len() + 9);
    key.extend_from_slice(identity.as_bytes());
    key.push(0);
    key.extend_from_slice(&at.get().to_be_bytes());
    key
}

fn split_key(key: &[u8]) -> Option<(String, u64)> {
    // Fixed layout: identity, NUL, 8 big-endian timestamp bytes. The
    // timestamp may itself contain zero bytes, so locate the separator
    // positionally.
    if key.len() < 9 || key[key.len() - 9] != 0 {
        return None;
    }
    let (identity, ts) = key.split_at(key.len() - 9);
    let ts: [u8; 8] = ts[1..].try_into().ok()?;
    Some((
        String::from_utf8(identity.to_vec()).ok()?,
        u64::from_be_bytes(ts),
    ))
}

fn encode<V: Serialize>(value: &Option<V>) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization {
        message: format!("failed to encode record: {e}"),
    })
}

fn decode<V: DeserializeOwned>(bytes: &[u8]) -> StoreResult<Option<V>> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
        message: format!("failed to decode record: {e}"),
    })
}

/// Durable bitemporal store using redb.
pub struct DurableStore {
    db: Arc<Database>,
}

impl DurableStore {
    /// Open or create a durable store in the given directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let db_path = data_dir.join("argus.redb");
        let db = Database::create(&db_path)
            .map_err(|e| redb_err(&format!("failed to open redb at {}", db_path.display()), e))?;

        // Creating the tables up front keeps read paths free of
        // table-missing special cases.
        let txn = db.begin_write().map_err(|e| redb_err("begin_write", e))?;
        {
            txn.open_table(NODES).map_err(|e| redb_err("open nodes", e))?;
            txn.open_table(PROFILES)
                .map_err(|e| redb_err("open profiles", e))?;
            txn.open_table(ORIGINS)
                .map_err(|e| redb_err("open origins", e))?;
            txn.open_table(COMMITS)
                .map_err(|e| redb_err("open commits", e))?;
        }
        txn.commit().map_err(|e| redb_err("commit", e))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Latest version of one identity at or before `at`.
    fn read_version<V: DeserializeOwned>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        identity: &str,
        at: Timestamp,
    ) -> StoreResult<Option<V>> {
        let txn = self.db.begin_read().map_err(|e| redb_err("begin_read", e))?;
        let table = txn.open_table(table).map_err(|e| redb_err("open_table", e))?;

        let low = version_key(identity, Timestamp::ZERO);
        let high = version_key(identity, at);
        let mut range = table
            .range(low.as_slice()..=high.as_slice())
            .map_err(|e| redb_err("range", e))?;

        match range.next_back() {
            Some(entry) => {
                let (_, value) = entry.map_err(|e| redb_err("cursor", e))?;
                decode(value.value())
            }
            None => Ok(None),
        }
    }

    /// Latest live version per identity at `at`, across a whole table.
    fn scan_live<V: DeserializeOwned>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        at: Timestamp,
    ) -> StoreResult<Vec<(String, V)>> {
        let txn = self.db.begin_read().map_err(|e| redb_err("begin_read", e))?;
        let table = txn.open_table(table).map_err(|e| redb_err("open_table", e))?;

        // (identity → (version ts, decoded)) keeping only the newest ≤ at.
        let mut latest: HashMap<String, (u64, Option<V>)> = HashMap::new();
        for entry in table.iter().map_err(|e| redb_err("iter", e))? {
            let (key, value) = entry.map_err(|e| redb_err("cursor", e))?;
            let Some((identity, ts)) = split_key(key.value()) else {
                continue;
            };
            if ts > at.get() {
                continue;
            }
            let newer = latest
                .get(&identity)
                .is_none_or(|(existing, _)| ts > *existing);
            if newer {
                latest.insert(identity, (ts, decode(value.value())?));
            }
        }

        let mut live: Vec<(String, V)> = latest
            .into_iter()
            .filter_map(|(identity, (_, value))| value.map(|v| (identity, v)))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(live)
    }

    fn live_nodes(&self, at: Timestamp) -> StoreResult<Vec<(Reference, Node)>> {
        let mut out = Vec::new();
        for (identity, node) in self.scan_live::<Node>(NODES, at)? {
            let reference = Reference::parse(&identity).map_err(|e| StoreError::Serialization {
                message: format!("corrupt node key \"{identity}\": {e}"),
            })?;
            out.push((reference, node));
        }
        Ok(out)
    }
}

impl GraphStore for DurableStore {
    fn get(&self, reference: &Reference, at: Timestamp) -> StoreResult<Option<Node>> {
        self.read_version(NODES, &reference.to_string(), at)
    }

    fn neighbours(
        &self,
        reference: &Reference,
        paths: &[RelationPath],
        at: Timestamp,
    ) -> StoreResult<HashMap<RelationPath, Vec<(Reference, Node)>>> {
        let mut out: HashMap<RelationPath, Vec<(Reference, Node)>> = HashMap::new();
        for path in paths {
            let mut hits = Vec::new();
            match path {
                RelationPath::Outgoing { attr } => {
                    if let Some(node) = self.get(reference, at)? {
                        if let Some(target) =
                            node.attr(attr).and_then(|value| value.as_reference())
                        {
                            if let Some(target_node) = self.get(target, at)? {
                                hits.push((target.clone(), target_node));
                            }
                        }
                    }
                }
                RelationPath::Incoming { kind, attr } => {
                    for (candidate, node) in self.live_nodes(at)? {
                        if candidate.kind() != kind {
                            continue;
                        }
                        let points_here = node
                            .attr(attr)
                            .and_then(|value| value.as_reference())
                            .is_some_and(|target| target == reference);
                        if points_here {
                            hits.push((candidate, node));
                        }
                    }
                }
            }
            out.insert(path.clone(), hits);
        }
        Ok(out)
    }

    fn query(&self, query: &Query, at: Timestamp) -> StoreResult<Vec<(Reference, Node)>> {
        let mut rows = Vec::new();
        for (reference, node) in self.live_nodes(at)? {
            if node.kind() != query.kind {
                continue;
            }
            let matches = query.anchors.iter().all(|(attr, anchor)| {
                node.attr(attr)
                    .and_then(|value| value.as_reference())
                    .is_some_and(|target| target == anchor)
            });
            if matches {
                rows.push((reference, node));
            }
        }
        Ok(rows)
    }

    fn profile(&self, reference: &Reference, at: Timestamp) -> StoreResult<Option<ScanProfile>> {
        self.read_version(PROFILES, &reference.to_string(), at)
    }

    fn declared_profiles(&self, at: Timestamp) -> StoreResult<Vec<(Reference, ScanLevel)>> {
        let mut declared = Vec::new();
        for (identity, profile) in self.scan_live::<ScanProfile>(PROFILES, at)? {
            if let ScanProfile::Declared { level } = profile {
                let reference =
                    Reference::parse(&identity).map_err(|e| StoreError::Serialization {
                        message: format!("corrupt profile key \"{identity}\": {e}"),
                    })?;
                declared.push((reference, level));
            }
        }
        Ok(declared)
    }

    fn all_profiles(&self, at: Timestamp) -> StoreResult<Vec<(Reference, ScanProfile)>> {
        let mut profiles = Vec::new();
        for (identity, profile) in self.scan_live::<ScanProfile>(PROFILES, at)? {
            let reference = Reference::parse(&identity).map_err(|e| StoreError::Serialization {
                message: format!("corrupt profile key \"{identity}\": {e}"),
            })?;
            profiles.push((reference, profile));
        }
        Ok(profiles)
    }

    fn origin(&self, id: &str, at: Timestamp) -> StoreResult<Option<Origin>> {
        self.read_version(ORIGINS, id, at)
    }

    fn origins_with_parameter(
        &self,
        reference: &Reference,
        at: Timestamp,
    ) -> StoreResult<Vec<Origin>> {
        Ok(self
            .scan_live::<Origin>(ORIGINS, at)?
            .into_iter()
            .map(|(_, origin)| origin)
            .filter(|origin| origin.is_parameterized_by(reference))
            .collect())
    }

    fn origins_producing(
        &self,
        reference: &Reference,
        at: Timestamp,
    ) -> StoreResult<Vec<Origin>> {
        Ok(self
            .scan_live::<Origin>(ORIGINS, at)?
            .into_iter()
            .map(|(_, origin)| origin)
            .filter(|origin| origin.result.contains(reference))
            .collect())
    }

    fn commit(&self, mutations: Vec<Mutation>, valid_time: Timestamp) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(|e| redb_err("begin_write", e))?;
        {
            let mut nodes = txn.open_table(NODES).map_err(|e| redb_err("open nodes", e))?;
            let mut profiles = txn
                .open_table(PROFILES)
                .map_err(|e| redb_err("open profiles", e))?;
            let mut origins = txn
                .open_table(ORIGINS)
                .map_err(|e| redb_err("open origins", e))?;
            let mut commits = txn
                .open_table(COMMITS)
                .map_err(|e| redb_err("open commits", e))?;

            for mutation in &mutations {
                match mutation {
                    Mutation::PutNode { reference, node } => {
                        let key = version_key(&reference.to_string(), valid_time);
                        let value = encode(&Some(node.clone()))?;
                        nodes
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(|e| redb_err("insert node", e))?;
                    }
                    Mutation::DeleteNode(reference) => {
                        let key = version_key(&reference.to_string(), valid_time);
                        let value = encode::<Node>(&None)?;
                        nodes
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(|e| redb_err("insert node tombstone", e))?;
                    }
                    Mutation::PutProfile { reference, profile } => {
                        let key = version_key(&reference.to_string(), valid_time);
                        let value = encode(&Some(profile.clone()))?;
                        profiles
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(|e| redb_err("insert profile", e))?;
                    }
                    Mutation::DeleteProfile(reference) => {
                        let key = version_key(&reference.to_string(), valid_time);
                        let value = encode::<ScanProfile>(&None)?;
                        profiles
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(|e| redb_err("insert profile tombstone", e))?;
                    }
                    Mutation::PutOrigin(origin) => {
                        let key = version_key(&origin.id(), valid_time);
                        let value = encode(&Some(origin.clone()))?;
                        origins
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(|e| redb_err("insert origin", e))?;
                    }
                    Mutation::DeleteOrigin(id) => {
                        let key = version_key(id, valid_time);
                        let value = encode::<Origin>(&None)?;
                        origins
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(|e| redb_err("insert origin tombstone", e))?;
                    }
                }
            }

            let seq = commits
                .last()
                .map_err(|e| redb_err("commits cursor", e))?
                .map(|(key, _)| key.value() + 1)
                .unwrap_or(0);
            commits
                .insert(seq, (valid_time.get(), Timestamp::now().get()))
                .map_err(|e| redb_err("insert commit record", e))?;
        }
        txn.commit().map_err(|e| redb_err("commit", e))?;
        Ok(())
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").finish()
    }
}
