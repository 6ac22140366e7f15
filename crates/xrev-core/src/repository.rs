//! # Repository Abstraction
//!
//! The storage/query contract the engine's algorithms consume, and the
//! in-memory arena implementation used by `Session`.
//!
//! Nodes live in an append-only arena; the external index maps `Xid` to
//! arena slots, successor links are an index over predecessors (a node never
//! stores its `next`), and the internal index maps 32-bit uids to
//! administrative items. All maps are `BTreeMap` for deterministic iteration.
//!
//! Commits are atomic: everything added since the last finished commit is
//! either sealed by `finish_commit` or discarded by `abort_commit`.

use crate::identity::{Rev, Xid, read_xid};
use crate::normalize::{Manifestation, MigrationMap, PayloadStore, scan_table};
use crate::primitives::{DEFAULT_UID_SEED, FIRST_REVISION, MAX_UID_ATTEMPTS, NODE_TYPE};
use crate::tree::Element;
use crate::types::XrevError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// STORED RECORDS
// =============================================================================

/// A stored, normalized payload. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// External identity, as carried by the payload root.
    pub payload_xid: Xid,
    /// Administrative identity; never appears in content.
    pub item_xid: Xid,
    /// Single predecessor (no branching).
    pub prev: Option<Xid>,
    /// Normalized payload.
    pub payload: Element,
}

/// A tracked document's per-commit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub path: String,
    /// Revision of the commit that recorded this version.
    pub revision: u64,
    /// BLAKE3 digest of the document's canonical form.
    pub digest: String,
    /// Identity of the document root.
    pub root: Xid,
    /// Revision of the commit that recorded the previous version of this path.
    pub prev: Option<u64>,
    /// Inclusion points left collapsed in this document instance.
    pub manifestation: Option<Manifestation>,
}

/// One entry of a commit's layout snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileChange {
    Write(File),
    Delete { path: String },
}

/// An atomic unit of the append-only history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub revision: u64,
    pub message: String,
    pub changes: Vec<FileChange>,
    /// Nodes introduced by this commit.
    pub nodes: Vec<Xid>,
}

/// An entry of the internal-identity index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Internal {
    /// Type name the uid was generated for (`node`, `link`, ...).
    pub kind: String,
    /// The node an item identity administers.
    pub owner: Option<Xid>,
}

// =============================================================================
// REPOSITORY TRAIT
// =============================================================================

/// The storage contract consumed by ingest, migration and resolution.
///
/// Shared indices are mutated only through `generate_xid` and `add_node`.
pub trait Repository {
    /// Revision of the commit in flight.
    fn revision(&self) -> u64;

    /// Exact `(id, rev)` lookup in the external namespace.
    fn get_node(&self, xid: &Xid) -> Result<Option<Node>, XrevError>;

    /// The successor of `xid`, discovered through the predecessor index.
    fn successor(&self, xid: &Xid) -> Result<Option<Xid>, XrevError>;

    /// Produce a fresh internal identity `#<type_name>!<8 hex>` at the current revision.
    fn generate_xid(&mut self, type_name: &str) -> Result<Xid, XrevError>;

    /// Register a payload under the identity its root carries, linked to `prev`.
    fn add_node(&mut self, payload: Element, prev: Option<&Xid>) -> Result<Node, XrevError>;

    /// The node with lifeline `id` reachable from the current tree that has no
    /// successor, maximizing by revision.
    fn get_latest_leaser(&self, lifeline_id: &str) -> Result<Option<Node>, XrevError>;

    /// Move `xid` to the current commit revision. A present version gets its
    /// minor number bumped.
    fn set_new_revision(&self, xid: &mut Xid) {
        xid.rev = Rev::Assigned(self.revision());
        if let Some(version) = xid.version.as_mut() {
            version.minor = version.minor.saturating_add(1);
        }
    }

    /// Follow successor links to the newest revision of `xid`'s lifeline.
    fn newest_revision(&self, xid: &Xid) -> Result<Xid, XrevError> {
        let mut current = xid.clone();
        while let Some(next) = self.successor(&current)? {
            current = next;
        }
        Ok(current)
    }
}

// =============================================================================
// IN-MEMORY REPOSITORY
// =============================================================================

/// Arena-backed repository.
#[derive(Clone)]
pub struct MemoryRepository {
    /// Node arena, append-only.
    nodes: Vec<Node>,
    /// External index: Xid -> arena slot.
    externals: BTreeMap<Xid, usize>,
    /// Successor index: predecessor slot -> successor slot.
    successors: BTreeMap<usize, usize>,
    /// Internal index: uid -> item.
    internals: BTreeMap<u32, Internal>,
    /// Finished commits, oldest first.
    commits: Vec<Commit>,
    /// Head layout: path -> File.
    layout: BTreeMap<String, File>,
    /// Revision of the commit in flight.
    revision: u64,
    /// Arena length at the last finished commit.
    committed: usize,
    /// Uids drawn since the last finished commit.
    uncommitted_uids: Vec<u32>,
    seed: u64,
    rng: StdRng,
}

impl std::fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRepository")
            .field("revision", &self.revision)
            .field("nodes", &self.nodes.len())
            .field("commits", &self.commits.len())
            .field("files", &self.layout.len())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::with_seed(DEFAULT_UID_SEED)
    }
}

impl MemoryRepository {
    /// Create an empty repository at the first revision.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty repository with a specific uid seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            externals: BTreeMap::new(),
            successors: BTreeMap::new(),
            internals: BTreeMap::new(),
            commits: Vec::new(),
            layout: BTreeMap::new(),
            revision: FIRST_REVISION,
            committed: 0,
            uncommitted_uids: Vec::new(),
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Number of stored nodes, including uncommitted ones.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes added since the last finished commit.
    #[must_use]
    pub fn pending_nodes(&self) -> &[Node] {
        &self.nodes[self.committed..]
    }

    /// All stored nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Finished commits, oldest first.
    #[must_use]
    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    /// The latest finished commit.
    #[must_use]
    pub fn head(&self) -> Option<&Commit> {
        self.commits.last()
    }

    /// The head layout.
    #[must_use]
    pub fn layout(&self) -> &BTreeMap<String, File> {
        &self.layout
    }

    /// The head record of a tracked path.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&File> {
        self.layout.get(path)
    }

    /// Lookup in the internal-identity index.
    #[must_use]
    pub fn internal(&self, xid: &Xid) -> Option<&Internal> {
        self.internals.get(&xid.internal_uid()?)
    }

    /// All revisions of a lifeline, oldest first.
    #[must_use]
    pub fn lifeline(&self, id: &str) -> Vec<Xid> {
        self.externals
            .keys()
            .filter(|xid| xid.id == id)
            .cloned()
            .collect()
    }

    /// Slots of every node in the current tree: reachable from the head
    /// layout's roots or from a node added by the commit in flight.
    pub fn reachable(&self) -> Result<BTreeSet<usize>, XrevError> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<Xid> = self
            .layout
            .values()
            .map(|f| f.root.clone())
            .chain(self.pending_nodes().iter().map(|n| n.payload_xid.clone()))
            .collect();

        while let Some(xid) = stack.pop() {
            let slot = *self.externals.get(&xid).ok_or_else(|| {
                XrevError::integrity(format!("{} is reachable but not stored", xid))
            })?;
            if !seen.insert(slot) {
                continue;
            }
            for record in scan_table(&self.nodes[slot].payload)? {
                stack.push(record.target);
            }
        }
        Ok(seen)
    }

    /// Map every superseded revision to the newest revision of its lifeline.
    pub fn migration_map(&self) -> Result<MigrationMap, XrevError> {
        let mut map = MigrationMap::new();
        for &slot in self.successors.keys() {
            let stale = self.nodes[slot].payload_xid.clone();
            let newest = self.newest_revision(&stale)?;
            map.insert(stale, newest);
        }
        Ok(map)
    }

    /// Seal everything added since the last commit and advance the revision.
    pub fn finish_commit(
        &mut self,
        message: impl Into<String>,
        changes: Vec<FileChange>,
    ) -> &Commit {
        for change in &changes {
            match change {
                FileChange::Write(file) => {
                    self.layout.insert(file.path.clone(), file.clone());
                }
                FileChange::Delete { path } => {
                    self.layout.remove(path);
                }
            }
        }

        let commit = Commit {
            revision: self.revision,
            message: message.into(),
            changes,
            nodes: self.nodes[self.committed..]
                .iter()
                .map(|n| n.payload_xid.clone())
                .collect(),
        };
        tracing::info!(
            revision = commit.revision,
            nodes = commit.nodes.len(),
            changes = commit.changes.len(),
            "commit finished"
        );

        self.commits.push(commit);
        self.revision = self.revision.saturating_add(1);
        self.committed = self.nodes.len();
        self.uncommitted_uids.clear();
        &self.commits[self.commits.len() - 1]
    }

    /// Discard every node, successor link and uid added since the last commit.
    pub fn abort_commit(&mut self) {
        let keep = self.committed;
        let dropped = self.nodes.len().saturating_sub(keep);
        self.nodes.truncate(keep);
        self.externals.retain(|_, slot| *slot < keep);
        self.successors.retain(|_, next| *next < keep);
        for uid in self.uncommitted_uids.drain(..) {
            self.internals.remove(&uid);
        }
        tracing::debug!(revision = self.revision, dropped, "commit aborted");
    }

    fn slot_of(&self, xid: &Xid) -> Option<usize> {
        self.externals.get(xid).copied()
    }
}

impl Repository for MemoryRepository {
    fn revision(&self) -> u64 {
        self.revision
    }

    fn get_node(&self, xid: &Xid) -> Result<Option<Node>, XrevError> {
        Ok(self.slot_of(xid).map(|slot| self.nodes[slot].clone()))
    }

    fn successor(&self, xid: &Xid) -> Result<Option<Xid>, XrevError> {
        Ok(self
            .slot_of(xid)
            .and_then(|slot| self.successors.get(&slot))
            .map(|&next| self.nodes[next].payload_xid.clone()))
    }

    fn generate_xid(&mut self, type_name: &str) -> Result<Xid, XrevError> {
        for _ in 0..MAX_UID_ATTEMPTS {
            let uid: u32 = self.rng.random();
            if self.internals.contains_key(&uid) {
                continue;
            }
            self.internals.insert(
                uid,
                Internal {
                    kind: type_name.to_string(),
                    owner: None,
                },
            );
            self.uncommitted_uids.push(uid);
            return Ok(Xid::new(
                format!("#{}!{:08x}", type_name, uid),
                self.revision,
            ));
        }
        Err(XrevError::integrity(format!(
            "no unused internal uid for '{}' after {} attempts",
            type_name, MAX_UID_ATTEMPTS
        )))
    }

    fn add_node(&mut self, payload: Element, prev: Option<&Xid>) -> Result<Node, XrevError> {
        let payload_xid = read_xid(&payload)?
            .ok_or_else(|| XrevError::integrity("payload root carries no identity"))?;
        if payload_xid.rev.number().is_none() {
            return Err(XrevError::integrity(format!(
                "payload identity {} has no assigned revision",
                payload_xid
            )));
        }
        if self.externals.contains_key(&payload_xid) {
            return Err(XrevError::integrity(format!(
                "identity {} is already taken",
                payload_xid
            )));
        }

        let prev_slot = match prev {
            Some(prev_xid) => {
                let slot = self.slot_of(prev_xid).ok_or_else(|| {
                    XrevError::integrity(format!("predecessor {} is not stored", prev_xid))
                })?;
                if let Some(&next) = self.successors.get(&slot) {
                    return Err(XrevError::integrity(format!(
                        "predecessor {} already has successor {}",
                        prev_xid, self.nodes[next].payload_xid
                    )));
                }
                Some(slot)
            }
            None => None,
        };

        let item_xid = self.generate_xid(NODE_TYPE)?;
        if let Some(uid) = item_xid.internal_uid() {
            if let Some(item) = self.internals.get_mut(&uid) {
                item.owner = Some(payload_xid.clone());
            }
        }

        let node = Node {
            payload_xid: payload_xid.clone(),
            item_xid,
            prev: prev.cloned(),
            payload,
        };
        let slot = self.nodes.len();
        self.nodes.push(node.clone());
        self.externals.insert(payload_xid, slot);
        if let Some(p) = prev_slot {
            self.successors.insert(p, slot);
        }
        Ok(node)
    }

    fn get_latest_leaser(&self, lifeline_id: &str) -> Result<Option<Node>, XrevError> {
        let reachable = self.reachable()?;
        Ok(reachable
            .into_iter()
            .filter(|slot| {
                self.nodes[*slot].payload_xid.id == lifeline_id
                    && !self.successors.contains_key(slot)
            })
            .max_by_key(|slot| self.nodes[*slot].payload_xid.rev)
            .map(|slot| self.nodes[slot].clone()))
    }
}

impl PayloadStore for MemoryRepository {
    fn payload(&self, xid: &Xid) -> Result<Option<Element>, XrevError> {
        Ok(self.slot_of(xid).map(|slot| self.nodes[slot].payload.clone()))
    }
}

// =============================================================================
// SERIALIZABLE FORM
// =============================================================================

/// Committed repository state, ready for `postcard`.
///
/// Uncommitted nodes are never part of the serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableRepository {
    pub revision: u64,
    pub seed: u64,
    pub nodes: Vec<Node>,
    pub internals: Vec<(u32, Internal)>,
    pub commits: Vec<Commit>,
    pub layout: Vec<File>,
}

impl From<&MemoryRepository> for SerializableRepository {
    fn from(repo: &MemoryRepository) -> Self {
        let pending: BTreeSet<u32> = repo.uncommitted_uids.iter().copied().collect();
        Self {
            revision: repo.revision,
            seed: repo.seed,
            nodes: repo.nodes[..repo.committed].to_vec(),
            internals: repo
                .internals
                .iter()
                .filter(|(uid, _)| !pending.contains(uid))
                .map(|(uid, item)| (*uid, item.clone()))
                .collect(),
            commits: repo.commits.clone(),
            layout: repo.layout.values().cloned().collect(),
        }
    }
}

impl TryFrom<SerializableRepository> for MemoryRepository {
    type Error = XrevError;

    fn try_from(s: SerializableRepository) -> Result<Self, Self::Error> {
        let mut repo = Self::with_seed(s.seed);
        // Reseed per revision so reopened repositories do not replay old draws.
        repo.rng = StdRng::seed_from_u64(s.seed ^ s.revision.rotate_left(32));
        repo.revision = s.revision;

        for node in s.nodes {
            let slot = repo.nodes.len();
            if repo.externals.insert(node.payload_xid.clone(), slot).is_some() {
                return Err(XrevError::integrity(format!(
                    "duplicate identity {} in snapshot",
                    node.payload_xid
                )));
            }
            repo.nodes.push(node);
        }
        for slot in 0..repo.nodes.len() {
            if let Some(prev) = repo.nodes[slot].prev.clone() {
                let prev_slot = repo.slot_of(&prev).ok_or_else(|| {
                    XrevError::integrity(format!("predecessor {} missing from snapshot", prev))
                })?;
                if repo.successors.insert(prev_slot, slot).is_some() {
                    return Err(XrevError::integrity(format!(
                        "{} has two successors in snapshot",
                        prev
                    )));
                }
            }
        }

        repo.internals = s.internals.into_iter().collect();
        repo.commits = s.commits;
        repo.layout = s
            .layout
            .into_iter()
            .map(|file| (file.path.clone(), file))
            .collect();
        repo.committed = repo.nodes.len();
        Ok(repo)
    }
}

// =============================================================================
// TESTS
// =============================================================================
