//! Commit graph: creation, ancestry walks and merge-base selection.
//!
//! Ancestry is read from the `commit_parents` index rather than by decoding
//! every commit payload. All walks are breadth-first with explicit queues and
//! visited sets, so arbitrarily deep histories never grow the call stack.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::queries;
use crate::errors::{GraphError, StoreError};
use crate::models::{Commit, CommitMeta, ObjectId, ObjectKind};
use crate::store::ObjectStore;

/// One commit in a history listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: ObjectId,
    pub commit: Commit,
}

/// Stateless commit graph operations.
pub struct CommitGraph;

impl CommitGraph {
    /// Create a commit after checking the tree and every parent are stored
    /// with the right kind.
    pub fn create_commit(
        conn: &Connection,
        tree: &ObjectId,
        parents: &[ObjectId],
        meta: CommitMeta,
    ) -> Result<ObjectId, GraphError> {
        match ObjectStore::kind_of(conn, tree)? {
            Some(ObjectKind::Tree) => {}
            Some(other) => return Err(kind_mismatch(tree, ObjectKind::Tree, other).into()),
            None => return Err(GraphError::MissingTree(tree.to_string())),
        }
        for parent in parents {
            match ObjectStore::kind_of(conn, parent)? {
                Some(ObjectKind::Commit) => {}
                Some(other) => return Err(kind_mismatch(parent, ObjectKind::Commit, other).into()),
                None => return Err(GraphError::MissingParent(parent.to_string())),
            }
        }

        let commit = Commit::new(tree.clone(), parents.to_vec(), meta);
        let id = ObjectStore::put_commit(conn, &commit)?;
        debug!(commit = %id.short(), parents = parents.len(), "created commit");
        Ok(id)
    }

    /// Parents of a stored commit, in order.
    pub fn parents(conn: &Connection, commit: &ObjectId) -> Result<Vec<ObjectId>, GraphError> {
        Self::ensure_commit(conn, commit)?;
        Self::indexed_parents(conn, commit)
    }

    /// Commits that name `commit` as a parent.
    pub fn children(conn: &Connection, commit: &ObjectId) -> Result<Vec<ObjectId>, GraphError> {
        Self::ensure_commit(conn, commit)?;
        let ids = queries::list_commit_children(conn, commit.as_str())?;
        ids.iter()
            .map(|id| ObjectId::from_hex(id).map_err(GraphError::from))
            .collect()
    }

    /// `commit` and everything reachable from it through parent links.
    pub fn ancestors(conn: &Connection, commit: &ObjectId) -> Result<HashSet<ObjectId>, GraphError> {
        Self::ensure_commit(conn, commit)?;
        Self::reachable(conn, vec![commit.clone()])
    }

    /// `true` if `ancestor` is `descendant` or reachable from it.
    pub fn is_ancestor(
        conn: &Connection,
        ancestor: &ObjectId,
        descendant: &ObjectId,
    ) -> Result<bool, GraphError> {
        Self::ensure_commit(conn, ancestor)?;
        Self::ensure_commit(conn, descendant)?;

        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([descendant.clone()]);
        while let Some(current) = queue.pop_front() {
            if &current == ancestor {
                return Ok(true);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            queue.extend(Self::indexed_parents(conn, &current)?);
        }
        Ok(false)
    }

    /// Best common ancestor of `a` and `b`.
    ///
    /// Candidates are common ancestors not reachable from another common
    /// ancestor. Among several candidates the one with the latest timestamp
    /// wins, then the lexicographically smallest id, so the result does not
    /// depend on argument order.
    pub fn merge_base(conn: &Connection, a: &ObjectId, b: &ObjectId) -> Result<ObjectId, GraphError> {
        let ancestors_a = Self::ancestors(conn, a)?;
        let ancestors_b = Self::ancestors(conn, b)?;
        let common: HashSet<ObjectId> = ancestors_a.intersection(&ancestors_b).cloned().collect();
        if common.is_empty() {
            return Err(GraphError::NoCommonAncestor {
                a: a.to_string(),
                b: b.to_string(),
            });
        }

        // Strict ancestors of any common ancestor are dominated.
        let mut starts = Vec::new();
        for id in &common {
            starts.extend(Self::indexed_parents(conn, id)?);
        }
        let dominated = Self::reachable(conn, starts)?;

        let mut best: Option<(DateTime<Utc>, ObjectId)> = None;
        for id in common.into_iter().filter(|id| !dominated.contains(id)) {
            let timestamp = ObjectStore::get_commit(conn, &id)?.timestamp;
            let better = match &best {
                None => true,
                Some((best_ts, best_id)) => {
                    timestamp > *best_ts || (timestamp == *best_ts && id < *best_id)
                }
            };
            if better {
                best = Some((timestamp, id));
            }
        }

        match best {
            Some((_, id)) => {
                debug!(a = %a.short(), b = %b.short(), base = %id.short(), "merge base");
                Ok(id)
            }
            None => Err(GraphError::NoCommonAncestor {
                a: a.to_string(),
                b: b.to_string(),
            }),
        }
    }

    /// Ancestry of `start`, newest first by commit timestamp, at most `limit`
    /// entries.
    pub fn history(
        conn: &Connection,
        start: &ObjectId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, GraphError> {
        let first = ObjectStore::get_commit(conn, start)?;
        let mut heap = BinaryHeap::from([(first.timestamp, Reverse(start.clone()))]);
        let mut pending = HashMap::from([(start.clone(), first)]);
        let mut seen = HashSet::from([start.clone()]);

        let mut out = Vec::new();
        while let Some((_, Reverse(id))) = heap.pop() {
            if out.len() >= limit {
                break;
            }
            let Some(commit) = pending.remove(&id) else {
                continue;
            };
            for parent in &commit.parents {
                if seen.insert(parent.clone()) {
                    let parent_commit = ObjectStore::get_commit(conn, parent)?;
                    heap.push((parent_commit.timestamp, Reverse(parent.clone())));
                    pending.insert(parent.clone(), parent_commit);
                }
            }
            out.push(HistoryEntry { id, commit });
        }
        Ok(out)
    }

    fn ensure_commit(conn: &Connection, id: &ObjectId) -> Result<(), GraphError> {
        ObjectStore::get_typed(conn, id, ObjectKind::Commit)?;
        Ok(())
    }

    fn indexed_parents(conn: &Connection, commit: &ObjectId) -> Result<Vec<ObjectId>, GraphError> {
        queries::list_commit_parents(conn, commit.as_str())?
            .iter()
            .map(|id| ObjectId::from_hex(id).map_err(GraphError::from))
            .collect()
    }

    fn reachable(conn: &Connection, starts: Vec<ObjectId>) -> Result<HashSet<ObjectId>, GraphError> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from(starts);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            for parent in Self::indexed_parents(conn, &current)? {
                if !visited.contains(&parent) {
                    queue.push_back(parent);
                }
            }
        }
        Ok(visited)
    }
}

fn kind_mismatch(id: &ObjectId, expected: ObjectKind, actual: ObjectKind) -> StoreError {
    StoreError::KindMismatch {
        id: id.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}
