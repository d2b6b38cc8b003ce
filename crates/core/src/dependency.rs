//! Dependency graph over object keys.
//!
//! An edge `from -> to` records that a change to `from` may break `to`: a
//! table `owns` its columns, a view `derives-from` its tables, and so on. The
//! graph may contain cycles; every traversal is a breadth-first walk with an
//! explicit queue, a visited set and a depth bound.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::queries::{self, EdgeRow};
use crate::errors::DependencyError;
use crate::models::ObjectKey;

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

/// Kind of dependency between two schema objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Relation {
    Owns,
    References,
    DerivesFrom,
    Indexes,
    TriggersOn,
    InheritsFrom,
    PartitionOf,
    Constrains,
    UsesType,
    UsesSequence,
    CallsFunction,
    DefaultOf,
    PolicyOn,
    RuleOn,
    CommentOn,
    GrantOn,
    ExtensionMember,
    Publishes,
}

impl Relation {
    pub const ALL: [Relation; 18] = [
        Self::Owns,
        Self::References,
        Self::DerivesFrom,
        Self::Indexes,
        Self::TriggersOn,
        Self::InheritsFrom,
        Self::PartitionOf,
        Self::Constrains,
        Self::UsesType,
        Self::UsesSequence,
        Self::CallsFunction,
        Self::DefaultOf,
        Self::PolicyOn,
        Self::RuleOn,
        Self::CommentOn,
        Self::GrantOn,
        Self::ExtensionMember,
        Self::Publishes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owns => "owns",
            Self::References => "references",
            Self::DerivesFrom => "derives-from",
            Self::Indexes => "indexes",
            Self::TriggersOn => "triggers-on",
            Self::InheritsFrom => "inherits-from",
            Self::PartitionOf => "partition-of",
            Self::Constrains => "constrains",
            Self::UsesType => "uses-type",
            Self::UsesSequence => "uses-sequence",
            Self::CallsFunction => "calls-function",
            Self::DefaultOf => "default-of",
            Self::PolicyOn => "policy-on",
            Self::RuleOn => "rule-on",
            Self::CommentOn => "comment-on",
            Self::GrantOn => "grant-on",
            Self::ExtensionMember => "extension-member",
            Self::Publishes => "publishes",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DependencyError> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| DependencyError::UnknownRelation(s.to_string()))
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Edges and closures
// ---------------------------------------------------------------------------

/// A dependency edge. `depth` is 1 for a direct edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: ObjectKey,
    pub to: ObjectKey,
    pub relation: Relation,
    pub depth: usize,
}

impl TryFrom<EdgeRow> for DependencyEdge {
    type Error = DependencyError;

    fn try_from(row: EdgeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            relation: Relation::parse(&row.relation)?,
            from: ObjectKey::parse(&row.from_key),
            to: ObjectKey::parse(&row.to_key),
            depth: 1,
        })
    }
}

/// A key reached by a traversal and its minimal distance from the start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClosureEntry {
    pub key: ObjectKey,
    pub depth: usize,
}

/// Result of a bounded transitive walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub root: ObjectKey,
    pub max_depth: usize,
    /// Reached keys ordered by depth, then key.
    pub entries: Vec<ClosureEntry>,
    /// `true` when keys beyond `max_depth` were left unexplored.
    pub truncated: bool,
}

impl Closure {
    /// The depth-bound warning for a truncated walk.
    pub fn exceeded_depth(&self) -> Option<DependencyError> {
        self.truncated
            .then(|| DependencyError::CyclicDependencyExceededDepth {
                key: self.root.to_string(),
                max_depth: self.max_depth,
            })
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.entries.iter().map(|e| &e.key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.entries.iter().any(|e| &e.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Edge storage and bounded traversals.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    max_depth: usize,
}

impl DependencyResolver {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Default depth bound used by [`closure`](Self::closure).
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Record an edge. Returns `false` if it was already present.
    pub fn add_edge(
        &self,
        conn: &Connection,
        from: &ObjectKey,
        to: &ObjectKey,
        relation: Relation,
    ) -> Result<bool, DependencyError> {
        if from == to {
            return Err(DependencyError::SelfEdge(from.to_string()));
        }
        let inserted =
            queries::insert_edge(conn, &from.to_string(), &to.to_string(), relation.as_str())?;
        debug!(%from, %to, relation = relation.as_str(), inserted, "add dependency edge");
        Ok(inserted)
    }

    /// Remove an edge. Returns `false` if it did not exist.
    pub fn remove_edge(
        &self,
        conn: &Connection,
        from: &ObjectKey,
        to: &ObjectKey,
        relation: Relation,
    ) -> Result<bool, DependencyError> {
        let removed =
            queries::delete_edge(conn, &from.to_string(), &to.to_string(), relation.as_str())?;
        Ok(removed > 0)
    }

    /// Direct outgoing edges of `key`.
    pub fn edges_for(
        &self,
        conn: &Connection,
        key: &ObjectKey,
    ) -> Result<Vec<DependencyEdge>, DependencyError> {
        queries::list_edges_from(conn, &key.to_string())?
            .into_iter()
            .map(DependencyEdge::try_from)
            .collect()
    }

    /// Direct incoming edges of `key`: objects whose changes may impact it.
    pub fn dependents_of(
        &self,
        conn: &Connection,
        key: &ObjectKey,
    ) -> Result<Vec<DependencyEdge>, DependencyError> {
        queries::list_edges_to(conn, &key.to_string())?
            .into_iter()
            .map(DependencyEdge::try_from)
            .collect()
    }

    /// Closure of `key` under the configured depth bound.
    pub fn closure(&self, conn: &Connection, key: &ObjectKey) -> Result<Closure, DependencyError> {
        self.transitive_closure(conn, key, self.max_depth)
    }

    /// Every key reachable from `key` within `max_depth` edges, each with its
    /// minimal depth. The start key is never part of its own closure.
    pub fn transitive_closure(
        &self,
        conn: &Connection,
        key: &ObjectKey,
        max_depth: usize,
    ) -> Result<Closure, DependencyError> {
        let mut visited: HashSet<ObjectKey> = HashSet::from([key.clone()]);
        let mut queue: VecDeque<(ObjectKey, usize)> = VecDeque::from([(key.clone(), 0)]);
        let mut entries = Vec::new();
        let mut truncated = false;

        while let Some((current, depth)) = queue.pop_front() {
            let successors = queries::list_edges_from(conn, &current.to_string())?;
            for edge in successors {
                let next = ObjectKey::parse(&edge.to_key);
                if visited.contains(&next) {
                    continue;
                }
                if depth >= max_depth {
                    truncated = true;
                    break;
                }
                visited.insert(next.clone());
                entries.push(ClosureEntry {
                    key: next.clone(),
                    depth: depth + 1,
                });
                queue.push_back((next, depth + 1));
            }
        }

        entries.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.key.cmp(&b.key)));
        let closure = Closure {
            root: key.clone(),
            max_depth,
            entries,
            truncated,
        };
        if let Some(e) = closure.exceeded_depth() {
            warn!(error = %e, "dependency traversal truncated");
        }
        Ok(closure)
    }

    /// Keys impacted by a change to `key`: the closure of `key` and of each
    /// enclosing key (a column change impacts dependents of its table),
    /// merged by minimal depth.
    pub fn impact_of(
        &self,
        conn: &Connection,
        key: &ObjectKey,
        max_depth: usize,
    ) -> Result<Closure, DependencyError> {
        let mut depths: BTreeMap<ObjectKey, usize> = BTreeMap::new();
        let mut truncated = false;

        let starts = std::iter::once(key.clone()).chain(key.ancestors());
        for start in starts {
            let closure = self.transitive_closure(conn, &start, max_depth)?;
            truncated |= closure.truncated;
            for entry in closure.entries {
                if &entry.key == key {
                    continue;
                }
                depths
                    .entry(entry.key)
                    .and_modify(|d| *d = (*d).min(entry.depth))
                    .or_insert(entry.depth);
            }
        }

        let mut entries: Vec<ClosureEntry> = depths
            .into_iter()
            .map(|(key, depth)| ClosureEntry { key, depth })
            .collect();
        entries.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.key.cmp(&b.key)));
        Ok(Closure {
            root: key.clone(),
            max_depth,
            entries,
            truncated,
        })
    }
}
