//! Domain model types used throughout schemavc.
//!
//! These types bridge the object store, the merge engine, and the database
//! layer. Objects, trees and commits are immutable values: "changing" one
//! always means building a new value and storing it under its new id.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dependency::ClosureEntry;
use crate::errors::StoreError;

// ---------------------------------------------------------------------------
// Object ids
// ---------------------------------------------------------------------------

/// Content hash identifying a stored object: lowercase hex SHA-256 over
/// `"<kind> <len>\0<payload>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Compute the id an object of `kind` with `payload` is stored under.
    pub fn for_content(kind: ObjectKind, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(payload.len().to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(payload);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a full 64-character hex id.
    pub fn from_hex(s: &str) -> Result<Self, StoreError> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(StoreError::Corrupt {
                id: s.to_string(),
                detail: "not a lowercase 64-character hex object id".into(),
            });
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// The three immutable object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
        }
    }

    /// Parse a stored kind label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blob" => Some(Self::Blob),
            "tree" => Some(Self::Tree),
            "commit" => Some(Self::Commit),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored object: id, kind and canonical payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub payload: Vec<u8>,
}

impl Object {
    /// Build an object, computing its id from the content.
    pub fn new(kind: ObjectKind, payload: Vec<u8>) -> Self {
        Self {
            id: ObjectId::for_content(kind, &payload),
            kind,
            payload,
        }
    }

    /// Payload as text, with invalid UTF-8 replaced.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Trees
// ---------------------------------------------------------------------------

/// A single named child of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub id: ObjectId,
    pub kind: ObjectKind,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, id: ObjectId, kind: ObjectKind) -> Self {
        Self {
            name: name.into(),
            id,
            kind,
        }
    }

    /// Same child object, regardless of the name it is filed under.
    pub fn same_target(&self, other: &TreeEntry) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

/// An ordered mapping of names to child objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from entries, rejecting invalid or duplicate names.
    pub fn from_entries<I>(entries: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = TreeEntry>,
    {
        let mut tree = Self::new();
        for entry in entries {
            tree.insert(entry)?;
        }
        Ok(tree)
    }

    /// Add an entry. Names must be unique within the tree.
    pub fn insert(&mut self, entry: TreeEntry) -> Result<(), StoreError> {
        validate_entry_name(&entry.name)?;
        if self.entries.contains_key(&entry.name) {
            return Err(StoreError::DuplicateEntry(entry.name));
        }
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    /// Add or replace an entry.
    pub fn upsert(&mut self, entry: TreeEntry) -> Result<(), StoreError> {
        validate_entry_name(&entry.name)?;
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    /// Entries in name order.
    pub fn entries(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical payload: JSON array of entries sorted by name.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let entries: Vec<&TreeEntry> = self.entries.values().collect();
        Ok(serde_json::to_vec(&entries)?)
    }

    /// Decode a canonical tree payload.
    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let entries: Vec<TreeEntry> = serde_json::from_slice(payload)?;
        Self::from_entries(entries)
    }
}

/// Tree entry names are non-empty and never contain the key separator.
pub fn validate_entry_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.contains(ObjectKey::SEPARATOR) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

/// Author, message and time of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMeta {
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitMeta {
    /// Metadata stamped with the current time.
    pub fn now(author: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn at(
        author: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            author: author.into(),
            message: message.into(),
            timestamp,
        }
    }
}

/// A commit: a tree plus ancestry and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Commit {
    pub fn new(tree: ObjectId, parents: Vec<ObjectId>, meta: CommitMeta) -> Self {
        Self {
            tree,
            parents,
            author: meta.author,
            message: meta.message,
            timestamp: meta.timestamp,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

// ---------------------------------------------------------------------------
// Object keys
// ---------------------------------------------------------------------------

/// Path of tree entry names from the root tree, e.g. `public.t1.a`.
///
/// Also the node type of the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey(Vec<String>);

impl ObjectKey {
    pub const SEPARATOR: char = '.';

    /// Split a dotted key into segments.
    pub fn parse(s: &str) -> Self {
        Self(s.split(Self::SEPARATOR).map(str::to_string).collect())
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Key of a named child below this key.
    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.to_string());
        Self(segments)
    }

    /// Enclosing key, `None` for a top-level key.
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Proper ancestors, nearest first.
    pub fn ancestors(&self) -> Vec<Self> {
        (1..self.0.len())
            .rev()
            .map(|len| Self(self.0[..len].to_vec()))
            .collect()
    }

    /// `true` if `other` lies strictly below this key.
    pub fn is_ancestor_of(&self, other: &ObjectKey) -> bool {
        other.0.len() > self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl Serialize for ObjectKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

// ---------------------------------------------------------------------------
// Snapshots (change capture input)
// ---------------------------------------------------------------------------

/// One node of a captured schema snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotNode {
    /// Definition text of a leaf object (column, index, view body, ...).
    Leaf(String),
    /// Named sub-objects (schema, table, ...).
    Group(BTreeMap<String, SnapshotNode>),
}

/// A full capture of tracked objects at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    pub objects: BTreeMap<String, SnapshotNode>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the leaf at `key`, creating enclosing groups as needed. A leaf on
    /// the way down is replaced by a group.
    pub fn insert(&mut self, key: &ObjectKey, definition: impl Into<String>) {
        let segments = key.segments();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut level = &mut self.objects;
        for name in parents {
            let node = level
                .entry(name.clone())
                .or_insert_with(|| SnapshotNode::Group(BTreeMap::new()));
            if matches!(node, SnapshotNode::Leaf(_)) {
                *node = SnapshotNode::Group(BTreeMap::new());
            }
            level = match node {
                SnapshotNode::Group(children) => children,
                SnapshotNode::Leaf(_) => return,
            };
        }
        level.insert(last.clone(), SnapshotNode::Leaf(definition.into()));
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: &str, definition: impl Into<String>) -> Self {
        self.insert(&ObjectKey::parse(key), definition);
        self
    }
}

// ---------------------------------------------------------------------------
// Refs
// ---------------------------------------------------------------------------

/// Kind of a named ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Branch,
    Tag,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Branch => "branch",
            Self::Tag => "tag",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "branch" => Some(Self::Branch),
            "tag" => Some(Self::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named pointer to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ref {
    pub name: String,
    pub kind: RefKind,
    pub target: ObjectId,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Merge operations
// ---------------------------------------------------------------------------

/// Persisted lifecycle status of a merge operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Resolving,
    Completed,
    Aborted,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "resolving" => Some(Self::Resolving),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Legal persisted transitions. Terminal states have none.
    pub fn can_transition_to(&self, next: MergeStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Resolving)
                | (Self::Pending, Self::Completed)
                | (Self::Pending, Self::Aborted)
                | (Self::Resolving, Self::Completed)
                | (Self::Resolving, Self::Aborted)
        )
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A merge request and its persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOperation {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
    pub source_head: ObjectId,
    pub target_head: ObjectId,
    pub base_commit: ObjectId,
    pub status: MergeStatus,
    pub requested_by: String,
    pub result_commit: Option<ObjectId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// The six-way classification assigned to every key touched by a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    NoConflict,
    SourceModified,
    TargetModified,
    BothModified,
    DeletedSource,
    DeletedTarget,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoConflict => "NO_CONFLICT",
            Self::SourceModified => "SOURCE_MODIFIED",
            Self::TargetModified => "TARGET_MODIFIED",
            Self::BothModified => "BOTH_MODIFIED",
            Self::DeletedSource => "DELETED_SOURCE",
            Self::DeletedTarget => "DELETED_TARGET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NO_CONFLICT" => Some(Self::NoConflict),
            "SOURCE_MODIFIED" => Some(Self::SourceModified),
            "TARGET_MODIFIED" => Some(Self::TargetModified),
            "BOTH_MODIFIED" => Some(Self::BothModified),
            "DELETED_SOURCE" => Some(Self::DeletedSource),
            "DELETED_TARGET" => Some(Self::DeletedTarget),
            _ => None,
        }
    }

    /// `true` for the three kinds that block finalization.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::BothModified | Self::DeletedSource | Self::DeletedTarget
        )
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution state of a single conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
    Rejected,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a conflict was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the source side's value (absent if the source deleted it).
    TakeSource,
    /// Keep the target side's value (absent if the target deleted it).
    TakeTarget,
    /// Replace the object with a caller-supplied blob payload.
    Custom(Vec<u8>),
}

impl Resolution {
    /// Label persisted in the `resolution` column.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TakeSource => "take_source",
            Self::TakeTarget => "take_target",
            Self::Custom(_) => "custom",
        }
    }

    /// Rebuild from the persisted label and payload column.
    pub fn from_parts(label: &str, payload: Option<Vec<u8>>) -> Option<Self> {
        match (label, payload) {
            ("take_source", _) => Some(Self::TakeSource),
            ("take_target", _) => Some(Self::TakeTarget),
            ("custom", Some(bytes)) => Some(Self::Custom(bytes)),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A conflict surfaced by a merge, with all three sides in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub merge_id: String,
    pub object_key: ObjectKey,
    pub kind: ConflictKind,
    pub base: Option<Object>,
    pub source: Option<Object>,
    pub target: Option<Object>,
    pub status: ConflictStatus,
    pub resolution: Option<Resolution>,
    pub note: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Objects whose correctness may depend on this one.
    pub impacted: Vec<ClosureEntry>,
    pub created_at: DateTime<Utc>,
}

impl Conflict {
    pub fn is_open(&self) -> bool {
        self.status == ConflictStatus::Open
    }

    /// Unified text diffs base→source and base→target, for review.
    pub fn unified_diff(&self) -> String {
        let text = |o: &Option<Object>| o.as_ref().map(Object::payload_text).unwrap_or_default();
        let base = text(&self.base);
        let source_text = text(&self.source);
        let target_text = text(&self.target);
        let source = diffy::create_patch(&base, &source_text);
        let target = diffy::create_patch(&base, &target_text);
        format!(
            "# {} ({})\n## source\n{}## target\n{}",
            self.object_key, self.kind, source, target
        )
    }
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub subject: Option<String>,
    pub actor: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Annotations
// ---------------------------------------------------------------------------

/// What an annotation is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AnnotationSubject {
    Commit(ObjectId),
    Conflict(String),
}

impl AnnotationSubject {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Commit(_) => "commit",
            Self::Conflict(_) => "conflict",
        }
    }

    pub fn id_str(&self) -> &str {
        match self {
            Self::Commit(id) => id.as_str(),
            Self::Conflict(id) => id,
        }
    }
}

/// Opaque metadata attached by an external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: i64,
    pub subject: AnnotationSubject,
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
