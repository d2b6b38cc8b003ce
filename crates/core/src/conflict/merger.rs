//! Merged-tree construction.
//!
//! A [`TreeEditor`] records per-key edits against a root tree and writes the
//! result bottom-up: only trees on the path to an edited key are rebuilt,
//! every untouched subtree keeps its id.

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::debug;

use crate::errors::StoreError;
use crate::models::{ObjectId, ObjectKey, ObjectKind, Tree, TreeEntry};
use crate::store::ObjectStore;

/// Pending edits against one root tree.
#[derive(Debug, Clone)]
pub struct TreeEditor {
    root: ObjectId,
    /// `None` removes the key.
    edits: BTreeMap<ObjectKey, Option<TreeEntry>>,
}

impl TreeEditor {
    pub fn new(root: ObjectId) -> Self {
        Self {
            root,
            edits: BTreeMap::new(),
        }
    }

    /// Place `entry`'s object at `key`. The entry's own name is ignored.
    pub fn set(&mut self, key: ObjectKey, entry: TreeEntry) {
        self.edits.insert(key, Some(entry));
    }

    pub fn remove(&mut self, key: ObjectKey) {
        self.edits.insert(key, None);
    }

    /// Set or remove depending on `entry`.
    pub fn apply(&mut self, key: ObjectKey, entry: Option<TreeEntry>) {
        self.edits.insert(key, entry);
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    /// Write every rebuilt tree and return the new root id.
    pub fn write(self, conn: &Connection) -> Result<ObjectId, StoreError> {
        if self.edits.is_empty() {
            return Ok(self.root);
        }
        let edits: Vec<(ObjectKey, Option<TreeEntry>)> = self
            .edits
            .into_iter()
            .filter(|(key, _)| key.depth() > 0)
            .collect();
        let root = rewrite(conn, Some(&self.root), 0, &edits)?;
        debug!(root = %root.short(), edits = edits.len(), "wrote merged tree");
        Ok(root)
    }
}

/// Rebuild the tree at `depth` (or an empty one) with `edits`, all of which
/// share the same first `depth` segments and are sorted by key.
fn rewrite(
    conn: &Connection,
    tree_id: Option<&ObjectId>,
    depth: usize,
    edits: &[(ObjectKey, Option<TreeEntry>)],
) -> Result<ObjectId, StoreError> {
    let mut tree = match tree_id {
        Some(id) => ObjectStore::get_tree(conn, id)?,
        None => Tree::new(),
    };

    let mut start = 0;
    while start < edits.len() {
        let name = edits[start].0.segments()[depth].clone();
        let mut end = start + 1;
        while end < edits.len() && edits[end].0.segments()[depth] == name {
            end += 1;
        }
        let group = &edits[start..end];
        start = end;

        // An edit of the child itself sorts first and overrides edits below it.
        if let Some((key, edit)) = group.first().filter(|(k, _)| k.depth() == depth + 1) {
            match edit {
                Some(entry) => {
                    tree.upsert(TreeEntry::new(name, entry.id.clone(), entry.kind))?;
                }
                None => {
                    tree.remove(&name);
                }
            }
            if group.len() > 1 {
                debug!(%key, skipped = group.len() - 1, "edit replaces nested edits");
            }
            continue;
        }

        let child = tree
            .get(&name)
            .filter(|e| e.kind == ObjectKind::Tree)
            .map(|e| e.id.clone());
        let child_id = rewrite(conn, child.as_ref(), depth + 1, group)?;
        tree.upsert(TreeEntry::new(name, child_id, ObjectKind::Tree))?;
    }

    ObjectStore::put_tree(conn, &tree)
}
