//! Snapshot tree of one VM.
//!
//! Nodes live in an arena keyed by guid; parent and child links are guids.
//! A synthetic head node (guid `""`) anchors the tree once the first
//! snapshot exists. The current pointer is a single field, so at most one
//! node is ever current.

use crate::error::{Error, Result};
use crate::vm::SnapshotVmState;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;

/// Guid of the synthetic head node.
pub const HEAD_GUID: &str = "";

/// Timestamp format used for snapshot creation times.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Runtime details recorded with a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotRuntime {
    /// Size of the snapshot payload in bytes.
    pub size: u64,
    /// Guest OS version code.
    pub os_version: u32,
}

/// Payload of one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotData {
    /// Unique id within the VM.
    pub guid: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// User that took the snapshot.
    pub creator: String,
    /// Creation time (host local).
    pub created: Option<NaiveDateTime>,
    /// VM state at capture.
    pub vm_state: SnapshotVmState,
    /// Screenshot file name relative to the snapshot directory.
    pub screenshot: String,
    /// Runtime details, if recorded.
    pub runtime: Option<SnapshotRuntime>,
}

impl SnapshotData {
    /// New snapshot payload stamped with the current local time.
    pub fn new(guid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            name: name.into(),
            created: Some(chrono::Local::now().naive_local()),
            ..Self::default()
        }
    }

    /// Creation time formatted for display and persistence.
    pub fn created_str(&self) -> String {
        self.created
            .map(|t| t.format(DATE_FORMAT).to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Node {
    data: SnapshotData,
    parent: Option<String>,
    children: Vec<String>,
}

/// Nested, serializable view of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    /// Snapshot guid.
    pub guid: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Creator.
    pub creator: String,
    /// Creation time.
    pub created: String,
    /// VM state at capture.
    pub vm_state: SnapshotVmState,
    /// Whether this is the current snapshot.
    pub current: bool,
    /// Child snapshots.
    pub children: Vec<SnapshotInfo>,
}

/// Item produced by the tree file parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedItem {
    /// Node payload.
    pub data: SnapshotData,
    /// `current="yes"` was set.
    pub current: bool,
    /// Nested items in document order.
    pub children: Vec<ParsedItem>,
}

/// Snapshot hierarchy of one VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotTree {
    nodes: HashMap<String, Node>,
    current: Option<String>,
}

impl SnapshotTree {
    /// Empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the tree holds no snapshots.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of snapshots, not counting the head.
    pub fn len(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    /// Attach a new snapshot under the current node and make it current.
    ///
    /// An empty tree first gets a fresh head.
    pub fn insert(&mut self, data: SnapshotData) -> Result<()> {
        if data.guid.is_empty() {
            return Err(Error::CannotCreateSnapshot("empty snapshot guid".into()));
        }
        if self.nodes.contains_key(&data.guid) {
            return Err(Error::CannotCreateSnapshot(format!(
                "snapshot {} already exists",
                data.guid
            )));
        }

        let parent = if self.is_empty() {
            self.nodes.insert(
                HEAD_GUID.to_string(),
                Node {
                    data: SnapshotData::default(),
                    parent: None,
                    children: Vec::new(),
                },
            );
            HEAD_GUID.to_string()
        } else {
            match &self.current {
                Some(current) if self.nodes.contains_key(current) => current.clone(),
                _ => {
                    tracing::error!("snapshot tree has no current node");
                    return Err(Error::CannotCreateSnapshot(
                        "snapshot tree has no current node".into(),
                    ));
                }
            }
        };

        let guid = data.guid.clone();
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(guid.clone());
        }
        self.nodes.insert(
            guid.clone(),
            Node {
                data,
                parent: Some(parent),
                children: Vec::new(),
            },
        );
        self.current = Some(guid);
        Ok(())
    }

    /// Remove one snapshot, splicing its children into its place.
    ///
    /// If the removed node was current its parent becomes current; a head
    /// left without children empties the whole tree.
    pub fn delete_node(&mut self, guid: &str) -> Result<()> {
        let (parent, children) = match self.nodes.get(guid) {
            Some(Node {
                parent: Some(parent),
                children,
                ..
            }) => (parent.clone(), children.clone()),
            _ => {
                return Err(Error::CannotDeleteSnapshot {
                    guid: guid.to_string(),
                })
            }
        };
        let was_current = self.current.as_deref() == Some(guid);

        let Some(parent_node) = self.nodes.get_mut(&parent) else {
            return Err(Error::unexpected(format!(
                "snapshot {} has a dangling parent",
                guid
            )));
        };
        let Some(pos) = parent_node.children.iter().position(|c| c == guid) else {
            return Err(Error::unexpected(format!(
                "snapshot {} is missing from its parent's children",
                guid
            )));
        };
        parent_node.children.remove(pos);
        for (offset, child) in children.iter().enumerate() {
            parent_node.children.insert(pos + offset, child.clone());
        }

        for child in &children {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parent = Some(parent.clone());
            }
        }
        self.nodes.remove(guid);

        if was_current {
            self.current = Some(parent);
        }
        self.collapse_empty_head();
        Ok(())
    }

    /// Remove a snapshot together with its whole subtree.
    pub fn delete_branch(&mut self, guid: &str) -> Result<()> {
        let parent = match self.nodes.get(guid) {
            Some(Node {
                parent: Some(parent),
                ..
            }) => parent.clone(),
            _ => {
                return Err(Error::CannotDeleteSnapshot {
                    guid: guid.to_string(),
                })
            }
        };

        let doomed = self.subtree_guids(guid);
        let had_current = self
            .current
            .as_ref()
            .map(|c| doomed.contains(c))
            .unwrap_or(false);

        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.retain(|c| c != guid);
        }
        for g in &doomed {
            self.nodes.remove(g);
        }

        if had_current {
            self.current = Some(parent);
        }
        self.collapse_empty_head();
        Ok(())
    }

    fn collapse_empty_head(&mut self) {
        let head_empty = self
            .nodes
            .get(HEAD_GUID)
            .map(|head| head.children.is_empty())
            .unwrap_or(false);
        if head_empty {
            self.nodes.clear();
            self.current = None;
        }
    }

    /// Current snapshot payload; the head when it holds the pointer.
    pub fn find_current(&self) -> Option<&SnapshotData> {
        self.current
            .as_ref()
            .and_then(|c| self.nodes.get(c))
            .map(|n| &n.data)
    }

    /// Guid of the current node.
    pub fn current_guid(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Snapshot payload by guid. The head is not a snapshot.
    pub fn find_by_guid(&self, guid: &str) -> Option<&SnapshotData> {
        if guid == HEAD_GUID {
            return None;
        }
        self.nodes.get(guid).map(|n| &n.data)
    }

    /// Whether `guid` is current.
    pub fn is_current(&self, guid: &str) -> bool {
        self.current.as_deref() == Some(guid) && self.nodes.contains_key(guid)
    }

    /// Whether `guid` has child snapshots.
    pub fn has_children(&self, guid: &str) -> bool {
        self.nodes
            .get(guid)
            .map(|n| !n.children.is_empty())
            .unwrap_or(false)
    }

    /// Child guids in order.
    pub fn children(&self, guid: &str) -> &[String] {
        self.nodes
            .get(guid)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Parent guid; the head's guid is returned for top-level snapshots.
    pub fn parent(&self, guid: &str) -> Option<&str> {
        self.nodes.get(guid).and_then(|n| n.parent.as_deref())
    }

    /// Make `guid` current.
    pub fn set_current(&mut self, guid: &str) -> Result<()> {
        if guid == HEAD_GUID || !self.nodes.contains_key(guid) {
            return Err(Error::SnapshotNotFound {
                guid: guid.to_string(),
            });
        }
        self.current = Some(guid.to_string());
        Ok(())
    }

    /// Ancestors of `guid`, nearest first, excluding the head.
    pub fn path_to(&self, guid: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut cursor = self.parent(guid);
        while let Some(p) = cursor {
            if p == HEAD_GUID {
                break;
            }
            path.push(p.to_string());
            cursor = self.parent(p);
        }
        path
    }

    /// `guid` and all of its descendants in pre-order.
    pub fn subtree_guids(&self, guid: &str) -> Vec<String> {
        let mut out = Vec::new();
        if !self.nodes.contains_key(guid) {
            return out;
        }
        let mut stack = vec![guid.to_string()];
        while let Some(g) = stack.pop() {
            if let Some(node) = self.nodes.get(&g) {
                stack.extend(node.children.iter().rev().cloned());
            }
            out.push(g);
        }
        out
    }

    /// Snapshots in depth-first pre-order, head excluded.
    pub fn iter(&self) -> impl Iterator<Item = &SnapshotData> + '_ {
        self.subtree_guids(HEAD_GUID)
            .into_iter()
            .filter(|g| g != HEAD_GUID)
            .filter_map(move |g| self.nodes.get(&g).map(|n| &n.data))
    }

    /// Nested view of the top-level snapshots.
    pub fn to_info(&self) -> Vec<SnapshotInfo> {
        self.children(HEAD_GUID)
            .iter()
            .filter_map(|g| self.info_of(g))
            .collect()
    }

    fn info_of(&self, guid: &str) -> Option<SnapshotInfo> {
        let node = self.nodes.get(guid)?;
        Some(SnapshotInfo {
            guid: node.data.guid.clone(),
            name: node.data.name.clone(),
            description: node.data.description.clone(),
            creator: node.data.creator.clone(),
            created: node.data.created_str(),
            vm_state: node.data.vm_state,
            current: self.is_current(guid),
            children: node
                .children
                .iter()
                .filter_map(|c| self.info_of(c))
                .collect(),
        })
    }

    /// Payload of any node, head included.
    pub(crate) fn node_data(&self, guid: &str) -> Option<&SnapshotData> {
        self.nodes.get(guid).map(|n| &n.data)
    }

    /// Build a tree from a parsed head item.
    pub(crate) fn from_parsed(head: ParsedItem) -> Result<Self> {
        let mut tree = Self::new();
        let mut stack = vec![(head, None::<String>)];
        while let Some((item, parent)) = stack.pop() {
            let guid = item.data.guid.clone();
            if parent.is_some() == guid.is_empty() {
                return Err(Error::BadSnapshotTree(if guid.is_empty() {
                    "snapshot without guid".to_string()
                } else {
                    format!("head item carries guid {}", guid)
                }));
            }
            if tree.nodes.contains_key(&guid) {
                return Err(Error::BadSnapshotTree(format!("duplicate guid {}", guid)));
            }
            if item.current {
                if tree.current.is_some() {
                    return Err(Error::BadSnapshotTree("more than one current snapshot".into()));
                }
                tree.current = Some(guid.clone());
            }
            if let Some(p) = &parent {
                if let Some(node) = tree.nodes.get_mut(p) {
                    node.children.push(guid.clone());
                }
            }
            let children = item.children;
            tree.nodes.insert(
                guid.clone(),
                Node {
                    data: item.data,
                    parent,
                    children: Vec::new(),
                },
            );
            for child in children.into_iter().rev() {
                stack.push((child, Some(guid.clone())));
            }
        }
        tree.collapse_empty_head();
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(guid: &str) -> SnapshotData {
        SnapshotData::new(guid, format!("snap {}", guid))
    }

    fn current_count(tree: &SnapshotTree) -> usize {
        tree.iter().filter(|d| tree.is_current(&d.guid)).count()
            + usize::from(tree.is_current(HEAD_GUID))
    }

    /// Builds head -> a -> b -> {c, d}, with d current.
    fn sample() -> SnapshotTree {
        let mut tree = SnapshotTree::new();
        tree.insert(snap("a")).unwrap();
        tree.insert(snap("b")).unwrap();
        tree.insert(snap("c")).unwrap();
        tree.set_current("b").unwrap();
        tree.insert(snap("d")).unwrap();
        tree
    }

    #[test]
    fn test_insert_into_empty_creates_head() {
        let mut tree = SnapshotTree::new();
        assert!(tree.is_empty());
        tree.insert(snap("a")).unwrap();

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.parent("a"), Some(HEAD_GUID));
        assert!(tree.is_current("a"));
        assert_eq!(tree.find_current().map(|d| d.guid.as_str()), Some("a"));
        assert!(tree.find_by_guid(HEAD_GUID).is_none());
    }

    #[test]
    fn test_insert_moves_current() {
        let tree = sample();
        assert_eq!(tree.children("b"), &["c".to_string(), "d".to_string()]);
        assert!(tree.is_current("d"));
        assert!(!tree.is_current("c"));
        assert_eq!(current_count(&tree), 1);
    }

    #[test]
    fn test_insert_duplicate_guid_rejected() {
        let mut tree = sample();
        let before = tree.clone();
        assert!(matches!(
            tree.insert(snap("c")),
            Err(Error::CannotCreateSnapshot(_))
        ));
        assert_eq!(tree, before);
    }

    #[test]
    fn test_delete_node_splices_children_in_place() {
        let mut tree = SnapshotTree::new();
        tree.insert(snap("a")).unwrap();
        tree.insert(snap("x")).unwrap();
        tree.set_current("a").unwrap();
        tree.insert(snap("b")).unwrap();
        tree.insert(snap("b1")).unwrap();
        tree.set_current("b").unwrap();
        tree.insert(snap("b2")).unwrap();
        tree.set_current("a").unwrap();
        tree.insert(snap("y")).unwrap();
        // a: [x, b, y], b: [b1, b2]

        tree.delete_node("b").unwrap();

        assert_eq!(
            tree.children("a"),
            &["x", "b1", "b2", "y"].map(String::from)
        );
        assert_eq!(tree.parent("b1"), Some("a"));
        assert_eq!(tree.len(), 5);
        assert!(tree.is_current("y"));
    }

    #[test]
    fn test_delete_current_promotes_parent() {
        let mut tree = sample();
        tree.delete_node("d").unwrap();
        assert!(tree.is_current("b"));
        assert_eq!(current_count(&tree), 1);
    }

    #[test]
    fn test_delete_last_snapshot_empties_tree() {
        let mut tree = SnapshotTree::new();
        tree.insert(snap("a")).unwrap();
        tree.delete_node("a").unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.find_current(), None);
    }

    #[test]
    fn test_delete_top_level_current_with_siblings_makes_head_current() {
        let mut tree = SnapshotTree::new();
        tree.insert(snap("a")).unwrap();
        tree.set_current("a").unwrap();
        tree.delete_node("a").unwrap();
        assert!(tree.is_empty());

        tree.insert(snap("a")).unwrap();
        tree.delete_node("a").unwrap();
        tree.insert(snap("p")).unwrap();
        tree.insert(snap("q")).unwrap();
        tree.set_current("p").unwrap();
        tree.insert(snap("r")).unwrap();
        // head -> p -> {q, r}; delete p with r current
        tree.delete_node("r").unwrap();
        assert!(tree.is_current("p"));
        tree.delete_node("p").unwrap();
        assert_eq!(tree.children(HEAD_GUID), &["q".to_string()]);
        assert!(tree.is_current(HEAD_GUID));

        tree.insert(snap("s")).unwrap();
        assert_eq!(tree.parent("s"), Some(HEAD_GUID));
    }

    #[test]
    fn test_delete_head_or_missing_rejected() {
        let mut tree = sample();
        assert!(matches!(
            tree.delete_node(HEAD_GUID),
            Err(Error::CannotDeleteSnapshot { .. })
        ));
        assert!(matches!(
            tree.delete_node("nope"),
            Err(Error::CannotDeleteSnapshot { .. })
        ));
        assert!(matches!(
            tree.delete_branch("nope"),
            Err(Error::CannotDeleteSnapshot { .. })
        ));
    }

    #[test]
    fn test_delete_branch_with_current_promotes_parent() {
        let mut tree = sample();
        tree.delete_branch("b").unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.is_current("a"));
        assert!(tree.find_by_guid("d").is_none());
    }

    #[test]
    fn test_delete_branch_without_current_keeps_pointer() {
        let mut tree = sample();
        tree.delete_branch("c").unwrap();
        assert!(tree.is_current("d"));
        assert_eq!(tree.children("b"), &["d".to_string()]);
    }

    #[test]
    fn test_delete_whole_top_branch_empties_tree() {
        let mut tree = sample();
        tree.delete_branch("a").unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn test_paths_and_subtrees() {
        let tree = sample();
        assert_eq!(tree.path_to("d"), vec!["b".to_string(), "a".to_string()]);
        assert!(tree.path_to("a").is_empty());
        assert_eq!(
            tree.subtree_guids("b"),
            vec!["b".to_string(), "c".to_string(), "d".to_string()]
        );
        let order: Vec<_> = tree.iter().map(|d| d.guid.clone()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_set_current_unknown_guid() {
        let mut tree = sample();
        assert!(matches!(
            tree.set_current("zzz"),
            Err(Error::SnapshotNotFound { .. })
        ));
        assert!(tree.is_current("d"));
    }

    #[test]
    fn test_to_info_nesting() {
        let tree = sample();
        let info = tree.to_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].guid, "a");
        let b = &info[0].children[0];
        assert_eq!(b.children.len(), 2);
        assert!(b.children[1].current);
    }

    #[test]
    fn test_single_current_through_random_edits() {
        let mut tree = SnapshotTree::new();
        for i in 0..12 {
            tree.insert(snap(&format!("s{}", i))).unwrap();
            if i % 3 == 0 {
                tree.set_current(&format!("s{}", i / 2)).unwrap();
            }
            assert_eq!(current_count(&tree), 1);
        }
        for g in ["s3", "s7", "s0", "s11"] {
            tree.delete_node(g).unwrap();
            assert!(current_count(&tree) <= 1);
        }
        tree.delete_branch("s1").unwrap();
        assert!(tree.is_empty() || current_count(&tree) == 1);
    }
}
