//! The operation-tree data model shared by the cache, the loader, and the
//! diff engine.
//!
//! A tree lives for the duration of one client request. Nodes are stored by
//! value in their parent's child sequence; insertion order is the traversal
//! order every downstream consumer observes. The only state shared across
//! threads is each file's [`ContentSlot`], which the loader's completion
//! path fills and the response generator drains.

use std::{
    collections::HashMap,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use svn_bridge_source::{SourceItem, SourceItemKind};
use svn_path::CasePolicy;

/// Attributes common to every node kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemMeta {
    /// Server path, `$`-sigil rooted.
    pub name: String,

    pub item_revision: i64,
    pub property_revision: i64,
    pub sub_item_revision: i64,

    pub last_modified: DateTime<Utc>,
    pub author: String,
    pub properties: HashMap<String, String>,

    /// Set when a delete tombstone for this path was cancelled by a later
    /// re-add within the same replay.
    pub originally_deleted: bool,

    /// Set when the node exists in the tree only because a property change
    /// touched it. A later delete converts such a node instead of unlinking
    /// it.
    pub property_change_only: bool,

    /// Set when a folder entered the tree purely as a traversal container
    /// (a resolved stub): the generator opens it instead of adding it.
    pub container_only: bool,
}

impl ItemMeta {
    pub fn from_source(item: &SourceItem) -> Self {
        Self {
            name: item.remote_name.clone(),
            item_revision: item.revision,
            property_revision: 0,
            sub_item_revision: 0,
            last_modified: item.last_modified,
            author: item.author.clone(),
            properties: item.properties.clone(),
            originally_deleted: false,
            property_change_only: false,
            container_only: false,
        }
    }

    /// A bare metadata record for synthesized nodes: tombstones, stubs for
    /// paths the cache cannot materialize, and missing markers.
    pub fn synthetic(name: impl Into<String>, revision: i64) -> Self {
        Self {
            name: name.into(),
            item_revision: revision,
            property_revision: 0,
            sub_item_revision: 0,
            last_modified: Utc.timestamp(0, 0),
            author: String::new(),
            properties: HashMap::new(),
            originally_deleted: false,
            property_change_only: false,
            container_only: false,
        }
    }

    /// Effective revision: the maximum of the item, property, and sub-item
    /// revisions.
    pub fn revision(&self) -> i64 {
        self.item_revision
            .max(self.property_revision)
            .max(self.sub_item_revision)
    }
}

#[derive(Debug, Default)]
struct SlotState {
    bytes: Option<Bytes>,
    md5: Option<String>,
}

/// The cross-thread hand-off cell for one file's content.
///
/// The loader's completion path is the single writer; `data_loaded` is
/// published with release ordering after the bytes are attached, so a
/// consumer that observes the flag is guaranteed to see the bytes. Robbing
/// is a move: the flag stays set, the bytes are gone.
#[derive(Debug, Default)]
pub struct ContentSlot {
    loaded: AtomicBool,
    state: Mutex<SlotState>,
}

impl ContentSlot {
    /// Attaches fetched bytes and their MD5 (lowercase hex) and marks the
    /// slot loaded.
    pub fn publish(&self, bytes: Bytes, md5: String) {
        {
            // Poisoning is unreachable here: no panic can occur while the
            // lock is held.
            let mut state = self.state.lock().unwrap();
            state.bytes = Some(bytes);
            state.md5 = Some(md5);
        }
        self.loaded.store(true, Ordering::Release);
    }

    /// Marks the slot loaded with no data: the fetch failed and downstream
    /// handles the absence.
    pub fn publish_failed(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Moves the bytes and hash out of the slot.
    pub fn rob(&self) -> (Option<Bytes>, Option<String>) {
        let mut state = self.state.lock().unwrap();
        (state.bytes.take(), state.md5.take())
    }

    /// Bytes currently loaded but not yet robbed.
    pub fn buffered_len(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .bytes
            .as_ref()
            .map_or(0, |b| b.len())
    }
}

/// A file node: metadata, the upstream identity the loader fetches by, and
/// the content slot.
#[derive(Debug)]
pub struct FileNode {
    pub meta: ItemMeta,
    pub origin: SourceItem,
    pub content: Arc<ContentSlot>,
}

impl FileNode {
    pub fn from_source(item: SourceItem) -> Self {
        Self {
            meta: ItemMeta::from_source(&item),
            origin: item,
            content: Arc::new(ContentSlot::default()),
        }
    }
}

/// A folder node owning an ordered sequence of children.
#[derive(Debug)]
pub struct FolderNode {
    pub meta: ItemMeta,
    pub children: Vec<Node>,
}

impl FolderNode {
    pub fn new(meta: ItemMeta) -> Self {
        Self {
            meta,
            children: Vec::new(),
        }
    }

    pub fn from_source(item: &SourceItem) -> Self {
        Self::new(ItemMeta::from_source(item))
    }

    pub fn attach(&mut self, node: Node) {
        self.children.push(node);
    }

    /// Index of the child whose path equals `name` under the policy.
    pub fn position_of(&self, policy: CasePolicy, name: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|child| policy.eq(child.name(), name))
    }

    pub fn find_child(&self, policy: CasePolicy, name: &str) -> Option<&Node> {
        self.position_of(policy, name).map(|idx| &self.children[idx])
    }

    pub fn remove_child(&mut self, idx: usize) -> Node {
        self.children.remove(idx)
    }

    pub fn replace_child(&mut self, idx: usize, node: Node) -> Node {
        mem::replace(&mut self.children[idx], node)
    }
}

/// The kinds a tree node can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum NodeKind {
    #[display(fmt = "file")]
    File,

    #[display(fmt = "folder")]
    Folder,

    #[display(fmt = "delete-file")]
    DeleteFile,

    #[display(fmt = "delete-folder")]
    DeleteFolder,

    #[display(fmt = "stub-folder")]
    StubFolder,

    #[display(fmt = "missing")]
    Missing,
}

/// A node in the operation tree.
///
/// Behavior that would be virtual dispatch elsewhere is a match on the tag;
/// the "is this a delete?" predicate is [`Node::is_delete`].
#[derive(Debug)]
pub enum Node {
    File(FileNode),
    Folder(FolderNode),
    DeleteFile { meta: ItemMeta },
    DeleteFolder { meta: ItemMeta },

    /// Placeholder for an intermediate path element no operation has been
    /// decided for yet; wraps the real folder it stands in for. Must never
    /// survive to tree hand-off.
    StubFolder(Box<FolderNode>),

    /// A path the changeset references but the target revision cannot
    /// materialize. `edit` distinguishes would-have-been-edit from
    /// would-have-been-add.
    Missing { meta: ItemMeta, edit: bool },
}

impl Node {
    pub fn from_source(item: SourceItem) -> Self {
        match item.kind {
            SourceItemKind::File => Node::File(FileNode::from_source(item)),
            SourceItemKind::Folder => Node::Folder(FolderNode::from_source(&item)),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::File(_) => NodeKind::File,
            Node::Folder(_) => NodeKind::Folder,
            Node::DeleteFile { .. } => NodeKind::DeleteFile,
            Node::DeleteFolder { .. } => NodeKind::DeleteFolder,
            Node::StubFolder(_) => NodeKind::StubFolder,
            Node::Missing { .. } => NodeKind::Missing,
        }
    }

    pub fn meta(&self) -> &ItemMeta {
        match self {
            Node::File(file) => &file.meta,
            Node::Folder(folder) => &folder.meta,
            Node::DeleteFile { meta } => meta,
            Node::DeleteFolder { meta } => meta,
            Node::StubFolder(folder) => &folder.meta,
            Node::Missing { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ItemMeta {
        match self {
            Node::File(file) => &mut file.meta,
            Node::Folder(folder) => &mut folder.meta,
            Node::DeleteFile { meta } => meta,
            Node::DeleteFolder { meta } => meta,
            Node::StubFolder(folder) => &mut folder.meta,
            Node::Missing { meta, .. } => meta,
        }
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn revision(&self) -> i64 {
        self.meta().revision()
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Node::DeleteFile { .. } | Node::DeleteFolder { .. })
    }

    pub fn is_stub(&self) -> bool {
        matches!(self, Node::StubFolder(_))
    }

    /// The folder to descend into, for both real folders and stubs.
    pub fn as_folder_mut(&mut self) -> Option<&mut FolderNode> {
        match self {
            Node::Folder(folder) => Some(folder),
            Node::StubFolder(folder) => Some(folder),
            _ => None,
        }
    }

    pub fn as_folder(&self) -> Option<&FolderNode> {
        match self {
            Node::Folder(folder) => Some(folder),
            Node::StubFolder(folder) => Some(folder),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(file) => Some(file),
            _ => None,
        }
    }

    /// Resolves a stub in place to the real folder it wraps, keeping the
    /// children accumulated so far. A no-op on any other kind.
    pub fn unwrap_stub(&mut self) {
        if !self.is_stub() {
            return;
        }

        let placeholder = Node::Missing {
            meta: ItemMeta::synthetic("", 0),
            edit: false,
        };

        if let Node::StubFolder(inner) = mem::replace(self, placeholder) {
            *self = Node::Folder(*inner);
        }
    }
}

/// The files of the tree in depth-first, insertion order: the order the
/// loader prefetches and the response generator consumes.
pub fn files_in_order(folder: &FolderNode) -> Vec<&FileNode> {
    fn walk<'a>(folder: &'a FolderNode, out: &mut Vec<&'a FileNode>) {
        for child in &folder.children {
            match child {
                Node::File(file) => out.push(file),
                Node::Folder(folder) => walk(folder, out),
                Node::StubFolder(folder) => walk(folder, out),
                _ => {}
            }
        }
    }

    let mut out = Vec::new();
    walk(folder, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use super::*;

    fn item(path: &str, kind: SourceItemKind, revision: i64) -> SourceItem {
        SourceItem {
            id: 1,
            remote_name: path.into(),
            kind,
            revision,
            size: 0,
            last_modified: Utc.timestamp(0, 0),
            author: String::from("author"),
            properties: StdHashMap::new(),
        }
    }

    #[test]
    fn test_effective_revision() {
        let mut meta = ItemMeta::synthetic("$/p", 4);
        meta.property_revision = 9;
        meta.sub_item_revision = 7;
        assert_eq!(meta.revision(), 9);
    }

    #[test]
    fn test_find_child_respects_policy() {
        let mut folder = FolderNode::new(ItemMeta::synthetic("$/p", 1));
        folder.attach(Node::from_source(item("$/p/File.txt", SourceItemKind::File, 2)));

        assert!(folder
            .find_child(CasePolicy::Sensitive, "$/p/file.txt")
            .is_none());
        assert!(folder
            .find_child(CasePolicy::Insensitive, "$/p/file.txt")
            .is_some());
    }

    #[test]
    fn test_unwrap_stub_keeps_children() {
        let mut inner = FolderNode::new(ItemMeta::synthetic("$/p/dir", 3));
        inner.attach(Node::from_source(item("$/p/dir/f", SourceItemKind::File, 3)));

        let mut node = Node::StubFolder(Box::new(inner));
        node.unwrap_stub();

        match node {
            Node::Folder(folder) => {
                assert_eq!(folder.children.len(), 1);
                assert_eq!(folder.meta.name, "$/p/dir");
            }
            other => panic!("expected folder, got {}", other.kind()),
        }
    }

    #[test]
    fn test_content_slot_rob_is_a_move() {
        let slot = ContentSlot::default();
        assert!(!slot.is_loaded());

        slot.publish(Bytes::from("abc"), String::from("hash"));
        assert!(slot.is_loaded());
        assert_eq!(slot.buffered_len(), 3);

        let (bytes, md5) = slot.rob();
        assert_eq!(bytes.unwrap(), Bytes::from("abc"));
        assert_eq!(md5.unwrap(), "hash");

        // A second rob sees a loaded slot with nothing left in it.
        assert!(slot.is_loaded());
        let (bytes, _md5) = slot.rob();
        assert!(bytes.is_none());
        assert_eq!(slot.buffered_len(), 0);
    }

    #[test]
    fn test_files_in_order_is_depth_first() {
        let mut sub = FolderNode::new(ItemMeta::synthetic("$/p/sub", 1));
        sub.attach(Node::from_source(item("$/p/sub/b", SourceItemKind::File, 1)));

        let mut root = FolderNode::new(ItemMeta::synthetic("$/p", 1));
        root.attach(Node::from_source(item("$/p/a", SourceItemKind::File, 1)));
        root.attach(Node::Folder(sub));
        root.attach(Node::from_source(item("$/p/c", SourceItemKind::File, 1)));
        root.attach(Node::DeleteFile {
            meta: ItemMeta::synthetic("$/p/gone", 1),
        });

        let names: Vec<&str> = files_in_order(&root)
            .into_iter()
            .map(|file| file.meta.name.as_str())
            .collect();
        assert_eq!(names, vec!["$/p/a", "$/p/sub/b", "$/p/c"]);
    }
}
