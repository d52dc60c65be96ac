use super::{Error, ErrorDetails, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static INODE_COUNTER: AtomicU64 = AtomicU64::new(1);

/* Symlink chains longer than this are treated as cycles */
const MAX_LINK_DEPTH: usize = 32;

/// Content carried by a [`Dentry`].
#[derive(Debug)]
pub enum DentryContent {
    /// A directory; its data lives in the child map.
    Directory,
    /// A regular file with owned bytes.
    File(Vec<u8>),
    /// A symbolic link holding a target path, interpreted relative to the link's directory.
    Symlink(String),
}

/// Directory-entry-like node of the in-memory virtual filesystem tree.
///
/// A dentry is owned by its parent through an [`Arc`]; the parent back-reference is a [`Weak`]
/// so that a dentry never keeps its parent alive. Readers that resolved a dentry keep the
/// subtree below it alive through their own [`Arc`] clones, which is what makes table
/// supersession safe: the ingestion side unlinks a superseded subtree and the memory is
/// reclaimed only once the last reader drops its handle.
///
/// Child names are unique within a directory and the child map is only ever mutated through
/// single-entry operations, so concurrent readers always observe either the old or the new
/// entry, never an intermediate state.
pub struct Dentry {
    inode: u64,
    name: String,
    content: DentryContent,
    parent: RwLock<Weak<Dentry>>,
    children: RwLock<BTreeMap<String, Arc<Dentry>>>,
    xattrs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl Dentry {
    fn alloc(name: &str, content: DentryContent) -> Arc<Self> {
        Arc::new(Self {
            inode: INODE_COUNTER.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            content,
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(BTreeMap::new()),
            xattrs: RwLock::new(BTreeMap::new()),
        })
    }

    /// Creates the tree root. The root has an empty name and renders as `/` in paths.
    pub fn new_root() -> Arc<Self> {
        Self::alloc("", DentryContent::Directory)
    }

    /// Creates a detached directory dentry.
    pub fn new_dir(name: &str) -> Arc<Self> {
        Self::alloc(name, DentryContent::Directory)
    }

    /// Creates a detached file dentry with owned content bytes.
    pub fn new_file(name: &str, content: Vec<u8>) -> Arc<Self> {
        Self::alloc(name, DentryContent::File(content))
    }

    /// Creates a detached symlink dentry pointing at `target`.
    pub fn new_symlink(name: &str, target: &str) -> Arc<Self> {
        Self::alloc(name, DentryContent::Symlink(target.to_owned()))
    }

    /// Name of this dentry, unique among its siblings.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inode number, stable for the lifetime of the dentry.
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// POSIX-style mode bits: directories are read/execute only, files and link targets
    /// read-only.
    pub fn mode(&self) -> u32 {
        match self.content {
            DentryContent::Directory => 0o040_555,
            DentryContent::File(_) => 0o100_444,
            DentryContent::Symlink(_) => 0o120_444,
        }
    }

    /// Returns true when this dentry is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self.content, DentryContent::Directory)
    }

    /// Returns true when this dentry is a symlink.
    pub fn is_symlink(&self) -> bool {
        matches!(self.content, DentryContent::Symlink(_))
    }

    /// File content bytes, or [`None`] for directories and symlinks.
    pub fn file_content(&self) -> Option<&[u8]> {
        match &self.content {
            DentryContent::File(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Symlink target path, or [`None`] for directories and files.
    pub fn symlink_target(&self) -> Option<&str> {
        match &self.content {
            DentryContent::Symlink(target) => Some(target),
            _ => None,
        }
    }

    /// Upgraded parent reference, or [`None`] for the root and detached nodes.
    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.read().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Dentry>) {
        *self.parent.write() = Arc::downgrade(parent);
    }

    /// Attaches `child` under this directory.
    ///
    /// Fails with [`ErrorDetails::DentryCollision`] when a child of the same name already
    /// exists; the existing child is left untouched.
    pub fn add_child(self: &Arc<Self>, child: Arc<Dentry>) -> Result<()> {
        let mut children = self.children.write();
        if children.contains_key(child.name()) {
            return Err(Error::new(0, ErrorDetails::DentryCollision(child.name().to_owned())));
        }
        child.set_parent(self);
        children.insert(child.name().to_owned(), child);
        Ok(())
    }

    /// Attaches `child`, replacing any existing child of the same name.
    ///
    /// The map swap is a single insert, so a concurrent reader resolves either the old or the
    /// new entry. The displaced child (if any) is returned still holding its subtree.
    pub fn replace_child(self: &Arc<Self>, child: Arc<Dentry>) -> Option<Arc<Dentry>> {
        child.set_parent(self);
        self.children.write().insert(child.name().to_owned(), child)
    }

    /// Unlinks and returns the named child.
    pub fn remove_child(&self, name: &str) -> Option<Arc<Dentry>> {
        self.children.write().remove(name)
    }

    /// Looks up a direct child by name without following symlinks.
    pub fn lookup(&self, name: &str) -> Option<Arc<Dentry>> {
        self.children.read().get(name).cloned()
    }

    /// Snapshot of the children in name order.
    pub fn children(&self) -> Vec<Arc<Dentry>> {
        self.children.read().values().cloned().collect()
    }

    /// Snapshot of the child names in name order.
    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Stores an extended attribute, replacing any previous value.
    pub fn set_xattr(&self, name: &str, value: Vec<u8>) {
        self.xattrs.write().insert(name.to_owned(), value);
    }

    /// Extended attribute bytes by name.
    pub fn xattr(&self, name: &str) -> Option<Vec<u8>> {
        self.xattrs.read().get(name).cloned()
    }

    /// Snapshot of the extended attribute names.
    pub fn xattr_names(&self) -> Vec<String> {
        self.xattrs.read().keys().cloned().collect()
    }

    /// Absolute path of this dentry, computed through the parent chain.
    ///
    /// A detached dentry reports the path of its detached subtree, rooted at its highest
    /// reachable ancestor.
    pub fn path(&self) -> String {
        let mut components = vec![self.name.clone()];
        let mut node = self.parent();
        while let Some(current) = node {
            components.push(current.name().to_owned());
            node = current.parent();
        }
        components.reverse();
        let joined = components.join("/");
        if joined.is_empty() {
            "/".to_owned()
        } else {
            joined
        }
    }

    /// Resolves a `/`-separated path relative to this directory, following symlinks.
    ///
    /// `.` and empty components are skipped, `..` ascends. Returns [`None`] for missing
    /// entries and for symlink chains deeper than the cycle cap.
    pub fn walk(self: &Arc<Self>, path: &str) -> Option<Arc<Dentry>> {
        self.walk_depth(path, 0)
    }

    fn walk_depth(self: &Arc<Self>, path: &str, depth: usize) -> Option<Arc<Dentry>> {
        if depth > MAX_LINK_DEPTH {
            return None;
        }
        let mut node = self.clone();
        for component in path.split('/') {
            match component {
                "" | "." => continue,
                ".." => node = node.parent()?,
                name => {
                    let mut next = node.lookup(name)?;
                    while let Some(target) = next.symlink_target().map(str::to_owned) {
                        let dir = next.parent()?;
                        next = dir.walk_depth(&target, depth + 1)?;
                    }
                    node = next;
                }
            }
        }
        Some(node)
    }
}

impl Debug for Dentry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dentry")
            .field("inode", &self.inode)
            .field("name", &self.name)
            .field("content", &self.content)
            .field("children", &self.child_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_names_are_unique() {
        let root = Dentry::new_root();
        root.add_child(Dentry::new_dir("PAT")).unwrap();
        let err = root.add_child(Dentry::new_dir("PAT")).unwrap_err();
        assert!(matches!(err.details, ErrorDetails::DentryCollision(_)));
        assert_eq!(root.child_count(), 1);
    }

    #[test]
    fn replace_child_swaps_atomically() {
        let root = Dentry::new_root();
        root.add_child(Dentry::new_symlink("Current", "V00")).unwrap();
        let old = root.replace_child(Dentry::new_symlink("Current", "V01")).unwrap();
        assert_eq!(old.symlink_target(), Some("V00"));
        assert_eq!(root.lookup("Current").unwrap().symlink_target(), Some("V01"));
    }

    #[test]
    fn walk_follows_symlinks_relative_to_link_dir() {
        let root = Dentry::new_root();
        let pat = Dentry::new_dir("PAT");
        let v00 = Dentry::new_dir("V00");
        v00.add_child(Dentry::new_file("table_id", b"0".to_vec())).unwrap();
        pat.add_child(v00).unwrap();
        pat.add_child(Dentry::new_symlink("Current", "V00")).unwrap();
        root.add_child(pat).unwrap();

        let leaf = root.walk("PAT/Current/table_id").unwrap();
        assert_eq!(leaf.file_content(), Some(&b"0"[..]));
        assert_eq!(leaf.path(), "/PAT/V00/table_id");
    }

    #[test]
    fn walk_rejects_symlink_cycles() {
        let root = Dentry::new_root();
        root.add_child(Dentry::new_symlink("a", "b")).unwrap();
        root.add_child(Dentry::new_symlink("b", "a")).unwrap();
        assert!(root.walk("a").is_none());
    }

    #[test]
    fn parent_reference_is_weak() {
        let root = Dentry::new_root();
        let dir = Dentry::new_dir("NIT");
        root.add_child(dir.clone()).unwrap();
        let weak_root = Arc::downgrade(&root);
        drop(root);
        /* Child alone does not keep the parent alive */
        assert!(weak_root.upgrade().is_none());
        assert!(dir.parent().is_none());
    }

    #[test]
    fn unlinked_subtree_lives_until_readers_release() {
        let root = Dentry::new_root();
        let dir = Dentry::new_dir("V00");
        dir.add_child(Dentry::new_file("crc_32", b"0".to_vec())).unwrap();
        root.add_child(dir).unwrap();

        let held = root.walk("V00").unwrap();
        let weak = Arc::downgrade(&held);
        root.remove_child("V00");
        assert_eq!(held.lookup("crc_32").unwrap().file_content(), Some(&b"0"[..]));
        drop(held);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn inode_numbers_are_distinct() {
        let a = Dentry::new_dir("a");
        let b = Dentry::new_dir("b");
        assert_ne!(a.inode(), b.inode());
    }
}
