//! Helpers for building and publishing the versioned dentry tree.
//!
//! Table parsers build a fully detached `Vnn` subtree, then publish it with
//! [`publish_version`]: one child-map insert makes it visible, the `Current` symlink is
//! retargeted by replacing the link entry, children the new version does not re-create are
//! migrated over from the superseded version, and only then is the old version unlinked.
//! Readers that resolved the old subtree keep it alive through their own references.

use super::dentry::Dentry;
use super::Result;
use std::sync::Arc;

/// Extended attribute holding the hexadecimal rendering of a numeric leaf.
pub const XATTR_HEX: &str = "user.hex";

/// Extended attribute holding the binary rendering of a numeric leaf.
pub const XATTR_BIN: &str = "user.bin";

/// Directory name for table version `version`, e.g. `V00`.
pub fn version_dir_name(version: u8) -> String {
    format!("V{:02}", version)
}

/// Creates a detached version directory named per [`version_dir_name`].
pub fn create_version_dir(version: u8) -> Arc<Dentry> {
    Dentry::new_dir(&version_dir_name(version))
}

/// Returns the named child directory of `parent`, creating it when absent.
pub fn ensure_dir(parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
    if let Some(existing) = parent.lookup(name) {
        return Ok(existing);
    }
    let dir = Dentry::new_dir(name);
    parent.add_child(dir.clone())?;
    Ok(dir)
}

/// Retargets the `Current` symlink beside the version directories.
///
/// The link is replaced with a freshly built one in a single child-map insert, so a reader
/// resolves either the old or the new target, never a missing link.
pub fn update_current_symlink(parent: &Arc<Dentry>, target: &str) {
    if let Some(existing) = parent.lookup("Current") {
        if existing.symlink_target() == Some(target) {
            return;
        }
    }
    parent.replace_child(Dentry::new_symlink("Current", target));
}

/// Moves every child of `old_root` that has no same-named counterpart under `new_root`.
///
/// This keeps externally-held references valid across a version swap: a leaf the new version
/// did not re-create stays reachable at the same path under the new version directory.
pub fn migrate_children(old_root: &Arc<Dentry>, new_root: &Arc<Dentry>) {
    for child in old_root.children() {
        if new_root.lookup(child.name()).is_none() {
            old_root.remove_child(child.name());
            let _ = new_root.add_child(child);
        }
    }
}

/// Publishes a detached version directory under `table_root`, superseding `superseded`.
///
/// Ordering follows the reader-safety discipline: splice the new directory, retarget
/// `Current`, migrate orphaned children, then unlink the old directory.
pub fn publish_version(
    table_root: &Arc<Dentry>,
    vdir: Arc<Dentry>,
    superseded: Option<Arc<Dentry>>,
) -> Result<()> {
    let version_name = vdir.name().to_owned();
    match superseded {
        /* Tables without a wire version field republish the same directory name */
        Some(old) if old.name() == version_name => {
            table_root.replace_child(vdir.clone());
            update_current_symlink(table_root, &version_name);
            migrate_children(&old, &vdir);
        }
        Some(old) => {
            table_root.add_child(vdir.clone())?;
            update_current_symlink(table_root, &version_name);
            migrate_children(&old, &vdir);
            table_root.remove_child(old.name());
        }
        None => {
            table_root.add_child(vdir)?;
            update_current_symlink(table_root, &version_name);
        }
    }
    Ok(())
}

fn numeric_leaf(name: &str, value: u64, hex_digits: usize) -> Arc<Dentry> {
    let leaf = Dentry::new_file(name, value.to_string().into_bytes());
    leaf.set_xattr(
        XATTR_HEX,
        format!("0x{:0width$x}", value, width = hex_digits).into_bytes(),
    );
    leaf.set_xattr(
        XATTR_BIN,
        format!("{:0width$b}", value, width = hex_digits * 4).into_bytes(),
    );
    leaf
}

/// Appends a numeric leaf for an 8-bit field: decimal content, `0x%02x` hex xattr.
pub fn append_u8(parent: &Arc<Dentry>, name: &str, value: u8) -> Result<Arc<Dentry>> {
    let leaf = numeric_leaf(name, value.into(), 2);
    parent.add_child(leaf.clone())?;
    Ok(leaf)
}

/// Appends a numeric leaf for a 16-bit field: decimal content, `0x%04x` hex xattr.
pub fn append_u16(parent: &Arc<Dentry>, name: &str, value: u16) -> Result<Arc<Dentry>> {
    let leaf = numeric_leaf(name, value.into(), 4);
    parent.add_child(leaf.clone())?;
    Ok(leaf)
}

/// Appends a numeric leaf for a 32-bit field: decimal content, `0x%08x` hex xattr.
pub fn append_u32(parent: &Arc<Dentry>, name: &str, value: u32) -> Result<Arc<Dentry>> {
    let leaf = numeric_leaf(name, value.into(), 8);
    parent.add_child(leaf.clone())?;
    Ok(leaf)
}

/// Appends a one-bit flag leaf rendered as `0` or `1`.
pub fn append_flag(parent: &Arc<Dentry>, name: &str, value: bool) -> Result<Arc<Dentry>> {
    append_u8(parent, name, value as u8)
}

/// Appends a text leaf with UTF-8 content.
pub fn append_string(parent: &Arc<Dentry>, name: &str, value: &str) -> Result<Arc<Dentry>> {
    let leaf = Dentry::new_file(name, value.as_bytes().to_vec());
    parent.add_child(leaf.clone())?;
    Ok(leaf)
}

/// Appends a leaf holding raw bytes.
pub fn append_binary(parent: &Arc<Dentry>, name: &str, value: &[u8]) -> Result<Arc<Dentry>> {
    let leaf = Dentry::new_file(name, value.to_vec());
    parent.add_child(leaf.clone())?;
    Ok(leaf)
}

/// Appends a symlink child.
pub fn append_symlink(parent: &Arc<Dentry>, name: &str, target: &str) -> Result<Arc<Dentry>> {
    let leaf = Dentry::new_symlink(name, target);
    parent.add_child(leaf.clone())?;
    Ok(leaf)
}
