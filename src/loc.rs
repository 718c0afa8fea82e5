//! A resolution result: "here is what a pathname or handle resolved to,"
//! the shared currency between `src/resolve.rs` and every operation in
//! `src/ops.rs`.
//!
//! Grounded on the `loc_t` produced throughout `glfs-resolve.c`: either a
//! known inode, or a parent-plus-name pair for an entry that doesn't exist
//! yet (the shape `create`/`mkdir`/`symlink` need).

use std::sync::Arc;

use crate::errno::{Errno, Result};
use crate::gfid::Gfid;
use crate::inode::Inode;

/// The result of resolving a pathname or a `(parent, name)` pair.
///
/// Invariant: `inode.is_some()`, or both `parent.is_some()` and
/// `name.is_some()`. `gfid` always matches `inode`'s GFID when `inode` is
/// present.
#[derive(Clone)]
pub struct Loc {
    pub parent: Option<Arc<Inode>>,
    pub name: Option<String>,
    pub inode: Option<Arc<Inode>>,
    pub gfid: Gfid,
}

impl Loc {
    /// A `Loc` for an object that already has an inode.
    pub fn for_inode(inode: Arc<Inode>) -> Loc {
        let gfid = inode.gfid();
        Loc {
            parent: None,
            name: None,
            inode: Some(inode),
            gfid,
        }
    }

    /// A `Loc` for an entry that may not exist yet, named within a known
    /// parent directory.
    pub fn for_entry(parent: Arc<Inode>, name: impl Into<String>, gfid: Gfid) -> Loc {
        Loc {
            parent: Some(parent),
            name: Some(name.into()),
            inode: None,
            gfid,
        }
    }

    /// Checks the structural invariant every `Loc` must uphold before it
    /// is handed to an operation.
    pub fn validate(&self) -> Result<()> {
        if self.inode.is_none() && (self.parent.is_none() || self.name.is_none()) {
            return Err(Errno::Invalid);
        }
        if let Some(inode) = &self.inode {
            if inode.gfid() != self.gfid {
                return Err(Errno::Invalid);
            }
        }
        Ok(())
    }

    /// `true` if this `Loc` already names a resolved inode.
    pub fn has_inode(&self) -> bool {
        self.inode.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::FileType;
    use crate::gfid::ROOT_GFID;
    use crate::inode::InodeTable;

    #[test]
    fn for_inode_validates() {
        let table = InodeTable::new();
        let root = table.lookup(&ROOT_GFID).unwrap();
        let loc = Loc::for_inode(root);
        assert!(loc.validate().is_ok());
        assert!(loc.has_inode());
    }

    #[test]
    fn for_entry_without_name_is_invalid() {
        let table = InodeTable::new();
        let root = table.lookup(&ROOT_GFID).unwrap();
        let mut loc = Loc::for_entry(root, "x", ROOT_GFID);
        loc.name = None;
        assert_eq!(loc.validate(), Err(Errno::Invalid));
    }

    #[test]
    fn mismatched_gfid_is_invalid() {
        let table = InodeTable::new();
        let child = table.get_or_create(
            {
                let mut b = [0u8; 16];
                b[15] = 9;
                crate::gfid::Gfid(b)
            },
            FileType::RegularFile,
        );
        let mut loc = Loc::for_inode(child);
        loc.gfid = ROOT_GFID;
        assert_eq!(loc.validate(), Err(Errno::Invalid));
    }
}
