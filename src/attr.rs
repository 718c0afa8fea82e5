//! Object attributes (`Iatt` in the glossary) and the file-type enum,
//! mirrored closely from the shape `stat(2)` needs.

use std::time::SystemTime;

use crate::gfid::Gfid;

/// File types an inode can take on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub enum FileType {
    /// `S_IFIFO`
    NamedPipe,
    /// `S_IFCHR`
    CharDevice,
    /// `S_IFBLK`
    BlockDevice,
    /// `S_IFDIR`
    Directory,
    /// `S_IFREG`
    RegularFile,
    /// `S_IFLNK`
    Symlink,
    /// `S_IFSOCK`
    Socket,
}

/// Attributes of one filesystem object, as returned by `stat`/`lstat`/
/// `fstat`/`getattr` and updated in place by `setattr`.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct Iatt {
    /// The object's GFID.
    pub gfid: Gfid,
    /// Size in bytes.
    pub size: u64,
    /// Allocated size in 512-byte blocks.
    pub blocks: u64,
    /// Time of last access.
    pub atime: SystemTime,
    /// Time of last modification.
    pub mtime: SystemTime,
    /// Time of last status change.
    pub ctime: SystemTime,
    /// Kind of file.
    pub kind: FileType,
    /// Permission bits.
    pub perm: u16,
    /// Number of hard links.
    pub nlink: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Device id, for device-special files.
    pub rdev: u32,
    /// Preferred I/O block size reported by `stat()`.
    pub blksize: u32,
}

impl Iatt {
    /// An attribute record for a freshly allocated object with no history;
    /// used as a base when the server hasn't answered yet.
    pub fn zeroed(gfid: Gfid, kind: FileType) -> Self {
        let now = SystemTime::now();
        Iatt {
            gfid,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            kind,
            perm: 0,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }
}

/// Time argument accepted by `setattr`/`utimens`: either an explicit
/// timestamp or a request to stamp the current server time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TimeOrNow {
    /// Use this specific timestamp.
    Specific(SystemTime),
    /// Use whatever time the server considers "now".
    Now,
}

/// The subset of `setattr` fields that may be changed in a single call;
/// every field left `None` is left unmodified.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttr {
    /// New permission bits.
    pub mode: Option<u32>,
    /// New owning user id.
    pub uid: Option<u32>,
    /// New owning group id.
    pub gid: Option<u32>,
    /// New size (truncate/extend).
    pub size: Option<u64>,
    /// New access time.
    pub atime: Option<TimeOrNow>,
    /// New modification time.
    pub mtime: Option<TimeOrNow>,
}

impl SetAttr {
    /// `true` if this call changes nothing.
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }
}
