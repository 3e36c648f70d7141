//! Filesystem abstraction shared by the local and SFTP drivers.
//!
//! The engines speak only to these traits, so the same backup, restore,
//! verify, and cleanup code drives a local repository and a remote one.

pub mod local;
pub mod sftp;

use std::ffi::{OsStr, OsString};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Open for reading.
    ReadOnly,
    /// Create, truncating any existing file.
    Overwrite,
    /// Create; fail if the file already exists.
    NoOverwrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathType {
    Regular,
    Directory,
    SymLink,
    Unknown,
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} {}: {message} (sftp status {status})", .path.display())]
    Sftp {
        op: &'static str,
        path: PathBuf,
        message: String,
        status: u32,
    },
    #[error("{op} {}: operation not supported", .path.display())]
    Unsupported { op: &'static str, path: PathBuf },
    #[error("sftp protocol error: {0}")]
    Protocol(String),
}

impl FsError {
    pub(crate) fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        FsError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Errno-equivalent of this error; SFTP status codes are translated.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::Io { source, .. } => source.raw_os_error().unwrap_or(-1),
            FsError::Sftp { status, .. } => match *status {
                sftp::wire::SSH_FX_NO_SUCH_FILE => libc::ENOENT,
                sftp::wire::SSH_FX_PERMISSION_DENIED => libc::EACCES,
                sftp::wire::SSH_FX_OP_UNSUPPORTED => libc::ENOSYS,
                _ => -1,
            },
            FsError::Unsupported { .. } => libc::ENOSYS,
            FsError::Protocol(_) => -1,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.errno() == libc::ENOENT
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// An open file handle. Reads and writes are buffered or pipelined by the
/// driver; write errors may be deferred until `flush`. Dropping a handle
/// releases its resources on every control-flow exit, but callers that care
/// about deferred errors must flush first.
pub trait FsFile: Read + Write {}

pub trait Filesystem {
    fn rename(&self, old: &Path, new: &Path) -> FsResult<()>;

    fn remove(&self, path: &Path) -> FsResult<()>;

    fn open(&self, path: &Path, mode: OpenMode) -> FsResult<Box<dyn FsFile>>;

    fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()>;

    fn exists(&self, path: &Path) -> FsResult<bool>;

    /// Directory entries, excluding `.` and `..`, in no particular order.
    fn contents(&self, path: &Path) -> FsResult<Vec<OsString>>;

    /// Type of the entry at `path`, without following symlinks.
    fn path_type(&self, path: &Path) -> FsResult<PathType>;

    fn readlink(&self, path: &Path) -> FsResult<OsString> {
        Err(FsError::Unsupported {
            op: "reading symlink",
            path: path.to_path_buf(),
        })
    }

    /// True if `path` is a mount point.
    fn ismount(&self, path: &Path) -> FsResult<bool> {
        Err(FsError::Unsupported {
            op: "checking mount point",
            path: path.to_path_buf(),
        })
    }

    fn utimes(&self, path: &Path, atime: i64, mtime: i64) -> FsResult<()> {
        let _ = (atime, mtime);
        Err(FsError::Unsupported {
            op: "setting file times",
            path: path.to_path_buf(),
        })
    }

    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        let _ = (uid, gid);
        Err(FsError::Unsupported {
            op: "changing ownership of",
            path: path.to_path_buf(),
        })
    }

    fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        let _ = mode;
        Err(FsError::Unsupported {
            op: "changing permissions of",
            path: path.to_path_buf(),
        })
    }

    fn symlink(&self, target: &OsStr, path: &Path) -> FsResult<()> {
        let _ = target;
        Err(FsError::Unsupported {
            op: "creating symlink",
            path: path.to_path_buf(),
        })
    }

    fn hard_link(&self, old: &Path, new: &Path) -> FsResult<()> {
        let _ = new;
        Err(FsError::Unsupported {
            op: "linking",
            path: old.to_path_buf(),
        })
    }

    fn mknod(&self, path: &Path, mode: u32, dev: u64) -> FsResult<()> {
        let _ = (mode, dev);
        Err(FsError::Unsupported {
            op: "creating device",
            path: path.to_path_buf(),
        })
    }

    /// Create `path` and any missing ancestors.
    fn makedirs(&self, path: &Path) -> FsResult<()> {
        if self.exists(path)? {
            return Ok(());
        }
        let mut prefix = PathBuf::new();
        for comp in path.components() {
            prefix.push(comp);
            if !self.exists(&prefix)? {
                self.mkdir(&prefix, 0o777)?;
            }
        }
        Ok(())
    }

    /// Start an asynchronous existence probe for `path`, to be consumed by a
    /// later `exists` call. The SFTP driver pipelines a STAT; elsewhere the
    /// later `exists` simply does the work.
    fn prefigure_exists(&self, path: &Path) -> FsResult<()> {
        let _ = path;
        Ok(())
    }

    fn is_local(&self) -> bool {
        false
    }
}
