//! Local filesystem driver: std fs plus the libc calls std doesn't cover.

use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use super::{FsError, FsFile, FsResult, Filesystem, OpenMode, PathType};

pub struct LocalFilesystem;

enum Io {
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
}

/// A buffered local file. The write side flushes on drop, but deferred
/// errors only surface through an explicit `flush`.
pub struct LocalFile {
    path: PathBuf,
    io: Io,
}

impl Read for LocalFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.io {
            Io::Reader(r) => r.read(buf),
            Io::Writer(_) => Err(std::io::Error::other(format!(
                "{}: file is open for writing",
                self.path.display()
            ))),
        }
    }
}

impl Write for LocalFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.io {
            Io::Writer(w) => w.write(buf),
            Io::Reader(_) => Err(std::io::Error::other(format!(
                "{}: file is open for reading",
                self.path.display()
            ))),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.io {
            Io::Writer(w) => w.flush(),
            Io::Reader(_) => Ok(()),
        }
    }
}

impl FsFile for LocalFile {}

fn cpath(op: &'static str, path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        FsError::io(
            op,
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL"),
        )
    })
}

impl Filesystem for LocalFilesystem {
    fn rename(&self, old: &Path, new: &Path) -> FsResult<()> {
        fs::rename(old, new).map_err(|e| FsError::io("renaming", old, e))
    }

    fn remove(&self, path: &Path) -> FsResult<()> {
        // remove(3) semantics: unlink files, rmdir directories.
        let res = match self.path_type(path)? {
            PathType::Directory => fs::remove_dir(path),
            _ => fs::remove_file(path),
        };
        res.map_err(|e| FsError::io("removing", path, e))
    }

    fn open(&self, path: &Path, mode: OpenMode) -> FsResult<Box<dyn FsFile>> {
        let io = match mode {
            OpenMode::ReadOnly => {
                let f = File::open(path).map_err(|e| FsError::io("opening", path, e))?;
                Io::Reader(BufReader::new(f))
            }
            OpenMode::Overwrite | OpenMode::NoOverwrite => {
                let mut options = OpenOptions::new();
                options.write(true);
                match mode {
                    OpenMode::Overwrite => options.create(true).truncate(true),
                    _ => options.create_new(true),
                };
                let f = options
                    .open(path)
                    .map_err(|e| FsError::io("opening", path, e))?;
                Io::Writer(BufWriter::new(f))
            }
        };
        Ok(Box::new(LocalFile {
            path: path.to_path_buf(),
            io,
        }))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        fs::DirBuilder::new()
            .mode(mode)
            .create(path)
            .map_err(|e| FsError::io("creating directory", path, e))
    }

    fn exists(&self, path: &Path) -> FsResult<bool> {
        match fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FsError::io("stat", path, e)),
        }
    }

    fn contents(&self, path: &Path) -> FsResult<Vec<OsString>> {
        let entries = fs::read_dir(path).map_err(|e| FsError::io("opening directory", path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FsError::io("reading directory", path, e))?;
            names.push(entry.file_name());
        }
        Ok(names)
    }

    fn path_type(&self, path: &Path) -> FsResult<PathType> {
        let meta = fs::symlink_metadata(path).map_err(|e| FsError::io("lstat", path, e))?;
        let ft = meta.file_type();
        Ok(if ft.is_file() {
            PathType::Regular
        } else if ft.is_dir() {
            PathType::Directory
        } else if ft.is_symlink() {
            PathType::SymLink
        } else {
            PathType::Unknown
        })
    }

    fn readlink(&self, path: &Path) -> FsResult<OsString> {
        fs::read_link(path)
            .map(PathBuf::into_os_string)
            .map_err(|e| FsError::io("reading link", path, e))
    }

    fn ismount(&self, path: &Path) -> FsResult<bool> {
        let meta = fs::metadata(path).map_err(|e| FsError::io("stat", path, e))?;
        if !meta.is_dir() {
            return Ok(false);
        }
        let parent = path.join("..");
        let pmeta = fs::metadata(&parent).map_err(|e| FsError::io("stat", &parent, e))?;
        Ok(meta.dev() != pmeta.dev())
    }

    fn utimes(&self, path: &Path, atime: i64, mtime: i64) -> FsResult<()> {
        let c = cpath("setting file times", path)?;
        let times = [
            libc::timeval {
                tv_sec: atime as libc::time_t,
                tv_usec: 0,
            },
            libc::timeval {
                tv_sec: mtime as libc::time_t,
                tv_usec: 0,
            },
        ];
        if unsafe { libc::utimes(c.as_ptr(), times.as_ptr()) } < 0 {
            return Err(FsError::io(
                "setting file times",
                path,
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn lchown(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        let c = cpath("changing ownership of", path)?;
        if unsafe { libc::lchown(c.as_ptr(), uid, gid) } < 0 {
            return Err(FsError::io(
                "changing ownership of",
                path,
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| FsError::io("changing permissions of", path, e))
    }

    fn symlink(&self, target: &OsStr, path: &Path) -> FsResult<()> {
        std::os::unix::fs::symlink(target, path)
            .map_err(|e| FsError::io("creating symlink", path, e))
    }

    fn hard_link(&self, old: &Path, new: &Path) -> FsResult<()> {
        fs::hard_link(old, new).map_err(|e| FsError::io("linking", old, e))
    }

    fn mknod(&self, path: &Path, mode: u32, dev: u64) -> FsResult<()> {
        let c = cpath("creating device", path)?;
        if unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, dev as libc::dev_t) } < 0 {
            return Err(FsError::io(
                "creating device",
                path,
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn is_local(&self) -> bool {
        true
    }
}
