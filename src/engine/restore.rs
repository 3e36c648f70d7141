//! Restore engine: replay an index into a directory tree.
//!
//! Every entry is materialized at `<name>~restore~` and renamed into place,
//! so an interrupted restore never leaves a half-written file at its final
//! name. Directory timestamps are fixed up at the end, after creating their
//! contents stopped disturbing them.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow, bail};

use crate::codec;
use crate::fs::OpenMode;
use crate::index::{self, Record};
use crate::types::{Context, Stats};
use crate::utils::config::{HASH_DIR, RESTORE_SUFFIX, StoreConsts};

pub fn do_restore(ctx: &mut Context) -> Result<()> {
    let repo = ctx
        .opts
        .repo
        .clone()
        .ok_or_else(|| anyhow!("no repository specified"))?;
    let root = ctx
        .opts
        .root
        .clone()
        .ok_or_else(|| anyhow!("no root specified"))?;
    let index_path = ctx
        .opts
        .index
        .clone()
        .ok_or_else(|| anyhow!("no index specified"))?;

    let mut f = ctx.backup_fs.open(&index_path, OpenMode::ReadOnly)?;
    log::debug!("restoring from {}", index_path.display());

    let mut restorer = Restorer {
        ctx,
        root,
        hash_dir: repo.join(HASH_DIR),
        dir: Vec::new(),
        inodes: HashMap::new(),
        dir_times: Vec::new(),
    };
    while let Some(rec) = index::read_record(&mut f)
        .with_context(|| format!("reading index {}", index_path.display()))?
    {
        restorer.restore_record(&rec)?;
    }
    drop(f);

    // Creating entries inside a directory bumped its mtime; put the
    // recorded stamps back now that the contents are complete.
    log::debug!("fixing directory timestamps");
    let Restorer {
        ctx, dir_times, ..
    } = restorer;
    for (path, atime, mtime) in dir_times {
        ctx.host_fs.utimes(&path, atime, mtime)?;
    }
    Ok(())
}

struct Restorer<'a> {
    ctx: &'a mut Context,
    root: PathBuf,
    hash_dir: PathBuf,
    /// Directory the last full-path record lived in, for `./` expansion.
    dir: Vec<u8>,
    /// Inode number from the index to the path already restored for it.
    inodes: HashMap<u64, PathBuf>,
    dir_times: Vec<(PathBuf, i64, i64)>,
}

fn num_field(rec: &Record, key: &str) -> i64 {
    index::field_str(rec, key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// uid/gid values are numeric; this tool delegates name lookup elsewhere.
fn id_field(rec: &Record, key: &str, name: &[u8]) -> Result<u32> {
    let s = index::field_str(rec, key)
        .ok_or_else(|| anyhow!("{}: record has no {key}", String::from_utf8_lossy(name)))?;
    s.parse()
        .map_err(|_| anyhow!("non-numeric {key} {s:?}: name lookup is not supported"))
}

impl Restorer<'_> {
    fn restore_record(&mut self, rec: &Record) -> Result<()> {
        let Some(name_raw) = rec.get("name") else {
            self.ctx.stats.error("index record has no name");
            return Ok(());
        };

        // A ./something name belongs to the same directory as the last
        // full-path record.
        let name: Vec<u8> = if name_raw.starts_with(b"./") {
            if self.dir.is_empty() {
                self.ctx.stats.error(format!(
                    "unexpected relative name: {}",
                    String::from_utf8_lossy(name_raw)
                ));
                return Ok(());
            }
            let mut n = self.dir.clone();
            n.push(b'/');
            n.extend_from_slice(&name_raw[2..]);
            n
        } else {
            match name_raw.iter().rposition(|&b| b == b'/') {
                Some(pos) => self.dir = name_raw[..pos].to_vec(),
                None => self.dir.clear(),
            }
            name_raw.clone()
        };

        let fullname = self.root.join(Path::new(OsStr::from_bytes(&name)));
        let mut tmp = fullname.as_os_str().to_owned();
        tmp.push(RESTORE_SUFFIX);
        let tmpname = PathBuf::from(tmp);

        // Get any leftover temporary out of the way.
        let _ = self.ctx.host_fs.remove(&tmpname);

        // Might be a link to a file we already unpacked.
        let inode: Option<u64> = index::field_str(rec, "inode").and_then(|s| s.parse().ok());
        if let Some(n) = inode
            && let Some(existing) = self.inodes.get(&n)
        {
            self.ctx.stats.hardlinks += 1;
            let existing = existing.clone();
            self.ctx.host_fs.hard_link(&existing, &tmpname)?;
            self.ctx.host_fs.rename(&tmpname, &fullname)?;
            // The link shares everything with its target; leave
            // permissions alone.
            return Ok(());
        }

        let mut mode = index::field_str(rec, "perms")
            .and_then(index::parse_perms)
            .unwrap_or(0);
        let type_field = index::field_str(rec, "type");

        match type_field {
            Some("link") => {
                self.ctx.stats.links += 1;
                let Some(target) = rec.get("target") else {
                    self.ctx.stats.error(format!(
                        "{}: link record has no target",
                        String::from_utf8_lossy(&name)
                    ));
                    return Ok(());
                };
                self.ctx
                    .host_fs
                    .symlink(OsStr::from_bytes(target), &tmpname)?;
            }
            Some("dir") => {
                self.ctx.stats.dirs += 1;
                // An existing directory is assumed intentional.
                if self.ctx.host_fs.exists(&fullname)? {
                    self.ctx.stats.warning(format!(
                        "{} already exists, leaving it alone",
                        fullname.display()
                    ));
                    return Ok(());
                }
                if !self.ctx.opts.permissions {
                    mode = 0o777;
                }
                self.ctx.host_fs.mkdir(&tmpname, mode)?;
            }
            Some(t @ ("chr" | "blk")) => {
                self.ctx.stats.devs += 1;
                let devtype = if t == "chr" {
                    libc::S_IFCHR
                } else {
                    libc::S_IFBLK
                };
                if !self.ctx.opts.permissions {
                    mode = 0o666;
                }
                let rdev = num_field(rec, "rdev") as u64;
                self.ctx.host_fs.mknod(&tmpname, mode | devtype, rdev)?;
            }
            Some("socket") => {
                self.ctx.stats.socks += 1;
                if !self.ctx.host_fs.is_local() {
                    self.ctx.stats.warning(format!(
                        "{}: cannot restore socket to remote filesystem",
                        fullname.display()
                    ));
                    return Ok(());
                }
                if !bind_unix_socket(&tmpname, &mut self.ctx.stats)? {
                    return Ok(());
                }
            }
            Some(other) => {
                self.ctx.stats.error(format!("unknown file type {other}"));
                return Ok(());
            }
            None => {
                self.ctx.stats.regular_files += 1;
                if let Some(data) = rec.get("data") {
                    self.ctx.stats.small_files += 1;
                    let mut f = self.ctx.host_fs.open(&tmpname, OpenMode::Overwrite)?;
                    f.write_all(data)
                        .and_then(|_| f.flush())
                        .with_context(|| format!("writing {}", tmpname.display()))?;
                } else if let Some(hash_hex) = index::field_str(rec, "sha1") {
                    let h = codec::hash_decode(hash_hex)?;
                    let blob = self.hash_dir.join(codec::hash_path(&h));
                    let mut src = self.ctx.backup_fs.open(&blob, OpenMode::ReadOnly)?;
                    let mut dst = self.ctx.host_fs.open(&tmpname, OpenMode::Overwrite)?;
                    let mut buf = [0u8; StoreConsts::COPY_CHUNK];
                    loop {
                        let n = src
                            .read(&mut buf)
                            .with_context(|| format!("reading {}", blob.display()))?;
                        if n == 0 {
                            break;
                        }
                        dst.write_all(&buf[..n])
                            .with_context(|| format!("writing {}", tmpname.display()))?;
                    }
                    dst.flush()
                        .with_context(|| format!("writing {}", tmpname.display()))?;
                } else {
                    // Must be from the future.
                    self.ctx.stats.error(format!(
                        "{} does not have a known hash",
                        String::from_utf8_lossy(&name)
                    ));
                    return Ok(());
                }
                if let Some(n) = inode {
                    // Other links to this file may turn up later.
                    self.inodes.insert(n, fullname.clone());
                }
            }
        }

        // Fix ownership, permissions and times, then rename into place.
        if self.ctx.opts.permissions {
            let uid = id_field(rec, "uid", &name)?;
            let gid = id_field(rec, "gid", &name)?;
            self.ctx.host_fs.lchown(&tmpname, uid, gid)?;
        }
        let is_dir = type_field == Some("dir");
        if type_field != Some("link") {
            if self.ctx.opts.permissions {
                self.ctx.host_fs.chmod(&tmpname, mode)?;
            }
            let atime = num_field(rec, "atime");
            let mtime = num_field(rec, "mtime");
            if is_dir {
                self.dir_times.push((fullname.clone(), atime, mtime));
            } else {
                self.ctx.host_fs.utimes(&tmpname, atime, mtime)?;
            }
        }
        self.ctx.host_fs.rename(&tmpname, &fullname)?;
        Ok(())
    }
}

/// Re-create a UNIX socket by binding and immediately closing it. Returns
/// false after a counted, recoverable error.
fn bind_unix_socket(path: &Path, stats: &mut Stats) -> Result<bool> {
    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        stats.error(format!("{}: socket path name too long", path.display()));
        return Ok(false);
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (i, &b) in bytes.iter().enumerate() {
        addr.sun_path[i] = b as libc::c_char;
    }

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        bail!(
            "error creating socket: {}",
            std::io::Error::last_os_error()
        );
    }
    let rc = unsafe {
        libc::bind(
            fd,
            std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let e = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        stats.error(format!("error binding socket to {}: {e}", path.display()));
        return Ok(false);
    }
    if unsafe { libc::close(fd) } < 0 {
        bail!("error calling close: {}", std::io::Error::last_os_error());
    }
    Ok(true)
}
