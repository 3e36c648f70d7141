//! Backup engine: walk the tree, deduplicate large files into the
//! repository, and emit one index record per entry.
//!
//! Within a directory, records appear in byte-wise filename order and
//! subdirectories are recursed only after every sibling has been emitted.
//! Two backups of an unchanged tree therefore produce byte-identical
//! indexes, and a streaming reader knows a directory is complete the moment
//! it sees a record from elsewhere.

use std::ffi::OsString;
use std::io::{BufWriter, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow, bail};
use sha1::{Digest, Sha1};

use crate::codec::{self, HashBytes};
use crate::engine::hashing::{HashSet, hash_file};
use crate::engine::hints::{HintCache, HintWriter};
use crate::fs::{FsError, FsFile, OpenMode};
use crate::index;
use crate::types::Context;
use crate::utils::config::{HASH_DIR, StoreConsts, TMP_SUFFIX};

/// A large file whose blob may be missing from the repository. The
/// existence probe is already in flight; the copy happens at the end of the
/// directory.
struct PendingBlob {
    source: PathBuf,
    repo_path: PathBuf,
    hash: HashBytes,
}

pub fn do_backup(ctx: &mut Context) -> Result<()> {
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
    anyhow::ensure!(ctx.host_fs.is_local(), "backup root must be local");

    if !ctx.opts.overwrite_index && ctx.backup_fs.exists(&index_path)? {
        bail!("index file {} already exists", index_path.display());
    }

    let (hint_cache, hint_writer) = match ctx.opts.hints.clone() {
        Some(path) => (
            HintCache::load(ctx.host_fs.as_ref(), &path)?,
            Some(HintWriter::create(ctx.host_fs.as_ref(), &path)?),
        ),
        None => (HintCache::default(), None),
    };

    let write_path = if ctx.opts.overwrite_index {
        index_path.clone()
    } else {
        let mut p = index_path.as_os_str().to_owned();
        p.push(TMP_SUFFIX);
        PathBuf::from(p)
    };
    let index_file = ctx.backup_fs.open(&write_path, OpenMode::Overwrite)?;

    let mut engine = BackupEngine {
        ctx,
        root,
        repo_hash_dir: repo.join(HASH_DIR),
        inrepo: HashSet::new(),
        hint_cache,
        hint_writer,
        index: BufWriter::new(index_file),
    };
    engine.backup_dir(Path::new(""))?;
    engine
        .index
        .write_all(b"[end]\n")
        .with_context(|| format!("writing index to {}", write_path.display()))?;
    engine
        .index
        .flush()
        .with_context(|| format!("writing index to {}", write_path.display()))?;

    let BackupEngine {
        ctx,
        index,
        hint_writer,
        ..
    } = engine;
    drop(index);

    if let Some(writer) = hint_writer {
        writer.commit(ctx.host_fs.as_ref())?;
    }

    if ctx.cancelled() {
        bail!("backup cancelled; no snapshot was committed");
    }
    // The rename is the commit point of the whole snapshot.
    if !ctx.opts.overwrite_index {
        ctx.backup_fs.rename(&write_path, &index_path)?;
    }
    Ok(())
}

struct BackupEngine<'a> {
    ctx: &'a mut Context,
    root: PathBuf,
    repo_hash_dir: PathBuf,
    /// Hashes known to be in the repository during this run.
    inrepo: HashSet,
    hint_cache: HintCache,
    hint_writer: Option<HintWriter>,
    index: BufWriter<Box<dyn FsFile>>,
}

impl BackupEngine<'_> {
    fn backup_dir(&mut self, dir: &Path) -> Result<()> {
        if self.ctx.cancelled() {
            bail!("backup cancelled; no snapshot was committed");
        }
        let full_dir = if dir.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(dir)
        };
        let names = self.ctx.host_fs.contents(&full_dir)?;

        // Stat everything first, dropping what we won't back up.
        let mut entries: Vec<(OsString, std::fs::Metadata)> = Vec::with_capacity(names.len());
        for name in names {
            let localname = dir.join(&name);
            if self
                .ctx
                .exclusions
                .excluded(localname.as_os_str().as_bytes())
            {
                continue;
            }
            let fullname = self.root.join(&localname);
            let sb = match std::fs::symlink_metadata(&fullname) {
                Ok(sb) => sb,
                // Some platforms list entries that cannot then be stat'd.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.ctx
                        .stats
                        .warning(format!("lstat {}: {e}", fullname.display()));
                    continue;
                }
                Err(e) => return Err(FsError::io("lstat", &fullname, e).into()),
            };
            let ft = sb.file_type();
            if !(ft.is_file()
                || ft.is_dir()
                || ft.is_symlink()
                || ft.is_char_device()
                || ft.is_block_device()
                || ft.is_socket())
            {
                self.ctx
                    .stats
                    .warning(format!("cannot back up {}", fullname.display()));
                self.ctx.stats.unknown_files += 1;
                continue;
            }
            entries.push((name, sb));
        }
        entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let mut subdirs: Vec<PathBuf> = Vec::new();
        let mut pending: Vec<PendingBlob> = Vec::new();
        let mut first = true;

        for (name, sb) in &entries {
            let localname = dir.join(name);
            let fullname = self.root.join(&localname);

            // The first record of a directory carries the full path; later
            // ones shorten to ./basename, except in the root where names
            // have no directory part at all.
            let relname: Vec<u8> = if first || dir.as_os_str().is_empty() {
                localname.as_os_str().as_bytes().to_vec()
            } else {
                let mut r = b"./".to_vec();
                r.extend_from_slice(name.as_bytes());
                r
            };
            first = false;

            let mut line = format!(
                "name={}&perms={}&uid={}&gid={}&atime={}&ctime={}&mtime={}",
                codec::url_encode(&relname),
                index::format_perms(sb.mode()),
                sb.uid(),
                sb.gid(),
                sb.atime(),
                sb.ctime(),
                sb.mtime(),
            );

            let ft = sb.file_type();
            if ft.is_file() {
                self.append_regular(&mut line, &fullname, sb, &mut pending)?;
                // nlink > 1 means restore will want to stitch hard links
                // back together.
                if sb.nlink() > 1 {
                    line.push_str(&format!("&inode={}", sb.ino()));
                }
            } else if ft.is_dir() {
                line.push_str("&type=dir");
                self.ctx.stats.dirs += 1;
                if !self.ctx.opts.one_file_system || !self.ctx.host_fs.ismount(&fullname)? {
                    subdirs.push(localname.clone());
                }
            } else if ft.is_symlink() {
                let target = self.ctx.host_fs.readlink(&fullname)?;
                line.push_str(&format!(
                    "&target={}&type=link",
                    codec::url_encode(target.as_bytes())
                ));
                self.ctx.stats.links += 1;
            } else if ft.is_char_device() || ft.is_block_device() {
                line.push_str(&format!(
                    "&rdev={}&type={}",
                    sb.rdev(),
                    if ft.is_char_device() { "chr" } else { "blk" }
                ));
                self.ctx.stats.devs += 1;
            } else {
                line.push_str("&type=socket");
                self.ctx.stats.socks += 1;
            }
            line.push('\n');
            self.index
                .write_all(line.as_bytes())
                .context("writing index")?;

            if ft.is_file() {
                if self.ctx.opts.preserve_atime {
                    self.ctx
                        .host_fs
                        .utimes(&fullname, sb.atime(), sb.mtime())?;
                }
                self.ctx.stats.regular_files += 1;
            }
        }

        // Copy in the blobs this directory needs. Over SFTP the existence
        // probes have been in flight since the loop above, so the answers
        // arrive without one round trip each.
        for blob in pending {
            if !self.ctx.backup_fs.exists(&blob.repo_path)? {
                self.store_blob(&blob)?;
                self.ctx.stats.new_hashes += 1;
            }
        }

        for sub in subdirs {
            self.backup_dir(&sub)?;
        }
        Ok(())
    }

    /// Append `data=` or `sha1=` for a regular file, scheduling a blob copy
    /// when the repository might not have it yet.
    fn append_regular(
        &mut self,
        line: &mut String,
        fullname: &Path,
        sb: &std::fs::Metadata,
        pending: &mut Vec<PendingBlob>,
    ) -> Result<()> {
        let size = sb.len();
        if size <= StoreConsts::STORE_LIMIT {
            let f = self.ctx.host_fs.open(fullname, OpenMode::ReadOnly)?;
            let mut data = Vec::with_capacity(size as usize);
            f.take(size)
                .read_to_end(&mut data)
                .map_err(|e| FsError::io("reading", fullname, e))?;
            if (data.len() as u64) < size {
                bail!("unexpected EOF reading {}", fullname.display());
            }
            line.push_str("&data=");
            line.push_str(&codec::url_encode(&data));
            self.ctx.stats.small_files += 1;
            return Ok(());
        }

        let hash = match self
            .hint_cache
            .lookup(fullname, size, sb.ctime(), sb.mtime())
        {
            Some(hash) => {
                self.ctx.stats.hints_used += 1;
                hash
            }
            None => hash_file(
                self.ctx.host_fs.as_ref(),
                fullname,
                size >= StoreConsts::MIN_MAP,
                &mut self.ctx.stats,
            )?,
        };
        if let Some(writer) = &mut self.hint_writer {
            // Every large file gets a fresh hint, hashed or not, so the new
            // hint file is a complete snapshot.
            writer.record(fullname, &hash, sb.ctime(), sb.mtime(), size)?;
        }

        if !self.inrepo.contains(&hash) {
            let repo_path = self.repo_hash_dir.join(codec::hash_path(&hash));
            self.ctx.backup_fs.prefigure_exists(&repo_path)?;
            pending.push(PendingBlob {
                source: fullname.to_path_buf(),
                repo_path,
                hash,
            });
            // The repository holds this blob either way for the rest of
            // this run.
            self.inrepo.insert(&hash);
        }
        line.push_str("&sha1=");
        line.push_str(&codec::hex_encode(&hash));
        Ok(())
    }

    /// Stream a blob to `<repo path>.tmp` and rename it into place. A
    /// reader observing the final name observes complete content.
    fn store_blob(&mut self, blob: &PendingBlob) -> Result<()> {
        let mut tmp = blob.repo_path.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let mut src = self.ctx.host_fs.open(&blob.source, OpenMode::ReadOnly)?;
        // The shard directories usually exist already, so try the open
        // first and only create them on ENOENT.
        let mut dst = match self.ctx.backup_fs.open(&tmp, OpenMode::Overwrite) {
            Ok(f) => f,
            Err(e) if e.is_not_found() => {
                if let Some(parent) = blob.repo_path.parent() {
                    self.ctx.backup_fs.makedirs(parent)?;
                }
                self.ctx.backup_fs.open(&tmp, OpenMode::Overwrite)?
            }
            Err(e) => return Err(e.into()),
        };

        let mut hasher = self.ctx.opts.recheck_hash.then(Sha1::new);
        let mut buf = [0u8; StoreConsts::COPY_CHUNK];
        loop {
            let n = src
                .read(&mut buf)
                .map_err(|e| FsError::io("reading", &blob.source, e))?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])
                .map_err(|e| FsError::io("writing to", &tmp, e))?;
            if let Some(h) = &mut hasher {
                h.update(&buf[..n]);
            }
        }
        if let Some(h) = hasher {
            let actual: HashBytes = h.finalize().into();
            if actual != blob.hash {
                bail!(
                    "{} changed hash between test and write",
                    blob.source.display()
                );
            }
        }
        dst.flush().map_err(|e| FsError::io("writing to", &tmp, e))?;
        drop(src);
        drop(dst);
        self.ctx.backup_fs.rename(&tmp, &blob.repo_path)?;
        Ok(())
    }
}
