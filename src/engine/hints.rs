//! Hint cache: skip re-hashing files whose size and times are unchanged.
//!
//! A hint file uses the index line grammar with fields `name` (absolute host
//! path), `sha1`, `ctime`, `mtime`, `size`. Hints are only an accelerator:
//! one is used in place of hashing iff all three of size, ctime and mtime
//! still match. The new hint file is rebuilt from scratch every run and
//! committed with a rename, so it is always a complete current snapshot.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow};

use crate::codec::{self, HashBytes};
use crate::fs::{FsFile, Filesystem, OpenMode};
use crate::index::{self, Record};
use crate::utils::config::TMP_SUFFIX;

struct Hint {
    hash: HashBytes,
    size: u64,
    ctime: i64,
    mtime: i64,
}

/// Hints loaded from the previous run, keyed by absolute host path.
#[derive(Default)]
pub struct HintCache {
    map: HashMap<PathBuf, Hint>,
}

fn num_field(rec: &Record, key: &str) -> Result<i64> {
    index::field_str(rec, key)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("hint record has no usable {key} field"))
}

impl HintCache {
    /// Load `path` if it exists; a missing file is an empty cache.
    pub fn load(fs: &dyn Filesystem, path: &Path) -> Result<Self> {
        let mut cache = HintCache::default();
        if !fs.exists(path)? {
            return Ok(cache);
        }
        log::debug!("loading hints from {}", path.display());
        let mut f = fs.open(path, OpenMode::ReadOnly)?;
        while let Some(rec) = index::read_record(&mut f)
            .with_context(|| format!("reading hints from {}", path.display()))?
        {
            let name = rec
                .get("name")
                .ok_or_else(|| anyhow!("hint record has no name field"))?;
            let hash = index::field_str(&rec, "sha1")
                .ok_or_else(|| anyhow!("hint record has no sha1 field"))
                .and_then(|s| Ok(codec::hash_decode(s)?))?;
            let hint = Hint {
                hash,
                size: num_field(&rec, "size")? as u64,
                ctime: num_field(&rec, "ctime")?,
                mtime: num_field(&rec, "mtime")?,
            };
            cache
                .map
                .insert(PathBuf::from(OsString::from_vec(name.clone())), hint);
        }
        Ok(cache)
    }

    /// The recorded hash for `path`, provided size and both times still match.
    pub fn lookup(&self, path: &Path, size: u64, ctime: i64, mtime: i64) -> Option<HashBytes> {
        self.map
            .get(path)
            .filter(|h| h.size == size && h.ctime == ctime && h.mtime == mtime)
            .map(|h| h.hash)
    }
}

/// Writes the replacement hint file to `<path>.tmp`, renamed over the old
/// file only when the run completes.
pub struct HintWriter {
    file: Box<dyn FsFile>,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl HintWriter {
    pub fn create(fs: &dyn Filesystem, path: &Path) -> Result<Self> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp_path = PathBuf::from(tmp);
        let file = fs.open(&tmp_path, OpenMode::Overwrite)?;
        Ok(HintWriter {
            file,
            tmp_path,
            final_path: path.to_path_buf(),
        })
    }

    /// Record one large regular file, whether its hash was fresh or reused.
    pub fn record(
        &mut self,
        path: &Path,
        hash: &HashBytes,
        ctime: i64,
        mtime: i64,
        size: u64,
    ) -> Result<()> {
        let line = format!(
            "name={}&sha1={}&ctime={ctime}&mtime={mtime}&size={size}\n",
            codec::url_encode(path.as_os_str().as_bytes()),
            codec::hex_encode(hash),
        );
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("writing hints to {}", self.tmp_path.display()))
    }

    /// Terminate, flush and atomically rename into place.
    pub fn commit(mut self, fs: &dyn Filesystem) -> Result<()> {
        self.file.write_all(b"[end]\n")?;
        self.file.flush()?;
        drop(self.file);
        fs.rename(&self.tmp_path, &self.final_path)?;
        Ok(())
    }
}
