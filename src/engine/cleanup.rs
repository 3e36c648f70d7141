//! Cleanup engine: delete or list repository blobs no longer referenced by
//! any of the supplied indexes.
//!
//! Two passes. Pass one builds the set of needed hashes from every index;
//! any index that fails to parse poisons the run, and nothing is deleted.
//! Pass two walks the blob tree and treats everything outside the needed
//! set, including stray `.tmp` files, as obsolete.

use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow, bail};

use crate::codec::{self, CodecError};
use crate::engine::hashing::{HashSet, hash_file};
use crate::fs::{OpenMode, PathType};
use crate::index::{self, IndexError};
use crate::types::Context;
use crate::utils::config::HASH_DIR;

pub fn do_cleanup(ctx: &mut Context, indexes: &[PathBuf]) -> Result<()> {
    let repo = ctx
        .opts
        .repo
        .clone()
        .ok_or_else(|| anyhow!("no repository specified"))?;
    if indexes.is_empty() {
        bail!("no index files specified");
    }

    let mut needed = HashSet::new();
    let mut bad: Vec<&PathBuf> = Vec::new();
    for ix in indexes {
        log::debug!("checking {}", ix.display());
        let mut f = ctx.backup_fs.open(ix, OpenMode::ReadOnly)?;
        if let Err(e) = collect_hashes(f.as_mut(), &mut needed) {
            match e {
                IndexError::Io(e) => {
                    return Err(anyhow!(e).context(format!("reading {}", ix.display())));
                }
                other => {
                    ctx.stats.error(format!("{}: {other}", ix.display()));
                    bad.push(ix);
                }
            }
        }
    }
    if !bad.is_empty() {
        for ix in &bad {
            eprintln!("{}", ix.display());
        }
        bail!("{} bad input files", bad.len());
    }

    if ctx.opts.verbose {
        needed.dump_stats();
    }
    log::debug!("looking for obsolete files");
    let obsolete = clean_dir(ctx, &needed, &repo.join(HASH_DIR))?;
    log::debug!("found {obsolete} obsolete files");
    Ok(())
}

/// Insert every `sha1=` hash of one index into `needed`.
fn collect_hashes(f: &mut dyn std::io::Read, needed: &mut HashSet) -> Result<(), IndexError> {
    while let Some(rec) = index::read_record(f)? {
        if let Some(raw) = rec.get("sha1") {
            let hex = std::str::from_utf8(raw).map_err(|_| CodecError::BadHexDigit)?;
            needed.insert(&codec::hash_decode(hex)?);
        }
    }
    Ok(())
}

/// Walk one level of the blob tree; returns how many obsolete files were
/// seen. Directories are recursed, anything else is left alone.
fn clean_dir(ctx: &mut Context, needed: &HashSet, path: &Path) -> Result<u64> {
    let mut obsolete = 0;
    for name in ctx.backup_fs.contents(path)? {
        let fullname = path.join(&name);
        match ctx.backup_fs.path_type(&fullname)? {
            PathType::Regular => {
                if blob_is_needed(ctx, needed, &name, &fullname) {
                    continue;
                }
                if ctx.opts.delete_clean {
                    // Don't give up over one file we cannot delete.
                    if let Err(e) = ctx.backup_fs.remove(&fullname) {
                        ctx.stats.error(e.to_string());
                    }
                } else {
                    let mut out = std::io::stdout().lock();
                    writeln!(out, "{}", fullname.display())
                        .context("error writing to stdout")?;
                }
                obsolete += 1;
            }
            PathType::Directory => obsolete += clean_dir(ctx, needed, &fullname)?,
            _ => {}
        }
    }
    Ok(obsolete)
}

/// A blob earns its keep by being named a valid hash that some index still
/// references; with detect-bogus its bytes must also hash to that name.
fn blob_is_needed(ctx: &mut Context, needed: &HashSet, name: &OsStr, fullname: &Path) -> bool {
    let Some(hex) = name.to_str() else {
        return false;
    };
    let Ok(h) = codec::hash_decode(hex) else {
        return false;
    };
    let mut keep = needed.contains(&h);
    if ctx.opts.detect_bogus {
        match hash_file(ctx.backup_fs.as_ref(), fullname, false, &mut ctx.stats) {
            Ok(actual) if actual == h => {}
            _ => keep = false,
        }
    }
    keep
}
