//! Verify engine: re-hash every blob an index references.

use anyhow::{Context as _, Result, anyhow};

use crate::codec;
use crate::engine::hashing::hash_file;
use crate::fs::OpenMode;
use crate::index;
use crate::types::Context;
use crate::utils::config::HASH_DIR;

/// Check that every `sha1=` blob in the index still hashes to its name.
/// Mismatches and missing blobs are counted errors; with detect-bogus a
/// mismatched blob is also deleted so the next backup repopulates it.
pub fn do_verify(ctx: &mut Context) -> Result<()> {
    let repo = ctx
        .opts
        .repo
        .clone()
        .ok_or_else(|| anyhow!("no repository specified"))?;
    let index_path = ctx
        .opts
        .index
        .clone()
        .ok_or_else(|| anyhow!("no index specified"))?;
    let hash_dir = repo.join(HASH_DIR);

    let mut f = ctx.backup_fs.open(&index_path, OpenMode::ReadOnly)?;
    while let Some(rec) = index::read_record(&mut f)
        .with_context(|| format!("reading index {}", index_path.display()))?
    {
        if rec.contains_key("type") || rec.contains_key("data") {
            continue;
        }
        let name = rec
            .get("name")
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default();
        let Some(hash_hex) = index::field_str(&rec, "sha1") else {
            ctx.stats.error(format!("{name}: no known hash"));
            continue;
        };
        let h = codec::hash_decode(hash_hex)?;
        let blob = hash_dir.join(codec::hash_path(&h));
        match hash_file(ctx.backup_fs.as_ref(), &blob, false, &mut ctx.stats) {
            Ok(actual) => {
                if actual != h {
                    ctx.stats
                        .error(format!("{name}: hash mismatch for {}", blob.display()));
                    if ctx.opts.detect_bogus {
                        ctx.backup_fs.remove(&blob)?;
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                ctx.stats
                    .error(format!("{name}: cannot find {}", blob.display()));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
