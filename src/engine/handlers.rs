//! Wire CLI commands to the engines: options, logging, drivers, summaries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result};

use crate::engine::arg_parser::CommonArgs;
use crate::engine::{backup, cleanup, restore, verify};
use crate::exclude::Exclusions;
use crate::fs::Filesystem;
use crate::fs::local::LocalFilesystem;
use crate::fs::sftp::SftpFilesystem;
use crate::types::{Context, Opts, Stats};
use crate::utils::{apply_rcfile_to_opts, load_rcfile, setup_logging};

/// Rc-file defaults, then shared CLI flags on top. Also initializes logging.
fn base_opts(common: &CommonArgs) -> Opts {
    let mut opts = Opts::default();
    if let Some(file) = load_rcfile(Path::new(".")) {
        apply_rcfile_to_opts(&file, &mut opts);
    }
    if let Some(r) = &common.repo {
        opts.repo = Some(r.clone());
    }
    if let Some(h) = &common.sftp {
        opts.sftp = Some(h.clone());
    }
    if let Some(p) = &common.sftp_server {
        opts.sftp_server = Some(p.clone());
    }
    if common.verbose {
        opts.verbose = true;
    }
    setup_logging(opts.verbose);
    opts
}

fn build_context(opts: Opts) -> Result<Context> {
    let mut exclusions = Exclusions::default();
    for pattern in &opts.exclude {
        exclusions
            .add(pattern)
            .with_context(|| format!("compiling exclusion pattern {pattern:?}"))?;
    }
    let backup_fs: Box<dyn Filesystem> = match &opts.sftp {
        Some(user_host) => {
            unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
            Box::new(SftpFilesystem::new(
                user_host,
                opts.sftp_server.clone(),
                opts.sftp_posix_rename,
            ))
        }
        None => Box::new(LocalFilesystem),
    };
    Ok(Context {
        opts,
        stats: Stats::default(),
        exclusions,
        host_fs: Box::new(LocalFilesystem),
        backup_fs,
        cancel: Arc::new(AtomicBool::new(false)),
    })
}

/// Ctrl+C sets a flag the backup engine checks before its commit rename; an
/// interrupted run leaves temporaries but no visible snapshot.
fn setup_cancel_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed))
        .context("set Ctrl+C handler")?;
    Ok(flag)
}

/// Trailing warning/error totals; the exit status is 1 iff errors > 0.
fn finish(stats: &Stats) -> Result<u64> {
    if stats.warnings > 0 {
        eprintln!("*** {} warnings", stats.warnings);
    }
    if stats.errors > 0 {
        eprintln!("*** {} errors", stats.errors);
    }
    Ok(stats.errors)
}

fn print_backup_summary(stats: &Stats) {
    eprintln!("Regular files:        {:>8}", stats.regular_files);
    eprintln!("Directories:          {:>8}", stats.dirs);
    eprintln!("Links:                {:>8}", stats.links);
    eprintln!("Devices:              {:>8}", stats.devs);
    eprintln!("Sockets:              {:>8}", stats.socks);
    eprintln!("Unknown:              {:>8}", stats.unknown_files);
    eprintln!("New hashes:           {:>8}", stats.new_hashes);
    eprintln!("Files mapped to hash: {:>8}", stats.hash_mmap);
    eprintln!("Files read to hash:   {:>8}", stats.hash_read);
    eprintln!("Tiny files:           {:>8}", stats.small_files);
    eprintln!("Hints used:           {:>8}", stats.hints_used);
}

fn print_restore_summary(stats: &Stats) {
    eprintln!("Regular files:        {:>8}", stats.regular_files);
    eprintln!("Directories:          {:>8}", stats.dirs);
    eprintln!("Links:                {:>8}", stats.links);
    eprintln!("Devices:              {:>8}", stats.devs);
    eprintln!("Sockets:              {:>8}", stats.socks);
    eprintln!("Tiny files:           {:>8}", stats.small_files);
    eprintln!("Hard links:           {:>8}", stats.hardlinks);
}

#[allow(clippy::too_many_arguments)]
pub fn handle_backup(
    common: &CommonArgs,
    index: PathBuf,
    root: PathBuf,
    one_file_system: bool,
    preserve_atime: bool,
    exclude: Vec<String>,
    overwrite: bool,
    hints: Option<PathBuf>,
) -> Result<u64> {
    let mut opts = base_opts(common);
    opts.index = Some(index);
    opts.root = Some(root);
    opts.one_file_system = one_file_system;
    opts.preserve_atime = preserve_atime;
    if !exclude.is_empty() {
        opts.exclude = exclude;
    }
    opts.overwrite_index = overwrite;
    if hints.is_some() {
        opts.hints = hints;
    }
    let verbose = opts.verbose;

    let mut ctx = build_context(opts)?;
    ctx.cancel = setup_cancel_flag()?;
    backup::do_backup(&mut ctx)?;
    if verbose {
        print_backup_summary(&ctx.stats);
    }
    finish(&ctx.stats)
}

pub fn handle_restore(
    common: &CommonArgs,
    index: PathBuf,
    root: PathBuf,
    no_permissions: bool,
) -> Result<u64> {
    let mut opts = base_opts(common);
    opts.index = Some(index);
    opts.root = Some(root);
    opts.permissions = !no_permissions;
    let verbose = opts.verbose;

    let mut ctx = build_context(opts)?;
    restore::do_restore(&mut ctx)?;
    if verbose {
        print_restore_summary(&ctx.stats);
    }
    finish(&ctx.stats)
}

pub fn handle_verify(common: &CommonArgs, index: PathBuf, detect_bogus: bool) -> Result<u64> {
    let mut opts = base_opts(common);
    opts.index = Some(index);
    opts.detect_bogus = detect_bogus;

    let mut ctx = build_context(opts)?;
    verify::do_verify(&mut ctx)?;
    finish(&ctx.stats)
}

pub fn handle_cleanup(
    common: &CommonArgs,
    delete: bool,
    detect_bogus: bool,
    indexes: &[PathBuf],
) -> Result<u64> {
    let mut opts = base_opts(common);
    opts.delete_clean = delete;
    opts.detect_bogus = detect_bogus;

    let mut ctx = build_context(opts)?;
    cleanup::do_cleanup(&mut ctx, indexes)?;
    finish(&ctx.stats)
}
