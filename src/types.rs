//! Run options, counters, and the per-run context threaded through the engines.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::exclude::Exclusions;
use crate::fs::Filesystem;

/// Full options for one run, assembled from the rc file and the CLI.
#[derive(Clone, Debug)]
pub struct Opts {
    /// Repository directory (local path, or remote path when sftp is set).
    pub repo: Option<PathBuf>,
    /// Index file to write (backup) or read (restore, verify).
    pub index: Option<PathBuf>,
    /// Root of the tree to back up or restore into.
    pub root: Option<PathBuf>,
    /// Don't recurse across filesystem boundaries (backup).
    pub one_file_system: bool,
    /// Restore access times after reading files (backup).
    pub preserve_atime: bool,
    /// Exclusion patterns applied to repository-relative paths (backup).
    pub exclude: Vec<String>,
    /// Write the index in place instead of committing via tmp-and-rename.
    pub overwrite_index: bool,
    /// Repository lives on this host, reached over SFTP.
    pub sftp: Option<String>,
    /// Remote sftp server binary, when the `sftp` subsystem won't do.
    pub sftp_server: Option<String>,
    /// Use the posix-rename@openssh.org extension for atomic renames.
    pub sftp_posix_rename: bool,
    /// Delete obsolete blobs instead of listing them (cleanup).
    pub delete_clean: bool,
    /// Treat blobs whose bytes don't hash to their name as corrupt.
    pub detect_bogus: bool,
    /// Restore ownership and permission bits.
    pub permissions: bool,
    /// Hint file used to skip re-hashing unchanged files (backup).
    pub hints: Option<PathBuf>,
    /// Re-hash blob bytes while copying and fail on divergence.
    pub recheck_hash: bool,
    /// Verbose output.
    pub verbose: bool,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            repo: None,
            index: None,
            root: None,
            one_file_system: false,
            preserve_atime: false,
            exclude: Vec::new(),
            overwrite_index: false,
            sftp: None,
            sftp_server: None,
            sftp_posix_rename: false,
            delete_clean: false,
            detect_bogus: false,
            permissions: true,
            hints: None,
            recheck_hash: true,
            verbose: false,
        }
    }
}

/// End-of-run counters. Each is incremented in exactly one place.
#[derive(Debug, Default)]
pub struct Stats {
    pub regular_files: u64,
    pub dirs: u64,
    pub links: u64,
    pub devs: u64,
    pub socks: u64,
    pub hardlinks: u64,
    pub unknown_files: u64,
    pub new_hashes: u64,
    pub hash_mmap: u64,
    pub hash_read: u64,
    pub small_files: u64,
    pub hints_used: u64,
    pub warnings: u64,
    pub errors: u64,
}

impl Stats {
    /// Log and count a warning. The run still exits 0.
    pub fn warning(&mut self, msg: impl AsRef<str>) {
        log::warn!("{}", msg.as_ref());
        self.warnings += 1;
    }

    /// Log and count an error. Any counted error makes the run exit 1.
    pub fn error(&mut self, msg: impl AsRef<str>) {
        log::error!("{}", msg.as_ref());
        self.errors += 1;
    }
}

/// Everything one operation needs: options, counters, and the two drivers.
///
/// The host side is always the local filesystem; the repository side is
/// either local or the SFTP driver. The engines own the context for the
/// whole run and are its only mutators.
pub struct Context {
    pub opts: Opts,
    pub stats: Stats,
    pub exclusions: Exclusions,
    pub host_fs: Box<dyn Filesystem>,
    pub backup_fs: Box<dyn Filesystem>,
    pub cancel: Arc<AtomicBool>,
}

impl Context {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
