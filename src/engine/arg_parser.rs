//! casnap CLI: one subcommand per operation, shared flags flattened in.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Content-addressed backup of directory trees.
#[derive(Parser)]
#[command(name = "casnap", version)]
#[command(about = "Snapshot directory trees into a content-addressed repository.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Save ROOT into the repository and write INDEX describing the snapshot.
    Backup {
        #[command(flatten)]
        common: CommonArgs,

        /// Index file to write.
        #[arg(long, short = 'I', value_name = "FILE")]
        index: PathBuf,

        /// Root of the tree to back up.
        #[arg(long, short = 'F', value_name = "DIR")]
        root: PathBuf,

        /// Don't cross filesystem boundaries.
        #[arg(long, short = 'x')]
        one_file_system: bool,

        /// Put access times back after reading files.
        #[arg(long, short = 'a')]
        preserve_atime: bool,

        /// Skip paths matching a regular expression. Repeatable.
        #[arg(long, short = 'X', value_name = "PATTERN")]
        exclude: Vec<String>,

        /// Write the index in place instead of committing via rename.
        #[arg(long, short = 'O')]
        overwrite: bool,

        /// Hint file used to skip re-hashing unchanged files.
        #[arg(long, value_name = "FILE")]
        hints: Option<PathBuf>,
    },

    /// Recreate a snapshot under ROOT from INDEX and the repository.
    Restore {
        #[command(flatten)]
        common: CommonArgs,

        /// Index file to restore from.
        #[arg(long, short = 'I', value_name = "FILE")]
        index: PathBuf,

        /// Directory to restore into.
        #[arg(long, short = 'F', value_name = "DIR")]
        root: PathBuf,

        /// Don't restore ownership or permission bits.
        #[arg(long, short = 'P')]
        no_permissions: bool,
    },

    /// Re-hash every blob INDEX references and report mismatches.
    Verify {
        #[command(flatten)]
        common: CommonArgs,

        /// Index file to verify.
        #[arg(long, short = 'I', value_name = "FILE")]
        index: PathBuf,

        /// Delete blobs whose bytes don't hash to their name.
        #[arg(long, short = 'B')]
        detect_bogus: bool,
    },

    /// Delete or list blobs no longer referenced by any of the INDEXes.
    Cleanup {
        #[command(flatten)]
        common: CommonArgs,

        /// Delete obsolete blobs instead of printing their paths.
        #[arg(long, short = 'd')]
        delete: bool,

        /// Also treat blobs whose bytes don't hash to their name as obsolete.
        #[arg(long, short = 'B')]
        detect_bogus: bool,

        /// Index files still in use.
        #[arg(required = true, value_name = "INDEX")]
        indexes: Vec<PathBuf>,
    },
}

/// Flags shared by every operation.
#[derive(Args, Clone)]
pub struct CommonArgs {
    /// Repository directory.
    #[arg(long, short = 'R', value_name = "DIR")]
    pub repo: Option<PathBuf>,

    /// Reach the repository over sftp on this host.
    #[arg(long, short = 's', value_name = "USER@HOST")]
    pub sftp: Option<String>,

    /// Remote sftp server binary, instead of the sftp subsystem.
    #[arg(long, short = 'S', value_name = "PATH")]
    pub sftp_server: Option<String>,

    /// Verbose output.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}
