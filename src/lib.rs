//! Casnap: content-addressed backup of directory trees.
//!
//! A snapshot is a textual index file listing every entry with its metadata
//! plus a shared repository in which the contents of large regular files are
//! stored once per distinct SHA-1. Snapshots of overlapping trees share
//! blobs. The repository can live on the local filesystem or behind a
//! pipelined SFTP connection; the engines don't know the difference.

pub mod codec;
pub mod engine;
pub mod exclude;
pub mod fs;
pub mod index;
pub mod types;
pub mod utils;

/// Re-export types for API
pub use types::{Context, Opts, Stats};
