//! Engine module: the four operations plus hashing and hint support.

pub mod arg_parser;
pub mod backup;
pub mod cleanup;
pub mod handlers;
pub mod hashing;
pub mod hints;
pub mod restore;
pub mod verify;

// Re-export commonly used items
pub use arg_parser::{Cli, Commands, CommonArgs};
pub use handlers::{handle_backup, handle_cleanup, handle_restore, handle_verify};
pub use hashing::{HashSet, hash_bytes, hash_file};
