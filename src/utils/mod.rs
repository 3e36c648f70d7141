pub mod config;
pub mod logger;
pub mod rcfile;

pub use config::*;
pub use logger::setup_logging;
pub(crate) use rcfile::{apply_rcfile_to_opts, load_rcfile};
