//! Load `.casnap.toml` from the working directory (CLI only). Flags passed on
//! the command line always win over the file.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::Opts;

#[derive(Debug, Deserialize)]
pub(crate) struct CasnapToml {
    #[serde(default)]
    settings: SettingsSection,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsSection {
    repo: Option<String>,
    sftp: Option<String>,
    sftp_server: Option<String>,
    sftp_posix_rename: Option<bool>,
    exclude: Option<Vec<String>>,
    hints: Option<String>,
    recheck_hash: Option<bool>,
    verbose: Option<bool>,
}

/// Load `.casnap.toml` from `dir` if present. Returns None if file missing or
/// unreadable.
pub(crate) fn load_rcfile(dir: &Path) -> Option<CasnapToml> {
    let path = dir.join(".casnap.toml");
    let s = std::fs::read_to_string(&path).ok()?;
    toml::from_str(&s)
        .map_err(|e| log::warn!("{}: {}", path.display(), e))
        .ok()
}

/// Overwrite opts field from file when present.
macro_rules! apply_file_opt {
    ($section:expr, $opts:expr, $field:ident) => {
        if let Some(v) = $section.$field {
            $opts.$field = v;
        }
    };
}

/// Apply file config to opts (only fields present in the file). Call before
/// applying CLI flags.
pub(crate) fn apply_rcfile_to_opts(file: &CasnapToml, opts: &mut Opts) {
    let s = &file.settings;
    if let Some(ref p) = s.repo {
        opts.repo = Some(PathBuf::from(p));
    }
    if let Some(ref h) = s.sftp {
        opts.sftp = Some(h.clone());
    }
    if let Some(ref p) = s.sftp_server {
        opts.sftp_server = Some(p.clone());
    }
    apply_file_opt!(s, opts, sftp_posix_rename);
    if let Some(ref v) = s.exclude {
        opts.exclude = v.clone();
    }
    if let Some(ref p) = s.hints {
        opts.hints = Some(PathBuf::from(p));
    }
    apply_file_opt!(s, opts, recheck_hash);
    apply_file_opt!(s, opts, verbose);
}
