//! Exclusion patterns applied to repository-relative paths during backup.

use regex::bytes::Regex;

/// Ordered list of compiled exclusion patterns. A path is excluded when any
/// pattern matches anywhere in it; `$` anchors to the very end of the path.
#[derive(Debug, Default)]
pub struct Exclusions {
    patterns: Vec<Regex>,
}

impl Exclusions {
    pub fn add(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.patterns.push(Regex::new(pattern)?);
        Ok(())
    }

    pub fn excluded(&self, path: &[u8]) -> bool {
        self.patterns.iter().any(|re| re.is_match(path))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
