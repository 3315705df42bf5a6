//! Filesystem search capability consumed by the request handlers.

use std::path::PathBuf;

/// One file under the shared root that matched a query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Match {
    /// Root-relative path with `/` separators and a leading `/`, as reported to peers.
    pub logical: String,
    /// Where the file actually lives, for serving it.
    pub absolute: PathBuf,
}

/// Substring search over the shared tree. Implementations never look above their root.
pub trait MatchFinder: Send + Sync {
    fn find_matches(&self, query: &str) -> Vec<Match>;
}
