//! Substring search over the shared tree.

use std::path::{Path, PathBuf};

use treeshare_core::{Match, MatchFinder};
use walkdir::WalkDir;

/// Walks `root` on every query. Symlinks are not followed, so nothing outside the
/// root is ever reported or served.
pub struct TreeFinder {
    root: PathBuf,
}

impl TreeFinder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `/`-separated root-relative path with a leading `/`.
    fn logical(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut out = String::new();
        for part in rel.components() {
            out.push('/');
            out.push_str(&part.as_os_str().to_string_lossy());
        }
        Some(out)
    }
}

impl MatchFinder for TreeFinder {
    fn find_matches(&self, query: &str) -> Vec<Match> {
        if query.is_empty() {
            return Vec::new();
        }
        let mut found: Vec<Match> = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let logical = self.logical(e.path())?;
                logical.contains(query).then(|| Match {
                    logical,
                    absolute: e.into_path(),
                })
            })
            .collect();
        found.sort();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("reports/2023")).unwrap();
        fs::create_dir_all(root.join("music")).unwrap();
        fs::write(root.join("reports/old.txt"), b"old").unwrap();
        fs::write(root.join("reports/2023/q4.txt"), b"q4").unwrap();
        fs::write(root.join("music/song.mp3"), b"la").unwrap();
        dir
    }

    fn logical(found: &[Match]) -> Vec<&str> {
        found.iter().map(|m| m.logical.as_str()).collect()
    }

    #[test]
    fn matches_anywhere_in_relative_path() {
        let dir = tree();
        let finder = TreeFinder::new(dir.path());
        assert_eq!(
            logical(&finder.find_matches("report")),
            ["/reports/2023/q4.txt", "/reports/old.txt"]
        );
        let one = finder.find_matches("song");
        assert_eq!(logical(&one), ["/music/song.mp3"]);
        assert_eq!(one[0].absolute, dir.path().join("music/song.mp3"));
    }

    #[test]
    fn directories_alone_do_not_match() {
        let dir = tree();
        assert!(TreeFinder::new(dir.path()).find_matches("2023/").len() == 1);
        assert!(TreeFinder::new(dir.path()).find_matches("music/").len() == 1);
        fs::create_dir_all(dir.path().join("empty_dir")).unwrap();
        assert!(TreeFinder::new(dir.path()).find_matches("empty").is_empty());
    }

    #[test]
    fn no_match_and_missing_root_are_empty() {
        let dir = tree();
        assert!(TreeFinder::new(dir.path()).find_matches("zzz").is_empty());
        assert!(TreeFinder::new(dir.path()).find_matches("").is_empty());
        assert!(TreeFinder::new(dir.path().join("nope"))
            .find_matches("old")
            .is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_out_of_root_are_ignored() {
        let dir = tree();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), b"s").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("secret-link.txt"),
        )
        .unwrap();
        assert!(TreeFinder::new(dir.path()).find_matches("secret").is_empty());
    }
}
