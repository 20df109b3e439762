use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One regular file found under the index root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Forward-slash separated, relative to the index root.
    pub relative_path: String,
    pub size: u64,
    pub modified: SystemTime,
}

impl FileEntry {
    /// Local calendar date of the modification time, `YYYY-MM-DD`.
    pub fn date(&self) -> String {
        DateTime::<Local>::from(self.modified)
            .format("%Y-%m-%d")
            .to_string()
    }
}

/// Files discovered by a single walk of the root directory.
///
/// The 1-based position of an entry is its id. The index is never rebuilt
/// or mutated after [`FileIndex::build`], so ids stay stable for the life of
/// the process.
#[derive(Debug, Clone)]
pub struct FileIndex {
    root: PathBuf,
    entries: Vec<FileEntry>,
}

impl FileIndex {
    /// Walks `root` depth-first in directory-listing order.
    ///
    /// Only regular files become entries. Symlinks are followed; a link that
    /// loops back to an ancestor and any directory that cannot be read are
    /// skipped without aborting the walk.
    pub fn build(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut entries = Vec::new();

        for item in WalkDir::new(&root).follow_links(true).min_depth(1) {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    if e.loop_ancestor().is_some() {
                        warn!(error = %e, "skipping symlink loop");
                    } else {
                        warn!(error = %e, "skipping unreadable entry");
                    }
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "cannot stat file");
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let Some(relative_path) = to_slash_path(relative) else {
                warn!(path = %entry.path().display(), "skipping non UTF-8 file name");
                continue;
            };
            debug!(path = %relative_path, size = metadata.len(), "indexed");
            entries.push(FileEntry {
                relative_path,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        FileIndex { root, entries }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry by its 1-based id.
    pub fn get(&self, id: u64) -> Option<&FileEntry> {
        let position = usize::try_from(id).ok()?.checked_sub(1)?;
        self.entries.get(position)
    }

    /// Absolute location of an entry on disk.
    pub fn full_path(&self, entry: &FileEntry) -> PathBuf {
        self.root.join(&entry.relative_path)
    }

    /// All entries whose relative path matches, in id order.
    pub fn find<'a, 'p>(
        &'a self,
        pattern: &'p Pattern,
    ) -> impl Iterator<Item = (u64, &'a FileEntry)> + use<'a, 'p> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (i as u64 + 1, entry))
            .filter(move |(_, entry)| pattern.matches(&entry.relative_path))
    }

    #[cfg(test)]
    fn from_entries(root: impl Into<PathBuf>, entries: Vec<FileEntry>) -> Self {
        FileIndex {
            root: root.into(),
            entries,
        }
    }
}

/// `None` when a component is not valid UTF-8; such a name could not be
/// advertised and then reopened.
fn to_slash_path(path: &Path) -> Option<String> {
    let parts = path
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("Missing search pattern")]
    Empty,
    #[error("Multiple wildcards are not supported")]
    MultipleWildcards,
}

/// Search pattern with at most one `*`.
///
/// Without a `*` the pattern must equal the path. With one, the path must
/// start with the text before it and end with the text after it, and be at
/// least as long as both together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Exact(String),
    Wildcard { prefix: String, suffix: String },
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        match pattern.split_once('*') {
            None => Ok(Pattern::Exact(pattern.to_string())),
            Some((_, suffix)) if suffix.contains('*') => Err(PatternError::MultipleWildcards),
            Some((prefix, suffix)) => Ok(Pattern::Wildcard {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            }),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Pattern::Exact(exact) => exact == path,
            Pattern::Wildcard { prefix, suffix } => {
                path.len() >= prefix.len() + suffix.len()
                    && path.starts_with(prefix.as_str())
                    && path.ends_with(suffix.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn matches(pattern: &str, path: &str) -> bool {
        Pattern::parse(pattern).unwrap().matches(path)
    }

    fn sample_tree() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"0123456789").unwrap();
        dir
    }

    #[test]
    fn test_exact_and_wildcard_matching() {
        assert!(matches("*.txt", "a.txt"));
        assert!(!matches("*.txt", "a.md"));
        assert!(matches("report", "report"));
        assert!(!matches("report", "reports"));
        assert!(matches("sub/*", "sub/b.txt"));
        assert!(matches("*", "anything/at/all"));
        assert!(matches("a*", "a"));
    }

    #[test]
    fn test_prefix_and_suffix_may_not_overlap() {
        assert!(!matches("ab*ba", "aba"));
        assert!(matches("ab*ba", "abba"));
        assert!(matches("ab*ba", "ab-ba"));
    }

    #[test]
    fn test_rejects_empty_and_multi_wildcard_patterns() {
        assert_eq!(Pattern::parse(""), Err(PatternError::Empty));
        assert_eq!(Pattern::parse("*a*"), Err(PatternError::MultipleWildcards));
        assert_eq!(Pattern::parse("**"), Err(PatternError::MultipleWildcards));
    }

    #[test]
    fn test_build_lists_only_regular_files() {
        let dir = sample_tree();
        fs::create_dir(dir.path().join("empty")).unwrap();
        let index = FileIndex::build(dir.path());

        assert_eq!(index.len(), 2);
        let mut paths: Vec<_> = index
            .find(&Pattern::parse("*").unwrap())
            .map(|(_, e)| (e.relative_path.clone(), e.size))
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![("a.txt".to_string(), 5), ("sub/b.txt".to_string(), 10)]
        );
    }

    #[test]
    fn test_subdirectory_contents_follow_their_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        fs::write(dir.path().join("x/y/deep.bin"), b"d").unwrap();
        fs::write(dir.path().join("x/near.bin"), b"n").unwrap();
        fs::write(dir.path().join("top.bin"), b"t").unwrap();
        let index = FileIndex::build(dir.path());

        let order: Vec<_> = index
            .find(&Pattern::parse("*").unwrap())
            .map(|(_, e)| e.relative_path.clone())
            .collect();
        let x_files: Vec<_> = order.iter().filter(|p| p.starts_with("x/")).collect();
        assert_eq!(x_files.len(), 2);
        // Everything under x/ is contiguous.
        let first = order.iter().position(|p| p.starts_with("x/")).unwrap();
        assert!(order[first..first + 2].iter().all(|p| p.starts_with("x/")));
    }

    #[test]
    fn test_ids_are_one_based_and_stable() {
        let dir = sample_tree();
        let index = FileIndex::build(dir.path());

        assert!(index.get(0).is_none());
        assert!(index.get(3).is_none());
        let hits: Vec<_> = index.find(&Pattern::parse("*.txt").unwrap()).collect();
        assert_eq!(hits.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 2]);
        for (id, entry) in hits {
            assert_eq!(index.get(id), Some(entry));
        }
    }

    #[test]
    fn test_find_preserves_index_order() {
        let entry = |p: &str| FileEntry {
            relative_path: p.to_string(),
            size: 1,
            modified: SystemTime::UNIX_EPOCH,
        };
        let index = FileIndex::from_entries(
            "/srv",
            vec![entry("z.txt"), entry("m.md"), entry("a.txt")],
        );
        let hits: Vec<_> = index
            .find(&Pattern::parse("*.txt").unwrap())
            .map(|(id, e)| (id, e.relative_path.as_str()))
            .collect();
        assert_eq!(hits, vec![(1, "z.txt"), (3, "a.txt")]);
        assert_eq!(index.full_path(&entry("m.md")), PathBuf::from("/srv/m.md"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_does_not_hang() {
        let dir = sample_tree();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("sub/back")).unwrap();
        let index = FileIndex::build(dir.path());
        assert_eq!(index.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_subdirectory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = sample_tree();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("hidden.txt"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Permission bits do not stop root.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let index = FileIndex::build(dir.path());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.find(&Pattern::parse("locked/*").unwrap()).count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_names_are_not_indexed() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = sample_tree();
        fs::write(dir.path().join(OsStr::from_bytes(b"bad\xff.txt")), b"x").unwrap();
        let index = FileIndex::build(dir.path());

        assert_eq!(index.len(), 2);
        for (_, entry) in index.find(&Pattern::parse("*").unwrap()) {
            assert!(index.full_path(entry).exists());
        }
    }

    #[test]
    fn test_slash_path_joins_components() {
        assert_eq!(to_slash_path(Path::new("a/b/c.txt")).as_deref(), Some("a/b/c.txt"));
    }

    #[test]
    fn test_date_is_calendar_day() {
        let entry = FileEntry {
            relative_path: "x".into(),
            size: 0,
            modified: SystemTime::now(),
        };
        let date = entry.date();
        assert_eq!(date.len(), 10);
        assert_eq!(&date[4..5], "-");
        assert_eq!(&date[7..8], "-");
    }
}
