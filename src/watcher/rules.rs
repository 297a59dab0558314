//! Which paths count as source changes.
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Extension and exclusion filter applied to every raw event.
///
/// Paths are judged relative to the watch root: hidden components and
/// excluded directories anywhere along the way disqualify a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRule {
    extensions: BTreeSet<String>,
    excluded: BTreeSet<PathBuf>,
}

impl WatchRule {
    pub fn new(extensions: &[String], excluded: &[String]) -> Self {
        let excluded = excluded
            .iter()
            .map(|entry| entry.trim().trim_start_matches("./").trim_end_matches('/'))
            .filter(|entry| !entry.is_empty())
            .map(PathBuf::from)
            .collect();
        Self {
            extensions: normalize_extensions(extensions),
            excluded,
        }
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }

    /// Whether a file (relative to the root) should trigger a rebuild.
    pub fn matches(&self, relative: &Path) -> bool {
        let Some(name) = relative.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
            && !is_hidden(relative)
            && !self.is_excluded(relative)
    }

    /// Whether a directory (relative to the root) should be watched.
    pub fn allows_dir(&self, relative: &Path) -> bool {
        !is_hidden(relative) && !self.is_excluded(relative)
    }

    /// An excluded entry without a separator matches any component with
    /// that name; one with a separator matches that subtree of the root.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        self.excluded.iter().any(|entry| {
            if entry.components().count() > 1 {
                relative.starts_with(entry)
            } else {
                relative
                    .components()
                    .any(|c| c.as_os_str() == entry.as_os_str())
            }
        })
    }
}

/// Split `.go|.html` style entries, add missing dots, drop blanks.
pub fn normalize_extensions(extensions: &[String]) -> BTreeSet<String> {
    extensions
        .iter()
        .flat_map(|entry| entry.split(['|', ',']))
        .map(str::trim)
        .filter(|ext| !ext.is_empty() && *ext != ".")
        .map(|ext| {
            if ext.starts_with('.') {
                ext.to_string()
            } else {
                format!(".{ext}")
            }
        })
        .collect()
}

fn is_hidden(relative: &Path) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(name) => name.to_str().is_some_and(|n| n.starts_with('.')),
        _ => false,
    })
}

/// `path` relative to `root`; unrelated paths are returned unchanged.
pub fn relative<'a>(root: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}

/// The root plus every directory beneath it the rule allows.
pub fn watchable_dirs(root: &Path, rule: &WatchRule) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || rule.allows_dir(relative(root, entry.path()))
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect()
}
