//! Polling raw source: rescan the tree on an interval and compare
//! modification times against a high-water mark. Works where native
//! notifications do not (network mounts, some container volumes).
use super::rules::{relative, WatchRule};
use super::{RawChange, RawEvent, WatcherError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use walkdir::WalkDir;

pub(crate) struct PollSource {
    rx: mpsc::UnboundedReceiver<Result<RawEvent, WatcherError>>,
}

impl PollSource {
    /// Take the baseline scan now, then rescan every `interval` on a
    /// dedicated thread until the source is dropped.
    pub(crate) fn spawn(
        root: &Path,
        rule: WatchRule,
        interval: Duration,
        show_watched: bool,
    ) -> Result<Self, WatcherError> {
        let started = SystemTime::now();
        let mut snapshot = Snapshot::baseline(scan(root, &rule)?, started);
        if show_watched {
            for path in snapshot.files.keys() {
                tracing::info!(file = %path.display(), "watching file");
            }
        }
        tracing::info!(
            root = %root.display(),
            files = snapshot.files.len(),
            interval_ms = interval.as_millis() as u64,
            "polling for changes"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let thread_root = root.to_path_buf();
        std::thread::Builder::new()
            .name("reforge-poll".to_string())
            .spawn(move || loop {
                std::thread::sleep(interval);
                if tx.is_closed() {
                    return;
                }
                match scan(&thread_root, &rule) {
                    Ok(files) => {
                        for event in snapshot.advance(files) {
                            if tx.send(Ok(event)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            })
            .map_err(|e| WatcherError::Scan {
                path: root.to_path_buf(),
                source: e,
            })?;

        Ok(Self { rx })
    }

    pub(crate) async fn next(&mut self) -> Option<Result<RawEvent, WatcherError>> {
        self.rx.recv().await
    }
}

/// Matching files and their modification times.
fn scan(root: &Path, rule: &WatchRule) -> Result<HashMap<PathBuf, SystemTime>, WatcherError> {
    let mut files = HashMap::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || rule.allows_dir(relative(root, entry.path()))
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(WatcherError::Scan {
                    path: root.to_path_buf(),
                    source: e.into(),
                });
            }
            // Files can vanish mid-walk.
            Err(_) => continue,
        };
        if !entry.file_type().is_file() || !rule.matches(relative(root, entry.path())) {
            continue;
        }
        if let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) {
            files.insert(entry.into_path(), modified);
        }
    }
    Ok(files)
}

/// Last scan plus the newest modification time accounted for.
#[derive(Debug)]
struct Snapshot {
    files: HashMap<PathBuf, SystemTime>,
    high_water: SystemTime,
}

impl Snapshot {
    fn baseline(files: HashMap<PathBuf, SystemTime>, now: SystemTime) -> Self {
        let newest = files.values().copied().max().unwrap_or(now);
        Self {
            files,
            high_water: newest.max(now),
        }
    }

    /// Diff a fresh scan against the snapshot and take it as the new one.
    fn advance(&mut self, files: HashMap<PathBuf, SystemTime>) -> Vec<RawEvent> {
        let mut events = Vec::new();
        for (path, modified) in &files {
            let kind = if !self.files.contains_key(path) {
                RawChange::Created
            } else if *modified > self.high_water {
                RawChange::Modified
            } else {
                continue;
            };
            events.push(RawEvent {
                path: path.clone(),
                kind,
            });
        }
        for path in self.files.keys() {
            if !files.contains_key(path) {
                events.push(RawEvent {
                    path: path.clone(),
                    kind: RawChange::Removed,
                });
            }
        }

        if let Some(newest) = files.values().copied().max() {
            self.high_water = self.high_water.max(newest);
        }
        self.files = files;
        events
    }
}
