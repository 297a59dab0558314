//! Event-driven raw source backed by native filesystem notifications.
use super::rules::{relative, watchable_dirs, WatchRule};
use super::{RawChange, RawEvent, WatcherError};
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// Subscribes to each allowed directory individually so excluded trees
/// never cost a watch descriptor, and keeps the subscription set in step
/// with directories being created and removed.
pub(crate) struct NotifySource {
    watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    root: PathBuf,
    rule: WatchRule,
    show_watched: bool,
    watched: HashSet<PathBuf>,
    pending: VecDeque<RawEvent>,
}

impl NotifySource {
    pub(crate) fn new(root: &Path, rule: WatchRule, show_watched: bool) -> Result<Self, WatcherError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(WatcherError::Init)?;

        let mut source = Self {
            watcher,
            rx,
            root: root.to_path_buf(),
            rule,
            show_watched,
            watched: HashSet::new(),
            pending: VecDeque::new(),
        };
        for dir in watchable_dirs(root, &source.rule) {
            source.subscribe(&dir)?;
        }
        tracing::info!(
            root = %root.display(),
            dirs = source.watched.len(),
            "watching for changes"
        );
        Ok(source)
    }

    fn subscribe(&mut self, dir: &Path) -> Result<(), WatcherError> {
        if self.watched.contains(dir) {
            return Ok(());
        }
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch {
                path: dir.to_path_buf(),
                source: e,
            })?;
        if self.show_watched {
            tracing::info!(dir = %dir.display(), "watching dir");
        } else {
            tracing::debug!(dir = %dir.display(), "watching dir");
        }
        self.watched.insert(dir.to_path_buf());
        Ok(())
    }

    fn unsubscribe(&mut self, dir: &Path) {
        let gone: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|watched| watched.starts_with(dir))
            .cloned()
            .collect();
        for watched in gone {
            // The OS usually dropped the watch already when the directory went away.
            let _ = self.watcher.unwatch(&watched);
            self.watched.remove(&watched);
            tracing::debug!(dir = %watched.display(), "stopped watching dir");
        }
    }

    /// Next raw event, or `None` once the notification channel closes.
    ///
    /// Cancel-safe: translated events are queued before being handed out.
    pub(crate) async fn next(&mut self) -> Option<Result<RawEvent, WatcherError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            match self.rx.recv().await? {
                Ok(event) => {
                    if let Err(e) = self.absorb(event) {
                        return Some(Err(e));
                    }
                }
                Err(e) => return Some(Err(WatcherError::Source(e))),
            }
        }
    }

    fn absorb(&mut self, event: Event) -> Result<(), WatcherError> {
        if event.need_rescan() {
            return self.rescan();
        }
        let kind = match event.kind {
            EventKind::Create(_) => RawChange::Created,
            // chmod and friends
            EventKind::Modify(ModifyKind::Metadata(_)) => return Ok(()),
            EventKind::Modify(_) | EventKind::Any => RawChange::Modified,
            EventKind::Remove(_) => RawChange::Removed,
            EventKind::Access(_) | EventKind::Other => return Ok(()),
        };

        for path in event.paths {
            match kind {
                RawChange::Created | RawChange::Modified if path.is_dir() => {
                    self.adopt_dir(&path)?;
                }
                RawChange::Removed | RawChange::Modified if !path.exists() => {
                    self.unsubscribe(&path);
                }
                _ => {}
            }
            self.pending.push_back(RawEvent { path, kind });
        }
        Ok(())
    }

    /// The backend dropped events (e.g. inotify queue overflow). Bring the
    /// subscriptions back in line with the tree and report a change that
    /// no single path accounts for.
    fn rescan(&mut self) -> Result<(), WatcherError> {
        tracing::warn!(root = %self.root.display(), "file events were lost, rescanning");
        let vanished: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|dir| !dir.exists())
            .cloned()
            .collect();
        for dir in vanished {
            self.unsubscribe(&dir);
        }
        for dir in watchable_dirs(&self.root, &self.rule) {
            if let Err(e) = self.subscribe(&dir) {
                if dir.exists() {
                    return Err(e);
                }
            }
        }
        self.pending.push_back(RawEvent {
            path: self.root.clone(),
            kind: RawChange::Rescan,
        });
        Ok(())
    }

    /// Watch a directory that appeared under the root, and report the files
    /// it already holds: they were written before the subscription existed.
    fn adopt_dir(&mut self, dir: &Path) -> Result<(), WatcherError> {
        if !self.rule.allows_dir(relative(&self.root, dir)) {
            return Ok(());
        }
        for sub in watchable_dirs(dir, &self.rule) {
            if !self.rule.allows_dir(relative(&self.root, &sub)) {
                continue;
            }
            if let Err(e) = self.subscribe(&sub) {
                // Short-lived directories may vanish before we get to them.
                if sub.exists() {
                    return Err(e);
                }
            }
        }
        let files = WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path());
        for path in files {
            self.pending.push_back(RawEvent {
                path,
                kind: RawChange::Created,
            });
        }
        Ok(())
    }
}
