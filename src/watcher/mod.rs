//! Change detection: turn raw filesystem activity under the watch root into
//! coalesced "rebuild now" signals.
//!
//! Either raw source (native notifications or polling) feeds the same
//! filter and quiet-window debounce, which run on one background task and
//! hand signals to the orchestrator through a single-slot channel.
pub mod debounce;
mod events;
mod poll;
pub mod rules;

use crate::config::{WatchConfig, WatchStrategy};
use debounce::Debouncer;
use events::NotifySource;
use poll::PollSource;
use rules::{relative, WatchRule};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// "At least one watched path changed since the last signal."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawChange {
    Created,
    Modified,
    Removed,
    /// Events were lost; something under the root changed.
    Rescan,
}

/// A single notification from a raw source, before filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawChange,
}

/// Failures of the underlying event source. Each one ends the detector.
#[derive(Debug)]
pub enum WatcherError {
    /// The native watcher could not be created.
    Init(notify::Error),
    /// A directory could not be subscribed.
    Watch {
        path: PathBuf,
        source: notify::Error,
    },
    /// The native watcher reported an error (e.g. watch limit reached).
    Source(notify::Error),
    /// The tree could not be scanned.
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The detector stopped without reporting why.
    Closed,
}

impl std::fmt::Display for WatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatcherError::Init(e) => write!(f, "failed to create file watcher: {e}"),
            WatcherError::Watch { path, source } => {
                write!(f, "failed to watch {}: {}", path.display(), source)
            }
            WatcherError::Source(e) => write!(f, "file watcher error: {e}"),
            WatcherError::Scan { path, source } => {
                write!(f, "failed to scan {}: {}", path.display(), source)
            }
            WatcherError::Closed => write!(f, "file watcher stopped"),
        }
    }
}

impl std::error::Error for WatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherError::Init(e) => Some(e),
            WatcherError::Watch { source, .. } => Some(source),
            WatcherError::Source(e) => Some(e),
            WatcherError::Scan { source, .. } => Some(source),
            WatcherError::Closed => None,
        }
    }
}

/// Consumer end of the detector.
pub struct ChangeStream {
    rx: mpsc::Receiver<Result<ChangeSignal, WatcherError>>,
}

impl ChangeStream {
    pub(crate) fn new(rx: mpsc::Receiver<Result<ChangeSignal, WatcherError>>) -> Self {
        Self { rx }
    }

    /// Wait for the next coalesced change. Cancel-safe.
    pub async fn next(&mut self) -> Result<ChangeSignal, WatcherError> {
        self.rx.recv().await.unwrap_or(Err(WatcherError::Closed))
    }
}

enum RawSource {
    Notify(NotifySource),
    Poll(PollSource),
}

impl RawSource {
    async fn next(&mut self) -> Option<Result<RawEvent, WatcherError>> {
        match self {
            RawSource::Notify(source) => source.next().await,
            RawSource::Poll(source) => source.next().await,
        }
    }
}

/// Handle to the running detector task. Dropping it stops detection.
pub struct ChangeDetector {
    task: JoinHandle<()>,
}

impl ChangeDetector {
    /// Subscribe to the tree with the configured strategy and start
    /// emitting signals.
    pub fn spawn(config: &WatchConfig) -> Result<(Self, ChangeStream), WatcherError> {
        let root = config
            .root
            .canonicalize()
            .map_err(|e| WatcherError::Scan {
                path: config.root.clone(),
                source: e,
            })?;
        let rule = WatchRule::new(&config.extensions, &config.exclude_dirs);
        tracing::debug!(
            extensions = ?rule.extensions().collect::<Vec<_>>(),
            exclude = ?config.exclude_dirs,
            strategy = ?config.strategy,
            "starting change detector"
        );

        let source = match config.strategy {
            WatchStrategy::Notify => RawSource::Notify(NotifySource::new(
                &root,
                rule.clone(),
                config.show_watched_files,
            )?),
            WatchStrategy::Poll => RawSource::Poll(PollSource::spawn(
                &root,
                rule.clone(),
                config.poll_interval(),
                config.show_watched_files,
            )?),
        };

        // One slot: a pending signal already covers any later change.
        let (tx, rx) = mpsc::channel(1);
        let debouncer = Debouncer::new(config.delay());
        let task = tokio::spawn(detect(source, root, rule, debouncer, tx));
        Ok((Self { task }, ChangeStream::new(rx)))
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn detect(
    mut source: RawSource,
    root: PathBuf,
    rule: WatchRule,
    mut debouncer: Debouncer,
    tx: mpsc::Sender<Result<ChangeSignal, WatcherError>>,
) {
    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            event = source.next() => match event {
                Some(Ok(event)) => {
                    if qualifies(&root, &rule, &event) {
                        tracing::info!(path = %event.path.display(), kind = ?event.kind, "file changed");
                        debouncer.record(Instant::now());
                    } else {
                        tracing::trace!(path = %event.path.display(), "ignored change");
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "change detection failed");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                None => {
                    let _ = tx.send(Err(WatcherError::Closed)).await;
                    return;
                }
            },
            _ = sleep_until(deadline) => {
                if debouncer.poll(Instant::now()) {
                    match tx.try_send(Ok(ChangeSignal)) {
                        Ok(()) => tracing::debug!("change signal emitted"),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::debug!("change signal already pending");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
            }
        }
    }
}

fn qualifies(root: &Path, rule: &WatchRule, event: &RawEvent) -> bool {
    event.kind == RawChange::Rescan || rule.matches(relative(root, &event.path))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
