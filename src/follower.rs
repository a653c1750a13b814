use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info};

use crate::reconcile;
use crate::scheduler::join_with_timeout;

const POLL: Duration = Duration::from_millis(50);
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Single recursive observer on ground. Raw events buffer into a pending set;
/// a strictly one-shot debounce timer, armed by the first buffered path and
/// re-armed only after a drain, dispatches each accumulated path to the
/// per-path reconciler. Editor save cycles collapse into one reconcile.
pub struct ChangeFollower {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeFollower {
    /// `running` gates dispatch: pending paths are dropped on the floor when
    /// the engine is no longer running by the time the timer fires.
    pub fn spawn(
        ground: Utf8PathBuf,
        mirrors: Vec<Utf8PathBuf>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();

        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(ground.as_std_path(), RecursiveMode::Recursive)?;
        info!(ground = %ground, "change follower started");

        let handle = thread::spawn(move || {
            // Keep the watcher alive on this thread; dropping it unregisters
            // the OS watches.
            let _watcher = watcher;
            follow(&ground, &mirrors, &rx, &stop_thread, &running);
        });

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self, join_limit: Duration) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            join_with_timeout(handle, join_limit, "change follower");
        }
    }
}

fn follow(
    ground: &Utf8Path,
    mirrors: &[Utf8PathBuf],
    rx: &mpsc::Receiver<Result<Event, notify::Error>>,
    stop: &AtomicBool,
    running: &Arc<AtomicBool>,
) {
    let mut pending: HashSet<PathBuf> = HashSet::new();
    let mut deadline: Option<Instant> = None;

    while !stop.load(Ordering::SeqCst) {
        let timeout = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).min(POLL),
            None => POLL,
        };
        match rx.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                if relevant(&event) {
                    // Moves carry both endpoints in `paths`.
                    pending.extend(event.paths.iter().cloned());
                    if deadline.is_none() && !pending.is_empty() {
                        deadline = Some(Instant::now() + DEBOUNCE);
                    }
                }
            }
            Ok(Err(_)) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if let Some(d) = deadline {
            if Instant::now() >= d {
                deadline = None;
                let drained: Vec<PathBuf> = pending.drain().collect();
                if !running.load(Ordering::SeqCst) {
                    continue;
                }
                debug!(count = drained.len(), "debounce drained");
                for path in drained {
                    if stop.load(Ordering::SeqCst) {
                        return;
                    }
                    let changed = match Utf8PathBuf::from_path_buf(path) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    reconcile::sync_path(ground, mirrors, &changed, stop);
                }
            }
        }
    }
}

/// Created, modified, deleted and moved events matter; metadata-only churn on
/// directories does not.
fn relevant(event: &Event) -> bool {
    match event.kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(_) => !event.paths.iter().all(|p| p.is_dir()),
        _ => false,
    }
}
