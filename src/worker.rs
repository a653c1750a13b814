use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::bus::EventBus;
use crate::events::{EngineEvent, MirrorState};
use crate::lock;
use crate::reconcile;
use crate::retention;
use crate::scheduler::SnapshotClock;
use crate::store;

/// One-shot full reconciliation of a (ground, mirror) pair. The engine runs
/// one of these per mirror on its own thread; the cancel token is polled
/// between file-level iterations.
pub struct MirrorWorker {
    ground: Utf8PathBuf,
    mirror: Utf8PathBuf,
    bus: EventBus,
    cancel: Arc<AtomicBool>,
    pub create_snapshot: bool,
    pub retention_seconds: Option<u64>,
    pub clock: Option<Arc<SnapshotClock>>,
}

impl MirrorWorker {
    pub fn new(ground: Utf8PathBuf, mirror: Utf8PathBuf, bus: EventBus) -> Self {
        Self {
            ground,
            mirror,
            bus,
            cancel: Arc::new(AtomicBool::new(false)),
            create_snapshot: false,
            retention_seconds: None,
            clock: None,
        }
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn mirror(&self) -> &Utf8Path {
        &self.mirror
    }

    /// Full sweep, then optionally a terminal snapshot and retention. Errors
    /// never escape: they surface as an `ERROR:` status for this mirror and
    /// other mirrors proceed.
    pub fn run(&self) {
        info!(mirror = %self.mirror, "mirror sync started");
        self.publish_state(MirrorState::Syncing);

        match self.sync_full() {
            Ok(true) => {
                if self.create_snapshot {
                    if let Err(e) = self.snapshot_and_retain() {
                        warn!(mirror = %self.mirror, error = %e, "terminal snapshot failed");
                    }
                }
                self.publish_state(MirrorState::Synced);
                info!(mirror = %self.mirror, "mirror sync completed");
            }
            Ok(false) => {
                self.publish_state(MirrorState::Synced);
                info!(mirror = %self.mirror, "mirror sync stopped");
            }
            Err(e) => {
                self.publish_state(MirrorState::Error(e.to_string()));
                error!(mirror = %self.mirror, error = %e, "mirror sync error");
            }
        }
    }

    /// Returns `Ok(false)` when the cancel token interrupted the sweep.
    fn sync_full(&self) -> Result<bool> {
        let current = store::current_root(&self.mirror);
        fs::create_dir_all(current.as_std_path())
            .with_context(|| format!("create replica root {current}"))?;

        let mut src_dirs = Vec::new();
        let mut src_files = Vec::new();
        for entry in WalkDir::new(self.ground.as_std_path()) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(ground = %self.ground, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let path = match Utf8Path::from_path(entry.path()) {
                Some(p) => p.to_owned(),
                None => continue,
            };
            if entry.file_type().is_dir() {
                src_dirs.push(path);
            } else if entry.file_type().is_file() {
                src_files.push(path);
            }
        }

        // Materialize every directory so empty ones round-trip.
        for dir in &src_dirs {
            if self.cancelled() {
                return Ok(false);
            }
            let rel = dir.strip_prefix(&self.ground)?;
            fs::create_dir_all(current.join(rel).as_std_path())
                .with_context(|| format!("create directory {rel}"))?;
        }

        let total = src_files.len();
        let mut processed = 0usize;
        let mut last_percent = None;
        for src in &src_files {
            if self.cancelled() {
                return Ok(false);
            }
            let rel = src.strip_prefix(&self.ground)?.to_owned();
            let guard = match lock::wait_acquire(&self.mirror, &rel, &self.cancel) {
                Ok(g) => g,
                Err(_) => return Ok(false),
            };
            if let Err(e) = reconcile::reconcile_file(&self.mirror, &rel, src) {
                warn!(mirror = %self.mirror, rel = %rel, error = %e, "skipping file");
            }
            drop(guard);

            processed += 1;
            let percent = (processed * 100 / total).min(99) as u8;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                self.bus.publish(EngineEvent::Progress {
                    mirror: self.mirror.clone(),
                    percent,
                });
            }
        }

        // Orphaned files: the ground counterpart is gone, so preserve the
        // bytes as a version and drop the replica entry.
        for entry in WalkDir::new(current.as_std_path()) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if self.cancelled() {
                return Ok(false);
            }
            let path = match Utf8Path::from_path(entry.path()) {
                Some(p) => p.to_owned(),
                None => continue,
            };
            let rel = path.strip_prefix(&current)?.to_owned();
            if self.ground.join(&rel).exists() {
                continue;
            }
            let guard = match lock::wait_acquire(&self.mirror, &rel, &self.cancel) {
                Ok(g) => g,
                Err(_) => return Ok(false),
            };
            if let Err(e) = reconcile::remove_stale(&self.mirror, &rel) {
                warn!(mirror = %self.mirror, rel = %rel, error = %e, "orphan removal failed");
            }
            drop(guard);
        }

        // Orphaned directories, deepest first.
        for entry in WalkDir::new(current.as_std_path())
            .min_depth(1)
            .contents_first(true)
        {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            if self.cancelled() {
                return Ok(false);
            }
            let path = match Utf8Path::from_path(entry.path()) {
                Some(p) => p.to_owned(),
                None => continue,
            };
            let rel = path.strip_prefix(&current)?;
            if !self.ground.join(rel).exists() {
                let _ = fs::remove_dir_all(path.as_std_path());
            }
        }

        self.bus.publish(EngineEvent::Progress {
            mirror: self.mirror.clone(),
            percent: 100,
        });
        Ok(true)
    }

    fn snapshot_and_retain(&self) -> Result<()> {
        if let Some(ts) = store::snapshot::maybe_commit(&self.mirror)? {
            if let Some(clock) = &self.clock {
                clock.advance(ts);
            }
            self.bus.publish(EngineEvent::SnapshotCommitted {
                mirror: self.mirror.clone(),
                committed_at: ts,
            });
        }
        if let Some(secs) = self.retention_seconds {
            retention::apply_retention(&self.mirror, secs);
        }
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn publish_state(&self, state: MirrorState) {
        self.bus.publish(EngineEvent::MirrorStatus {
            mirror: self.mirror.clone(),
            state,
        });
    }
}
