use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::Utf8PathBuf;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::events::EngineEvent;
use crate::fsutil;
use crate::retention;
use crate::store;

/// Cached time of the last successful snapshot across any mirror. Strictly
/// monotone: an older or equal timestamp is silently rejected. This setter is
/// the only place the cached value changes; on acceptance the persistence
/// hook (if any) tells the config collaborator to write the profile back.
pub struct SnapshotClock {
    last: Mutex<Option<f64>>,
    on_advance: Option<Box<dyn Fn(f64) + Send + Sync>>,
}

impl SnapshotClock {
    pub fn new(initial: Option<f64>) -> Self {
        Self {
            last: Mutex::new(initial),
            on_advance: None,
        }
    }

    pub fn with_hook(initial: Option<f64>, hook: Box<dyn Fn(f64) + Send + Sync>) -> Self {
        Self {
            last: Mutex::new(initial),
            on_advance: Some(hook),
        }
    }

    pub fn get(&self) -> Option<f64> {
        *self.last.lock().unwrap()
    }

    /// Max-merge an on-disk observation without notifying the persistence
    /// hook. Used when the engine reconciles the cached value against the
    /// newest snapshot mtime at start.
    pub fn seed(&self, ts: f64) {
        let mut last = self.last.lock().unwrap();
        if last.map_or(true, |cur| ts > cur) {
            *last = Some(ts);
        }
    }

    pub fn advance(&self, ts: f64) -> bool {
        {
            let mut last = self.last.lock().unwrap();
            if last.map_or(false, |cur| ts <= cur) {
                return false;
            }
            *last = Some(ts);
        }
        if let Some(hook) = &self.on_advance {
            hook(ts);
        }
        true
    }
}

/// Next wall-clock boundary: an exact multiple of the interval past the last
/// snapshot, or right now when no snapshot has ever been taken.
pub fn next_boundary(last: Option<f64>, interval: u64, now: f64) -> f64 {
    match last {
        None => now,
        Some(last) => {
            let intervals_passed = ((now - last) / interval as f64).floor();
            last + (intervals_passed + 1.0) * interval as f64
        }
    }
}

pub fn fmt_span(seconds: u64) -> String {
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let minutes = minutes % 60;
    let days = hours / 24;
    let hours = hours % 24;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// Human age/next-due string shown by the front end.
pub fn status_line(last: Option<f64>, interval: u64, now: f64) -> String {
    let last = match last {
        Some(ts) => ts,
        None => return "Waiting for first snapshot".to_string(),
    };
    let age = (now - last).max(0.0) as u64;
    let next_in = (next_boundary(Some(last), interval, now) - now).max(0.0) as u64;
    let age_text = if age < 60 {
        "Just Now".to_string()
    } else {
        format!("{} ago", fmt_span(age))
    };
    format!("{age_text} (next in {})", fmt_span(next_in))
}

pub fn stopped_line(last: Option<f64>, now: f64) -> String {
    match last {
        None => "stopped".to_string(),
        Some(ts) => {
            let age = (now - ts).max(0.0) as u64;
            let mins = age / 60;
            let hours = mins / 60;
            let mins = mins % 60;
            format!("stopped (last: {hours}h {mins}m ago)")
        }
    }
}

/// Long-lived loop that wakes on interval boundaries (or an explicit nudge),
/// asks each mirror to record a snapshot, and runs retention.
pub struct Scheduler {
    pub mirrors: Vec<Utf8PathBuf>,
    pub interval: u64,
    pub retention_seconds: Option<u64>,
    pub clock: Arc<SnapshotClock>,
    pub bus: EventBus,
}

pub struct SchedulerHandle {
    stop: Arc<AtomicBool>,
    wake: Sender<()>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Evaluate the next snapshot opportunity immediately instead of waiting
    /// out the current interval.
    pub fn nudge(&self) {
        let _ = self.wake.try_send(());
    }

    pub fn stop(self, join_limit: Duration) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(());
        join_with_timeout(self.handle, join_limit, "snapshot scheduler");
    }
}

pub(crate) fn join_with_timeout(handle: JoinHandle<()>, limit: Duration, what: &str) {
    let deadline = std::time::Instant::now() + limit;
    while !handle.is_finished() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(25));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        warn!("{what} did not stop in time, detaching");
    }
}

impl Scheduler {
    pub fn spawn(self) -> SchedulerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded(1);
        let stop_thread = stop.clone();
        let handle = thread::spawn(move || self.run(&stop_thread, &wake_rx));
        SchedulerHandle {
            stop,
            wake: wake_tx,
            handle,
        }
    }

    fn run(self, stop: &AtomicBool, wake: &Receiver<()>) {
        info!("snapshot scheduler started");
        while !stop.load(Ordering::SeqCst) {
            let now = fsutil::now_epoch();
            let boundary = next_boundary(self.clock.get(), self.interval, now);
            let sleep_for = Duration::from_secs_f64((boundary - now).max(1.0));

            match wake.recv_timeout(sleep_for) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if stop.load(Ordering::SeqCst) {
                break;
            }
            self.fire();
        }
        info!("snapshot scheduler stopped");
    }

    fn fire(&self) {
        for mirror in &self.mirrors {
            match store::snapshot::maybe_commit(mirror) {
                Ok(Some(ts)) => {
                    self.clock.advance(ts);
                    self.bus.publish(EngineEvent::SnapshotCommitted {
                        mirror: mirror.clone(),
                        committed_at: ts,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(mirror = %mirror, error = %e, "scheduled snapshot failed");
                    continue;
                }
            }
            if let Some(secs) = self.retention_seconds {
                retention::apply_retention(mirror, secs);
            }
        }
        self.bus.publish(EngineEvent::SnapshotStatus {
            text: status_line(self.clock.get(), self.interval, fsutil::now_epoch()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[test]
    fn clock_rejects_stale_updates() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_hook = accepted.clone();
        let clock = SnapshotClock::with_hook(
            Some(100.0),
            Box::new(move |_| {
                accepted_hook.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(!clock.advance(99.0));
        assert!(!clock.advance(100.0));
        assert!(clock.advance(101.5));
        assert!(!clock.advance(101.5));
        assert_eq!(clock.get(), Some(101.5));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn seed_takes_the_max_without_hook() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_hook = fired.clone();
        let clock = SnapshotClock::with_hook(
            None,
            Box::new(move |_| {
                fired_hook.fetch_add(1, Ordering::SeqCst);
            }),
        );

        clock.seed(50.0);
        clock.seed(40.0);
        assert_eq!(clock.get(), Some(50.0));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn boundary_is_an_interval_multiple_past_last() {
        assert_eq!(next_boundary(None, 60, 1_000.0), 1_000.0);
        // age 130s with a 60s interval: two intervals passed, fire at +180.
        assert_eq!(next_boundary(Some(1_000.0), 60, 1_130.0), 1_180.0);
        // exactly on the boundary schedules the next one
        assert_eq!(next_boundary(Some(1_000.0), 60, 1_060.0), 1_120.0);
    }

    #[test]
    fn status_strings() {
        assert_eq!(status_line(None, 3600, 0.0), "Waiting for first snapshot");
        assert_eq!(
            status_line(Some(1_000.0), 3600, 1_030.0),
            "Just Now (next in 59m)"
        );
        assert_eq!(
            status_line(Some(0.0), 3600, 2.0 * 3600.0 + 120.0),
            "2h 2m ago (next in 58m)"
        );
        assert_eq!(fmt_span(3 * 86_400 + 5 * 3600), "3d 5h");
        assert_eq!(stopped_line(None, 0.0), "stopped");
        assert_eq!(
            stopped_line(Some(0.0), 3_900.0),
            "stopped (last: 1h 5m ago)"
        );
    }

    #[test]
    fn nudge_fires_an_immediate_snapshot() {
        let tmp = tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let mirror = root.join("m");
        fs::create_dir_all(store::current_root(&mirror).as_std_path()).unwrap();
        fs::write(
            store::current_root(&mirror).join("a.txt").as_std_path(),
            b"hello",
        )
        .unwrap();

        let clock = Arc::new(SnapshotClock::new(Some(fsutil::now_epoch())));
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let handle = Scheduler {
            mirrors: vec![mirror.clone()],
            interval: 3600,
            retention_seconds: None,
            clock,
            bus,
        }
        .spawn();

        handle.nudge();
        let committed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(committed, EngineEvent::SnapshotCommitted { .. }));
        handle.stop(Duration::from_secs(3));
        assert_eq!(store::snapshot::list(&mirror).unwrap().len(), 1);
    }
}
