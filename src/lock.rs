use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use thiserror::Error;

const BACKOFF: Duration = Duration::from_millis(10);

/// Process-wide set of (mirror, relative path) pairs currently being
/// reconciled. This is the only cross-thread lock on filesystem writes: the
/// full-sweep worker and the live follower both take it before touching a
/// path, so a file is never versioned twice or torn between writers.
static HELD: Lazy<Mutex<HashSet<(Utf8PathBuf, Utf8PathBuf)>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock wait cancelled for {0}")]
    Cancelled(Utf8PathBuf),
}

/// Releases the pair on drop.
#[derive(Debug)]
pub struct PathLockGuard {
    mirror: Utf8PathBuf,
    rel: Utf8PathBuf,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        release(&self.mirror, &self.rel);
    }
}

/// Atomic insert; `None` when another reconcile holds the pair.
pub fn try_acquire(mirror: &Utf8Path, rel: &Utf8Path) -> Option<PathLockGuard> {
    let mut held = HELD.lock().unwrap();
    if held.insert((mirror.to_owned(), rel.to_owned())) {
        Some(PathLockGuard {
            mirror: mirror.to_owned(),
            rel: rel.to_owned(),
        })
    } else {
        None
    }
}

/// Block until the pair is free, polling with a short backoff. Fails only
/// when the cancel token fires first.
pub fn wait_acquire(
    mirror: &Utf8Path,
    rel: &Utf8Path,
    cancel: &AtomicBool,
) -> Result<PathLockGuard, LockError> {
    loop {
        if let Some(guard) = try_acquire(mirror, rel) {
            return Ok(guard);
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(LockError::Cancelled(rel.to_owned()));
        }
        thread::sleep(BACKOFF);
    }
}

pub fn release(mirror: &Utf8Path, rel: &Utf8Path) {
    let mut held = HELD.lock().unwrap();
    held.remove(&(mirror.to_owned(), rel.to_owned()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_acquire_is_busy_until_release() {
        let mirror = Utf8Path::new("/locks/m1");
        let rel = Utf8Path::new("a.txt");

        let guard = try_acquire(mirror, rel).unwrap();
        assert!(try_acquire(mirror, rel).is_none());
        assert!(try_acquire(mirror, Utf8Path::new("b.txt")).is_some());
        assert!(try_acquire(Utf8Path::new("/locks/m2"), rel).is_some());

        drop(guard);
        assert!(try_acquire(mirror, rel).is_some());
    }

    #[test]
    fn wait_acquire_respects_cancel() {
        let mirror = Utf8Path::new("/locks/m3");
        let rel = Utf8Path::new("a.txt");
        let _guard = try_acquire(mirror, rel).unwrap();

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_thread = cancel.clone();
        let handle = thread::spawn(move || {
            wait_acquire(Utf8Path::new("/locks/m3"), Utf8Path::new("a.txt"), &cancel_thread)
        });
        thread::sleep(Duration::from_millis(50));
        cancel.store(true, Ordering::SeqCst);
        let res = handle.join().unwrap();
        assert!(matches!(res, Err(LockError::Cancelled(_))));
    }

    #[test]
    fn exclusion_across_threads() {
        let cancel = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(Mutex::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cancel = cancel.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _guard = wait_acquire(
                        Utf8Path::new("/locks/m4"),
                        Utf8Path::new("hot.txt"),
                        &cancel,
                    )
                    .unwrap();
                    let mut c = counter.lock().unwrap();
                    *c += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 200);
    }
}
