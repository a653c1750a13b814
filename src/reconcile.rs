use std::fs;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::fsutil;
use crate::lock;
use crate::store;

/// Bring `current/<rel>` into agreement with the ground file at `src`,
/// versioning whatever content is about to be displaced. Callers must hold
/// the path lock for `(mirror, rel)`.
pub fn reconcile_file(mirror: &Utf8Path, rel: &Utf8Path, src: &Utf8Path) -> Result<()> {
    let dst = store::current_root(mirror).join(rel);
    if !fsutil::files_differ(src, &dst)? {
        return Ok(());
    }
    if dst.is_file() {
        store::version::record_version(mirror, rel, &dst)?;
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent.as_std_path())
            .with_context(|| format!("create directory {parent}"))?;
    }
    fsutil::copy_preserving(src, &dst)
}

/// Remove `current/<rel>` after its ground counterpart disappeared. Files
/// are versioned first so their last content stays recoverable; directory
/// trees go without versioning. Callers must hold the path lock.
pub fn remove_stale(mirror: &Utf8Path, rel: &Utf8Path) -> Result<()> {
    let dst = store::current_root(mirror).join(rel);
    if dst.is_dir() {
        fs::remove_dir_all(dst.as_std_path())
            .with_context(|| format!("remove stale directory {dst}"))?;
    } else if dst.exists() {
        store::version::record_version(mirror, rel, &dst)?;
        fs::remove_file(dst.as_std_path())
            .with_context(|| format!("remove stale file {dst}"))?;
    }
    Ok(())
}

/// Reconcile one changed absolute path against every mirror, as dispatched
/// by the follower after a debounce drain. Paths outside ground are ignored;
/// per-mirror failures are logged and do not stop the remaining mirrors.
pub fn sync_path(
    ground: &Utf8Path,
    mirrors: &[Utf8PathBuf],
    changed: &Utf8Path,
    cancel: &AtomicBool,
) {
    let rel = match changed.strip_prefix(ground) {
        Ok(rel) if !rel.as_str().is_empty() => rel,
        _ => return,
    };

    for mirror in mirrors {
        let guard = match lock::wait_acquire(mirror, rel, cancel) {
            Ok(g) => g,
            Err(_) => return,
        };
        if let Err(e) = sync_path_one(mirror, rel, changed) {
            warn!(mirror = %mirror, rel = %rel, error = %e, "reconcile failed");
        }
        drop(guard);
    }
}

fn sync_path_one(mirror: &Utf8Path, rel: &Utf8Path, src: &Utf8Path) -> Result<()> {
    let current = store::current_root(mirror);
    fs::create_dir_all(current.as_std_path())?;

    if src.is_dir() {
        fs::create_dir_all(current.join(rel).as_std_path())?;
    } else if src.exists() {
        reconcile_file(mirror, rel, src)?;
        debug!(mirror = %mirror, rel = %rel, "file reconciled");
    } else {
        remove_stale(mirror, rel)?;
        debug!(mirror = %mirror, rel = %rel, "stale entry removed");
    }
    Ok(())
}
