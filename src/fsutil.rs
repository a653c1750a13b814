use std::fs::{self, File};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use camino::Utf8Path;

/// Cheap difference predicate used by sweeps and the live follower: size plus
/// a one-second mtime tolerance, no content hashing. A false negative only
/// costs a skipped version, a false positive only a redundant copy.
pub fn files_differ(src: &Utf8Path, dst: &Utf8Path) -> Result<bool> {
    let dst_meta = match fs::metadata(dst.as_std_path()) {
        Ok(m) => m,
        Err(_) => return Ok(true),
    };
    let src_meta = fs::metadata(src.as_std_path())
        .with_context(|| format!("stat source file {src}"))?;
    if src_meta.len() != dst_meta.len() {
        return Ok(true);
    }
    let src_mtime = epoch_secs(src_meta.modified()?);
    let dst_mtime = epoch_secs(dst_meta.modified()?);
    Ok((src_mtime - dst_mtime).abs() > 1.0)
}

/// Copy `src` to `dst`, carrying the source mtime over. The difference
/// predicate compares mtimes, so a plain copy would look permanently stale.
pub fn copy_preserving(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    let mtime = fs::metadata(src.as_std_path())
        .with_context(|| format!("stat source file {src}"))?
        .modified()?;
    fs::copy(src.as_std_path(), dst.as_std_path())
        .with_context(|| format!("copy {src} to {dst}"))?;
    // Read-only is enough to touch the timestamp, and the copy may have
    // carried read-only permissions over.
    let f = File::open(dst.as_std_path())?;
    f.set_modified(mtime)?;
    Ok(())
}

/// Relative path rendered with forward slashes regardless of host separator.
pub fn rel_slash(rel: &Utf8Path) -> String {
    rel.components()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn epoch_secs(t: SystemTime) -> f64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

pub fn now_epoch() -> f64 {
    epoch_secs(SystemTime::now())
}

/// Current wall-clock second in the on-disk timestamp format.
pub fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Parse a `YYYY-MM-DD_HH-MM-SS` stamp (optionally carrying a collision
/// suffix after the 19 significant characters) back to epoch seconds.
pub fn parse_stamp(stem: &str) -> Option<f64> {
    let head = stem.get(..19)?;
    let naive = chrono::NaiveDateTime::parse_from_str(head, "%Y-%m-%d_%H-%M-%S").ok()?;
    let local = naive.and_local_timezone(chrono::Local).single()?;
    Some(local.timestamp() as f64)
}
