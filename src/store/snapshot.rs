use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::fsutil;

/// Whole-tree manifest: every live relative path mapped to the blob that
/// holds its content. Keys use forward slashes regardless of host separator;
/// the sorted map keeps serialization canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub timestamp: String,
    pub files: BTreeMap<String, String>,
}

/// Walk `current/` (not ground) and ingest every regular file, so the
/// manifest reflects what has already been reconciled.
pub fn build(mirror: &Utf8Path) -> Result<Manifest> {
    let current = super::current_root(mirror);
    let mut files = BTreeMap::new();

    if current.exists() {
        for entry in walkdir::WalkDir::new(current.as_std_path()).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = match Utf8Path::from_path(entry.path()) {
                Some(p) => p.to_owned(),
                None => continue,
            };
            let rel = path
                .strip_prefix(&current)
                .with_context(|| format!("relativize {path}"))?;
            let hash = super::store_object(mirror, &path)?;
            files.insert(fsutil::rel_slash(rel), hash);
        }
    }

    Ok(Manifest {
        timestamp: fsutil::now_stamp(),
        files,
    })
}

/// Deterministic digest over the canonical serialization of the file map.
/// Two manifests with identical content share a digest whatever their
/// timestamps say.
pub fn digest(manifest: &Manifest) -> String {
    let encoded = serde_json::to_vec(&manifest.files).expect("serialize file map");
    format!("{:x}", Sha256::digest(&encoded))
}

/// Digest of the most recent on-disk snapshot, if any.
pub fn last_digest(mirror: &Utf8Path) -> Result<Option<String>> {
    let stamps = list(mirror)?;
    let last = match stamps.last() {
        Some(ts) => ts,
        None => return Ok(None),
    };
    Ok(Some(digest(&load(mirror, last)?)))
}

/// Build a manifest and commit it unless it matches the newest snapshot
/// already on disk. Returns the manifest file's mtime in epoch seconds when
/// a new snapshot was written, `None` when suppressed. A quiet tree thus
/// produces no churn under `snapshots/`.
pub fn maybe_commit(mirror: &Utf8Path) -> Result<Option<f64>> {
    let sdir = super::snapshots_root(mirror);
    fs::create_dir_all(sdir.as_std_path())
        .with_context(|| format!("create snapshots directory {sdir}"))?;

    let manifest = build(mirror)?;
    if last_digest(mirror)?.as_deref() == Some(digest(&manifest).as_str()) {
        return Ok(None);
    }

    let path = sdir.join(format!("{}.json", manifest.timestamp));
    super::write_atomic(&path, &serde_json::to_vec_pretty(&manifest)?)?;
    info!(path = %path, "snapshot created");
    let mtime = fs::metadata(path.as_std_path())?.modified()?;
    Ok(Some(fsutil::epoch_secs(mtime)))
}

pub fn load(mirror: &Utf8Path, timestamp: &str) -> Result<Manifest> {
    let path = super::snapshots_root(mirror).join(format!("{timestamp}.json"));
    let bytes = fs::read(path.as_std_path()).with_context(|| format!("read snapshot {path}"))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Snapshot timestamps, oldest first.
pub fn list(mirror: &Utf8Path) -> Result<Vec<String>> {
    let sdir = super::snapshots_root(mirror);
    if !sdir.exists() {
        return Ok(Vec::new());
    }
    let mut stamps: Vec<String> = fs::read_dir(sdir.as_std_path())?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter_map(|n| n.strip_suffix(".json").map(str::to_owned))
        .collect();
    stamps.sort();
    Ok(stamps)
}

/// Path of the newest snapshot manifest, used to seed the engine clock.
pub fn latest_mtime(mirror: &Utf8Path) -> Result<Option<f64>> {
    let stamps = list(mirror)?;
    let last = match stamps.last() {
        Some(ts) => ts,
        None => return Ok(None),
    };
    let path = super::snapshots_root(mirror).join(format!("{last}.json"));
    let mtime = fs::metadata(path.as_std_path())?.modified()?;
    Ok(Some(fsutil::epoch_secs(mtime)))
}
