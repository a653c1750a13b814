use std::collections::HashSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::fsutil;
use crate::store;

/// Prune snapshots and versions older than the retention window, then
/// garbage-collect unreferenced objects. Best-effort and idempotent: every
/// failure is logged and skipped, and the pass is retried on the next
/// interval anyway.
pub fn apply_retention(mirror: &Utf8Path, retention_seconds: u64) {
    if retention_seconds == 0 {
        return;
    }
    let cutoff = fsutil::now_epoch() - retention_seconds as f64;
    cleanup_snapshots(mirror, cutoff);
    cleanup_versions(mirror, cutoff);
    gc_objects(mirror);
}

/// Snapshots age by file mtime.
fn cleanup_snapshots(mirror: &Utf8Path, cutoff: f64) {
    let sdir = store::snapshots_root(mirror);
    let entries = match fs::read_dir(sdir.as_std_path()) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let mut removed = 0usize;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".json") {
            continue;
        }
        let mtime = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => fsutil::epoch_secs(t),
            Err(_) => continue,
        };
        if mtime < cutoff {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(snapshot = %name, error = %e, "failed to delete snapshot"),
            }
        }
    }
    if removed > 0 {
        info!(mirror = %mirror, removed, "removed old snapshots");
    }
}

/// Versions age by the timestamp encoded in their filename; records whose
/// names do not parse are left alone.
fn cleanup_versions(mirror: &Utf8Path, cutoff: f64) {
    let vroot = store::versions_root(mirror);
    if !vroot.exists() {
        return;
    }

    let mut removed = 0usize;
    for entry in WalkDir::new(vroot.as_std_path()) {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let stem = match name.strip_suffix(".json") {
            Some(s) => s,
            None => continue,
        };
        let ts = match fsutil::parse_stamp(stem) {
            Some(ts) => ts,
            None => continue,
        };
        if ts < cutoff {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(version = %name, error = %e, "failed to delete version"),
            }
        }
    }
    if removed > 0 {
        info!(mirror = %mirror, removed, "removed old versions");
    }
}

/// Unlink every blob no remaining snapshot or version refers to.
pub fn gc_objects(mirror: &Utf8Path) {
    let objects_root = store::objects_root(mirror);
    if !objects_root.exists() {
        return;
    }

    let live = live_hashes(mirror);

    let mut removed = 0usize;
    for entry in WalkDir::new(objects_root.as_std_path()) {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let hash = entry.file_name().to_string_lossy().into_owned();
        if live.contains(&hash) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(object = %hash, error = %e, "failed to delete object"),
        }
    }
    if removed > 0 {
        info!(mirror = %mirror, removed, "garbage collection removed unreferenced objects");
    }
}

/// Union of every hash referenced by a snapshot manifest or version record.
fn live_hashes(mirror: &Utf8Path) -> HashSet<String> {
    let mut live = HashSet::new();

    match store::snapshot::list(mirror) {
        Ok(stamps) => {
            for ts in stamps {
                match store::snapshot::load(mirror, &ts) {
                    Ok(manifest) => live.extend(manifest.files.into_values()),
                    Err(e) => warn!(snapshot = %ts, error = %e, "unreadable snapshot skipped"),
                }
            }
        }
        Err(e) => warn!(mirror = %mirror, error = %e, "could not list snapshots"),
    }

    let vroot = store::versions_root(mirror);
    if vroot.exists() {
        for entry in WalkDir::new(vroot.as_std_path()) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = match Utf8PathBuf::from_path_buf(entry.path().to_path_buf()) {
                Ok(p) => p,
                Err(_) => continue,
            };
            match store::version::read_record(&path) {
                Ok(record) => {
                    live.insert(record.hash);
                }
                Err(e) => warn!(record = %path, error = %e, "unreadable version record skipped"),
            }
        }
    }

    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{snapshot, version};
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn utf8_root(tmp: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap()
    }

    fn backdate(path: &Utf8Path, secs: u64) {
        let f = File::options().write(true).open(path.as_std_path()).unwrap();
        f.set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }

    fn old_stamp(secs_ago: u64) -> String {
        let then = chrono::Local::now() - chrono::Duration::seconds(secs_ago as i64);
        then.format("%Y-%m-%d_%H-%M-%S").to_string()
    }

    #[test]
    fn gc_keeps_referenced_objects() {
        let tmp = tempdir().unwrap();
        let root = utf8_root(&tmp);
        let mirror = root.join("m");
        fs::write(root.join("a.txt").as_std_path(), b"hello").unwrap();
        fs::write(root.join("b.txt").as_std_path(), b"orphan").unwrap();

        version::record_version(&mirror, Utf8Path::new("a.txt"), &root.join("a.txt")).unwrap();
        let orphan = store::store_object(&mirror, &root.join("b.txt")).unwrap();

        gc_objects(&mirror);

        assert!(!store::object_path(&mirror, &orphan).exists());
        let records = version::list_records(&mirror, Utf8Path::new("a.txt")).unwrap();
        let rec = version::read_record(
            &version::version_dir(&mirror, Utf8Path::new("a.txt")).join(&records[0]),
        )
        .unwrap();
        assert!(store::object_path(&mirror, &rec.hash).exists());
    }

    #[test]
    fn retention_prunes_expired_history() {
        let tmp = tempdir().unwrap();
        let root = utf8_root(&tmp);
        let mirror = root.join("m");
        let current = store::current_root(&mirror);
        fs::create_dir_all(current.as_std_path()).unwrap();
        fs::write(current.join("a.txt").as_std_path(), b"live").unwrap();

        // Live snapshot referencing the live content.
        snapshot::maybe_commit(&mirror).unwrap();

        // An expired snapshot and an expired version pointing at bytes
        // nothing else references.
        fs::write(root.join("old.txt").as_std_path(), b"ancient").unwrap();
        let old_hash = store::store_object(&mirror, &root.join("old.txt")).unwrap();
        let old_snap = store::snapshots_root(&mirror).join("2020-01-01_00-00-00.json");
        fs::write(
            old_snap.as_std_path(),
            serde_json::to_vec(&snapshot::Manifest {
                timestamp: "2020-01-01_00-00-00".into(),
                files: [("old.txt".to_string(), old_hash.clone())].into(),
            })
            .unwrap(),
        )
        .unwrap();
        backdate(&old_snap, 3600);

        let vdir = version::version_dir(&mirror, Utf8Path::new("old.txt"));
        fs::create_dir_all(vdir.as_std_path()).unwrap();
        let old_record = vdir.join(format!("{}.json", old_stamp(3600)));
        fs::write(
            old_record.as_std_path(),
            serde_json::to_vec(&version::VersionRecord {
                hash: old_hash.clone(),
                size: 7,
            })
            .unwrap(),
        )
        .unwrap();

        apply_retention(&mirror, 60);

        assert!(!old_snap.exists());
        assert!(!old_record.exists());
        assert!(!store::object_path(&mirror, &old_hash).exists());
        // The live snapshot and the replica survive.
        assert_eq!(snapshot::list(&mirror).unwrap().len(), 1);
        assert!(current.join("a.txt").exists());
        let live_manifest =
            snapshot::load(&mirror, &snapshot::list(&mirror).unwrap()[0]).unwrap();
        for hash in live_manifest.files.values() {
            assert!(store::object_path(&mirror, hash).exists());
        }
    }

    #[test]
    fn retention_is_idempotent() {
        let tmp = tempdir().unwrap();
        let root = utf8_root(&tmp);
        let mirror = root.join("m");
        let current = store::current_root(&mirror);
        fs::create_dir_all(current.as_std_path()).unwrap();
        fs::write(current.join("a.txt").as_std_path(), b"live").unwrap();
        snapshot::maybe_commit(&mirror).unwrap();

        apply_retention(&mirror, 60);
        apply_retention(&mirror, 60);
        assert_eq!(snapshot::list(&mirror).unwrap().len(), 1);
    }
}
