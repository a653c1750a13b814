use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fsutil;

/// Metadata record for a superseded file content: which blob holds the bytes
/// and how large they were.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub hash: String,
    pub size: u64,
}

pub fn version_dir(mirror: &Utf8Path, rel: &Utf8Path) -> Utf8PathBuf {
    super::versions_root(mirror).join(rel)
}

/// Preserve the current content of `src` before it is overwritten or
/// removed: ingest the bytes into the object pool and drop a timestamped
/// record under `versions/<rel>/`. Missing or directory sources are skipped.
pub fn record_version(mirror: &Utf8Path, rel: &Utf8Path, src: &Utf8Path) -> Result<()> {
    let meta = match fs::metadata(src.as_std_path()) {
        Ok(m) if m.is_file() => m,
        _ => return Ok(()),
    };

    let hash = super::store_object(mirror, src)?;
    let record = VersionRecord {
        hash,
        size: meta.len(),
    };
    let path = record_path(mirror, rel, &fsutil::now_stamp());
    super::write_atomic(&path, &serde_json::to_vec(&record)?)?;
    info!(rel = %rel, "version created");
    Ok(())
}

/// Pick a record filename for the given second. Same-second collisions get a
/// `_N` suffix, which sorts after the bare stamp and keeps the per-path
/// history monotone under lexicographic order.
fn record_path(mirror: &Utf8Path, rel: &Utf8Path, stamp: &str) -> Utf8PathBuf {
    let dir = version_dir(mirror, rel);
    let bare = dir.join(format!("{stamp}.json"));
    if !bare.exists() {
        return bare;
    }
    for n in 1.. {
        let candidate = dir.join(format!("{stamp}_{n}.json"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

pub fn read_record(path: &Utf8Path) -> Result<VersionRecord> {
    let bytes =
        fs::read(path.as_std_path()).with_context(|| format!("read version record {path}"))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Record filenames for one relative path, oldest first.
pub fn list_records(mirror: &Utf8Path, rel: &Utf8Path) -> Result<Vec<String>> {
    let dir = version_dir(mirror, rel);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = fs::read_dir(dir.as_std_path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".json"))
        .collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn utf8_root(tmp: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap()
    }

    #[test]
    fn record_points_at_stored_bytes() -> Result<()> {
        let tmp = tempdir()?;
        let root = utf8_root(&tmp);
        let mirror = root.join("m");
        fs::write(root.join("a.txt"), b"hello")?;

        record_version(&mirror, Utf8Path::new("a.txt"), &root.join("a.txt"))?;

        let names = list_records(&mirror, Utf8Path::new("a.txt"))?;
        assert_eq!(names.len(), 1);
        let record = read_record(&version_dir(&mirror, Utf8Path::new("a.txt")).join(&names[0]))?;
        assert_eq!(record.size, 5);
        let blob = super::super::object_path(&mirror, &record.hash);
        assert_eq!(fs::read(blob.as_std_path())?, b"hello");
        Ok(())
    }

    #[test]
    fn missing_or_directory_source_is_skipped() -> Result<()> {
        let tmp = tempdir()?;
        let root = utf8_root(&tmp);
        let mirror = root.join("m");
        fs::create_dir_all(root.join("d").as_std_path())?;

        record_version(&mirror, Utf8Path::new("gone.txt"), &root.join("gone.txt"))?;
        record_version(&mirror, Utf8Path::new("d"), &root.join("d"))?;
        assert!(!super::super::versions_root(&mirror).exists());
        Ok(())
    }

    #[test]
    fn same_second_collisions_stay_sorted() -> Result<()> {
        let tmp = tempdir()?;
        let root = utf8_root(&tmp);
        let mirror = root.join("m");
        let dir = version_dir(&mirror, Utf8Path::new("a.txt"));
        fs::create_dir_all(dir.as_std_path())?;

        let stamp = "2024-03-01_10-20-30";
        let first = record_path(&mirror, Utf8Path::new("a.txt"), stamp);
        fs::write(first.as_std_path(), b"{}")?;
        let second = record_path(&mirror, Utf8Path::new("a.txt"), stamp);
        fs::write(second.as_std_path(), b"{}")?;
        let third = record_path(&mirror, Utf8Path::new("a.txt"), stamp);

        assert_eq!(first.file_name(), Some("2024-03-01_10-20-30.json"));
        assert_eq!(second.file_name(), Some("2024-03-01_10-20-30_1.json"));
        assert_eq!(third.file_name(), Some("2024-03-01_10-20-30_2.json"));
        let names = list_records(&mirror, Utf8Path::new("a.txt"))?;
        assert_eq!(
            names,
            vec!["2024-03-01_10-20-30.json", "2024-03-01_10-20-30_1.json"]
        );
        Ok(())
    }
}
