use std::fs::{self, File};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};

pub mod snapshot;
pub mod version;

const HASH_CHUNK: usize = 1024 * 1024;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn current_root(mirror: &Utf8Path) -> Utf8PathBuf {
    mirror.join("current")
}

pub fn objects_root(mirror: &Utf8Path) -> Utf8PathBuf {
    mirror.join("objects")
}

pub fn versions_root(mirror: &Utf8Path) -> Utf8PathBuf {
    mirror.join("versions")
}

pub fn snapshots_root(mirror: &Utf8Path) -> Utf8PathBuf {
    mirror.join("snapshots")
}

/// Location of a blob inside the two-level object pool.
pub fn object_path(mirror: &Utf8Path, hash: &str) -> Utf8PathBuf {
    objects_root(mirror).join(&hash[..2]).join(hash)
}

/// A directory counts as a watchback mirror when any piece of the layout
/// exists beneath it. Read-only tooling uses this to tell mirrors apart from
/// arbitrary directories.
pub fn is_mirror(path: &Utf8Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    ["current", "versions", "snapshots", "objects"]
        .iter()
        .any(|name| path.join(name).exists())
}

/// Sha256 over the file content, streamed in 1 MiB chunks.
pub fn hash_file(path: &Utf8Path) -> Result<String> {
    let mut file =
        File::open(path.as_std_path()).with_context(|| format!("open file for hashing {path}"))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Ingest `src` into the object pool and return its hash. Insertion is
/// write-once: an existing blob with the same hash is left untouched. The
/// copy lands on a temp sibling first and is renamed into place so a failed
/// write never leaves a half-formed blob at the final path.
pub fn store_object(mirror: &Utf8Path, src: &Utf8Path) -> Result<String> {
    let hash = hash_file(src)?;
    let opath = object_path(mirror, &hash);
    if opath.exists() {
        return Ok(hash);
    }

    let parent = opath.parent().expect("object path has a parent");
    fs::create_dir_all(parent.as_std_path())
        .with_context(|| format!("create object directory {parent}"))?;
    let tmp = parent.join(format!(
        "{hash}.tmp{}",
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    crate::fsutil::copy_preserving(src, &tmp)?;
    fs::rename(tmp.as_std_path(), opath.as_std_path())
        .with_context(|| format!("publish object {opath}"))?;
    Ok(hash)
}

/// Atomically replace `path` with `bytes` via a temp sibling.
pub(crate) fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().expect("target path has a parent");
    fs::create_dir_all(parent.as_std_path())?;
    let tmp = parent.join(format!(
        "{}.tmp{}",
        path.file_name().unwrap_or("out"),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(tmp.as_std_path(), bytes)?;
    fs::rename(tmp.as_std_path(), path.as_std_path())
        .with_context(|| format!("publish {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn utf8_root(tmp: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap()
    }

    #[test]
    fn stores_blob_under_prefix_fanout() -> Result<()> {
        let tmp = tempdir()?;
        let root = utf8_root(&tmp);
        let mirror = root.join("m");
        fs::write(root.join("a.txt"), b"hello")?;

        let hash = store_object(&mirror, &root.join("a.txt"))?;
        assert_eq!(hash.len(), 64);
        let opath = object_path(&mirror, &hash);
        assert_eq!(opath, mirror.join("objects").join(&hash[..2]).join(&hash));
        assert_eq!(fs::read(opath.as_std_path())?, b"hello");
        Ok(())
    }

    #[test]
    fn second_store_is_a_noop() -> Result<()> {
        let tmp = tempdir()?;
        let root = utf8_root(&tmp);
        let mirror = root.join("m");
        fs::write(root.join("a.txt"), b"hello")?;

        let h1 = store_object(&mirror, &root.join("a.txt"))?;
        let before = fs::metadata(object_path(&mirror, &h1).as_std_path())?.modified()?;
        fs::write(root.join("b.txt"), b"hello")?;
        let h2 = store_object(&mirror, &root.join("b.txt"))?;
        assert_eq!(h1, h2);
        let after = fs::metadata(object_path(&mirror, &h1).as_std_path())?.modified()?;
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn no_temp_droppings_after_store() -> Result<()> {
        let tmp = tempdir()?;
        let root = utf8_root(&tmp);
        let mirror = root.join("m");
        fs::write(root.join("a.txt"), b"hello")?;
        let hash = store_object(&mirror, &root.join("a.txt"))?;

        let bucket = objects_root(&mirror).join(&hash[..2]);
        let names: Vec<String> = fs::read_dir(bucket.as_std_path())?
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![hash]);
        Ok(())
    }

    #[test]
    fn mirror_detection_needs_layout_entry() -> Result<()> {
        let tmp = tempdir()?;
        let root = utf8_root(&tmp);
        let m = root.join("m");
        fs::create_dir_all(m.as_std_path())?;
        assert!(!is_mirror(&m));
        fs::create_dir_all(snapshots_root(&m).as_std_path())?;
        assert!(is_mirror(&m));
        assert!(!is_mirror(&root.join("missing")));
        Ok(())
    }
}
