use std::fs;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 3600;
pub const MIN_SNAPSHOT_INTERVAL: u64 = 60;

/// Application data root (`~/.watchback`), housing the profile document and
/// the log file. No other host state is read.
pub fn base_dir() -> Utf8PathBuf {
    let home = dirs::home_dir()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."));
    home.join(".watchback")
}

pub fn config_path() -> Utf8PathBuf {
    base_dir().join("watchback.json")
}

pub fn log_path() -> Utf8PathBuf {
    base_dir().join("watchback.log")
}

pub fn ensure_base_dir() -> Result<()> {
    fs::create_dir_all(base_dir().as_std_path()).context("create application data directory")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Ground,
    Mirror,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilePath {
    pub path: Utf8PathBuf,
    pub role: Role,
}

fn default_interval() -> u64 {
    DEFAULT_SNAPSHOT_INTERVAL
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub paths: Vec<ProfilePath>,
    #[serde(default = "default_interval")]
    pub snapshot_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot_time: Option<f64>,
}

impl Profile {
    pub fn ground(&self) -> Option<&Utf8Path> {
        self.paths
            .iter()
            .find(|p| p.role == Role::Ground)
            .map(|p| p.path.as_path())
    }

    pub fn mirrors(&self) -> Vec<Utf8PathBuf> {
        self.paths
            .iter()
            .filter(|p| p.role == Role::Mirror)
            .map(|p| p.path.clone())
            .collect()
    }

    /// Shape validation at ingress; a profile that fails here never reaches
    /// the engine.
    pub fn validate(&self) -> Result<()> {
        let grounds = self
            .paths
            .iter()
            .filter(|p| p.role == Role::Ground)
            .count();
        if grounds != 1 {
            bail!("profile {:?} must have exactly one ground path", self.name);
        }
        if self.mirrors().is_empty() {
            bail!("profile {:?} must have at least one mirror path", self.name);
        }
        if self.snapshot_interval < MIN_SNAPSHOT_INTERVAL {
            bail!(
                "profile {:?} snapshot interval must be at least {MIN_SNAPSHOT_INTERVAL}s",
                self.name
            );
        }
        if self.retention_seconds == Some(0) {
            bail!("profile {:?} retention must be a positive number of seconds", self.name);
        }
        let ground = self.ground().expect("ground checked above");
        if !ground.is_dir() {
            bail!("profile {:?} ground path not found: {ground}", self.name);
        }
        Ok(())
    }
}

/// The on-disk profile document. The engine reads it and writes back only
/// through [`ConfigDoc::persist_profile`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDoc {
    pub profiles: Vec<Profile>,
}

impl ConfigDoc {
    /// Missing document reads as empty, matching first-run behavior.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path.as_std_path())
            .with_context(|| format!("read profile document {path}"))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())?;
        }
        fs::write(path.as_std_path(), serde_json::to_string_pretty(self)?)
            .with_context(|| format!("write profile document {path}"))?;
        info!("config saved");
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Fold an updated profile back into the document on disk. Used by the
    /// engine's persistence hook to record `last_snapshot_time`.
    pub fn persist_profile(path: &Utf8Path, updated: &Profile) -> Result<()> {
        let mut doc = Self::load(path)?;
        match doc.profiles.iter_mut().find(|p| p.name == updated.name) {
            Some(slot) => *slot = updated.clone(),
            None => doc.profiles.push(updated.clone()),
        }
        doc.save(path)
    }
}
