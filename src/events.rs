use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Top-level profile state as shown to the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Syncing,
    Idle,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Syncing => write!(f, "SYNCING"),
            EngineState::Idle => write!(f, "IDLE"),
        }
    }
}

/// Per-mirror sweep state. The rendered prefixes (`SYNCING`, `SYNCED`,
/// `ERROR:`) are part of the front-end contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorState {
    Syncing,
    Synced,
    Error(String),
}

impl fmt::Display for MirrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorState::Syncing => write!(f, "SYNCING"),
            MirrorState::Synced => write!(f, "SYNCED"),
            MirrorState::Error(msg) => write!(f, "ERROR: {msg}"),
        }
    }
}

/// Everything the engine tells its subscribers. The front end reacts to
/// these without knowing engine internals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Status {
        profile: String,
        state: EngineState,
    },
    MirrorStatus {
        mirror: Utf8PathBuf,
        state: MirrorState,
    },
    Progress {
        mirror: Utf8PathBuf,
        percent: u8,
    },
    SnapshotCommitted {
        mirror: Utf8PathBuf,
        committed_at: f64,
    },
    SnapshotStatus {
        text: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_state_prefixes() {
        assert_eq!(MirrorState::Syncing.to_string(), "SYNCING");
        assert_eq!(MirrorState::Synced.to_string(), "SYNCED");
        assert_eq!(MirrorState::Error("boom".into()).to_string(), "ERROR: boom");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = EngineEvent::Progress {
            mirror: Utf8PathBuf::from("/m"),
            percent: 42,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["percent"], 42);
    }
}
