use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RadioError, Result};

/// Current protocol version.  Bump this when the snapshot or intent shape
/// changes in a breaking way.  Clients get it in the `Hello` broadcast.
pub const PROTOCOL_VERSION: u32 = 1;

/// Highest volume a client may request at the boundary.  The controller
/// clamps further down to `Settings::max_volume`.
pub const BOUNDARY_MAX_VOLUME: i64 = 100;

/// Everything that can change radio state.  Hardware and network producers
/// send the exact same values; only the consumer loop interprets them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    /// Move the dial one position; `direction` is -1 or 1.
    RotateStation { direction: i8 },
    /// Jump to an absolute dial position (0 = OFF); clamped, never fails.
    SetStationIndex { index: i64 },
    SetPower { on: bool },
    SetVolume { level: i64 },
    /// Relative volume change, resolved against the committed volume.
    NudgeVolume { delta: i64 },
    ActivatePack { pack_id: String },
    /// Activate the pack after the current one, wrapping.
    NextPack,
    /// Asynchronous health report from the stream engine.
    StreamHealthChanged(HealthReport),
}

impl Intent {
    /// Type/range checks done at the boundary, before enqueueing.
    pub fn validate(&self) -> Result<()> {
        match self {
            Intent::RotateStation { direction } if *direction != -1 && *direction != 1 => Err(
                RadioError::Validation(format!("direction must be -1 or 1, got {}", direction)),
            ),
            Intent::SetVolume { level } if !(0..=BOUNDARY_MAX_VOLUME).contains(level) => {
                Err(RadioError::Validation(format!(
                    "level must be an integer 0-{}, got {}",
                    BOUNDARY_MAX_VOLUME, level
                )))
            }
            Intent::ActivatePack { pack_id } if pack_id.trim().is_empty() => {
                Err(RadioError::Validation("pack_id must not be empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Engine health for one specific play attempt.  `generation` identifies the
/// attempt so reports from a superseded stream can be dropped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthReport {
    pub generation: u64,
    pub status: StreamStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Stopped,
    Buffering,
    Playing,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheProgress {
    pub complete: usize,
    pub total: usize,
    pub current_station: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackSummary {
    pub id: String,
    pub name: String,
    pub station_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StationSummary {
    pub id: String,
    pub name: String,
}

/// Immutable view of the radio handed to subscribers and pull requests.
/// `rev` increases by one on every published snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub rev: u64,
    pub pack: Option<PackSummary>,
    pub station: Option<StationSummary>,
    pub station_index: usize,
    pub volume: u8,
    pub status: StreamStatus,
    pub power: bool,
    pub cache_progress: Option<CacheProgress>,
    pub updated_at: DateTime<Utc>,
}

/// Messages pushed to subscribers (serialised as SSE data).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast", rename_all = "snake_case")]
pub enum Broadcast {
    /// Sent immediately on subscribe: protocol version + current snapshot.
    Hello {
        protocol_version: u32,
        state: Snapshot,
    },
    State {
        data: Snapshot,
    },
    Log {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_wire_shape() {
        let json = serde_json::to_string(&Intent::RotateStation { direction: 1 }).unwrap();
        assert_eq!(json, r#"{"intent":"rotate_station","direction":1}"#);

        let parsed: Intent =
            serde_json::from_str(r#"{"intent":"activate_pack","pack_id":"lofi"}"#).unwrap();
        assert_eq!(
            parsed,
            Intent::ActivatePack {
                pack_id: "lofi".into()
            }
        );

        let health: Intent = serde_json::from_str(
            r#"{"intent":"stream_health_changed","generation":3,"status":"error"}"#,
        )
        .unwrap();
        assert_eq!(
            health,
            Intent::StreamHealthChanged(HealthReport {
                generation: 3,
                status: StreamStatus::Error
            })
        );
    }

    #[test]
    fn test_boundary_validation() {
        assert!(Intent::RotateStation { direction: 1 }.validate().is_ok());
        assert!(Intent::RotateStation { direction: 2 }.validate().is_err());
        assert!(Intent::RotateStation { direction: 0 }.validate().is_err());
        assert!(Intent::SetVolume { level: 100 }.validate().is_ok());
        assert!(Intent::SetVolume { level: 101 }.validate().is_err());
        assert!(Intent::SetVolume { level: -1 }.validate().is_err());
        // Out-of-range indices are clamped by the controller, not rejected.
        assert!(Intent::SetStationIndex { index: 99 }.validate().is_ok());
        assert!(Intent::ActivatePack {
            pack_id: " ".into()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_hello_round_trip() {
        let state = Snapshot {
            rev: 42,
            pack: None,
            station: None,
            station_index: 0,
            volume: 40,
            status: StreamStatus::Stopped,
            power: false,
            cache_progress: None,
            updated_at: Utc::now(),
        };
        let msg = Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            state,
        };
        let json = serde_json::to_string(&msg).unwrap();
        match serde_json::from_str::<Broadcast>(&json).unwrap() {
            Broadcast::Hello {
                protocol_version,
                state,
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(state.rev, 42);
            }
            _ => panic!("Wrong message type"),
        }
    }
}
