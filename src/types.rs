//! Core types shared across Heartsync
//!
//! This module defines the states, decoded measurements, snapshots and change
//! events that flow between the sessions, the orchestrator and whatever
//! presentation layer subscribes to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable, small positive identifier of a session (player slot)
pub type SessionId = u32;

/// Connection state of a single sensor session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level experience state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceState {
    /// Connecting devices
    Setup,
    /// Every session connected, waiting for start
    Ready,
    /// Active experience, readings flow to the group
    Playing,
    /// Temporarily paused
    Paused,
    /// Experience completed
    Finished,
}

impl ExperienceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperienceState::Setup => "setup",
            ExperienceState::Ready => "ready",
            ExperienceState::Playing => "playing",
            ExperienceState::Paused => "paused",
            ExperienceState::Finished => "finished",
        }
    }
}

impl fmt::Display for ExperienceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body location reported by the body sensor location characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyLocation {
    Chest,
    Undefined,
    NotAvailable,
}

impl BodyLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyLocation::Chest => "chest",
            BodyLocation::Undefined => "undefined",
            BodyLocation::NotAvailable => "not_available",
        }
    }
}

/// Sensor contact status carried in flag bits 1-2 of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorContact {
    NotSupported,
    NotDetected,
    Detected,
}

/// A decoded heart rate measurement notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateMeasurement {
    /// Beats per minute
    pub bpm: u16,
    /// Whether the value was transmitted as a 16-bit field
    pub wide_format: bool,
    /// Skin contact status, if the sensor reports it
    pub sensor_contact: SensorContact,
}

/// A reading a session decided to publish on its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReading {
    pub id: SessionId,
    pub bpm: u16,
}

/// Typed notification emitted by a session mutator when a value actually changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum SessionChange {
    Connection {
        id: SessionId,
        from: ConnectionState,
        to: ConnectionState,
    },
    HeartRate {
        id: SessionId,
        bpm: u16,
    },
    GroupMembership {
        id: SessionId,
        joined: bool,
    },
    BodyLocation {
        id: SessionId,
        location: BodyLocation,
    },
    Manufacturer {
        id: SessionId,
        name: String,
    },
}

impl SessionChange {
    pub fn is_connection_change(&self) -> bool {
        matches!(self, SessionChange::Connection { .. })
    }
}

/// Event published by the orchestrator to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Session(SessionChange),
    StateChanged {
        from: ExperienceState,
        to: ExperienceState,
    },
    ScoreChanged {
        score: f64,
    },
}

/// Point-in-time view of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub target: Uuid,
    pub connection_state: ConnectionState,
    pub last_heart_rate: u16,
    pub has_joined_group: bool,
    pub body_location: BodyLocation,
    pub manufacturer: String,
}

/// Summary of the sync scores accumulated during play
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    /// Most recent recorded score
    pub latest: Option<f64>,
    /// Mean over the retained window
    pub mean: Option<f64>,
    /// Highest score in the retained window
    pub peak: Option<f64>,
    /// Fraction of samples at or above the visual threshold (0-1)
    pub synchronized_fraction: Option<f64>,
    /// Number of retained samples
    pub samples: u32,
}

/// Point-in-time view of the whole experience
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceSnapshot {
    pub state: ExperienceState,
    pub started_at: Option<DateTime<Utc>>,
    pub configured_duration_secs: u64,
    /// Countdown shown while Playing or Paused
    pub remaining_secs: Option<i64>,
    pub sync_score: f64,
    pub score_summary: ScoreSummary,
    pub sessions: Vec<SessionSnapshot>,
}
