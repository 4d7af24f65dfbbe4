//! Orchestrator configuration
//!
//! Loaded from JSON or built in code; every field except the player roster
//! has a default.

use crate::error::SyncError;
use crate::scorer::DEFAULT_SCORE_WINDOW;
use crate::transport::Destination;
use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Default length of a Playing experience
pub const DEFAULT_DURATION_SECS: u64 = 180;
/// Default cadence of the orchestrator tick
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
/// Players in the reference installation
pub const DEFAULT_PLAYER_COUNT: u32 = 3;
/// Smallest roster for which synchronization is defined
pub const MIN_PLAYERS: usize = 2;
/// Longest accepted experience (one day)
pub const MAX_DURATION_SECS: u64 = 86_400;
/// Slowest accepted tick cadence
pub const MAX_TICK_INTERVAL_MS: u64 = 60_000;

/// One player slot bound to a physical sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConfig {
    pub id: SessionId,
    /// Identifier of the sensor assigned to this slot
    pub target: Uuid,
}

/// Configuration of a [`crate::orchestrator::SessionOrchestrator`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Fixed roster, in display order
    pub players: Vec<PlayerConfig>,
    /// OSC receiver
    #[serde(default)]
    pub destination: Destination,
    /// Time budget of a Playing experience (seconds)
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// Orchestrator tick cadence (milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Score samples retained for the results summary
    #[serde(default = "default_score_window")]
    pub score_window: usize,
    /// Whether a haptic actuator channel is expected
    #[serde(default = "default_actuator")]
    pub actuator: bool,
}

fn default_duration_secs() -> u64 {
    DEFAULT_DURATION_SECS
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_score_window() -> usize {
    DEFAULT_SCORE_WINDOW
}

fn default_actuator() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::with_targets((0..DEFAULT_PLAYER_COUNT).map(|_| Uuid::new_v4()))
    }
}

impl OrchestratorConfig {
    /// Roster numbered 1..=N in the given order, defaults elsewhere
    pub fn with_targets(targets: impl IntoIterator<Item = Uuid>) -> Self {
        let players = targets
            .into_iter()
            .zip(1..)
            .map(|(target, id)| PlayerConfig { id, target })
            .collect();

        Self {
            players,
            destination: Destination::default(),
            duration_secs: DEFAULT_DURATION_SECS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            score_window: DEFAULT_SCORE_WINDOW,
            actuator: true,
        }
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string_pretty(self).map_err(SyncError::JsonError)
    }

    /// Check roster size, identifier uniqueness and interval bounds
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.players.len() < MIN_PLAYERS {
            return Err(SyncError::InvalidConfig(format!(
                "at least {MIN_PLAYERS} players required, got {}",
                self.players.len()
            )));
        }

        let mut ids = HashSet::new();
        let mut targets = HashSet::new();
        for player in &self.players {
            if player.id == 0 {
                return Err(SyncError::InvalidConfig(
                    "player ids must be positive".to_string(),
                ));
            }
            if !ids.insert(player.id) {
                return Err(SyncError::InvalidConfig(format!(
                    "duplicate player id {}",
                    player.id
                )));
            }
            if !targets.insert(player.target) {
                return Err(SyncError::InvalidConfig(format!(
                    "sensor {} assigned to more than one player",
                    player.target
                )));
            }
        }

        if !(1..=MAX_DURATION_SECS).contains(&self.duration_secs) {
            return Err(SyncError::InvalidConfig(format!(
                "duration_secs must be between 1 and {MAX_DURATION_SECS}, got {}",
                self.duration_secs
            )));
        }
        if !(1..=MAX_TICK_INTERVAL_MS).contains(&self.tick_interval_ms) {
            return Err(SyncError::InvalidConfig(format!(
                "tick_interval_ms must be between 1 and {MAX_TICK_INTERVAL_MS}, got {}",
                self.tick_interval_ms
            )));
        }
        if self.destination.host.is_empty() {
            return Err(SyncError::InvalidConfig(
                "destination host must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Experience time budget; fails for values `validate` would reject
    pub fn duration(&self) -> Result<chrono::Duration, SyncError> {
        i64::try_from(self.duration_secs)
            .ok()
            .filter(|_| self.duration_secs <= MAX_DURATION_SECS)
            .map(chrono::Duration::seconds)
            .ok_or_else(|| {
                SyncError::InvalidConfig(format!(
                    "duration_secs {} out of range",
                    self.duration_secs
                ))
            })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.players.len(), 3);
        assert_eq!(
            config.players.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(config.destination.to_string(), "127.0.0.1:8000");
        assert_eq!(config.duration_secs, 180);
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let json = r#"{
            "players": [
                { "id": 1, "target": "6f1c4a3e-2b1d-4c8e-9a57-0d9f3b2e7a11" },
                { "id": 2, "target": "0b7e55d2-91c4-4f0e-8d6b-5a2f1e3c9d40" }
            ],
            "destination": { "host": "10.0.0.5", "port": 9000 }
        }"#;

        let config = OrchestratorConfig::from_json(json).unwrap();
        assert_eq!(config.destination.port, 9000);
        assert_eq!(config.duration_secs, DEFAULT_DURATION_SECS);
        assert_eq!(config.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert!(config.actuator);
    }

    #[test]
    fn test_rejects_small_roster() {
        let config = OrchestratorConfig::with_targets([Uuid::new_v4()]);
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_duplicates() {
        let target = Uuid::new_v4();
        let config = OrchestratorConfig::with_targets([target, target]);
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.players[1].id = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_duration() {
        let mut config = OrchestratorConfig::default();
        config.duration_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_intervals() {
        let mut config = OrchestratorConfig::default();
        config.duration_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(SyncError::InvalidConfig(_))
        ));
        assert!(config.duration().is_err());

        config.duration_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());
        assert_eq!(config.duration().unwrap().num_seconds(), 86_400);

        config.tick_interval_ms = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_json_reloads() {
        let config = OrchestratorConfig::default();
        let reloaded = OrchestratorConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            OrchestratorConfig::from_json("not json"),
            Err(SyncError::JsonError(_))
        ));
    }
}
