//! Per-sensor session state machine
//!
//! A [`DeviceSession`] owns the connection state, the last known reading and
//! the dedup bookkeeping of one physical sensor. Every mutator returns the
//! list of [`SessionChange`]s it caused; an empty list means nothing changed.
//!
//! ```text
//! Disconnected --connect()--> Connecting --connected--> Connected
//!      ^                          |                         |
//!      +------- failed / disconnected / disconnect() -------+
//! ```

use crate::decoder::UNKNOWN_MANUFACTURER;
use crate::error::SyncError;
use crate::types::{
    BodyLocation, ConnectionState, OutboundReading, SessionChange, SessionId, SessionSnapshot,
};
use log::{debug, info, warn};
use uuid::Uuid;

/// Readings must be strictly above this to be published
pub const PLAUSIBLE_BPM_FLOOR: u16 = 0;
/// Readings must be strictly below this to be published
pub const PLAUSIBLE_BPM_CEILING: u16 = 240;

/// Whether a bpm value lies inside the plausible physiological band
pub fn is_plausible_bpm(bpm: u16) -> bool {
    bpm > PLAUSIBLE_BPM_FLOOR && bpm < PLAUSIBLE_BPM_CEILING
}

/// Connection and reading state of one sensor
#[derive(Debug, Clone)]
pub struct DeviceSession {
    id: SessionId,
    target: Uuid,
    state: ConnectionState,
    last_heart_rate: u16,
    has_joined_group: bool,
    /// Last bpm handed to the outbound channels; `None` until the first send
    last_sent: Option<u16>,
    body_location: BodyLocation,
    manufacturer: String,
}

impl DeviceSession {
    /// Create a disconnected session addressing the sensor `target`
    pub fn new(id: SessionId, target: Uuid) -> Self {
        Self {
            id,
            target,
            state: ConnectionState::Disconnected,
            last_heart_rate: 0,
            has_joined_group: false,
            last_sent: None,
            body_location: BodyLocation::NotAvailable,
            manufacturer: UNKNOWN_MANUFACTURER.to_string(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn target(&self) -> Uuid {
        self.target
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn last_heart_rate(&self) -> u16 {
        self.last_heart_rate
    }

    pub fn has_joined_group(&self) -> bool {
        self.has_joined_group
    }

    pub fn last_sent(&self) -> Option<u16> {
        self.last_sent
    }

    pub fn body_location(&self) -> BodyLocation {
        self.body_location
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    /// Request a connection to the target sensor.
    ///
    /// Only leaves `Disconnected`; a session already connecting or connected
    /// is left alone.
    pub fn connect(&mut self) -> Vec<SessionChange> {
        if self.state != ConnectionState::Disconnected {
            debug!(
                "session {}: connect ignored while {}",
                self.id, self.state
            );
            return Vec::new();
        }
        info!("session {}: connecting to {}", self.id, self.target);
        vec![self.transition(ConnectionState::Connecting)]
    }

    /// The Bluetooth stack reported the connection as established
    pub fn on_connected(&mut self) -> Vec<SessionChange> {
        if self.state != ConnectionState::Connecting {
            warn!(
                "session {}: connected event ignored while {}",
                self.id, self.state
            );
            return Vec::new();
        }

        info!("session {}: connected to {}", self.id, self.target);
        let mut changes = vec![self.transition(ConnectionState::Connected)];
        changes.extend(self.clear_reading());
        self.last_sent = None;
        self.body_location = BodyLocation::NotAvailable;
        self.manufacturer = UNKNOWN_MANUFACTURER.to_string();
        changes
    }

    /// The Bluetooth stack failed to establish the connection
    pub fn on_connect_failed(&mut self) -> Vec<SessionChange> {
        if self.state != ConnectionState::Connecting {
            debug!(
                "session {}: connect failure ignored while {}",
                self.id, self.state
            );
            return Vec::new();
        }
        warn!("session {}: failed to connect to {}", self.id, self.target);
        vec![self.transition(ConnectionState::Disconnected)]
    }

    /// The Bluetooth stack reported the peripheral as gone
    pub fn on_disconnected(&mut self) -> Vec<SessionChange> {
        if self.state != ConnectionState::Disconnected {
            warn!("session {}: sensor {} disconnected", self.id, self.target);
        }
        self.force_disconnected()
    }

    /// Drop the session back to `Disconnected`.
    ///
    /// Idempotent and always safe; the state flips immediately even though the
    /// underlying link teardown completes asynchronously.
    pub fn disconnect(&mut self) -> Vec<SessionChange> {
        if self.state != ConnectionState::Disconnected {
            info!("session {}: disconnecting from {}", self.id, self.target);
        }
        self.force_disconnected()
    }

    fn force_disconnected(&mut self) -> Vec<SessionChange> {
        let mut changes = Vec::new();
        if self.state != ConnectionState::Disconnected {
            changes.push(self.transition(ConnectionState::Disconnected));
        }
        changes.extend(self.clear_reading());
        changes
    }

    /// A decoded reading arrived for this session.
    ///
    /// Rejected with [`SyncError::NotConnected`] unless connected. An unchanged
    /// value produces no change.
    pub fn on_notification(&mut self, bpm: u16) -> Result<Vec<SessionChange>, SyncError> {
        if self.state != ConnectionState::Connected {
            warn!(
                "session {}: dropping {} bpm received while {}",
                self.id, bpm, self.state
            );
            return Err(SyncError::NotConnected(self.id));
        }
        if bpm == self.last_heart_rate {
            return Ok(Vec::new());
        }
        self.last_heart_rate = bpm;
        Ok(vec![SessionChange::HeartRate { id: self.id, bpm }])
    }

    /// Opt this session into group synchronization.
    ///
    /// Ignored unless connected.
    pub fn join_group(&mut self) -> Vec<SessionChange> {
        if self.state != ConnectionState::Connected {
            debug!("session {}: join ignored while {}", self.id, self.state);
            return Vec::new();
        }
        if self.has_joined_group {
            return Vec::new();
        }
        self.has_joined_group = true;
        vec![SessionChange::GroupMembership {
            id: self.id,
            joined: true,
        }]
    }

    /// One heartbeat worth of time has passed.
    ///
    /// Returns the reading to publish, or `None` when the session has not
    /// joined, the reading was already sent, or it is outside the plausible
    /// band. A returned reading is recorded as sent.
    pub fn cycle_elapsed(&mut self) -> Option<OutboundReading> {
        if !self.has_joined_group {
            return None;
        }
        if self.last_sent == Some(self.last_heart_rate) {
            return None;
        }
        if !is_plausible_bpm(self.last_heart_rate) {
            debug!(
                "session {}: {} bpm outside plausible band, not sent",
                self.id, self.last_heart_rate
            );
            return None;
        }
        self.last_sent = Some(self.last_heart_rate);
        Some(OutboundReading {
            id: self.id,
            bpm: self.last_heart_rate,
        })
    }

    /// Store the decoded body sensor location
    pub fn set_body_location(&mut self, location: BodyLocation) -> Vec<SessionChange> {
        if self.body_location == location {
            return Vec::new();
        }
        self.body_location = location;
        vec![SessionChange::BodyLocation {
            id: self.id,
            location,
        }]
    }

    /// Store the decoded manufacturer name
    pub fn set_manufacturer(&mut self, name: String) -> Vec<SessionChange> {
        if self.manufacturer == name {
            return Vec::new();
        }
        self.manufacturer = name.clone();
        vec![SessionChange::Manufacturer { id: self.id, name }]
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            target: self.target,
            connection_state: self.state,
            last_heart_rate: self.last_heart_rate,
            has_joined_group: self.has_joined_group,
            body_location: self.body_location,
            manufacturer: self.manufacturer.clone(),
        }
    }

    fn transition(&mut self, to: ConnectionState) -> SessionChange {
        let from = self.state;
        self.state = to;
        SessionChange::Connection {
            id: self.id,
            from,
            to,
        }
    }

    /// Zero the reading and leave the group, reporting what actually changed
    fn clear_reading(&mut self) -> Vec<SessionChange> {
        let mut changes = Vec::new();
        if self.last_heart_rate != 0 {
            self.last_heart_rate = 0;
            changes.push(SessionChange::HeartRate { id: self.id, bpm: 0 });
        }
        if self.has_joined_group {
            self.has_joined_group = false;
            changes.push(SessionChange::GroupMembership {
                id: self.id,
                joined: false,
            });
        }
        changes
    }
}
