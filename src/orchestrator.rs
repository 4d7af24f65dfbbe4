//! Experience orchestration
//!
//! [`SessionOrchestrator`] owns the fixed roster of sessions, the top-level
//! experience state machine and the routing from readings to the outbound
//! channels:
//!
//! ```text
//! SensorEvent -> decoder -> DeviceSession -> cycle -> encoder -> Outbound (osc, actuator)
//!                                 |
//!                                 +-> tick -> SyncScorer -> group bundle -> Outbound
//! ```
//!
//! All methods take `&self`; share it behind an `Arc` with the Bluetooth
//! callbacks and the drivers. Each session has its own lock and the
//! experience state has another. The experience lock is always taken before
//! any session lock, never after.

use crate::config::OrchestratorConfig;
use crate::decoder::{decode_body_location, decode_heart_rate, decode_manufacturer_name};
use crate::encoder::{encode_group_bpms, encode_player_bpm, encode_text_bpm, encode_text_group};
use crate::error::SyncError;
use crate::scorer::{ScoreTracker, SyncScorer};
use crate::sensor::{SensorEvent, SensorLink};
use crate::session::DeviceSession;
use crate::transport::Outbound;
use crate::types::{
    ExperienceSnapshot, ExperienceState, OrchestratorEvent, OutboundReading, SessionChange,
    SessionId, SessionSnapshot,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events buffered per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Experience {
    state: ExperienceState,
    started_at: Option<DateTime<Utc>>,
    sync_score: f64,
    tracker: ScoreTracker,
}

/// Coordinator of the sessions, the experience and the outbound channels
pub struct SessionOrchestrator {
    sessions: Vec<Mutex<DeviceSession>>,
    by_id: HashMap<SessionId, usize>,
    by_target: HashMap<Uuid, usize>,
    experience: Mutex<Experience>,
    osc: Arc<dyn Outbound>,
    actuator: Option<Arc<dyn Outbound>>,
    sensors: Arc<dyn SensorLink>,
    events: broadcast::Sender<OrchestratorEvent>,
    duration: chrono::Duration,
    duration_secs: u64,
}

impl SessionOrchestrator {
    /// Build the orchestrator with its injected channels.
    ///
    /// `actuator` is the secondary text channel towards the haptic device, if
    /// one is present.
    pub fn new(
        config: &OrchestratorConfig,
        osc: Arc<dyn Outbound>,
        actuator: Option<Arc<dyn Outbound>>,
        sensors: Arc<dyn SensorLink>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let duration = config.duration()?;

        let sessions: Vec<_> = config
            .players
            .iter()
            .map(|player| Mutex::new(DeviceSession::new(player.id, player.target)))
            .collect();
        let by_id = config
            .players
            .iter()
            .enumerate()
            .map(|(index, player)| (player.id, index))
            .collect();
        let by_target = config
            .players
            .iter()
            .enumerate()
            .map(|(index, player)| (player.target, index))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            sessions,
            by_id,
            by_target,
            experience: Mutex::new(Experience {
                state: ExperienceState::Setup,
                started_at: None,
                sync_score: 0.0,
                tracker: ScoreTracker::new(config.score_window),
            }),
            osc,
            actuator,
            sensors,
            events,
            duration,
            duration_secs: config.duration_secs,
        })
    }

    /// Receive every change published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ExperienceState {
        lock(&self.experience).state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.experience).started_at
    }

    /// Score computed on the latest tick
    pub fn sync_score(&self) -> f64 {
        lock(&self.experience).sync_score
    }

    /// Roster ids in configuration order
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| lock(s).id()).collect()
    }

    pub fn session(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.by_id
            .get(&id)
            .map(|&index| lock(&self.sessions[index]).snapshot())
    }

    /// Current bpm of every session in roster order (0 for silent sensors)
    pub fn readings(&self) -> Vec<u16> {
        self.sessions
            .iter()
            .map(|s| lock(s).last_heart_rate())
            .collect()
    }

    pub fn snapshot(&self) -> ExperienceSnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Full view of the experience as of `now`
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> ExperienceSnapshot {
        let experience = lock(&self.experience);
        let remaining_secs = match (experience.state, experience.started_at) {
            (ExperienceState::Playing | ExperienceState::Paused, Some(started)) => {
                Some((self.duration - (now - started)).num_seconds().max(0))
            }
            _ => None,
        };

        ExperienceSnapshot {
            state: experience.state,
            started_at: experience.started_at,
            configured_duration_secs: self.duration_secs,
            remaining_secs,
            sync_score: experience.sync_score,
            score_summary: experience.tracker.summary(),
            sessions: self.sessions.iter().map(|s| lock(s).snapshot()).collect(),
        }
    }

    // ------------------------------------------------------------------
    // Session control
    // ------------------------------------------------------------------

    /// Ask the Bluetooth stack to connect the sensor of session `id`
    pub fn connect(&self, id: SessionId) -> Result<(), SyncError> {
        let index = self.index_of(id)?;
        let (target, changes) = {
            let mut session = lock(&self.sessions[index]);
            (session.target(), session.connect())
        };
        if !changes.is_empty() {
            self.sensors.connect(target);
        }
        self.apply(changes);
        Ok(())
    }

    /// Connect every session that is currently disconnected
    pub fn connect_all(&self) {
        for id in self.session_ids() {
            if let Err(e) = self.connect(id) {
                warn!("connect {id}: {e}");
            }
        }
    }

    /// Drop session `id` immediately and cancel its link
    pub fn disconnect(&self, id: SessionId) -> Result<(), SyncError> {
        let index = self.index_of(id)?;
        let (target, changes) = {
            let mut session = lock(&self.sessions[index]);
            (session.target(), session.disconnect())
        };
        if changes.iter().any(SessionChange::is_connection_change) {
            self.sensors.cancel(target);
        }
        self.apply(changes);
        Ok(())
    }

    /// Opt session `id` into group synchronization (ignored unless connected)
    pub fn join_group(&self, id: SessionId) -> Result<(), SyncError> {
        let index = self.index_of(id)?;
        let changes = lock(&self.sessions[index]).join_group();
        self.apply(changes);
        Ok(())
    }

    /// Route an event from the Bluetooth stack to its session.
    ///
    /// Malformed notifications and readings for unconnected sessions are
    /// reported and otherwise leave everything untouched.
    pub fn handle_sensor_event(&self, event: SensorEvent) -> Result<(), SyncError> {
        let device = event.device();
        let index = *self
            .by_target
            .get(&device)
            .ok_or_else(|| SyncError::UnknownSession(device.to_string()))?;
        let session = &self.sessions[index];

        let changes = match event {
            SensorEvent::Connected { .. } => lock(session).on_connected(),
            SensorEvent::FailedToConnect { .. } => lock(session).on_connect_failed(),
            SensorEvent::Disconnected { .. } => lock(session).on_disconnected(),
            SensorEvent::Notification { payload, .. } => {
                let measurement = decode_heart_rate(&payload).map_err(|e| {
                    warn!("sensor {device}: skipping notification: {e}");
                    e
                })?;
                lock(session).on_notification(measurement.bpm)?
            }
            SensorEvent::BodyLocation { payload, .. } => {
                lock(session).set_body_location(decode_body_location(payload.as_deref()))
            }
            SensorEvent::ManufacturerName { payload, .. } => {
                lock(session).set_manufacturer(decode_manufacturer_name(payload.as_deref()))
            }
        };

        self.apply(changes);
        Ok(())
    }

    /// One heartbeat period elapsed for session `id`.
    ///
    /// Publishes the reading on both channels when the session decides to
    /// send; a failure on one channel does not affect the other.
    pub fn cycle_elapsed(&self, id: SessionId) -> Result<Option<OutboundReading>, SyncError> {
        let index = self.index_of(id)?;
        let reading = lock(&self.sessions[index]).cycle_elapsed();
        if let Some(reading) = reading {
            self.dispatch_reading(reading);
        }
        Ok(reading)
    }

    /// Current bpm of session `id`
    pub fn heart_rate(&self, id: SessionId) -> Result<u16, SyncError> {
        let index = self.index_of(id)?;
        Ok(lock(&self.sessions[index]).last_heart_rate())
    }

    // ------------------------------------------------------------------
    // Experience control
    // ------------------------------------------------------------------

    pub fn start(&self) -> Result<(), SyncError> {
        self.start_at(Utc::now())
    }

    /// Ready -> Playing: stamp the start time and join every session
    pub fn start_at(&self, now: DateTime<Utc>) -> Result<(), SyncError> {
        let mut experience = lock(&self.experience);
        Self::require(&experience, "start", ExperienceState::Ready)?;

        experience.started_at = Some(now);
        let joined: Vec<_> = self
            .sessions
            .iter()
            .flat_map(|s| lock(s).join_group())
            .collect();
        self.publish_changes(joined);
        self.transition(&mut experience, ExperienceState::Playing);
        Ok(())
    }

    /// Playing -> Paused
    pub fn pause(&self) -> Result<(), SyncError> {
        let mut experience = lock(&self.experience);
        Self::require(&experience, "pause", ExperienceState::Playing)?;
        self.transition(&mut experience, ExperienceState::Paused);
        Ok(())
    }

    /// Paused -> Playing, or back to Setup if a sensor dropped while paused
    pub fn resume(&self) -> Result<(), SyncError> {
        let mut experience = lock(&self.experience);
        Self::require(&experience, "resume", ExperienceState::Paused)?;

        if self.all_connected() {
            self.transition(&mut experience, ExperienceState::Playing);
        } else {
            warn!("a sensor dropped out while paused, back to setup");
            self.transition(&mut experience, ExperienceState::Setup);
        }
        Ok(())
    }

    /// Force Finished from any state
    pub fn end(&self) {
        let mut experience = lock(&self.experience);
        self.transition(&mut experience, ExperienceState::Finished);
    }

    /// Disconnect every session, clear timing and score, back to Setup
    pub fn reset(&self) {
        let mut experience = lock(&self.experience);

        let mut cancelled = Vec::new();
        let mut changes = Vec::new();
        for session in &self.sessions {
            let mut session = lock(session);
            let dropped = session.disconnect();
            if dropped.iter().any(SessionChange::is_connection_change) {
                cancelled.push(session.target());
            }
            changes.extend(dropped);
        }

        experience.started_at = None;
        experience.sync_score = 0.0;
        experience.tracker.clear();
        self.publish_changes(changes);
        self.transition(&mut experience, ExperienceState::Setup);
        drop(experience);

        for target in cancelled {
            self.sensors.cancel(target);
        }
        info!("experience reset");
    }

    /// Periodic work: rescore, enforce the time budget, broadcast the group.
    ///
    /// Meant to run about once per second.
    pub fn tick(&self, now: DateTime<Utc>) {
        let readings = self.readings();
        let score = SyncScorer::score(&readings);

        let mut experience = lock(&self.experience);
        if experience.sync_score != score {
            experience.sync_score = score;
            self.publish(OrchestratorEvent::ScoreChanged { score });
        }

        if experience.state == ExperienceState::Playing {
            experience.tracker.record(score);

            let expired = experience
                .started_at
                .is_some_and(|started| now - started >= self.duration);
            if expired {
                info!("experience time budget of {}s used up", self.duration_secs);
                self.transition(&mut experience, ExperienceState::Finished);
            }
        }

        let playing = experience.state == ExperienceState::Playing;
        drop(experience);

        if playing {
            self.broadcast_group(&readings);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn index_of(&self, id: SessionId) -> Result<usize, SyncError> {
        self.by_id
            .get(&id)
            .copied()
            .ok_or_else(|| SyncError::UnknownSession(id.to_string()))
    }

    fn require(
        experience: &Experience,
        operation: &'static str,
        expected: ExperienceState,
    ) -> Result<(), SyncError> {
        if experience.state == expected {
            Ok(())
        } else {
            debug!("{operation} ignored while {}", experience.state);
            Err(SyncError::InvalidTransition {
                operation,
                state: experience.state,
            })
        }
    }

    fn transition(&self, experience: &mut Experience, to: ExperienceState) {
        let from = experience.state;
        if from == to {
            return;
        }
        experience.state = to;
        info!("experience {from} -> {to}");
        self.publish(OrchestratorEvent::StateChanged { from, to });
    }

    /// Publish session changes and re-evaluate readiness if a connection moved
    fn apply(&self, changes: Vec<SessionChange>) {
        let connection_moved = changes.iter().any(SessionChange::is_connection_change);
        self.publish_changes(changes);
        if connection_moved {
            self.evaluate_readiness();
        }
    }

    fn evaluate_readiness(&self) {
        let mut experience = lock(&self.experience);
        let all_connected = self.all_connected();

        match experience.state {
            ExperienceState::Setup if all_connected => {
                self.transition(&mut experience, ExperienceState::Ready);
            }
            ExperienceState::Ready | ExperienceState::Playing if !all_connected => {
                warn!("a sensor dropped out, back to setup");
                self.transition(&mut experience, ExperienceState::Setup);
            }
            _ => {}
        }
    }

    fn all_connected(&self) -> bool {
        self.sessions.iter().all(|s| lock(s).is_connected())
    }

    fn publish_changes(&self, changes: Vec<SessionChange>) {
        for change in changes {
            self.publish(OrchestratorEvent::Session(change));
        }
    }

    fn publish(&self, event: OrchestratorEvent) {
        // Err only means nobody is subscribed
        let _ = self.events.send(event);
    }

    fn dispatch_reading(&self, reading: OutboundReading) {
        if let Err(e) = self.osc.send(&encode_player_bpm(reading.id, reading.bpm)) {
            warn!("{}: player {} bpm dropped: {e}", self.osc.name(), reading.id);
        }
        if let Some(actuator) = &self.actuator {
            if let Err(e) = actuator.send(&encode_text_bpm(reading.bpm)) {
                warn!("{}: player {} bpm dropped: {e}", actuator.name(), reading.id);
            }
        }
    }

    fn broadcast_group(&self, readings: &[u16]) {
        let active: Vec<u16> = readings.iter().copied().filter(|&bpm| bpm > 0).collect();
        if active.is_empty() {
            return;
        }

        if let Err(e) = self.osc.send(&encode_group_bpms(&active)) {
            debug!("{}: group bundle dropped: {e}", self.osc.name());
        }
        if let Some(actuator) = &self.actuator {
            if let Err(e) = actuator.send(&encode_text_group(&active)) {
                debug!("{}: group payload dropped: {e}", actuator.name());
            }
        }
    }
}
