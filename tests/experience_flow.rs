//! End-to-end run of a three-player experience through the public API

use std::sync::Arc;

use chrono::{Duration, Utc};
use heartsync::encoder::{OscMessage, GROUP_BPM_ADDRESS};
use heartsync::sensor::{measurement_payload, LinkRequest, QueuedSensorLink};
use heartsync::transport::MemoryTransport;
use heartsync::types::{ConnectionState, ExperienceState, OrchestratorEvent};
use heartsync::{OrchestratorConfig, Outbound, SensorEvent, SessionOrchestrator};
use pretty_assertions::assert_eq;

struct Installation {
    orchestrator: SessionOrchestrator,
    osc: Arc<MemoryTransport>,
    actuator: Arc<MemoryTransport>,
    link: Arc<QueuedSensorLink>,
    config: OrchestratorConfig,
}

impl Installation {
    fn new() -> Self {
        let config = OrchestratorConfig::default();
        let osc = Arc::new(MemoryTransport::new("osc"));
        let actuator = Arc::new(MemoryTransport::new("actuator"));
        let link = Arc::new(QueuedSensorLink::new());
        let orchestrator = SessionOrchestrator::new(
            &config,
            osc.clone(),
            Some(actuator.clone() as Arc<dyn Outbound>),
            link.clone(),
        )
        .unwrap();

        Self {
            orchestrator,
            osc,
            actuator,
            link,
            config,
        }
    }

    /// Answer every pending connect request the way a Bluetooth stack would
    fn answer_link_requests(&self) {
        for request in self.link.drain() {
            if let LinkRequest::Connect { device } = request {
                self.orchestrator
                    .handle_sensor_event(SensorEvent::Connected { device })
                    .unwrap();
            }
        }
    }

    fn beat(&self, player: usize, bpm: u16) {
        self.orchestrator
            .handle_sensor_event(SensorEvent::Notification {
                device: self.config.players[player].target,
                payload: measurement_payload(bpm),
            })
            .unwrap();
    }

    fn player_packets(&self) -> Vec<OscMessage> {
        self.osc
            .take()
            .iter()
            .map(|bytes| OscMessage::decode(bytes).unwrap())
            .filter(|message| message.address != GROUP_BPM_ADDRESS)
            .collect()
    }
}

#[test]
fn test_full_experience() {
    let rig = Installation::new();
    let mut events = rig.orchestrator.subscribe();

    // Setup -> Ready once every sensor is connected
    rig.orchestrator.connect_all();
    assert_eq!(rig.orchestrator.state(), ExperienceState::Setup);
    rig.answer_link_requests();
    assert_eq!(rig.orchestrator.state(), ExperienceState::Ready);

    // Ready -> Playing
    let start = Utc::now();
    rig.orchestrator.start_at(start).unwrap();
    assert_eq!(rig.orchestrator.state(), ExperienceState::Playing);

    rig.beat(0, 72);
    rig.beat(1, 68);
    rig.beat(2, 75);

    // One cycle per session publishes each value exactly once
    for id in 1..=3 {
        rig.orchestrator.cycle_elapsed(id).unwrap();
        rig.orchestrator.cycle_elapsed(id).unwrap();
    }
    let packets = rig.player_packets();
    assert_eq!(
        packets,
        vec![
            OscMessage::new("/player/1/bpm", vec![72]),
            OscMessage::new("/player/2/bpm", vec![68]),
            OscMessage::new("/player/3/bpm", vec![75]),
        ]
    );
    assert_eq!(rig.actuator.take().len(), 3);

    // Spread of 7 bpm scores 86
    rig.orchestrator.tick(start + Duration::seconds(1));
    assert!((rig.orchestrator.sync_score() - 86.0).abs() < 1e-9);
    let bundle = OscMessage::decode(&rig.osc.take()[0]).unwrap();
    assert_eq!(bundle.args, vec![72, 68, 75]);
    assert_eq!(rig.actuator.take(), vec![b"72,68,75".to_vec()]);

    // Time budget used up -> Finished
    rig.orchestrator.tick(start + Duration::seconds(180));
    assert_eq!(rig.orchestrator.state(), ExperienceState::Finished);

    let snapshot = rig.orchestrator.snapshot_at(start + Duration::seconds(180));
    assert_eq!(snapshot.score_summary.samples, 2);
    assert_eq!(snapshot.remaining_secs, None);

    let states: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            OrchestratorEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ExperienceState::Ready,
            ExperienceState::Playing,
            ExperienceState::Finished
        ]
    );
}

#[test]
fn test_sensor_dropout_and_recovery() {
    let rig = Installation::new();
    rig.orchestrator.connect_all();
    rig.answer_link_requests();
    rig.orchestrator.start().unwrap();
    rig.beat(2, 90);

    // Unexpected drop of player 3 sends the experience back to Setup
    rig.orchestrator
        .handle_sensor_event(SensorEvent::Disconnected {
            device: rig.config.players[2].target,
        })
        .unwrap();
    assert_eq!(rig.orchestrator.state(), ExperienceState::Setup);
    let dropped = rig.orchestrator.session(3).unwrap();
    assert_eq!(dropped.connection_state, ConnectionState::Disconnected);
    assert_eq!(dropped.last_heart_rate, 0);
    assert!(!dropped.has_joined_group);

    // Reconnecting restores Ready, and a fresh start joins the group again
    rig.orchestrator.connect(3).unwrap();
    rig.answer_link_requests();
    assert_eq!(rig.orchestrator.state(), ExperienceState::Ready);
    rig.orchestrator.start().unwrap();
    assert!(rig.orchestrator.session(3).unwrap().has_joined_group);
}

#[test]
fn test_reset_returns_to_setup() {
    let rig = Installation::new();
    rig.orchestrator.connect_all();
    rig.answer_link_requests();
    rig.orchestrator.start().unwrap();
    rig.orchestrator.pause().unwrap();

    rig.orchestrator.reset();

    assert_eq!(rig.orchestrator.state(), ExperienceState::Setup);
    assert_eq!(rig.orchestrator.started_at(), None);
    let cancelled = rig
        .link
        .drain()
        .into_iter()
        .filter(|request| matches!(request, LinkRequest::Cancel { .. }))
        .count();
    assert_eq!(cancelled, 3);
    assert!(rig.orchestrator.start().is_err());
}
