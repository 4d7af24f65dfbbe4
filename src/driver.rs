//! Timer tasks that drive the orchestrator
//!
//! The orchestrator itself never sleeps. These tasks supply the periodic
//! inputs: the once-per-second tick, one heartbeat cycle per session paced by
//! its current bpm, and the pump that feeds Bluetooth events in.

use crate::orchestrator::SessionOrchestrator;
use crate::sensor::SensorEvent;
use crate::session::is_plausible_bpm;
use crate::types::SessionId;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Cycle period used while a session has no reading
pub const IDLE_HEARTBEAT: Duration = Duration::from_secs(1);

/// One beat at `bpm`, or [`IDLE_HEARTBEAT`] when there is no plausible reading
pub fn heartbeat_period(bpm: u16) -> Duration {
    if is_plausible_bpm(bpm) {
        Duration::from_secs_f64(60.0 / f64::from(bpm))
    } else {
        IDLE_HEARTBEAT
    }
}

/// Wall clock anchored to the runtime's monotonic clock
struct TickClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl TickClock {
    fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

/// Call [`SessionOrchestrator::tick`] every `period`
pub fn spawn_ticker(orchestrator: Arc<SessionOrchestrator>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let clock = TickClock::new();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            orchestrator.tick(clock.now());
        }
    })
}

/// Run the heartbeat cycle of session `id` forever
pub fn spawn_heartbeat(orchestrator: Arc<SessionOrchestrator>, id: SessionId) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let bpm = match orchestrator.heart_rate(id) {
                Ok(bpm) => bpm,
                Err(e) => {
                    warn!("heartbeat {id} stopped: {e}");
                    return;
                }
            };
            tokio::time::sleep(heartbeat_period(bpm)).await;

            if let Err(e) = orchestrator.cycle_elapsed(id) {
                warn!("heartbeat {id} stopped: {e}");
                return;
            }
        }
    })
}

/// Feed Bluetooth events to the orchestrator until the sender goes away
pub fn spawn_sensor_pump(
    orchestrator: Arc<SessionOrchestrator>,
    mut events: mpsc::UnboundedReceiver<SensorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            // Failures are already logged where they are detected
            if let Err(e) = orchestrator.handle_sensor_event(event) {
                debug!("sensor event rejected: {e}");
            }
        }
        debug!("sensor pump stopped");
    })
}

/// Running driver tasks; aborted when dropped
#[derive(Default)]
pub struct DriverHandles {
    tasks: Vec<JoinHandle<()>>,
}

impl DriverHandles {
    /// Start the ticker plus one heartbeat per session
    pub fn spawn(orchestrator: &Arc<SessionOrchestrator>, tick_interval: Duration) -> Self {
        let mut tasks = vec![spawn_ticker(Arc::clone(orchestrator), tick_interval)];
        tasks.extend(
            orchestrator
                .session_ids()
                .into_iter()
                .map(|id| spawn_heartbeat(Arc::clone(orchestrator), id)),
        );
        Self { tasks }
    }

    /// Track an additional task, e.g. a sensor pump
    pub fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn abort(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for DriverHandles {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::encoder::OscMessage;
    use crate::sensor::SimulatedSensors;
    use crate::transport::{MemoryTransport, Outbound};
    use crate::types::ExperienceState;
    use uuid::Uuid;

    struct Rig {
        orchestrator: Arc<SessionOrchestrator>,
        sensors: Arc<SimulatedSensors>,
        osc: Arc<MemoryTransport>,
        targets: Vec<Uuid>,
        _pump: DriverHandles,
    }

    fn rig(duration_secs: u64) -> Rig {
        let mut config = OrchestratorConfig::default();
        config.duration_secs = duration_secs;
        let targets = config.players.iter().map(|p| p.target).collect();

        let (sensors, events) = SimulatedSensors::new();
        let sensors = Arc::new(sensors);
        let osc = Arc::new(MemoryTransport::new("osc"));
        let orchestrator = Arc::new(
            SessionOrchestrator::new(
                &config,
                osc.clone() as Arc<dyn Outbound>,
                None,
                sensors.clone(),
            )
            .unwrap(),
        );

        let mut pump = DriverHandles::default();
        pump.push(spawn_sensor_pump(Arc::clone(&orchestrator), events));

        Rig {
            orchestrator,
            sensors,
            osc,
            targets,
            _pump: pump,
        }
    }

    #[test]
    fn test_heartbeat_period() {
        assert_eq!(heartbeat_period(60), Duration::from_secs(1));
        assert_eq!(heartbeat_period(120), Duration::from_millis(500));
        assert_eq!(heartbeat_period(0), IDLE_HEARTBEAT);
        assert_eq!(heartbeat_period(250), IDLE_HEARTBEAT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_brings_experience_to_ready() {
        let rig = rig(180);
        rig.orchestrator.connect_all();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(rig.orchestrator.state(), ExperienceState::Ready);
        assert_eq!(
            rig.orchestrator.session(1).unwrap().manufacturer,
            "Heartsync Sim"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sends_each_value_once() {
        let rig = rig(180);
        rig.orchestrator.connect_all();
        tokio::time::sleep(Duration::from_millis(10)).await;
        rig.orchestrator.start().unwrap();

        let _heartbeat = spawn_heartbeat(Arc::clone(&rig.orchestrator), 1);
        rig.sensors.beat(rig.targets[0], 60);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let sent = rig.osc.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            OscMessage::decode(&sent[0]).unwrap(),
            OscMessage::new("/player/1/bpm", vec![60])
        );

        rig.sensors.beat(rig.targets[0], 62);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rig.osc.take().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pumped_dropout_returns_to_setup() {
        let rig = rig(180);
        rig.orchestrator.connect_all();
        tokio::time::sleep(Duration::from_millis(10)).await;
        rig.orchestrator.start().unwrap();

        rig.sensors.drop_sensor(rig.targets[2]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(rig.orchestrator.state(), ExperienceState::Setup);
        assert!(!rig.orchestrator.session(3).unwrap().has_joined_group);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_finishes_experience() {
        let rig = rig(3);
        rig.orchestrator.connect_all();
        tokio::time::sleep(Duration::from_millis(10)).await;
        rig.orchestrator.start().unwrap();

        let mut drivers = DriverHandles::spawn(&rig.orchestrator, Duration::from_secs(1));
        assert_eq!(drivers.len(), 4);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(rig.orchestrator.state(), ExperienceState::Playing);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(rig.orchestrator.state(), ExperienceState::Finished);

        drivers.abort();
        assert!(drivers.is_empty());
    }
}
