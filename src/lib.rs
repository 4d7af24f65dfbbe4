//! Heartsync - Group heart-rate synchronization core
//!
//! Heartsync collects live readings from several Bluetooth heart-rate sensors,
//! one per participant, and publishes them to an external visual engine and an
//! optional haptic actuator while scoring how synchronized the group is:
//! notification decoding → per-sensor session → sync scoring → OSC encoding →
//! UDP transport.
//!
//! ## Modules
//!
//! - **Sessions**: [`session::DeviceSession`] tracks one sensor's connection and readings
//! - **Experience**: [`orchestrator::SessionOrchestrator`] runs the timed group experience
//! - **Outbound**: [`encoder`] framing over the [`transport::Outbound`] channels
//! - **Bluetooth boundary**: [`sensor`] events in, connect/cancel requests out

pub mod config;
pub mod decoder;
pub mod driver;
pub mod encoder;
pub mod error;
pub mod orchestrator;
pub mod scorer;
pub mod sensor;
pub mod session;
pub mod transport;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use config::{OrchestratorConfig, PlayerConfig};
pub use error::SyncError;
pub use orchestrator::SessionOrchestrator;
pub use scorer::{ScoreTracker, SyncScorer};
pub use session::DeviceSession;

// Boundary exports
pub use sensor::{SensorEvent, SensorLink};
pub use transport::{Destination, Outbound, UdpTransport};

/// Heartsync library version
pub const HEARTSYNC_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by diagnostics
pub const PRODUCER_NAME: &str = "heartsync";
