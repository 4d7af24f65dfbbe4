//! Boundary with the Bluetooth collaborator
//!
//! Scanning, pairing and characteristic discovery live outside this crate.
//! The collaborator delivers [`SensorEvent`]s addressed by the sensor's
//! identifier, and receives connect/cancel requests through [`SensorLink`].
//! No long-lived references into sessions ever cross this boundary.

use crate::decoder::{BODY_SENSOR_LOCATION, HEART_RATE_MEASUREMENT, MANUFACTURER_NAME};
use crate::error::SyncError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Lifecycle or data event reported by the Bluetooth stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorEvent {
    Connected {
        device: Uuid,
    },
    FailedToConnect {
        device: Uuid,
    },
    Disconnected {
        device: Uuid,
    },
    /// Raw Heart Rate Measurement notification
    Notification {
        device: Uuid,
        payload: Vec<u8>,
    },
    /// Body Sensor Location value; `None` when the read returned nothing
    BodyLocation {
        device: Uuid,
        payload: Option<Vec<u8>>,
    },
    /// Manufacturer Name String value; `None` when the read returned nothing
    ManufacturerName {
        device: Uuid,
        payload: Option<Vec<u8>>,
    },
}

impl SensorEvent {
    /// Identifier of the sensor the event concerns
    pub fn device(&self) -> Uuid {
        match self {
            SensorEvent::Connected { device }
            | SensorEvent::FailedToConnect { device }
            | SensorEvent::Disconnected { device }
            | SensorEvent::Notification { device, .. }
            | SensorEvent::BodyLocation { device, .. }
            | SensorEvent::ManufacturerName { device, .. } => *device,
        }
    }

    /// Wrap a value read or notified on a Heart Rate or Device Information
    /// characteristic. Empty metadata reads become `None`.
    pub fn from_characteristic(
        device: Uuid,
        characteristic: u16,
        value: Vec<u8>,
    ) -> Result<Self, SyncError> {
        let non_empty = |value: Vec<u8>| (!value.is_empty()).then_some(value);
        match characteristic {
            HEART_RATE_MEASUREMENT => Ok(SensorEvent::Notification {
                device,
                payload: value,
            }),
            BODY_SENSOR_LOCATION => Ok(SensorEvent::BodyLocation {
                device,
                payload: non_empty(value),
            }),
            MANUFACTURER_NAME => Ok(SensorEvent::ManufacturerName {
                device,
                payload: non_empty(value),
            }),
            other => Err(SyncError::MalformedPayload(format!(
                "unsupported characteristic 0x{other:04X}"
            ))),
        }
    }
}

/// Requests from the core to the Bluetooth stack.
///
/// Both calls return immediately; outcomes come back as [`SensorEvent`]s.
pub trait SensorLink: Send + Sync {
    /// Start connecting to a known sensor
    fn connect(&self, device: Uuid);

    /// Tear down any connection or pending attempt to a sensor
    fn cancel(&self, device: Uuid);
}

/// A request recorded by [`QueuedSensorLink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum LinkRequest {
    Connect { device: Uuid },
    Cancel { device: Uuid },
}

impl LinkRequest {
    pub fn device(&self) -> Uuid {
        match self {
            LinkRequest::Connect { device } | LinkRequest::Cancel { device } => *device,
        }
    }
}

/// Link that queues requests for a collaborator that polls for them.
///
/// Holds at most one request per device: a newer request replaces the
/// pending one, so the queue never outgrows the roster.
#[derive(Debug, Default)]
pub struct QueuedSensorLink {
    pending: Mutex<VecDeque<LinkRequest>>,
}

impl QueuedSensorLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every pending request, oldest first
    pub fn drain(&self) -> Vec<LinkRequest> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn push(&self, request: LinkRequest) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|queued| queued.device() != request.device());
        pending.push_back(request);
    }
}

impl SensorLink for QueuedSensorLink {
    fn connect(&self, device: Uuid) {
        self.push(LinkRequest::Connect { device });
    }

    fn cancel(&self, device: Uuid) {
        self.push(LinkRequest::Cancel { device });
    }
}

/// Build a Heart Rate Measurement notification for `bpm`.
///
/// Values above 255 use the 16-bit format.
pub fn measurement_payload(bpm: u16) -> Vec<u8> {
    match u8::try_from(bpm) {
        Ok(narrow) => vec![0x00, narrow],
        Err(_) => {
            let [lo, hi] = bpm.to_le_bytes();
            vec![0x01, lo, hi]
        }
    }
}

/// Sensors simulated in-process.
///
/// Connect requests are answered with a `Connected` event, cancels with a
/// `Disconnected` event, all pushed into the channel returned by
/// [`SimulatedSensors::new`]. Readings are injected with [`SimulatedSensors::beat`].
pub struct SimulatedSensors {
    events: mpsc::UnboundedSender<SensorEvent>,
}

impl SimulatedSensors {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SensorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }

    /// Emit a measurement notification for `device`
    pub fn beat(&self, device: Uuid, bpm: u16) {
        self.emit(SensorEvent::Notification {
            device,
            payload: measurement_payload(bpm),
        });
    }

    /// Emit an unsolicited drop of `device`
    pub fn drop_sensor(&self, device: Uuid) {
        self.emit(SensorEvent::Disconnected { device });
    }

    fn emit(&self, event: SensorEvent) {
        if self.events.send(event).is_err() {
            debug!("simulated sensors: event receiver dropped");
        }
    }
}

impl SensorLink for SimulatedSensors {
    fn connect(&self, device: Uuid) {
        self.emit(SensorEvent::Connected { device });
        self.emit(SensorEvent::BodyLocation {
            device,
            payload: Some(vec![1]),
        });
        self.emit(SensorEvent::ManufacturerName {
            device,
            payload: Some(b"Heartsync Sim".to_vec()),
        });
    }

    fn cancel(&self, device: Uuid) {
        self.emit(SensorEvent::Disconnected { device });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_bpm;

    #[test]
    fn test_measurement_payload_decodes() {
        assert_eq!(decode_bpm(&measurement_payload(72)).unwrap(), 72);
        assert_eq!(measurement_payload(300)[0], 0x01);
        assert_eq!(decode_bpm(&measurement_payload(300)).unwrap(), 300);
    }

    #[test]
    fn test_queued_link_drains_in_order() {
        let link = QueuedSensorLink::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        link.connect(first);
        link.cancel(second);

        assert_eq!(
            link.drain(),
            vec![
                LinkRequest::Connect { device: first },
                LinkRequest::Cancel { device: second }
            ]
        );
        assert!(link.drain().is_empty());
    }

    #[test]
    fn test_queued_link_keeps_latest_request_per_device() {
        let link = QueuedSensorLink::new();
        let device = Uuid::new_v4();
        let other = Uuid::new_v4();
        for _ in 0..1000 {
            link.connect(device);
            link.cancel(device);
        }
        link.connect(other);
        link.connect(device);

        assert_eq!(
            link.drain(),
            vec![
                LinkRequest::Connect { device: other },
                LinkRequest::Connect { device }
            ]
        );
    }

    #[test]
    fn test_from_characteristic() {
        let device = Uuid::new_v4();
        assert_eq!(
            SensorEvent::from_characteristic(device, HEART_RATE_MEASUREMENT, vec![0, 72]).unwrap(),
            SensorEvent::Notification {
                device,
                payload: vec![0, 72]
            }
        );
        assert_eq!(
            SensorEvent::from_characteristic(device, BODY_SENSOR_LOCATION, vec![]).unwrap(),
            SensorEvent::BodyLocation {
                device,
                payload: None
            }
        );
        assert_eq!(
            SensorEvent::from_characteristic(device, MANUFACTURER_NAME, b"Polar".to_vec()).unwrap(),
            SensorEvent::ManufacturerName {
                device,
                payload: Some(b"Polar".to_vec())
            }
        );
        assert!(matches!(
            SensorEvent::from_characteristic(device, 0x2A19, vec![90]),
            Err(SyncError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_sensor_event_json_shape() {
        let device = Uuid::nil();
        let json = serde_json::to_value(SensorEvent::Notification {
            device,
            payload: vec![0, 72],
        })
        .unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["payload"][1], 72);

        let parsed: SensorEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.device(), device);
    }

    #[tokio::test]
    async fn test_simulated_connect_answers() {
        let (sensors, mut events) = SimulatedSensors::new();
        let device = Uuid::new_v4();
        sensors.connect(device);
        sensors.beat(device, 64);

        assert_eq!(
            events.recv().await,
            Some(SensorEvent::Connected { device })
        );
        // metadata reads follow the connection
        assert!(matches!(
            events.recv().await,
            Some(SensorEvent::BodyLocation { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(SensorEvent::ManufacturerName { .. })
        ));
        assert_eq!(
            events.recv().await,
            Some(SensorEvent::Notification {
                device,
                payload: vec![0, 64]
            })
        );
    }
}
