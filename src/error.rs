//! Error types for Heartsync

use crate::types::{ExperienceState, SessionId};
use thiserror::Error;

/// Errors that can occur while decoding, routing or publishing readings.
///
/// None of these are fatal: every failure degrades to a no-op plus a
/// diagnostic so a live installation keeps running when one sensor misbehaves.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Malformed notification payload: {0}")]
    MalformedPayload(String),

    #[error("Session {0} is not connected")]
    NotConnected(SessionId),

    #[error("Outbound transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Cannot {operation} while experience is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: ExperienceState,
    },

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed OSC packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}
