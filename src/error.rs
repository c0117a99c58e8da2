use std::time::Duration;

use uuid::Uuid;

use crate::types::ConnectionState;

/// Errors returned by transport operations and configuration loading.
///
/// Malformed inbound data never surfaces here: bad fragments, unparseable
/// lines and wrong-shape messages are logged and dropped by the router.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A send or disconnect was requested while no device is connected.
    /// No transport call has been made.
    #[error("device not connected")]
    NotConnected,

    /// Scan or connect was requested while the link is not idle.
    #[error("operation not allowed while {0}")]
    InvalidState(ConnectionState),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Failure reported by a non-BLE transport (simulator, test doubles).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("characteristic {0} not found")]
    MissingCharacteristic(Uuid),

    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    /// The dedicated transport thread has shut down; the job was never run.
    #[error("transport executor is not running")]
    ExecutorStopped,

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Config(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
