//! Transport-agnostic collaborator interfaces.
//!
//! The acquisition layer only assumes an ordered, fragmenting, size-limited
//! duplex byte channel. [`crate::ble`] implements it over btleplug,
//! [`crate::sim`] in-process.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Receives inbound fragments, synchronously and in order, on whatever thread
/// the transport delivers notifications on.
pub trait NotificationSink: Send + 'static {
    fn on_fragment(&mut self, fragment: &[u8]);

    /// The notification stream ended without [`Connection::unsubscribe`]
    /// being called (link lost).
    fn on_closed(&mut self) {}
}

/// A device found during discovery.
pub trait DeviceInfo: Clone + fmt::Debug + Send + Sync + 'static {
    /// Advertised name, or `"Unknown"`.
    fn name(&self) -> &str;
    /// Platform identifier (MAC address on Linux, UUID on macOS/Windows).
    fn id(&self) -> String;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Device: DeviceInfo;
    type Connection: Connection;

    /// Discover nearby devices for `timeout`.
    async fn discover(&self, timeout: Duration) -> Result<Vec<Self::Device>>;

    /// Establish a link to `device`.
    ///
    /// `timeout` covers the whole open sequence, not each step. On error,
    /// and when the returned future is dropped before completing, no link
    /// may be left up.
    async fn open(&self, device: &Self::Device, timeout: Duration) -> Result<Self::Connection>;
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Start delivering notifications to `sink`.
    async fn subscribe(&mut self, sink: Box<dyn NotificationSink>) -> Result<()>;

    /// Stop notification delivery. The sink is dropped without `on_closed`.
    async fn unsubscribe(&mut self) -> Result<()>;

    /// Write one chunk; resolves once the transport accepted it.
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
