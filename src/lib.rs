//! # ledsense-rs
//!
//! Acquisition layer for multi-channel LED/photodiode sensor boards that
//! stream JSON lines over the Bluetooth Low Energy
//! [Nordic UART Service](https://docs.nordicsemi.com/bundle/ncs-latest/page/nrf/libraries/bluetooth/services/nus.html).
//!
//! Notifications arrive in fragments of at most 20 bytes. The crate
//! reassembles them into lines, classifies each line as a four-channel sample
//! array or a `[channel, raw]` calibration pair, keeps the most recent
//! samples per channel in bounded buffers, and pushes chunked, paced
//! configuration commands back to the board.
//!
//! ## Wire format
//!
//! | Direction | Shape | Meaning |
//! |---|---|---|
//! | device → host | `[["mV", ts, measured, raw], …×4]\n` | one sample per channel |
//! | device → host | `[channel, raw]\n` | calibration reading |
//! | host → device | `{"sequences":[…]}\n` + `END_CONFIG\n` | LED timing upload |
//! | host → device | `{"state":true,"clb":bool,"index":i}\n` | calibration mode |
//! | host → device | `{"state":bool}\n` | system on/off |
//! | host → device | `[HH:MM:SS.mmm] text` + `\n` | free text |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ledsense_rs::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SensorEvent>();
//!     let bridge = Bridge::spawn(ClientConfig::default(), Arc::new(tx), BleTransport::new)?;
//!
//!     let device = bridge.scan().wait()?.into_iter().next().ok_or_else(|| anyhow::anyhow!("no device"))?;
//!     bridge.connect(device).wait()?;
//!
//!     while let Some(event) = rx.blocking_recv() {
//!         if let SensorEvent::Sample(s) = event {
//!             println!("ch{} raw={} {}{}", s.channel, s.raw_value, s.measured_value, s.unit);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`bridge`] | Dedicated transport thread, job queue and [`bridge::Pending`] results |
//! | [`client`] | Async connection state machine and chunked command transmitter |
//! | [`transport`] | Traits a byte transport implements |
//! | [`ble`] | btleplug transport for NUS peripherals |
//! | [`sim`] | Simulated device, no hardware required |
//! | [`router`] | Line classification results → store and listener |
//! | [`store`] | Bounded per-channel buffers and the session log |
//! | [`parse`] | Fragment reassembly and message classification |
//! | [`protocol`] | UUIDs, constants and outbound command encoding |
//! | [`calibration`] | Calibration points and polynomial curves |
//! | [`types`] | Records, events and the listener trait |
//! | [`config`] | Client tunables |

pub mod ble;
pub mod bridge;
pub mod calibration;
pub mod client;
pub mod config;
pub mod error;
pub mod parse;
pub mod protocol;
pub mod router;
pub mod sim;
pub mod store;
pub mod transport;
pub mod types;

pub use config::ClientConfig;
pub use error::{Error, Result};

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Bridge and client ─────────────────────────────────────────────────────
    pub use crate::bridge::{Bridge, Pending};
    pub use crate::client::SensorClient;
    pub use crate::config::ClientConfig;
    pub use crate::error::{Error, Result};

    // ── Transports ────────────────────────────────────────────────────────────
    pub use crate::ble::{BleDevice, BleTransport};
    pub use crate::sim::{SimDevice, SimulatedTransport};
    pub use crate::transport::{Connection, DeviceInfo, NotificationSink, Transport};

    // ── Records and events ────────────────────────────────────────────────────
    pub use crate::store::{ChannelStore, StoreStats};
    pub use crate::types::{
        CalibrationSample, ConnectionState, NullListener, ReceptionEvent, SampleRecord,
        SensorEvent, SensorListener, SessionReading,
    };

    // ── Commands and calibration ──────────────────────────────────────────────
    pub use crate::calibration::{CalibrationCurve, CalibrationSession};
    pub use crate::protocol::{
        CalibrationConfig, Command, TimingConfig, TimingEntry, NUM_CHANNELS,
    };
}
