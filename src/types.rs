//! Records, events and the listener trait shared by every layer.
//!
//! Inbound data takes two shapes on the wire:
//!
//! | Line | Produces |
//! |---|---|
//! | `[["mV", ts, measured, raw], …]` | one [`SampleRecord`] per channel plus one [`ReceptionEvent`] |
//! | `[channel, raw]` | one [`CalibrationSample`] and its degenerate [`SampleRecord`] |

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local, Utc};
use tokio::sync::mpsc;

/// One measurement from one channel, built from a single inbound message.
///
/// Records are immutable: every field, including the optional LED tag, is
/// fixed at construction by the router.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    /// Unit label reported by the device (e.g. `"mV"`).
    pub unit: String,
    /// Device-side timestamp in milliseconds.
    ///
    /// For records derived from a calibration pair this is the host arrival
    /// time in milliseconds since the Unix epoch.
    pub device_timestamp: i64,
    /// Converted value (`mV` column of the wire format).
    pub measured_value: f64,
    /// Raw ADC reading.
    pub raw_value: i64,
    /// Channel index in `0..NUM_CHANNELS`.
    pub channel: usize,
    /// Host time at which the fragment completing this message arrived.
    pub received_at: DateTime<Utc>,
    /// LED pin that was isolated when this record was produced, if any.
    pub source_led: Option<u8>,
}

/// A `[channel, raw]` reading emitted by the device while in calibration mode.
///
/// The firmware enters this mode after a calibration-activate command and
/// streams one pair per reading for the selected sensor until deactivated.
/// Both elements arrive as JSON numbers and are truncated to integers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSample {
    /// Channel index in `0..NUM_CHANNELS`. Pairs naming any other channel
    /// are discarded during classification.
    pub channel: usize,
    /// Raw ADC reading for the channel.
    pub raw_value: i64,
    /// Host time at which the line completed.
    pub received_at: DateTime<Utc>,
}

impl CalibrationSample {
    /// Degenerate sample record used to keep the channel plot continuous while
    /// calibrating: unit `"mV"`, measured value = raw value, device timestamp =
    /// arrival time in milliseconds.
    pub fn to_sample_record(&self) -> SampleRecord {
        SampleRecord {
            unit: "mV".into(),
            device_timestamp: self.received_at.timestamp_millis(),
            measured_value: self.raw_value as f64,
            raw_value: self.raw_value,
            channel: self.channel,
            received_at: self.received_at,
            source_led: None,
        }
    }
}

/// Per-channel entry of a [`ReceptionEvent`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionReading {
    /// Raw ADC reading, copied from [`SampleRecord::raw_value`].
    pub raw: i64,
    /// Converted value, copied from [`SampleRecord::measured_value`].
    pub measured: f64,
    /// LED pin isolated when the reading was taken.
    pub source_led: Option<u8>,
}

/// Everything one inbound channel-array message produced, kept in the
/// session log for later export.
///
/// Only channel-array messages produce one; calibration pairs do not. A
/// message whose entries were all malformed produces none.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceptionEvent {
    /// Host time at which the message completed.
    pub received_at: DateTime<Utc>,
    /// Local wall-clock time of reception, for human-readable exports.
    pub wall_clock: DateTime<Local>,
    /// Readings keyed by channel index; never empty.
    pub readings: BTreeMap<usize, SessionReading>,
    /// LED pin isolated at reception time, if any.
    pub active_led: Option<u8>,
    /// `true` when `active_led` is set.
    pub isolation_mode: bool,
}

/// Link state as seen by the UI. Only the bridge drives transitions.
///
/// ```text
/// Disconnected ──scan──▶ Scanning ──▶ Disconnected
/// Disconnected ──connect──▶ Connecting ──▶ Connected | Disconnected
/// Connected ──disconnect──▶ Disconnecting ──▶ Disconnected
/// Connected ──link lost──▶ Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Whether a transport handle may exist in this state. A client in
    /// `Disconnected` or `Scanning` never holds one.
    pub fn has_link(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Events delivered to the UI when it listens through a channel.
///
/// Consumers receive these through the `mpsc::UnboundedReceiver` paired with
/// the sender passed to [`crate::bridge::Bridge::spawn`].
#[derive(Debug, Clone)]
pub enum SensorEvent {
    /// A sample from a channel-array message, or the degenerate record built
    /// from a calibration pair.
    Sample(SampleRecord),
    /// A calibration pair. Always preceded by the matching `Sample`.
    Calibration(CalibrationSample),
    ConnectionState(ConnectionState),
    /// Human-readable log line, prefixed with `[HH:MM:SS.mmm]`.
    Log(String),
}

/// Receiver of everything the acquisition layer reports.
///
/// Methods are invoked synchronously on whichever thread produced the event:
/// the transport's notification thread for samples, the transport executor
/// thread for state changes. Implementations must hand the event over to
/// their own thread before touching UI state, and must not block.
pub trait SensorListener: Send + Sync {
    /// Every accepted record, in channel order within a message.
    fn on_sample(&self, _sample: &SampleRecord) {}
    /// Calibration pairs, after the matching `on_sample`.
    fn on_calibration_sample(&self, _sample: &CalibrationSample) {}
    /// Called only when the state actually changes.
    fn on_connection_state_changed(&self, _state: ConnectionState) {}
    fn on_log_message(&self, _text: &str) {}
}

impl SensorListener for mpsc::UnboundedSender<SensorEvent> {
    fn on_sample(&self, sample: &SampleRecord) {
        let _ = self.send(SensorEvent::Sample(sample.clone()));
    }

    fn on_calibration_sample(&self, sample: &CalibrationSample) {
        let _ = self.send(SensorEvent::Calibration(*sample));
    }

    fn on_connection_state_changed(&self, state: ConnectionState) {
        let _ = self.send(SensorEvent::ConnectionState(state));
    }

    fn on_log_message(&self, text: &str) {
        let _ = self.send(SensorEvent::Log(text.to_owned()));
    }
}

/// Listener that drops everything; useful for headless tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl SensorListener for NullListener {}

/// Format a log line the way the UI log pane shows it.
pub(crate) fn stamped(message: &str) -> String {
    format!("[{}] {message}", Local::now().format("%H:%M:%S%.3f"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_linked_states_hold_a_handle() {
        assert!(!ConnectionState::Disconnected.has_link());
        assert!(!ConnectionState::Scanning.has_link());
        assert!(ConnectionState::Connecting.has_link());
        assert!(ConnectionState::Connected.has_link());
        assert!(ConnectionState::Disconnecting.has_link());
    }

    #[test]
    fn calibration_sample_becomes_degenerate_record() {
        let received_at = Utc::now();
        let record = CalibrationSample {
            channel: 1,
            raw_value: 742,
            received_at,
        }
        .to_sample_record();
        assert_eq!(record.unit, "mV");
        assert_eq!(record.measured_value, 742.0);
        assert_eq!(record.device_timestamp, received_at.timestamp_millis());
        assert_eq!(record.source_led, None);
    }
}
