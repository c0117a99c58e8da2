//! GATT UUIDs, wire constants and outbound command encoding.
//!
//! The device speaks newline-delimited UTF-8 JSON over the Nordic UART
//! Service (NUS). Inbound lines are handled by [`crate::parse`]; this module
//! covers the outbound direction: serialising a [`Command`] and splitting it
//! into the paced chunk sequence the firmware expects.

use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

// ── Service ──────────────────────────────────────────────────────────────────

/// Nordic UART Service UUID advertised by the sensor board.
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Host → device characteristic (write). Commands are written here in chunks.
pub const NUS_RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Device → host characteristic (notify). Carries sample-line fragments.
pub const NUS_TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

// ── Stream constants ──────────────────────────────────────────────────────────

/// Number of independent sensor channels multiplexed on the link.
pub const NUM_CHANNELS: usize = 4;

/// Default per-channel ring capacity.
pub const MAX_DATA_POINTS: usize = 100;

/// Outbound chunk size in bytes.
///
/// 20 bytes is the ATT payload of the minimum 23-byte MTU, so writes fit
/// without MTU negotiation.
pub const CHUNK_SIZE: usize = 20;

/// Terminator chunk sent after every payload.
pub const LINE_TERMINATOR: &[u8] = b"\n";

/// Marker that takes the firmware out of bulk-configuration mode.
/// Sent after the terminator for timing-configuration uploads.
pub const END_CONFIG_MARKER: &[u8] = b"END_CONFIG\n";

// ── Timing configuration ──────────────────────────────────────────────────────

/// One LED acquisition sequence: LED on, settle, read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimingEntry {
    pub led_pin: u8,
    pub time_open_ms: u32,
    pub time_delay_ms: u32,
    pub time_read_ms: u32,
    pub enabled: bool,
    /// LED drive level. Serialised as `lpo`; omitted when unset.
    #[serde(rename = "lpo", default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u32>,
}

impl TimingEntry {
    /// Firmware overhead added to every cycle, in milliseconds.
    const CYCLE_OVERHEAD_MS: u32 = 10;

    /// Total duration of one on/settle/read cycle including firmware overhead.
    pub fn cycle_time_ms(&self) -> u32 {
        self.time_open_ms + self.time_delay_ms + self.time_read_ms + Self::CYCLE_OVERHEAD_MS
    }

    /// Acquisition rate of this sequence; `0.0` for a zero-length cycle.
    pub fn frequency_hz(&self) -> f64 {
        match self.cycle_time_ms() {
            0 => 0.0,
            ms => 1000.0 / ms as f64,
        }
    }
}

impl Default for TimingEntry {
    fn default() -> Self {
        Self {
            led_pin: 1,
            time_open_ms: 100,
            time_delay_ms: 50,
            time_read_ms: 10,
            enabled: false,
            brightness: Some(40),
        }
    }
}

/// `{"sequences":[...]}` upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    pub sequences: Vec<TimingEntry>,
}

impl TimingConfig {
    /// Build an upload from per-sensor entries: exact duplicates are dropped
    /// (first occurrence wins) and the result is ordered by LED pin.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = TimingEntry>,
    {
        let mut sequences: Vec<TimingEntry> = Vec::new();
        for entry in entries {
            if !sequences.contains(&entry) {
                sequences.push(entry);
            }
        }
        sequences.sort_by_key(|e| e.led_pin);
        Self { sequences }
    }

    pub fn enabled_count(&self) -> usize {
        self.sequences.iter().filter(|e| e.enabled).count()
    }

    /// Number of distinct LED pins with at least one enabled sequence.
    pub fn active_leds(&self) -> usize {
        let mut pins: Vec<u8> = self
            .sequences
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.led_pin)
            .collect();
        pins.sort_unstable();
        pins.dedup();
        pins.len()
    }
}

// ── Calibration / state ───────────────────────────────────────────────────────

/// `{"state":bool,"clb":bool,"index":int}`: enter or leave calibration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub state: bool,
    pub clb: bool,
    pub index: usize,
}

impl CalibrationConfig {
    /// Put sensor `index` into calibration mode: the device then streams
    /// `[index, raw]` pairs instead of channel arrays.
    pub fn activate(index: usize) -> Self {
        Self {
            state: true,
            clb: true,
            index,
        }
    }

    pub fn deactivate() -> Self {
        Self {
            state: true,
            clb: false,
            index: 0,
        }
    }
}

#[derive(Serialize)]
struct StateUpdate {
    state: bool,
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// An outbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Timing(TimingConfig),
    Calibration(CalibrationConfig),
    /// System on/off toggle, `{"state":bool}`.
    State(bool),
    /// Free text; sent timestamp-prefixed and not JSON-wrapped.
    Text(String),
}

impl Command {
    /// Short label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Timing(_) => "timing config",
            Command::Calibration(_) => "calibration config",
            Command::State(_) => "state update",
            Command::Text(_) => "message",
        }
    }

    /// Encode using the current local time for free-text prefixes.
    pub fn encode(&self) -> Result<Transmission> {
        self.encode_at(Local::now())
    }

    /// Encode into a [`Transmission`].
    ///
    /// JSON commands are serialised compactly and terminated with `\n`. Free
    /// text becomes `"[HH:MM:SS.mmm] text"` with any line breaks flattened to
    /// spaces, so the trailing terminator chunk is its only newline.
    pub fn encode_at(&self, now: DateTime<Local>) -> Result<Transmission> {
        let (payload, pacing, end_marker) = match self {
            Command::Timing(cfg) => (json_line(cfg)?, Pacing::TIMING, true),
            Command::Calibration(cfg) => (json_line(cfg)?, Pacing::CALIBRATION, false),
            Command::State(state) => (json_line(&StateUpdate { state: *state })?, Pacing::SHORT, false),
            Command::Text(text) => {
                let flat = text.replace(['\r', '\n'], " ");
                let line = format!("[{}] {flat}", now.format("%H:%M:%S%.3f"));
                (line.into_bytes(), Pacing::SHORT, false)
            }
        };
        Ok(Transmission {
            payload,
            pacing,
            end_marker,
        })
    }
}

fn json_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ── Transmission ──────────────────────────────────────────────────────────────

/// Inter-write delays for one command category.
///
/// The receiver has no flow control; these pauses give it time to drain its
/// UART buffer between writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub between_chunks: Duration,
    pub after_terminator: Duration,
    pub after_marker: Duration,
}

impl Pacing {
    pub const TIMING: Pacing = Pacing {
        between_chunks: Duration::from_millis(50),
        after_terminator: Duration::from_millis(200),
        after_marker: Duration::from_millis(50),
    };
    pub const CALIBRATION: Pacing = Pacing {
        between_chunks: Duration::from_millis(50),
        after_terminator: Duration::from_millis(100),
        after_marker: Duration::ZERO,
    };
    pub const SHORT: Pacing = Pacing {
        between_chunks: Duration::from_millis(20),
        after_terminator: Duration::from_millis(50),
        after_marker: Duration::ZERO,
    };
}

/// One write of a transmission and the pause that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub pause: Duration,
}

/// An encoded command, ready to be chunked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    payload: Vec<u8>,
    pacing: Pacing,
    end_marker: bool,
}

impl Transmission {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    /// Whether the `END_CONFIG` marker follows the terminator.
    pub fn has_end_marker(&self) -> bool {
        self.end_marker
    }

    /// Split the payload into `chunk_size` pieces, followed by the bare
    /// terminator and, for configuration uploads, the end marker.
    ///
    /// A `chunk_size` of zero is treated as one.
    pub fn frames(&self, chunk_size: usize) -> Vec<Frame> {
        let mut frames: Vec<Frame> = self
            .payload
            .chunks(chunk_size.max(1))
            .map(|c| Frame {
                bytes: c.to_vec(),
                pause: self.pacing.between_chunks,
            })
            .collect();
        frames.push(Frame {
            bytes: LINE_TERMINATOR.to_vec(),
            pause: self.pacing.after_terminator,
        });
        if self.end_marker {
            frames.push(Frame {
                bytes: END_CONFIG_MARKER.to_vec(),
                pause: self.pacing.after_marker,
            });
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(pin: u8, enabled: bool) -> TimingEntry {
        TimingEntry {
            led_pin: pin,
            enabled,
            ..TimingEntry::default()
        }
    }

    #[test]
    fn timing_entry_serialises_with_wire_names() {
        let json = serde_json::to_string(&entry(2, true)).unwrap();
        assert_eq!(
            json,
            r#"{"led_pin":2,"time_open_ms":100,"time_delay_ms":50,"time_read_ms":10,"enabled":true,"lpo":40}"#
        );

        let no_brightness = TimingEntry {
            brightness: None,
            ..entry(1, false)
        };
        assert!(!serde_json::to_string(&no_brightness).unwrap().contains("lpo"));
    }

    #[test]
    fn cycle_time_includes_overhead() {
        let e = entry(1, true);
        assert_eq!(e.cycle_time_ms(), 170);
        assert!((e.frequency_hz() - 1000.0 / 170.0).abs() < 1e-9);
    }

    #[test]
    fn from_entries_dedupes_and_sorts_by_pin() {
        let cfg = TimingConfig::from_entries(vec![
            entry(3, true),
            entry(1, true),
            entry(3, true),
            entry(2, false),
            entry(1, true),
        ]);
        let pins: Vec<u8> = cfg.sequences.iter().map(|e| e.led_pin).collect();
        assert_eq!(pins, vec![1, 2, 3]);
        assert_eq!(cfg.enabled_count(), 2);
        assert_eq!(cfg.active_leds(), 2);
    }

    #[test]
    fn json_commands_are_compact_and_newline_terminated() {
        let tx = Command::State(true).encode().unwrap();
        assert_eq!(tx.payload(), b"{\"state\":true}\n");
        assert!(!tx.has_end_marker());

        let tx = Command::Calibration(CalibrationConfig::activate(2))
            .encode()
            .unwrap();
        assert_eq!(tx.payload(), b"{\"state\":true,\"clb\":true,\"index\":2}\n");
        assert_eq!(tx.pacing(), Pacing::CALIBRATION);
    }

    #[test]
    fn text_is_timestamp_prefixed_without_newline() {
        let now = Local.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap();
        let tx = Command::Text("hello\nworld".into()).encode_at(now).unwrap();
        assert_eq!(tx.payload(), b"[13:04:05.000] hello world");
    }

    #[test]
    fn forty_seven_byte_config_splits_into_three_chunks_and_two_markers() {
        let tx = Transmission {
            payload: vec![b'x'; 47],
            pacing: Pacing::TIMING,
            end_marker: true,
        };
        let frames = tx.frames(CHUNK_SIZE);
        let sizes: Vec<usize> = frames.iter().map(|f| f.bytes.len()).collect();
        assert_eq!(sizes, vec![20, 20, 7, 1, 11]);
        assert_eq!(frames[3].bytes, b"\n");
        assert_eq!(frames[4].bytes, b"END_CONFIG\n");
        assert_eq!(frames[3].pause, Duration::from_millis(200));
    }

    #[test]
    fn timing_chunks_reassemble_to_payload() {
        let cfg = TimingConfig::from_entries(vec![entry(1, true), entry(2, true), entry(4, false)]);
        let tx = Command::Timing(cfg.clone()).encode().unwrap();
        let frames = tx.frames(CHUNK_SIZE);
        assert!(frames.iter().all(|f| f.bytes.len() <= CHUNK_SIZE));

        // Payload chunks plus the terminator, without the marker.
        let joined: Vec<u8> = frames[..frames.len() - 1]
            .iter()
            .flat_map(|f| f.bytes.iter().copied())
            .collect();
        let mut expected = serde_json::to_vec(&cfg).unwrap();
        expected.extend_from_slice(b"\n\n");
        assert_eq!(joined, expected);
    }
}
