//! Inbound framing and message classification.
//!
//! Notifications arrive as arbitrary slices of a newline-delimited UTF-8
//! stream. [`LineDecoder`] reassembles them into complete lines and
//! [`classify`] turns each line into a typed [`Message`].
//!
//! | Shape | Example | Result |
//! |---|---|---|
//! | channel array | `[["mV",100,12.5,512], …]` | [`Message::Channels`] |
//! | calibration pair | `[2, 1834]` | [`Message::Calibration`] |
//! | anything else | `{"fw":"1.0"}` | [`Rejection::UnexpectedShape`] |
//!
//! Both functions are pure and never panic on malformed input.

use serde_json::Value;

use crate::protocol::NUM_CHANNELS;

// ── Framing ──────────────────────────────────────────────────────────────────

/// Default cap on a pending partial line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Reassembles newline-delimited lines from notification fragments.
///
/// Bytes are buffered raw and each complete line is decoded on its own with
/// lossy UTF-8, so a fragment boundary inside a multi-byte code point does
/// not corrupt the text. Lines are trimmed; blank lines are skipped.
///
/// ```
/// # use ledsense_rs::parse::LineDecoder;
/// let mut dec = LineDecoder::new();
/// assert_eq!(dec.push(b"[1,").count(), 0);            // incomplete
/// let lines: Vec<String> = dec.push(b"2]\n[3,4]\n").collect();
/// assert_eq!(lines, vec!["[1,2]", "[3,4]"]);
/// ```
///
/// If more than `max_line_bytes` accumulate without a newline the partial
/// line is discarded and [`LineDecoder::overflows`] is incremented.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Start of the first byte not yet yielded.
    cursor: usize,
    max_line_bytes: usize,
    overflows: u64,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            max_line_bytes: max_line_bytes.max(1),
            overflows: 0,
        }
    }

    /// Append a fragment and return an iterator over every line it completed.
    ///
    /// Lines not consumed before the iterator is dropped are yielded by the
    /// next call.
    pub fn push(&mut self, fragment: &[u8]) -> Lines<'_> {
        self.compact();
        self.buffer.extend_from_slice(fragment);

        let tail_start = self
            .buffer
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |i| i + 1);
        if self.buffer.len() - tail_start > self.max_line_bytes {
            log::warn!(
                "discarding {} bytes received without a line terminator",
                self.buffer.len() - tail_start
            );
            self.buffer.truncate(tail_start);
            self.overflows += 1;
        }
        Lines { decoder: self }
    }

    /// Bytes buffered for the next, not yet complete, line.
    pub fn pending(&self) -> &[u8] {
        &self.buffer[self.cursor..]
    }

    /// Number of partial lines discarded for exceeding the cap.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Drop all buffered bytes.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
    }

    fn compact(&mut self) {
        if self.cursor > 0 {
            self.buffer.drain(..self.cursor);
            self.cursor = 0;
        }
    }

    fn next_line(&mut self) -> Option<String> {
        loop {
            let rest = &self.buffer[self.cursor..];
            let nl = rest.iter().position(|&b| b == b'\n')?;
            let line = String::from_utf8_lossy(&rest[..nl]).trim().to_owned();
            self.cursor += nl + 1;
            if !line.is_empty() {
                return Some(line);
            }
        }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy iterator returned by [`LineDecoder::push`].
pub struct Lines<'a> {
    decoder: &'a mut LineDecoder,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.decoder.next_line()
    }
}

// ── Classification ────────────────────────────────────────────────────────────

/// One `[unit, deviceTimestamp, measuredValue, rawValue]` channel entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReading {
    pub unit: String,
    pub device_timestamp: i64,
    pub measured_value: f64,
    pub raw_value: i64,
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `[channel, raw]` pair sent while the device is in calibration mode.
    Calibration { channel: usize, raw_value: i64 },
    /// Positional channel array. `entries[i]` is channel `i`; `None` marks an
    /// entry of the wrong shape. At most [`NUM_CHANNELS`] entries are kept.
    Channels {
        entries: Vec<Option<ChannelReading>>,
        /// Length of the array as received, before truncation.
        declared: usize,
    },
}

/// Why a line was discarded.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a list, got {0}")]
    UnexpectedShape(&'static str),
    #[error("calibration channel {0} out of range")]
    ChannelOutOfRange(i64),
}

/// Parse and classify one decoded line.
pub fn parse_line(line: &str) -> Result<Message, Rejection> {
    let value: Value = serde_json::from_str(line)?;
    classify(&value)
}

/// Classify an already-parsed JSON value.
///
/// A two-element array of numbers is a calibration pair; any other array is
/// a channel array. Whole-message shape problems are errors; a malformed
/// channel entry only blanks that entry.
pub fn classify(value: &Value) -> Result<Message, Rejection> {
    let items = match value {
        Value::Array(items) => items,
        other => return Err(Rejection::UnexpectedShape(type_name(other))),
    };

    if let [Value::Number(ch), Value::Number(raw)] = items.as_slice() {
        let channel = number_to_i64(ch);
        let raw_value = number_to_i64(raw);
        return match usize::try_from(channel) {
            Ok(c) if c < NUM_CHANNELS => Ok(Message::Calibration {
                channel: c,
                raw_value,
            }),
            _ => Err(Rejection::ChannelOutOfRange(channel)),
        };
    }

    let entries = items
        .iter()
        .take(NUM_CHANNELS)
        .map(channel_reading)
        .collect();
    Ok(Message::Channels {
        entries,
        declared: items.len(),
    })
}

fn channel_reading(value: &Value) -> Option<ChannelReading> {
    let fields = value.as_array()?;
    if fields.len() < 4 {
        return None;
    }
    Some(ChannelReading {
        unit: fields[0].as_str()?.to_owned(),
        device_timestamp: as_number(&fields[1]).map(number_to_i64)?,
        measured_value: fields[2].as_f64()?,
        raw_value: as_number(&fields[3]).map(number_to_i64)?,
    })
}

fn as_number(value: &Value) -> Option<&serde_json::Number> {
    match value {
        Value::Number(n) => Some(n),
        _ => None,
    }
}

/// Integer coercion for numeric fields: floats truncate toward zero.
fn number_to_i64(n: &serde_json::Number) -> i64 {
    n.as_i64()
        .or_else(|| n.as_u64().map(|u| u.min(i64::MAX as u64) as i64))
        .or_else(|| n.as_f64().map(|f| f as i64))
        .unwrap_or_default()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[["mV",100,12.5,512],["mV",101,8.3,330],["mV",102,0,0],["mV",103,0,0]]"#;

    #[test]
    fn reassembles_lines_across_arbitrary_splits() {
        let messages = ["[1,2]", SAMPLE, r#"["µV","température"]"#];
        let stream: Vec<u8> = messages
            .iter()
            .flat_map(|m| m.bytes().chain(std::iter::once(b'\n')))
            .collect();

        for split in [1usize, 2, 3, 7, 20, 64] {
            let mut dec = LineDecoder::new();
            let mut out = Vec::new();
            for fragment in stream.chunks(split) {
                out.extend(dec.push(fragment));
            }
            assert_eq!(out, messages, "split size {split}");
            assert!(dec.pending().is_empty());
        }
    }

    #[test]
    fn split_inside_code_point_is_lossless() {
        let text = "[\"é\"]\n".as_bytes();
        // 'é' is 0xC3 0xA9; split between them.
        let mut dec = LineDecoder::new();
        assert_eq!(dec.push(&text[..3]).count(), 0);
        let lines: Vec<String> = dec.push(&text[3..]).collect();
        assert_eq!(lines, vec!["[\"é\"]"]);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut dec = LineDecoder::new();
        let lines: Vec<String> = dec.push(b"ab\xffcd\n").collect();
        assert_eq!(lines, vec!["ab\u{fffd}cd"]);
    }

    #[test]
    fn blank_lines_and_whitespace_are_skipped() {
        let mut dec = LineDecoder::new();
        let lines: Vec<String> = dec.push(b"\n  \r\n [1,2] \r\n").collect();
        assert_eq!(lines, vec!["[1,2]"]);
    }

    #[test]
    fn unconsumed_lines_survive_until_next_push() {
        let mut dec = LineDecoder::new();
        let mut it = dec.push(b"a\nb\nc");
        assert_eq!(it.next().as_deref(), Some("a"));
        drop(it);
        let rest: Vec<String> = dec.push(b"\n").collect();
        assert_eq!(rest, vec!["b", "c"]);
    }

    #[test]
    fn oversized_partial_line_is_discarded() {
        let mut dec = LineDecoder::with_max_line_bytes(8);
        assert_eq!(dec.push(b"0123456789").count(), 0);
        assert_eq!(dec.overflows(), 1);
        assert!(dec.pending().is_empty());
        let lines: Vec<String> = dec.push(b"[1,2]\n").collect();
        assert_eq!(lines, vec!["[1,2]"]);
    }

    #[test]
    fn classifies_channel_array() {
        match parse_line(SAMPLE).unwrap() {
            Message::Channels { entries, declared } => {
                assert_eq!(declared, 4);
                assert_eq!(entries.len(), 4);
                let first = entries[0].as_ref().unwrap();
                assert_eq!(first.unit, "mV");
                assert_eq!(first.device_timestamp, 100);
                assert_eq!(first.measured_value, 12.5);
                assert_eq!(first.raw_value, 512);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classifies_calibration_pair_with_coercion() {
        match parse_line("[2, 1834.9]").unwrap() {
            Message::Calibration { channel, raw_value } => {
                assert_eq!(channel, 2);
                assert_eq!(raw_value, 1834);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            parse_line("[7, 10]"),
            Err(Rejection::ChannelOutOfRange(7))
        ));
    }

    #[test]
    fn two_element_non_numeric_array_is_channel_array() {
        let msg = parse_line(r#"[["mV",1,2.0,3],"junk"]"#).unwrap();
        match msg {
            Message::Channels { entries, declared } => {
                assert_eq!(declared, 2);
                assert!(entries[0].is_some());
                assert!(entries[1].is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_entries_are_blanked_individually() {
        let line = r#"[["mV",1,2.0],[1,2,3,4],["mV","x",1,1],["mV",5,6.5,7],["mV",8,9,10]]"#;
        match parse_line(line).unwrap() {
            Message::Channels { entries, declared } => {
                assert_eq!(declared, 5);
                assert_eq!(entries.len(), 4);
                assert!(entries[..3].iter().all(Option::is_none));
                assert_eq!(entries[3].as_ref().unwrap().raw_value, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_non_array_and_bad_json() {
        assert!(matches!(
            parse_line(r#"{"state":true}"#),
            Err(Rejection::UnexpectedShape("object"))
        ));
        assert!(matches!(parse_line("42"), Err(Rejection::UnexpectedShape("number"))));
        assert!(matches!(parse_line("[1,2"), Err(Rejection::Json(_))));
    }
}
