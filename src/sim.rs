//! In-process stand-in for a sensor board, for running without hardware.
//!
//! The simulated device streams four-channel sample lines split into 20-byte
//! notifications, answers a calibration-activate command by streaming
//! `[index, raw]` pairs instead, and records every chunk written to it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::parse::LineDecoder;
use crate::protocol::{CHUNK_SIZE, NUM_CHANNELS};
use crate::transport::{Connection, DeviceInfo, NotificationSink, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    pub name: String,
    pub id: String,
}

impl DeviceInfo for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Streaming,
    Calibrating(usize),
}

struct Shared {
    writes: Mutex<Vec<Vec<u8>>>,
    mode: Mutex<Mode>,
    link_lost: Notify,
}

/// A [`Transport`] backed by a synthetic device.
#[derive(Clone)]
pub struct SimulatedTransport {
    device: SimDevice,
    interval: Duration,
    shared: Arc<Shared>,
}

impl SimulatedTransport {
    /// One device that emits a message every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            device: SimDevice {
                name: "JSON_Sender (simulated)".into(),
                id: "00:00:00:00:00:00".into(),
            },
            interval,
            shared: Arc::new(Shared {
                writes: Mutex::new(Vec::new()),
                mode: Mutex::new(Mode::Streaming),
                link_lost: Notify::new(),
            }),
        }
    }

    /// Every chunk written so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.writes.lock().clone()
    }

    /// Sensor index currently in calibration mode, if any.
    pub fn calibrating(&self) -> Option<usize> {
        match *self.shared.mode.lock() {
            Mode::Calibrating(index) => Some(index),
            Mode::Streaming => None,
        }
    }

    /// End the notification stream as if the radio link dropped.
    pub fn drop_link(&self) {
        self.shared.link_lost.notify_one();
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    type Device = SimDevice;
    type Connection = SimConnection;

    async fn discover(&self, timeout: Duration) -> Result<Vec<SimDevice>> {
        tokio::time::sleep(timeout.min(Duration::from_millis(200))).await;
        Ok(vec![self.device.clone()])
    }

    async fn open(&self, device: &SimDevice, _timeout: Duration) -> Result<SimConnection> {
        if device != &self.device {
            return Err(Error::Transport(format!("unknown device {}", device.id)));
        }
        *self.shared.mode.lock() = Mode::Streaming;
        Ok(SimConnection {
            shared: Arc::clone(&self.shared),
            interval: self.interval,
            inbound: Mutex::new(LineDecoder::new()),
            task: None,
        })
    }
}

pub struct SimConnection {
    shared: Arc<Shared>,
    interval: Duration,
    inbound: Mutex<LineDecoder>,
    task: Option<JoinHandle<()>>,
}

impl SimConnection {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn handle_command(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line == "END_CONFIG" {
            return;
        }
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) else {
            info!("sim: received text {line:?}");
            return;
        };
        if let Some(clb) = map.get("clb").and_then(Value::as_bool) {
            let index = map.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            let mode = if clb {
                Mode::Calibrating(index)
            } else {
                Mode::Streaming
            };
            info!("sim: mode -> {mode:?}");
            *self.shared.mode.lock() = mode;
        } else if let Some(sequences) = map.get("sequences").and_then(Value::as_array) {
            info!("sim: received {} timing sequences", sequences.len());
        } else if let Some(state) = map.get("state").and_then(Value::as_bool) {
            info!("sim: system {}", if state { "on" } else { "off" });
        }
    }
}

/// One synthetic message. Values drift deterministically with `tick`.
fn sample_line(mode: Mode, tick: u64, device_ms: i64) -> String {
    match mode {
        Mode::Streaming => {
            let entries: Vec<String> = (0..NUM_CHANNELS as u64)
                .map(|ch| {
                    let raw = 800 + ch * 400 + (tick * 37 + ch * 11) % 200;
                    let mv = (raw as f64 * 3300.0 / 4096.0 * 10.0).round() / 10.0;
                    format!("[\"mV\",{device_ms},{mv},{raw}]")
                })
                .collect();
            format!("[{}]\n", entries.join(","))
        }
        Mode::Calibrating(index) => {
            let raw = 1500 + (tick * 13) % 50;
            format!("[{index},{raw}]\n")
        }
    }
}

#[async_trait]
impl Connection for SimConnection {
    async fn subscribe(&mut self, mut sink: Box<dyn NotificationSink>) -> Result<()> {
        self.stop();
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mode = *shared.mode.lock();
                        let device_ms = started.elapsed().as_millis() as i64;
                        let line = sample_line(mode, tick, device_ms);
                        for fragment in line.as_bytes().chunks(CHUNK_SIZE) {
                            sink.on_fragment(fragment);
                        }
                        tick += 1;
                    }
                    _ = shared.link_lost.notified() => {
                        debug!("sim: link dropped after {tick} messages");
                        break;
                    }
                }
            }
            sink.on_closed();
        }));
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.stop();
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.shared.writes.lock().push(bytes.to_vec());
        let lines: Vec<String> = self.inbound.lock().push(bytes).collect();
        for line in lines {
            self.handle_command(&line);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stop();
        Ok(())
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse_line, Message};

    #[test]
    fn streaming_line_is_a_four_channel_array() {
        let line = sample_line(Mode::Streaming, 3, 1200);
        assert!(line.ends_with('\n'));
        match parse_line(line.trim_end()).unwrap() {
            Message::Channels { entries, declared } => {
                assert_eq!(declared, NUM_CHANNELS);
                assert!(entries.iter().all(Option::is_some));
                assert_eq!(entries[0].as_ref().unwrap().device_timestamp, 1200);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn calibrating_line_is_a_pair() {
        let line = sample_line(Mode::Calibrating(2), 0, 0);
        assert!(matches!(
            parse_line(line.trim_end()).unwrap(),
            Message::Calibration { channel: 2, .. }
        ));
    }

    #[tokio::test]
    async fn calibration_command_switches_mode() {
        let transport = SimulatedTransport::default();
        let device = transport.discover(Duration::ZERO).await.unwrap().remove(0);
        let conn = transport.open(&device, Duration::from_secs(1)).await.unwrap();

        for chunk in br#"{"state":true,"clb":true,"index":1}"#.chunks(20) {
            conn.send(chunk).await.unwrap();
        }
        assert_eq!(transport.calibrating(), None);
        conn.send(b"\n").await.unwrap();
        assert_eq!(transport.calibrating(), Some(1));

        conn.send(b"{\"state\":true,\"clb\":false,\"index\":0}\n").await.unwrap();
        assert_eq!(transport.calibrating(), None);
        assert_eq!(transport.writes().len(), 4);
    }
}
