//! Inbound path: decoded lines to records, the store and the listener.
//!
//! [`FragmentPipeline`] is the [`NotificationSink`] a connection feeds. It
//! reassembles fragments with a [`LineDecoder`] and hands every complete line
//! to a [`Router`], which classifies it and fans the result out in arrival
//! order on the calling thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use log::{debug, info, warn};

use crate::parse::{parse_line, ChannelReading, LineDecoder, Message};
use crate::protocol::NUM_CHANNELS;
use crate::store::ChannelStore;
use crate::transport::NotificationSink;
use crate::types::{
    stamped, CalibrationSample, ReceptionEvent, SampleRecord, SensorListener, SessionReading,
};

/// Turns decoded lines into records, stores them and notifies the listener.
///
/// Nothing here returns an error: a line that cannot be used is reported
/// through the log and dropped, and processing continues with the next one.
pub struct Router {
    store: Arc<ChannelStore>,
    listener: Arc<dyn SensorListener>,
}

impl Router {
    pub fn new(store: Arc<ChannelStore>, listener: Arc<dyn SensorListener>) -> Self {
        Self { store, listener }
    }

    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }

    /// Route one complete line received at `received_at`.
    pub fn route_line(&self, line: &str, received_at: DateTime<Utc>) {
        match parse_line(line) {
            Ok(Message::Calibration { channel, raw_value }) => {
                let sample = CalibrationSample {
                    channel,
                    raw_value,
                    received_at,
                };
                let record = sample.to_sample_record();
                self.store.append(record.clone());
                self.listener.on_sample(&record);
                self.listener.on_calibration_sample(&sample);
            }
            Ok(Message::Channels { entries, declared }) => {
                if declared != NUM_CHANNELS {
                    self.report(&format!(
                        "Warning: expected {NUM_CHANNELS} channels, got {declared}"
                    ));
                }
                self.route_channels(entries, received_at);
            }
            Err(e) => self.report(&format!("{e} | raw: {line}")),
        }
    }

    fn route_channels(&self, entries: Vec<Option<ChannelReading>>, received_at: DateTime<Utc>) {
        let source_led = self.store.led_isolation();
        let mut records = Vec::with_capacity(entries.len());
        for (channel, entry) in entries.into_iter().enumerate() {
            let Some(reading) = entry else {
                debug!("channel {channel}: malformed entry skipped");
                continue;
            };
            records.push(SampleRecord {
                unit: reading.unit,
                device_timestamp: reading.device_timestamp,
                measured_value: reading.measured_value,
                raw_value: reading.raw_value,
                channel,
                received_at,
                source_led,
            });
        }
        if records.is_empty() {
            return;
        }

        let readings: BTreeMap<usize, SessionReading> = records
            .iter()
            .map(|r| {
                (
                    r.channel,
                    SessionReading {
                        raw: r.raw_value,
                        measured: r.measured_value,
                        source_led: r.source_led,
                    },
                )
            })
            .collect();
        let event = ReceptionEvent {
            received_at,
            wall_clock: received_at.with_timezone(&Local),
            readings,
            active_led: source_led,
            isolation_mode: source_led.is_some(),
        };

        self.store.commit(&records, Some(event));
        for record in &records {
            self.listener.on_sample(record);
        }
    }

    /// Log a warning and forward it to the UI log.
    pub(crate) fn report(&self, message: &str) {
        warn!("{message}");
        self.listener.on_log_message(&stamped(message));
    }

    /// Log at info level and forward it to the UI log.
    pub(crate) fn announce(&self, message: &str) {
        info!("{message}");
        self.listener.on_log_message(&stamped(message));
    }
}

/// Notification sink that feeds fragments through a [`LineDecoder`] into a
/// [`Router`]. One pipeline is created per connection.
pub struct FragmentPipeline {
    decoder: LineDecoder,
    router: Arc<Router>,
    fragments: u64,
    on_closed: Option<Box<dyn FnOnce() + Send>>,
}

impl FragmentPipeline {
    pub fn new(router: Arc<Router>, max_line_bytes: usize) -> Self {
        Self {
            decoder: LineDecoder::with_max_line_bytes(max_line_bytes),
            router,
            fragments: 0,
            on_closed: None,
        }
    }

    /// Run `hook` once if the transport reports that the stream ended.
    pub fn on_link_lost(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_closed = Some(Box::new(hook));
        self
    }
}

impl NotificationSink for FragmentPipeline {
    fn on_fragment(&mut self, fragment: &[u8]) {
        let received_at = Utc::now();
        self.fragments += 1;
        if self.fragments <= 3 || self.fragments % 500 == 0 {
            debug!(
                "notification #{} len={} pending={}",
                self.fragments,
                fragment.len(),
                self.decoder.pending().len()
            );
        }
        for line in self.decoder.push(fragment) {
            self.router.route_line(&line, received_at);
        }
    }

    fn on_closed(&mut self) {
        info!("notification stream ended after {} fragments", self.fragments);
        if !self.decoder.pending().is_empty() {
            debug!("dropping {} bytes of an unterminated line", self.decoder.pending().len());
        }
        self.decoder.reset();
        if let Some(hook) = self.on_closed.take() {
            hook();
        }
    }
}
