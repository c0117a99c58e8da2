//! Bounded per-channel sample storage and the session log.
//!
//! All state lives behind one mutex. A message fans out to at most
//! [`NUM_CHANNELS`] appends, so a single lock is uncontended in practice and
//! keeps the ring buffers and the session log mutually consistent.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::protocol::{MAX_DATA_POINTS, NUM_CHANNELS};
use crate::types::{ReceptionEvent, SampleRecord};

/// Point-in-time counters returned by [`ChannelStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StoreStats {
    pub buffered: [usize; NUM_CHANNELS],
    pub session_events: usize,
    /// Channel-array messages that produced at least one record.
    pub messages_received: u64,
    pub last_data_time: Option<DateTime<Utc>>,
}

struct Inner {
    channels: [VecDeque<SampleRecord>; NUM_CHANNELS],
    session: Vec<ReceptionEvent>,
    messages_received: u64,
    last_data_time: Option<DateTime<Utc>>,
    isolated_led: Option<u8>,
}

/// Thread-safe ring buffers (one per channel) plus an append-only session log.
pub struct ChannelStore {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ChannelStore {
    /// Create a store holding at most `capacity` records per channel.
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                channels: std::array::from_fn(|_| VecDeque::with_capacity(capacity)),
                session: Vec::new(),
                messages_received: 0,
                last_data_time: None,
                isolated_led: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one record to its channel, evicting the oldest at capacity.
    /// Records with an out-of-range channel are ignored.
    pub fn append(&self, record: SampleRecord) {
        let mut inner = self.inner.lock();
        push_bounded(&mut inner.channels, self.capacity, record);
    }

    /// Append all records from one message and, if present, its reception
    /// event, under a single lock acquisition.
    pub fn commit(&self, records: &[SampleRecord], event: Option<ReceptionEvent>) {
        let mut inner = self.inner.lock();
        for record in records {
            push_bounded(&mut inner.channels, self.capacity, record.clone());
        }
        if let Some(event) = event {
            inner.messages_received += 1;
            inner.last_data_time = Some(event.received_at);
            inner.session.push(event);
        }
    }

    /// Copy of a channel's buffer, oldest first. Empty for unknown channels.
    pub fn snapshot(&self, channel: usize) -> Vec<SampleRecord> {
        let inner = self.inner.lock();
        inner
            .channels
            .get(channel)
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent record on a channel.
    pub fn latest(&self, channel: usize) -> Option<SampleRecord> {
        let inner = self.inner.lock();
        inner.channels.get(channel)?.back().cloned()
    }

    /// Copy of the whole session log.
    pub fn session_log(&self) -> Vec<ReceptionEvent> {
        self.inner.lock().session.clone()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            buffered: std::array::from_fn(|i| inner.channels[i].len()),
            session_events: inner.session.len(),
            messages_received: inner.messages_received,
            last_data_time: inner.last_data_time,
        }
    }

    /// Empty every channel buffer and the session log, and reset counters.
    /// The LED isolation setting is kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for buf in inner.channels.iter_mut() {
            buf.clear();
        }
        inner.session.clear();
        inner.messages_received = 0;
        inner.last_data_time = None;
    }

    /// Tag subsequent records and reception events with an isolated LED pin,
    /// or stop tagging with `None`.
    pub fn set_led_isolation(&self, led: Option<u8>) {
        self.inner.lock().isolated_led = led;
    }

    pub fn led_isolation(&self) -> Option<u8> {
        self.inner.lock().isolated_led
    }
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new(MAX_DATA_POINTS)
    }
}

fn push_bounded(
    channels: &mut [VecDeque<SampleRecord>; NUM_CHANNELS],
    capacity: usize,
    record: SampleRecord,
) {
    let Some(buf) = channels.get_mut(record.channel) else {
        log::warn!("dropping record for unknown channel {}", record.channel);
        return;
    };
    while buf.len() >= capacity {
        buf.pop_front();
    }
    buf.push_back(record);
}
