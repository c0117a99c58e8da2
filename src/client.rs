//! Connection state machine and chunked command transmitter.
//!
//! [`SensorClient`] is the async core: it must only be driven from one task.
//! Synchronous callers go through [`crate::bridge::Bridge`], which owns a
//! client on a dedicated executor thread.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::Command;
use crate::router::{FragmentPipeline, Router};
use crate::store::ChannelStore;
use crate::transport::{Connection, DeviceInfo, Transport};
use crate::types::{ConnectionState, SensorListener};

/// Extra time granted to a transport's own discovery window before the
/// client gives up on it.
const SCAN_GRACE: Duration = Duration::from_secs(2);

/// Extra time granted to [`Transport::open`], which owns the connect
/// deadline itself, before the client abandons it.
const CONNECT_GRACE: Duration = Duration::from_secs(2);

/// Connection state readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct StateHandle(Arc<Mutex<ConnectionState>>);

impl StateHandle {
    pub fn get(&self) -> ConnectionState {
        *self.0.lock()
    }

    fn set(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.0.lock(), state)
    }
}

/// The notification stream of connection number `generation` ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLoss {
    pub generation: u64,
}

/// Drives one [`Transport`] through the connection state machine.
///
/// Inbound fragments are routed into the shared [`ChannelStore`] and the
/// listener from the transport's notification context; outbound commands are
/// encoded, chunked and paced by [`send`](Self::send).
///
/// A client holds at most one connection. While the state is anything other
/// than `Connected`, no connection handle is held.
pub struct SensorClient<T: Transport> {
    transport: T,
    config: ClientConfig,
    router: Arc<Router>,
    listener: Arc<dyn SensorListener>,
    state: StateHandle,
    connection: Option<T::Connection>,
    device_name: Option<String>,
    generation: u64,
    link_loss_tx: Option<mpsc::UnboundedSender<LinkLoss>>,
}

impl<T: Transport> SensorClient<T> {
    /// Create an idle client. Records are committed to `store`; `listener`
    /// receives samples, state changes and log lines.
    pub fn new(
        transport: T,
        config: ClientConfig,
        store: Arc<ChannelStore>,
        listener: Arc<dyn SensorListener>,
    ) -> Self {
        let router = Arc::new(Router::new(store, Arc::clone(&listener)));
        Self {
            transport,
            config,
            router,
            listener,
            state: StateHandle::default(),
            connection: None,
            device_name: None,
            generation: 0,
            link_loss_tx: None,
        }
    }

    /// Receiver for link-loss notices. Feed each one back into
    /// [`handle_link_loss`](Self::handle_link_loss). Calling this again
    /// replaces the previous receiver for future connections.
    pub fn link_loss_events(&mut self) -> mpsc::UnboundedReceiver<LinkLoss> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.link_loss_tx = Some(tx);
        rx
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// A clone of the state cell, for reading the state from other threads.
    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// The store inbound records are committed to.
    pub fn store(&self) -> &Arc<ChannelStore> {
        self.router.store()
    }

    /// Tunables this client was created with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Name of the connected device, if any.
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    fn set_state(&self, state: ConnectionState) {
        debug_assert!(
            self.connection.is_none() || state.has_link(),
            "connection handle held while entering {state}"
        );
        let previous = self.state.set(state);
        if previous != state {
            debug!("connection state {previous} -> {state}");
            self.listener.on_connection_state_changed(state);
        }
    }

    fn require_idle(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected => Ok(()),
            other => Err(Error::InvalidState(other)),
        }
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// Discover devices for `timeout`. Only allowed while disconnected; the
    /// state returns to `Disconnected` whatever the outcome.
    pub async fn scan(&mut self, timeout: Duration) -> Result<Vec<T::Device>> {
        self.require_idle()?;
        self.set_state(ConnectionState::Scanning);
        self.router
            .announce(&format!("Scanning for devices ({}s)...", timeout.as_secs()));

        let result = match tokio::time::timeout(
            timeout + SCAN_GRACE,
            self.transport.discover(timeout),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout {
                operation: "scan",
                after: timeout,
            }),
        };
        self.set_state(ConnectionState::Disconnected);

        match &result {
            Ok(devices) => {
                self.router
                    .announce(&format!("Found {} device(s)", devices.len()));
                for d in devices {
                    info!("  {} ({})", d.name(), d.id());
                }
            }
            Err(e) => self.router.report(&format!("Scan failed: {e}")),
        }
        result
    }

    // ── Connect / disconnect ─────────────────────────────────────────────────

    /// Open a link to `device` and subscribe to its notifications.
    ///
    /// `timeout` is handed to [`Transport::open`], which must honour it. A
    /// transport that overruns it by more than a short grace period is
    /// abandoned and the attempt fails with [`Error::Timeout`].
    ///
    /// On any failure the partially-opened link is closed and the state
    /// returns to `Disconnected`.
    pub async fn connect(&mut self, device: &T::Device, timeout: Duration) -> Result<()> {
        self.require_idle()?;
        self.set_state(ConnectionState::Connecting);
        self.router
            .announce(&format!("Connecting to {} ({})...", device.name(), device.id()));

        let opened = match tokio::time::timeout(
            timeout + CONNECT_GRACE,
            self.transport.open(device, timeout),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout {
                operation: "connect",
                after: timeout,
            }),
        };
        let mut connection = match opened {
            Ok(c) => c,
            Err(e) => {
                self.router.report(&format!("Connection failed: {e}"));
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.generation += 1;
        let mut pipeline = FragmentPipeline::new(Arc::clone(&self.router), self.config.max_line_bytes);
        if let Some(tx) = self.link_loss_tx.clone() {
            let generation = self.generation;
            pipeline = pipeline.on_link_lost(move || {
                let _ = tx.send(LinkLoss { generation });
            });
        }

        if let Err(e) = connection.subscribe(Box::new(pipeline)).await {
            self.router
                .report(&format!("Failed to subscribe to notifications: {e}"));
            if let Err(close_err) = connection.close().await {
                debug!("close after failed subscribe: {close_err}");
            }
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        self.connection = Some(connection);
        self.device_name = Some(device.name().to_owned());
        self.set_state(ConnectionState::Connected);
        self.router
            .announce(&format!("Connected to {}", device.name()));
        Ok(())
    }

    /// Unsubscribe and close the current link. Sample data is kept.
    ///
    /// The state ends at `Disconnected` even if the transport reports an
    /// error; the first such error is returned.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let Some(mut connection) = self.connection.take() else {
            self.set_state(ConnectionState::Disconnected);
            return Err(Error::NotConnected);
        };
        self.set_state(ConnectionState::Disconnecting);

        let unsubscribed = connection.unsubscribe().await;
        let closed = connection.close().await;
        self.device_name = None;
        self.set_state(ConnectionState::Disconnected);

        let result = unsubscribed.and(closed);
        match &result {
            Ok(()) => self.router.announce("Disconnected"),
            Err(e) => self.router.report(&format!("Disconnect error: {e}")),
        }
        result
    }

    /// React to a [`LinkLoss`] notice. Stale notices from earlier
    /// connections are ignored.
    pub async fn handle_link_loss(&mut self, notice: LinkLoss) {
        if notice.generation != self.generation || self.state() != ConnectionState::Connected {
            debug!("ignoring stale link-loss notice {notice:?}");
            return;
        }
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!("close after link loss: {e}");
            }
        }
        let name = self.device_name.take().unwrap_or_else(|| "device".into());
        self.set_state(ConnectionState::Disconnected);
        self.router.report(&format!("Link to {name} lost"));
    }

    // ── Outbound commands ────────────────────────────────────────────────────

    /// Encode `command` and write it chunk by chunk, honouring its pacing.
    ///
    /// Fails with [`Error::NotConnected`] before touching the transport when
    /// no link is up. The first chunk failure aborts the rest of the
    /// sequence; nothing is retried.
    pub async fn send(&self, command: &Command) -> Result<()> {
        let connection = match (&self.connection, self.state()) {
            (Some(c), ConnectionState::Connected) => c,
            _ => return Err(Error::NotConnected),
        };
        let transmission = command.encode()?;
        let frames = transmission.frames(self.config.chunk_size);
        debug!(
            "sending {} ({} bytes, {} chunks)",
            command.kind(),
            transmission.payload().len(),
            frames.len()
        );

        let write_timeout = self.config.write_timeout();
        let total = frames.len();
        for (i, frame) in frames.iter().enumerate() {
            let written = match tokio::time::timeout(write_timeout, connection.send(&frame.bytes)).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout {
                    operation: "write",
                    after: write_timeout,
                }),
            };
            if let Err(e) = written {
                self.router.report(&format!(
                    "Failed to send {} (chunk {}/{total}): {e}",
                    command.kind(),
                    i + 1
                ));
                return Err(e);
            }
            if !frame.pause.is_zero() {
                tokio::time::sleep(frame.pause).await;
            }
        }

        self.router.announce(&format!("Sent {}", command.kind()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    use async_trait::async_trait;

    use crate::protocol::{CalibrationConfig, TimingConfig, TimingEntry, END_CONFIG_MARKER};
    use crate::transport::NotificationSink;
    use crate::types::{NullListener, SensorEvent};

    #[derive(Debug, Clone)]
    struct FakeDevice;

    impl DeviceInfo for FakeDevice {
        fn name(&self) -> &str {
            "LEDSense-Test"
        }
        fn id(&self) -> String {
            "00:11:22:33:44:55".into()
        }
    }

    #[derive(Default)]
    struct Calls {
        writes: Vec<Vec<u8>>,
        subscribes: usize,
        unsubscribes: usize,
        closes: usize,
        abandoned_opens: usize,
        sink: Option<Box<dyn NotificationSink>>,
    }

    #[derive(Default, Clone)]
    struct FakeTransport {
        calls: Arc<Mutex<Calls>>,
        fail_open: bool,
        hang_open: bool,
        fail_write_at: Option<usize>,
        hang_write_at: Option<usize>,
    }

    struct FakeConnection {
        calls: Arc<Mutex<Calls>>,
        fail_write_at: Option<usize>,
        hang_write_at: Option<usize>,
    }

    /// Counts an `open` future dropped before it finished.
    struct OpenInFlight(Arc<Mutex<Calls>>);

    impl Drop for OpenInFlight {
        fn drop(&mut self) {
            self.0.lock().abandoned_opens += 1;
        }
    }

    impl fmt::Debug for FakeConnection {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("FakeConnection")
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        type Device = FakeDevice;
        type Connection = FakeConnection;

        async fn discover(&self, _timeout: Duration) -> Result<Vec<FakeDevice>> {
            Ok(vec![FakeDevice])
        }

        async fn open(&self, _device: &FakeDevice, _timeout: Duration) -> Result<FakeConnection> {
            if self.fail_open {
                return Err(Error::Transport("refused".into()));
            }
            if self.hang_open {
                let _in_flight = OpenInFlight(Arc::clone(&self.calls));
                futures::future::pending::<()>().await;
            }
            Ok(FakeConnection {
                calls: Arc::clone(&self.calls),
                fail_write_at: self.fail_write_at,
                hang_write_at: self.hang_write_at,
            })
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn subscribe(&mut self, sink: Box<dyn NotificationSink>) -> Result<()> {
            let mut calls = self.calls.lock();
            calls.subscribes += 1;
            calls.sink = Some(sink);
            Ok(())
        }
        async fn unsubscribe(&mut self) -> Result<()> {
            let mut calls = self.calls.lock();
            calls.unsubscribes += 1;
            calls.sink = None;
            Ok(())
        }
        async fn send(&self, bytes: &[u8]) -> Result<()> {
            let hang = {
                let mut calls = self.calls.lock();
                let index = calls.writes.len();
                if Some(index) == self.fail_write_at {
                    return Err(Error::Transport("write rejected".into()));
                }
                if Some(index) == self.hang_write_at {
                    true
                } else {
                    calls.writes.push(bytes.to_vec());
                    false
                }
            };
            if hang {
                futures::future::pending::<()>().await;
            }
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            self.calls.lock().closes += 1;
            Ok(())
        }
    }

    fn client(transport: FakeTransport) -> SensorClient<FakeTransport> {
        SensorClient::new(
            transport,
            ClientConfig::default(),
            Arc::new(ChannelStore::default()),
            Arc::new(NullListener),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_touches_nothing() {
        let transport = FakeTransport::default();
        let c = client(transport.clone());
        let err = c.send(&Command::State(true)).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(transport.calls.lock().writes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_subscribes_then_disconnect_tears_down() {
        let transport = FakeTransport::default();
        let (tx, mut rx) = mpsc::unbounded_channel::<SensorEvent>();
        let mut c = SensorClient::new(
            transport.clone(),
            ClientConfig::default(),
            Arc::new(ChannelStore::default()),
            Arc::new(tx),
        );

        c.connect(&FakeDevice, Duration::from_secs(1)).await.unwrap();
        assert_eq!(c.state(), ConnectionState::Connected);
        assert_eq!(c.device_name(), Some("LEDSense-Test"));
        assert_eq!(transport.calls.lock().subscribes, 1);

        let err = c.connect(&FakeDevice, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(ConnectionState::Connected)));

        c.disconnect().await.unwrap();
        assert_eq!(c.state(), ConnectionState::Disconnected);
        {
            let calls = transport.calls.lock();
            assert_eq!((calls.unsubscribes, calls.closes), (1, 1));
        }
        assert!(matches!(c.disconnect().await, Err(Error::NotConnected)));

        let mut states = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let SensorEvent::ConnectionState(s) = ev {
                states.push(s);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_returns_to_disconnected() {
        let transport = FakeTransport {
            fail_open: true,
            ..Default::default()
        };
        let mut c = client(transport);
        assert!(c.connect(&FakeDevice, Duration::from_secs(1)).await.is_err());
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_returns_to_disconnected() {
        let mut c = client(FakeTransport::default());
        let found = c.scan(Duration::from_secs(1)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn timing_config_is_chunked_in_order_with_marker() {
        let transport = FakeTransport::default();
        let mut c = client(transport.clone());
        c.connect(&FakeDevice, Duration::from_secs(1)).await.unwrap();

        let config = TimingConfig::from_entries([TimingEntry::default()]);
        let command = Command::Timing(config);
        c.send(&command).await.unwrap();

        let payload = command.encode().unwrap().payload().to_vec();
        let writes = transport.calls.lock().writes.clone();
        let (body, tail) = writes.split_at(writes.len() - 2);
        assert!(body.iter().all(|w| w.len() <= 20));
        assert_eq!(body.concat(), payload);
        assert_eq!(tail[0], b"\n");
        assert_eq!(tail[1], END_CONFIG_MARKER);
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_config_has_no_marker() {
        let transport = FakeTransport::default();
        let mut c = client(transport.clone());
        c.connect(&FakeDevice, Duration::from_secs(1)).await.unwrap();
        c.send(&Command::Calibration(CalibrationConfig::activate(2)))
            .await
            .unwrap();

        let writes = transport.calls.lock().writes.clone();
        assert_eq!(writes.last().unwrap(), b"\n");
        assert!(!writes.iter().any(|w| w == END_CONFIG_MARKER));
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_failure_aborts_remaining_chunks() {
        let transport = FakeTransport {
            fail_write_at: Some(1),
            ..Default::default()
        };
        let mut c = client(transport.clone());
        c.connect(&FakeDevice, Duration::from_secs(1)).await.unwrap();

        let command = Command::Timing(TimingConfig::from_entries([TimingEntry::default()]));
        assert!(c.send(&command).await.is_err());
        assert_eq!(transport.calls.lock().writes.len(), 1);
        assert_eq!(c.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_disconnects_and_keeps_data() {
        let transport = FakeTransport::default();
        let mut c = client(transport.clone());
        let mut lost = c.link_loss_events();
        c.connect(&FakeDevice, Duration::from_secs(1)).await.unwrap();

        let mut sink = transport.calls.lock().sink.take().unwrap();
        sink.on_fragment(b"[[\"mV\",1,1.0,1],[\"mV\",2,2.0,2],[\"mV\",3,3.0,3],[\"mV\",4,4.0,4]]\n");
        sink.on_closed();

        let notice = lost.recv().await.unwrap();
        c.handle_link_loss(notice).await;
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert_eq!(c.store().stats().session_events, 1);
        assert!(matches!(
            c.send(&Command::State(false)).await,
            Err(Error::NotConnected)
        ));

        // A late duplicate for the same link is harmless.
        c.handle_link_loss(notice).await;
        assert_eq!(transport.calls.lock().closes, 1);
    }

    /// Paused-clock timers fire on millisecond ticks.
    fn assert_elapsed(started: tokio::time::Instant, expected: Duration) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= expected && elapsed <= expected + Duration::from_millis(1),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timing_upload_honours_pacing() {
        let transport = FakeTransport::default();
        let mut c = client(transport.clone());
        c.connect(&FakeDevice, Duration::from_secs(1)).await.unwrap();

        let entries = (1..=3).map(|pin| TimingEntry {
            led_pin: pin,
            enabled: true,
            ..TimingEntry::default()
        });
        let command = Command::Timing(TimingConfig::from_entries(entries));
        let chunks = command.encode().unwrap().payload().len().div_ceil(20) as u32;
        assert!(chunks > 1);

        let started = tokio::time::Instant::now();
        c.send(&command).await.unwrap();
        let expected = Duration::from_millis(50) * chunks
            + Duration::from_millis(200)
            + Duration::from_millis(50);
        assert_elapsed(started, expected);
        assert_eq!(transport.calls.lock().writes.len(), chunks as usize + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn short_commands_use_short_pacing() {
        let transport = FakeTransport::default();
        let mut c = client(transport.clone());
        c.connect(&FakeDevice, Duration::from_secs(1)).await.unwrap();

        let started = tokio::time::Instant::now();
        c.send(&Command::State(true)).await.unwrap();
        // `{"state":true}\n` fits one chunk, then the terminator.
        assert_elapsed(started, Duration::from_millis(20 + 50));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_write_times_out_and_aborts() {
        let transport = FakeTransport {
            hang_write_at: Some(1),
            ..Default::default()
        };
        let mut c = client(transport.clone());
        c.connect(&FakeDevice, Duration::from_secs(1)).await.unwrap();

        let command = Command::Timing(TimingConfig::from_entries([TimingEntry::default()]));
        let started = tokio::time::Instant::now();
        let err = c.send(&command).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "write", .. }));
        assert_elapsed(started, Duration::from_millis(50) + c.config().write_timeout());
        assert_eq!(transport.calls.lock().writes.len(), 1);
        assert_eq!(c.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_open_is_abandoned() {
        let transport = FakeTransport {
            hang_open: true,
            ..Default::default()
        };
        let mut c = client(transport.clone());

        let started = tokio::time::Instant::now();
        let err = c.connect(&FakeDevice, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "connect", .. }));
        assert_elapsed(started, Duration::from_secs(1) + CONNECT_GRACE);
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert_eq!(transport.calls.lock().abandoned_opens, 1);
        assert_eq!(transport.calls.lock().subscribes, 0);
    }
}
