//! btleplug transport for Nordic UART Service peripherals.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{NUS_RX_CHARACTERISTIC, NUS_SERVICE_UUID, NUS_TX_CHARACTERISTIC};
use crate::transport::{Connection, DeviceInfo, NotificationSink, Transport};

/// Lower-case substrings of advertised names that identify compatible
/// firmware even when the NUS service UUID is not advertised.
pub const NAME_HINTS: [&str; 4] = ["bluefruit", "feather", "json_sender", "nrf"];

/// Whether an advertisement looks like a compatible sensor board.
pub fn is_compatible(name: Option<&str>, services: &[Uuid]) -> bool {
    if services.contains(&NUS_SERVICE_UUID) {
        return true;
    }
    let name = name.unwrap_or_default().to_lowercase();
    NAME_HINTS.iter().any(|hint| name.contains(hint))
}

// ── BleDevice ─────────────────────────────────────────────────────────────────

/// A compatible peripheral discovered during a scan.
#[derive(Clone)]
pub struct BleDevice {
    /// Advertised device name, or `"Unknown"`.
    pub name: String,
    /// Platform BLE identifier: a UUID string on macOS and Windows, the MAC
    /// address (`AA:BB:CC:DD:EE:FF`) on Linux.
    pub id: String,
    pub(crate) peripheral: Peripheral,
}

impl fmt::Debug for BleDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleDevice")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl DeviceInfo for BleDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> String {
        self.id.clone()
    }
}

// ── BleTransport ──────────────────────────────────────────────────────────────

/// Discovers and opens NUS peripherals on the first Bluetooth adapter.
pub struct BleTransport {
    adapter: Adapter,
}

impl BleTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// On macOS, `CBCentralManager` needs a moment to reach the *poweredOn*
    /// state after initialisation; this waits up to 3 s for it.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoAdapter)?;

        #[cfg(target_os = "macos")]
        wait_powered_on(&adapter).await;

        Ok(Self { adapter })
    }
}

#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    // Scanning before poweredOn is a silent no-op.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => {
                info!("macOS: adapter is PoweredOn");
                break;
            }
            Ok(state) => {
                if tokio::time::Instant::now() >= deadline {
                    warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                    break;
                }
                debug!("macOS: adapter state = {state:?}, waiting");
            }
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[async_trait]
impl Transport for BleTransport {
    type Device = BleDevice;
    type Connection = BleConnection;

    async fn discover(&self, timeout: Duration) -> Result<Vec<BleDevice>> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(timeout).await;
        self.adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in self.adapter.peripherals().await? {
            let Ok(Some(props)) = p.properties().await else {
                continue;
            };
            if !is_compatible(props.local_name.as_deref(), &props.services) {
                continue;
            }
            let name = props.local_name.unwrap_or_else(|| "Unknown".into());
            let id = p.id().to_string();
            info!("discover: found {name}  id={id}  rssi={:?}", props.rssi);
            found.push(BleDevice {
                name,
                id,
                peripheral: p,
            });
        }
        Ok(found)
    }

    async fn open(&self, device: &BleDevice, timeout: Duration) -> Result<BleConnection> {
        let deadline = Instant::now() + timeout;
        let peripheral = device.peripheral.clone();
        let guard = LinkGuard::new(peripheral.clone());

        // BlueZ's Device1.Connect can block forever when the device is out of
        // range.
        within(deadline, timeout, "connect", peripheral.connect()).await?;

        // BlueZ reports the link up before the remote GATT cache is filled;
        // discovering too early returns an empty service set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep_until(deadline.min(Instant::now() + Duration::from_millis(600))).await;

        within(deadline, timeout, "service discovery", peripheral.discover_services()).await?;

        let chars: BTreeSet<Characteristic> = peripheral.characteristics();
        let find_char = |uuid: Uuid| -> Result<Characteristic> {
            chars
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or(Error::MissingCharacteristic(uuid))
        };
        let (rx_char, tx_char) = match (find_char(NUS_RX_CHARACTERISTIC), find_char(NUS_TX_CHARACTERISTIC)) {
            (Ok(rx), Ok(tx)) => (rx, tx),
            (Err(e), _) | (_, Err(e)) => return Err(e),
        };

        let write_type = if rx_char.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        info!(
            "Connected and services discovered: {} (writes {:?})",
            device.name, write_type
        );

        Ok(BleConnection {
            peripheral: guard.disarm(),
            adapter: self.adapter.clone(),
            rx_char,
            tx_char,
            write_type,
            notify_task: None,
        })
    }
}

/// Run one step of [`BleTransport::open`] against the shared deadline.
async fn within<T>(
    deadline: Instant,
    budget: Duration,
    operation: &'static str,
    step: impl Future<Output = btleplug::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout_at(deadline, step).await {
        Ok(r) => Ok(r?),
        Err(_) => Err(Error::Timeout {
            operation,
            after: budget,
        }),
    }
}

/// Disconnects a half-opened peripheral unless disarmed. Covers early
/// returns as well as the open future being dropped mid-way.
struct LinkGuard {
    peripheral: Peripheral,
    armed: bool,
}

impl LinkGuard {
    fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            armed: true,
        }
    }

    fn disarm(mut self) -> Peripheral {
        self.armed = false;
        self.peripheral.clone()
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let peripheral = self.peripheral.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = peripheral.disconnect().await {
                        debug!("disconnect after failed open: {e}");
                    }
                });
            }
            Err(_) => warn!("no runtime to disconnect a half-opened peripheral"),
        }
    }
}

// ── BleConnection ─────────────────────────────────────────────────────────────

pub struct BleConnection {
    peripheral: Peripheral,
    adapter: Adapter,
    rx_char: Characteristic,
    tx_char: Characteristic,
    write_type: WriteType,
    notify_task: Option<JoinHandle<()>>,
}

impl BleConnection {
    fn stop_notify_task(&mut self) {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
    }
}

/// Resolves when the adapter reports `id` disconnected. Never resolves if
/// adapter events are unavailable.
async fn disconnected(adapter: Adapter, id: PeripheralId) {
    match adapter.events().await {
        Ok(mut events) => {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        info!("Disconnect watcher: device {gone:?} disconnected.");
                        return;
                    }
                }
            }
        }
        Err(e) => warn!("Disconnect watcher: could not subscribe to adapter events: {e}"),
    }
    futures::future::pending::<()>().await
}

#[async_trait]
impl Connection for BleConnection {
    async fn subscribe(&mut self, mut sink: Box<dyn NotificationSink>) -> Result<()> {
        self.stop_notify_task();
        self.peripheral.subscribe(&self.tx_char).await?;
        let mut notifications = self.peripheral.notifications().await?;
        let watcher = disconnected(self.adapter.clone(), self.peripheral.id());

        self.notify_task = Some(tokio::spawn(async move {
            tokio::pin!(watcher);
            loop {
                tokio::select! {
                    next = notifications.next() => match next {
                        Some(n) if n.uuid == NUS_TX_CHARACTERISTIC => sink.on_fragment(&n.value),
                        Some(n) => debug!("Unknown notification from {}", n.uuid),
                        None => {
                            info!("NUS notification stream ended");
                            break;
                        }
                    },
                    _ = &mut watcher => break,
                }
            }
            sink.on_closed();
        }));
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.stop_notify_task();
        self.peripheral.unsubscribe(&self.tx_char).await?;
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.rx_char, bytes, self.write_type)
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stop_notify_task();
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for BleConnection {
    fn drop(&mut self) {
        self.stop_notify_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nus_service_marks_device_compatible() {
        assert!(is_compatible(None, &[NUS_SERVICE_UUID]));
        assert!(is_compatible(Some("Thermo"), &[Uuid::nil(), NUS_SERVICE_UUID]));
    }

    #[test]
    fn name_hints_are_case_insensitive() {
        assert!(is_compatible(Some("Adafruit Bluefruit LE"), &[]));
        assert!(is_compatible(Some("JSON_Sender"), &[]));
        assert!(is_compatible(Some("nRF52840"), &[]));
        assert!(!is_compatible(Some("HR-Strap 01"), &[]));
        assert!(!is_compatible(None, &[]));
    }
}
