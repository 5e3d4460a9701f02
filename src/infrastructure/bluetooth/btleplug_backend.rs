//! btleplug-backed radio access.
//!
//! [`BtleplugScanBackend`] feeds advertisements to the scanner and
//! [`BtleplugLink`] runs GATT operations for the session. Every operation runs
//! on its own task and reports back over the session mailbox.

use crate::domain::models::CharacteristicKind;
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::bluetooth::link::{
    ConnectionId, GattLink, GattOp, LinkEvent, LinkEventKind, OpFailure,
};
use crate::infrastructure::bluetooth::protocol::{ENABLE_NOTIFICATION_VALUE, SERVICE_UUID};
use crate::infrastructure::bluetooth::scanner::{ScanBackend, ScanReport};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::join_all;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Largest attribute value GATT allows.
const MAX_ATTRIBUTE_LEN: usize = 512;

/// How often the peripheral list is re-checked while scanning for an address.
const RESOLVE_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on waiting for closed connections at shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// First adapter reported by the platform.
pub async fn default_adapter() -> Result<Adapter, BleError> {
    let manager = Manager::new().await.map_err(BleError::from_scan)?;
    let adapters = manager.adapters().await.map_err(BleError::from_scan)?;
    let adapter = adapters.into_iter().next().ok_or_else(|| {
        error!("No Bluetooth adapters found");
        BleError::AdapterUnavailable
    })?;
    if let Ok(info) = adapter.adapter_info().await {
        info!("Using Bluetooth adapter: {}", info);
    }
    Ok(adapter)
}

/// Address string used to identify a peripheral across scan and connect.
///
/// Some platforms hide the link-layer address and report all zeros; the
/// platform peripheral id stands in for it there.
fn peripheral_address(peripheral: &Peripheral, properties: &PeripheralProperties) -> String {
    if properties.address == BDAddr::default() {
        format!("{:?}", peripheral.id())
    } else {
        properties.address.to_string()
    }
}

pub struct BtleplugScanBackend {
    adapter: Adapter,
    feed_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugScanBackend {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            feed_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ScanBackend for BtleplugScanBackend {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<ScanReport>, BleError> {
        let mut events = self.adapter.events().await.map_err(BleError::from_scan)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(BleError::from_scan)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                let report = ScanReport::Advertisement {
                    address: peripheral_address(&peripheral, &properties),
                    name: properties.local_name,
                };
                if tx.send(report).is_err() {
                    return;
                }
            }
            // The adapter event stream only ends when the adapter goes away.
            let _ = tx.send(ScanReport::Failed { code: -1 });
        });

        if let Some(old) = self.feed_task.lock().unwrap_or_else(|p| p.into_inner()).replace(task) {
            old.abort();
        }
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), BleError> {
        if let Some(task) = self.feed_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
        self.adapter.stop_scan().await.map_err(BleError::from_scan)
    }
}

struct LinkSlot {
    peripheral: Option<Peripheral>,
    tasks: Vec<JoinHandle<()>>,
}

type Slots = Arc<Mutex<HashMap<ConnectionId, LinkSlot>>>;

pub struct BtleplugLink {
    adapter: Adapter,
    runtime: Handle,
    events: mpsc::UnboundedSender<LinkEvent>,
    slots: Slots,
    closing: Vec<JoinHandle<()>>,
    resolve_window: Duration,
    next_id: u64,
}

impl BtleplugLink {
    /// Must be called from within a tokio runtime.
    ///
    /// `resolve_window` bounds how long `open` scans for an address the
    /// adapter has not seen yet.
    pub fn new(
        adapter: Adapter,
        events: mpsc::UnboundedSender<LinkEvent>,
        resolve_window: Duration,
    ) -> Self {
        Self {
            adapter,
            runtime: Handle::current(),
            events,
            slots: Arc::new(Mutex::new(HashMap::new())),
            closing: Vec::new(),
            resolve_window,
            next_id: 0,
        }
    }

    fn peripheral(&self, connection: ConnectionId) -> Option<Peripheral> {
        lock(&self.slots)
            .get(&connection)
            .and_then(|slot| slot.peripheral.clone())
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn open(&mut self, address: &str) -> Result<ConnectionId, BleError> {
        if address.trim().is_empty() {
            return Err(BleError::AddressInvalid {
                address: address.to_string(),
            });
        }

        self.next_id += 1;
        let connection = ConnectionId(self.next_id);
        lock(&self.slots).insert(
            connection,
            LinkSlot {
                peripheral: None,
                tasks: Vec::new(),
            },
        );

        let adapter = self.adapter.clone();
        let slots = self.slots.clone();
        let events = self.events.clone();
        let address = address.to_string();
        let window = self.resolve_window;
        self.runtime.spawn(async move {
            let result = establish(&adapter, &address, window, connection, &slots, &events).await;
            let kind = match result {
                Ok(true) => LinkEventKind::Connected,
                Ok(false) => return,
                Err(e) => LinkEventKind::ConnectFailed(e),
            };
            let _ = events.send(LinkEvent::new(connection, kind));
        });

        Ok(connection)
    }

    fn submit(&mut self, connection: ConnectionId, op: GattOp) {
        let events = self.events.clone();
        let Some(peripheral) = self.peripheral(connection) else {
            warn!("Dropping {:?} for unknown connection {}", op, connection);
            let _ = events.send(LinkEvent::new(connection, failed(&op, "not connected")));
            return;
        };

        self.runtime.spawn(async move {
            let kind = run_op(&peripheral, op).await;
            let _ = events.send(LinkEvent::new(connection, kind));
        });
    }

    fn close(&mut self, connection: ConnectionId, notifying: &[CharacteristicKind]) {
        let Some(slot) = lock(&self.slots).remove(&connection) else {
            return;
        };
        for task in &slot.tasks {
            task.abort();
        }
        let Some(peripheral) = slot.peripheral else {
            return;
        };

        let notifying = notifying.to_vec();
        self.closing.retain(|task| !task.is_finished());
        let task = self.runtime.spawn(async move {
            for field in notifying {
                let result = match find_characteristic(&peripheral, field) {
                    Some(c) => peripheral.unsubscribe(&c).await,
                    None => continue,
                };
                if let Err(e) = result {
                    warn!("Failed to disable notifications for {}: {}", field, e);
                } else {
                    debug!("Disabled notifications for {}", field);
                }
            }
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect reported an error: {}", e);
            }
            info!("Connection {} closed", connection);
        });
        self.closing.push(task);
    }

    async fn drain(&mut self) {
        let pending: Vec<_> = self.closing.drain(..).collect();
        if pending.is_empty() {
            return;
        }
        debug!("Waiting for {} connection(s) to close", pending.len());
        if timeout(CLOSE_TIMEOUT, join_all(pending)).await.is_err() {
            warn!("Gave up waiting for connections to close");
        }
    }
}

/// Resolve and connect. Returns `Ok(false)` if the slot was closed meanwhile.
async fn establish(
    adapter: &Adapter,
    address: &str,
    window: Duration,
    connection: ConnectionId,
    slots: &Slots,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> Result<bool, BleError> {
    let peripheral = resolve(adapter, address, window).await?;
    peripheral
        .connect()
        .await
        .map_err(|e| BleError::from_connect(e, address))?;

    let tasks: Vec<JoinHandle<()>> = notification_pump(&peripheral, connection, events.clone())
        .await
        .into_iter()
        .chain(disconnect_watcher(adapter, &peripheral, connection, events.clone()).await)
        .collect();

    let orphaned = match lock(slots).get_mut(&connection) {
        Some(slot) => {
            slot.peripheral = Some(peripheral.clone());
            slot.tasks.extend(tasks);
            None
        }
        None => Some(tasks),
    };

    match orphaned {
        None => Ok(true),
        Some(tasks) => {
            debug!("Connection {} closed while connecting", connection);
            tasks.iter().for_each(JoinHandle::abort);
            let _ = peripheral.disconnect().await;
            Ok(false)
        }
    }
}

/// Find the peripheral for `address`, scanning for up to `window` when the
/// adapter has not seen it yet.
async fn resolve(adapter: &Adapter, address: &str, window: Duration) -> Result<Peripheral, BleError> {
    if let Some(peripheral) = find_known(adapter, address).await? {
        return Ok(peripheral);
    }

    info!("{} not seen yet, scanning for up to {:?}", address, window);
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| BleError::from_connect(e, address))?;
    let found = poll_until(window, RESOLVE_INTERVAL, || async move {
        find_known(adapter, address).await.ok().flatten()
    })
    .await;
    if let Err(e) = adapter.stop_scan().await {
        debug!("Stopping the resolve scan failed: {}", e);
    }

    found.ok_or_else(|| BleError::AddressInvalid {
        address: address.to_string(),
    })
}

async fn find_known(adapter: &Adapter, address: &str) -> Result<Option<Peripheral>, BleError> {
    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| BleError::from_connect(e, address))?;
    for peripheral in peripherals {
        if let Ok(Some(properties)) = peripheral.properties().await {
            if peripheral_address(&peripheral, &properties).eq_ignore_ascii_case(address) {
                return Ok(Some(peripheral));
            }
        }
    }
    Ok(None)
}

/// Run `check` every `interval` until it yields a value or `window` elapses.
/// `check` always runs at least once.
async fn poll_until<T, F, Fut>(window: Duration, interval: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + window;
    loop {
        if let Some(found) = check().await {
            return Some(found);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        sleep_until((now + interval).min(deadline)).await;
    }
}

async fn notification_pump(
    peripheral: &Peripheral,
    connection: ConnectionId,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> Option<JoinHandle<()>> {
    let mut stream = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Notification stream unavailable: {}", e);
            return None;
        }
    };
    Some(tokio::spawn(async move {
        while let Some(notification) = stream.next().await {
            let Some(field) = CharacteristicKind::from_uuid(notification.uuid) else {
                continue;
            };
            let kind = LinkEventKind::ValueChanged {
                field,
                value: notification.value,
            };
            if events.send(LinkEvent::new(connection, kind)).is_err() {
                return;
            }
        }
    }))
}

async fn disconnect_watcher(
    adapter: &Adapter,
    peripheral: &Peripheral,
    connection: ConnectionId,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> Option<JoinHandle<()>> {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Adapter event stream unavailable: {}", e);
            return None;
        }
    };
    let id = peripheral.id();
    Some(tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            if let CentralEvent::DeviceDisconnected(gone) = event {
                if gone == id {
                    let _ = events.send(LinkEvent::new(connection, LinkEventKind::Disconnected));
                    return;
                }
            }
        }
    }))
}

fn find_characteristic(peripheral: &Peripheral, field: CharacteristicKind) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == SERVICE_UUID && c.uuid == field.uuid())
}

async fn run_op(peripheral: &Peripheral, op: GattOp) -> LinkEventKind {
    match op {
        GattOp::DiscoverServices => match peripheral.discover_services().await {
            Ok(()) => LinkEventKind::ServicesDiscovered {
                service_present: peripheral.services().iter().any(|s| s.uuid == SERVICE_UUID),
            },
            Err(e) => LinkEventKind::DiscoveryFailed(e.to_string()),
        },
        GattOp::WriteDescriptor { field, value } => {
            let result = match find_characteristic(peripheral, field) {
                Some(c) if value == ENABLE_NOTIFICATION_VALUE => {
                    peripheral.subscribe(&c).await.map_err(transport)
                }
                Some(c) => peripheral.unsubscribe(&c).await.map_err(transport),
                None => Err(missing(field)),
            };
            LinkEventKind::DescriptorWritten { field, result }
        }
        GattOp::Read { field } => {
            let result = match find_characteristic(peripheral, field) {
                Some(c) => peripheral.read(&c).await.map_err(transport),
                None => Err(missing(field)),
            };
            LinkEventKind::CharacteristicRead { field, result }
        }
        GattOp::Write { field, payload } => {
            let result = match find_characteristic(peripheral, field) {
                Some(_) if payload.len() > MAX_ATTRIBUTE_LEN => Err(OpFailure::Rejected),
                Some(c) => peripheral
                    .write(&c, &payload, WriteType::WithResponse)
                    .await
                    .map_err(write_failure),
                None => Err(missing(field)),
            };
            LinkEventKind::CharacteristicWritten { field, result }
        }
    }
}

/// Completion used when an op cannot even be issued.
fn failed(op: &GattOp, reason: &str) -> LinkEventKind {
    let failure = OpFailure::Transport(reason.to_string());
    match op {
        GattOp::DiscoverServices => LinkEventKind::DiscoveryFailed(reason.to_string()),
        GattOp::WriteDescriptor { field, .. } => LinkEventKind::DescriptorWritten {
            field: *field,
            result: Err(failure),
        },
        GattOp::Read { field } => LinkEventKind::CharacteristicRead {
            field: *field,
            result: Err(failure),
        },
        GattOp::Write { field, .. } => LinkEventKind::CharacteristicWritten {
            field: *field,
            result: Err(failure),
        },
    }
}

fn transport(error: btleplug::Error) -> OpFailure {
    OpFailure::Transport(error.to_string())
}

fn missing(field: CharacteristicKind) -> OpFailure {
    OpFailure::Transport(format!("Characteristic {} not found", field.uuid()))
}

// Platforms only surface the ATT status as text.
fn write_failure(error: btleplug::Error) -> OpFailure {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("invalid attribute value length") || lower.contains("invalidattributevaluelength")
    {
        OpFailure::Rejected
    } else {
        OpFailure::Transport(message)
    }
}

fn lock(slots: &Slots) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, LinkSlot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
