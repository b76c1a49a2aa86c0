//! btleplug-backed [`Transport`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{PacketHandler, Transport};
use crate::config::BleConfig;
use crate::error::TransportError;
use crate::types::RawPacket;

type Handlers = Arc<Mutex<HashMap<Uuid, Box<dyn PacketHandler>>>>;

/// Handlers only run short non-blocking code, so a poisoned lock still
/// holds a usable map.
fn lock(handlers: &Handlers) -> MutexGuard<'_, HashMap<Uuid, Box<dyn PacketHandler>>> {
    handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A peripheral seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Bluetooth MAC address (all zeros on macOS).
    pub address: String,
    /// Platform identifier; a UUID on macOS, the MAC elsewhere.
    pub id: String,
}

// ── Adapter helpers ───────────────────────────────────────────────────────────

async fn first_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(TransportError::NoAdapter)?;
    wait_powered_on(&adapter).await;
    Ok(adapter)
}

/// CoreBluetooth starts in an "unknown" state and silently ignores scans
/// until it reports PoweredOn.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;
    use log::warn;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("adapter still {state:?} after 3 s, continuing");
                break;
            }
            Ok(state) => debug!("adapter state = {state:?}, waiting…"),
            Err(e) => {
                warn!("adapter_state() failed: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

fn matches_address(peripheral: &Peripheral, address: &str) -> bool {
    peripheral.address().to_string().eq_ignore_ascii_case(address)
        || peripheral.id().to_string().eq_ignore_ascii_case(address)
}

/// Scan for `timeout_secs` and list every peripheral seen.
pub async fn scan(config: &BleConfig) -> Result<Vec<DiscoveredDevice>, TransportError> {
    let adapter = first_adapter().await?;
    info!("Scanning for {} s …", config.scan_timeout_secs);
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(Duration::from_secs(config.scan_timeout_secs)).await;
    adapter.stop_scan().await.ok();

    let mut found = Vec::new();
    for p in adapter.peripherals().await? {
        let name = match p.properties().await {
            Ok(Some(props)) => props.local_name,
            _ => None,
        };
        found.push(DiscoveredDevice {
            name,
            address: p.address().to_string(),
            id: p.id().to_string(),
        });
    }
    info!("{} device(s) found", found.len());
    Ok(found)
}

/// Poll the adapter until a peripheral with `address` shows up.
async fn find_peripheral(
    adapter: &Adapter,
    address: &str,
    timeout_secs: u64,
) -> Result<Peripheral, TransportError> {
    adapter.start_scan(ScanFilter::default()).await?;
    let found = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
        loop {
            let peripherals = adapter.peripherals().await.unwrap_or_default();
            if let Some(p) = peripherals.into_iter().find(|p| matches_address(p, address)) {
                return p;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    adapter.stop_scan().await.ok();
    found.map_err(|_| TransportError::DeviceNotFound(address.to_string()))
}

// ── Link ──────────────────────────────────────────────────────────────────────

struct Link {
    peripheral: Peripheral,
    characteristics: BTreeSet<Characteristic>,
    handlers: Handlers,
    dispatch: JoinHandle<()>,
}

impl Link {
    fn find(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

/// BLE connection to the sensor board.
///
/// All notifications arrive on one btleplug stream; a single dispatch task
/// forwards each to the handler registered for its characteristic, so a
/// characteristic's packets are handled strictly in delivery order.
pub struct BleTransport {
    config: BleConfig,
    link: Option<Link>,
}

impl BleTransport {
    pub fn new(config: BleConfig) -> Self {
        Self { config, link: None }
    }

    fn link(&self) -> Result<&Link, TransportError> {
        self.link.as_ref().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        if self.link.is_some() {
            self.disconnect().await.ok();
        }

        let adapter = first_adapter().await?;
        let peripheral =
            find_peripheral(&adapter, address, self.config.scan_timeout_secs).await?;

        // BlueZ can block Connect forever when the device walks out of range.
        let secs = self.config.connect_timeout_secs;
        tokio::time::timeout(Duration::from_secs(secs), peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                secs,
            })??;

        // BlueZ reports the connection before its GATT cache is filled.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(Duration::from_secs(secs), peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "discover_services",
                secs,
            })??;
        info!("Connected to {address}, services discovered");

        let handlers: Handlers = Arc::default();
        let mut notifications = peripheral.notifications().await?;
        let dispatch_handlers = Arc::clone(&handlers);
        let dispatch = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                let mut map = lock(&dispatch_handlers);
                match map.get_mut(&n.uuid) {
                    Some(handler) => handler.handle(RawPacket::new(n.uuid, n.value)),
                    None => debug!("Notification from unsubscribed {}", n.uuid),
                }
            }
            info!("Notification stream ended");
        });

        self.link = Some(Link {
            characteristics: peripheral.characteristics(),
            peripheral,
            handlers,
            dispatch,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(link) = self.link.take() else {
            return Err(TransportError::NotConnected);
        };
        link.dispatch.abort();
        lock(&link.handlers).clear();
        link.peripheral.disconnect().await?;
        info!("Disconnected");
        Ok(())
    }

    async fn start_notify(
        &mut self,
        characteristic: Uuid,
        handler: Box<dyn PacketHandler>,
    ) -> Result<(), TransportError> {
        let link = self.link()?;
        let c = link.find(characteristic)?.clone();
        lock(&link.handlers).insert(characteristic, handler);
        if let Err(e) = link.peripheral.subscribe(&c).await {
            lock(&link.handlers).remove(&characteristic);
            return Err(e.into());
        }
        Ok(())
    }

    async fn stop_notify(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
        let Some(link) = self.link.as_ref() else {
            return Err(TransportError::AlreadyUnsubscribed(characteristic));
        };
        let removed = lock(&link.handlers).remove(&characteristic);
        if removed.is_none() || !link.peripheral.is_connected().await.unwrap_or(false) {
            return Err(TransportError::AlreadyUnsubscribed(characteristic));
        }
        let c = link.find(characteristic)?.clone();
        link.peripheral.unsubscribe(&c).await?;
        Ok(())
    }

    async fn write_characteristic(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let link = self.link()?;
        let c = link.find(characteristic)?;
        link.peripheral
            .write(c, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match &self.link {
            Some(link) => link.peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }
}
