//! Host Bluetooth stack boundary
//!
//! The host stack owns [`HciDevice`] objects. The driver fills one in with its
//! [`HciDriver`] entry points and registers it; from then on the host calls
//! `open`, `close`, `send` and `destruct` through the device.

use crate::domain::error::{DriverError, DriverResult};
use crate::domain::models::{BusType, HciFrame, HciStats, PacketType, ParentId};
use crate::infrastructure::bluetooth::lock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Entry points the driver supplies for a registered device
pub trait HciDriver: Send + Sync {
    fn open(&self, hdev: &HciDevice) -> DriverResult<()>;
    fn close(&self, hdev: &HciDevice) -> DriverResult<()>;
    fn send(&self, hdev: &HciDevice, frame: HciFrame) -> DriverResult<()>;
    fn destruct(&self, hdev: &HciDevice);
}

/// Primitives of the generic Bluetooth host stack used by the driver
pub trait HostStack: Send + Sync {
    /// Allocate an empty device descriptor, `None` when out of memory
    fn alloc_dev(&self) -> Option<HciDevice> {
        Some(HciDevice::default())
    }

    /// Release a device descriptor
    fn free_dev(&self, hdev: Arc<HciDevice>) {
        drop(hdev);
    }

    /// Register a filled-in device, returning the host's errno on failure
    fn register_dev(&self, hdev: Arc<HciDevice>) -> Result<(), i32>;

    /// Unregister a device. The host closes it if it is running and calls
    /// `destruct` once it no longer uses it, possibly later.
    fn unregister_dev(&self, hdev: &Arc<HciDevice>);

    /// Deliver a received frame to the stack
    fn recv_frame(&self, hdev: &Arc<HciDevice>, frame: HciFrame) -> Result<(), i32>;
}

/// Logical HCI device as seen by the host stack
#[derive(Default)]
pub struct HciDevice {
    parent: Option<ParentId>,
    bus: BusType,
    running: AtomicBool,
    stats: Mutex<HciStats>,
    driver: Mutex<Option<Arc<dyn HciDriver>>>,
}

impl HciDevice {
    pub fn set_parent(&mut self, parent: ParentId) {
        self.parent = Some(parent);
    }

    pub fn set_bus(&mut self, bus: BusType) {
        self.bus = bus;
    }

    pub fn parent(&self) -> Option<ParentId> {
        self.parent
    }

    pub fn bus(&self) -> BusType {
        self.bus
    }

    /// Attach the driver entry points
    pub fn bind(&self, driver: Arc<dyn HciDriver>) {
        *lock(&self.driver) = Some(driver);
    }

    /// Detach the driver; later calls from the host fail with EINVAL
    pub fn unbind(&self) {
        *lock(&self.driver) = None;
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.driver).is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Set HCI_RUNNING, returning the previous value
    pub fn test_and_set_running(&self) -> bool {
        self.running.swap(true, Ordering::SeqCst)
    }

    /// Clear HCI_RUNNING, returning the previous value
    pub fn test_and_clear_running(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    pub fn stats(&self) -> HciStats {
        *lock(&self.stats)
    }

    pub(crate) fn record_rx(&self, frame: &HciFrame) {
        let mut stats = lock(&self.stats);
        stats.byte_rx += frame.len() as u64;
        if frame.pkt_type == PacketType::AclData {
            stats.acl_rx += 1;
        } else {
            stats.evt_rx += 1;
        }
    }

    pub(crate) fn record_tx_bytes(&self, len: usize) {
        lock(&self.stats).byte_tx += len as u64;
    }

    pub(crate) fn record_tx_packet(&self, pkt_type: PacketType) {
        let mut stats = lock(&self.stats);
        match pkt_type {
            PacketType::Command => stats.cmd_tx += 1,
            PacketType::AclData => stats.acl_tx += 1,
            _ => {}
        }
    }

    fn driver(&self) -> DriverResult<Arc<dyn HciDriver>> {
        lock(&self.driver)
            .clone()
            .ok_or(DriverError::InvalidArgument("no driver data bound to hdev"))
    }

    /// Host stack entry: bring the interface up
    pub fn open(&self) -> DriverResult<()> {
        self.driver()?.open(self)
    }

    /// Host stack entry: take the interface down
    pub fn close(&self) -> DriverResult<()> {
        self.driver()?.close(self)
    }

    /// Host stack entry: transmit a frame
    pub fn send(&self, frame: HciFrame) -> DriverResult<()> {
        self.driver()?.send(self, frame)
    }

    /// Host stack entry: the stack is done with this device
    pub fn destruct(&self) {
        match self.driver() {
            Ok(driver) => driver.destruct(self),
            Err(e) => tracing::error!("Destruct on unbound device: {}", e),
        }
    }
}

impl fmt::Debug for HciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HciDevice")
            .field("parent", &self.parent)
            .field("bus", &self.bus)
            .field("running", &self.is_running())
            .field("bound", &self.is_bound())
            .field("stats", &self.stats())
            .finish()
    }
}
