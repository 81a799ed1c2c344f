//! Loopback Chip and Host
//!
//! In-process stand-ins for the chip-management layer and the host stack.
//! The chip answers VS Bluetooth_Enable the way a CG2900 does, replies to any
//! other command with a successful Command Complete and echoes ACL data.
//! The host records what it is given and calls back into the driver like the
//! real stack does on unregistration.

use crate::domain::error::{TransportError, EIO};
use crate::domain::models::{BusType, ChannelKind, HciFrame, ParentId};
use crate::infrastructure::bluetooth::chip::{ChannelUser, ChipChannel};
use crate::infrastructure::bluetooth::host::{HciDevice, HostStack};
use crate::infrastructure::bluetooth::lock;
use crate::infrastructure::bluetooth::protocol::{self, RevisionData, BT_VS_BT_ENABLE, CG2900_PG2_HCI_REV};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How the loopback chip answers VS Bluetooth_Enable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableResponse {
    /// Command Complete with the given status
    Complete(u8),
    /// Command Status first, then Command Complete with the given status
    StatusThenComplete(u8),
    /// Never answer
    Silent,
}

#[derive(Debug, Clone)]
pub struct ChipConfig {
    pub revision: Option<RevisionData>,
    pub bus: BusType,
    pub enable_response: EnableResponse,
    /// Deliver answers from a separate thread after this delay
    pub reply_delay: Option<Duration>,
    pub fail_open: Option<ChannelKind>,
    pub fail_write: bool,
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self {
            revision: Some(RevisionData::new(CG2900_PG2_HCI_REV, 0x0000)),
            bus: BusType::Uart,
            enable_response: EnableResponse::Complete(protocol::HCI_ERR_NO_ERROR),
            reply_delay: None,
            fail_open: None,
            fail_write: false,
        }
    }
}

#[derive(Default)]
struct ChannelSlot {
    opened: bool,
    user: Option<Arc<dyn ChannelUser>>,
    written: Vec<HciFrame>,
}

#[derive(Default)]
struct ChipState {
    slots: [ChannelSlot; 3],
    open_log: Vec<ChannelKind>,
}

fn slot_index(kind: ChannelKind) -> usize {
    match kind {
        ChannelKind::Command => 0,
        ChannelKind::Acl => 1,
        ChannelKind::Event => 2,
    }
}

/// A simulated CG2900 exposing three channels under one parent
pub struct LoopbackChip {
    parent: ParentId,
    config: Mutex<ChipConfig>,
    state: Mutex<ChipState>,
}

impl LoopbackChip {
    pub fn new(parent: ParentId) -> Arc<Self> {
        Self::with_config(parent, ChipConfig::default())
    }

    pub fn with_config(parent: ParentId, config: ChipConfig) -> Arc<Self> {
        Arc::new(Self {
            parent,
            config: Mutex::new(config),
            state: Mutex::new(ChipState::default()),
        })
    }

    pub fn configure(&self, update: impl FnOnce(&mut ChipConfig)) {
        update(&mut lock(&self.config));
    }

    pub fn parent(&self) -> ParentId {
        self.parent
    }

    /// Handle for one logical channel of this chip
    pub fn channel(self: &Arc<Self>, kind: ChannelKind) -> Arc<dyn ChipChannel> {
        Arc::new(LoopbackChannel {
            kind,
            chip: self.clone(),
        })
    }

    pub fn is_opened(&self, kind: ChannelKind) -> bool {
        lock(&self.state).slots[slot_index(kind)].opened
    }

    pub fn has_user(&self, kind: ChannelKind) -> bool {
        lock(&self.state).slots[slot_index(kind)].user.is_some()
    }

    /// Frames written to `kind`, oldest first
    pub fn written(&self, kind: ChannelKind) -> Vec<HciFrame> {
        lock(&self.state).slots[slot_index(kind)].written.clone()
    }

    /// Successful channel opens, in call order
    pub fn open_log(&self) -> Vec<ChannelKind> {
        lock(&self.state).open_log.clone()
    }

    /// Hand a frame to the user of `kind` as if the chip had sent it
    pub fn inject(&self, kind: ChannelKind, frame: HciFrame) {
        let user = lock(&self.state).slots[slot_index(kind)].user.clone();
        match user {
            Some(user) => user.on_receive(frame),
            None => debug!("No {} user, frame dropped", kind.name()),
        }
    }

    /// Close one channel because of a chip reset and notify its user
    ///
    /// Channels that are not open have nothing to report.
    pub fn reset_channel(&self, kind: ChannelKind) {
        let user = {
            let mut state = lock(&self.state);
            let slot = &mut state.slots[slot_index(kind)];
            if !slot.opened {
                return;
            }
            slot.opened = false;
            slot.user.clone()
        };
        if let Some(user) = user {
            user.on_reset();
        }
    }

    /// Reset the whole chip
    pub fn reset(&self) {
        for kind in [ChannelKind::Acl, ChannelKind::Command, ChannelKind::Event] {
            self.reset_channel(kind);
        }
    }

    fn answers_for(&self, kind: ChannelKind, frame: &HciFrame) -> (ChannelKind, Vec<HciFrame>) {
        match kind {
            ChannelKind::Command if protocol::as_bt_enable_cmd(&frame.data).is_some() => {
                let replies = match lock(&self.config).enable_response {
                    EnableResponse::Complete(status) => {
                        vec![protocol::cmd_complete_event(BT_VS_BT_ENABLE, status)]
                    }
                    EnableResponse::StatusThenComplete(status) => vec![
                        protocol::cmd_status_event(BT_VS_BT_ENABLE, protocol::HCI_ERR_NO_ERROR),
                        protocol::cmd_complete_event(BT_VS_BT_ENABLE, status),
                    ],
                    EnableResponse::Silent => Vec::new(),
                };
                (ChannelKind::Event, replies)
            }
            ChannelKind::Command => match *frame.data.as_slice() {
                [lo, hi, ..] => (
                    ChannelKind::Event,
                    vec![protocol::cmd_complete_event(
                        u16::from_le_bytes([lo, hi]),
                        protocol::HCI_ERR_NO_ERROR,
                    )],
                ),
                _ => (ChannelKind::Event, Vec::new()),
            },
            ChannelKind::Acl => (ChannelKind::Acl, vec![frame.clone()]),
            ChannelKind::Event => (ChannelKind::Event, Vec::new()),
        }
    }

    fn deliver(self: &Arc<Self>, kind: ChannelKind, frames: Vec<HciFrame>) {
        if frames.is_empty() {
            return;
        }
        let delay = lock(&self.config).reply_delay;
        match delay {
            Some(delay) => {
                let chip = self.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    chip.deliver_now(kind, frames);
                });
            }
            None => self.deliver_now(kind, frames),
        }
    }

    fn deliver_now(&self, kind: ChannelKind, frames: Vec<HciFrame>) {
        for frame in frames {
            if !self.is_opened(kind) {
                debug!("{} channel closed, answer dropped", kind.name());
                return;
            }
            self.inject(kind, frame);
        }
    }
}

struct LoopbackChannel {
    kind: ChannelKind,
    chip: Arc<LoopbackChip>,
}

impl ChipChannel for LoopbackChannel {
    fn parent(&self) -> ParentId {
        self.chip.parent
    }

    fn open(&self) -> Result<(), TransportError> {
        if lock(&self.chip.config).fail_open == Some(self.kind) {
            return Err(TransportError::new(EIO, format!("{} open refused", self.kind.name())));
        }
        let mut state = lock(&self.chip.state);
        state.slots[slot_index(self.kind)].opened = true;
        state.open_log.push(self.kind);
        Ok(())
    }

    fn close(&self) {
        lock(&self.chip.state).slots[slot_index(self.kind)].opened = false;
    }

    fn is_opened(&self) -> bool {
        self.chip.is_opened(self.kind)
    }

    fn write(&self, frame: HciFrame) -> Result<(), TransportError> {
        if lock(&self.chip.config).fail_write {
            return Err(TransportError::new(EIO, format!("{} write refused", self.kind.name())));
        }
        trace!("{} write {:02X?}", self.kind.name(), frame.data);

        let (target, answers) = self.chip.answers_for(self.kind, &frame);
        lock(&self.chip.state).slots[slot_index(self.kind)]
            .written
            .push(frame);
        self.chip.deliver(target, answers);
        Ok(())
    }

    fn local_revision(&self) -> Option<RevisionData> {
        lock(&self.chip.config).revision
    }

    fn bus(&self) -> BusType {
        lock(&self.chip.config).bus
    }

    fn set_user(&self, user: Option<Arc<dyn ChannelUser>>) {
        lock(&self.chip.state).slots[slot_index(self.kind)].user = user;
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub fail_alloc: bool,
    pub fail_register: Option<i32>,
    /// Keep unregistered devices until `complete_destruct` is called
    pub defer_destruct: bool,
}

#[derive(Default)]
struct HostState {
    registered: Vec<Arc<HciDevice>>,
    pending_destruct: Vec<Arc<HciDevice>>,
    received: Vec<HciFrame>,
    registrations: usize,
    unregistrations: usize,
    freed: usize,
}

/// A host stack that records devices and frames
#[derive(Default)]
pub struct LoopbackHost {
    config: Mutex<HostConfig>,
    state: Mutex<HostState>,
}

impl LoopbackHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn configure(&self, update: impl FnOnce(&mut HostConfig)) {
        update(&mut lock(&self.config));
    }

    /// Most recently registered device still known to the host
    pub fn device(&self) -> Option<Arc<HciDevice>> {
        lock(&self.state).registered.last().cloned()
    }

    pub fn devices(&self) -> Vec<Arc<HciDevice>> {
        lock(&self.state).registered.clone()
    }

    pub fn received(&self) -> Vec<HciFrame> {
        lock(&self.state).received.clone()
    }

    pub fn registrations(&self) -> usize {
        lock(&self.state).registrations
    }

    pub fn unregistrations(&self) -> usize {
        lock(&self.state).unregistrations
    }

    pub fn freed(&self) -> usize {
        lock(&self.state).freed
    }

    /// Release devices whose destruct was held back
    pub fn complete_destruct(&self) {
        let pending = std::mem::take(&mut lock(&self.state).pending_destruct);
        for hdev in pending {
            hdev.destruct();
        }
    }
}

impl HostStack for LoopbackHost {
    fn alloc_dev(&self) -> Option<HciDevice> {
        if lock(&self.config).fail_alloc {
            return None;
        }
        Some(HciDevice::default())
    }

    fn free_dev(&self, hdev: Arc<HciDevice>) {
        lock(&self.state).freed += 1;
        drop(hdev);
    }

    fn register_dev(&self, hdev: Arc<HciDevice>) -> Result<(), i32> {
        if let Some(code) = lock(&self.config).fail_register {
            return Err(code);
        }
        let mut state = lock(&self.state);
        state.registered.push(hdev);
        state.registrations += 1;
        Ok(())
    }

    fn unregister_dev(&self, hdev: &Arc<HciDevice>) {
        {
            let mut state = lock(&self.state);
            state.registered.retain(|dev| !Arc::ptr_eq(dev, hdev));
            state.unregistrations += 1;
        }

        if hdev.is_running() {
            if let Err(e) = hdev.close() {
                warn!("Close on unregister failed: {}", e);
            }
        }

        if lock(&self.config).defer_destruct {
            lock(&self.state).pending_destruct.push(hdev.clone());
        } else {
            hdev.destruct();
        }
    }

    fn recv_frame(&self, _hdev: &Arc<HciDevice>, frame: HciFrame) -> Result<(), i32> {
        lock(&self.state).received.push(frame);
        Ok(())
    }
}
