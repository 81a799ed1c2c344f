use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the parent bus device shared by the three BT channels of one chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentId(pub u64);

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parent#{}", self.0)
    }
}

/// The three logical BT channels exposed by the chip-management layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Command,
    Acl,
    Event,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Command, ChannelKind::Acl, ChannelKind::Event];

    /// Packet type stamped on frames received through this channel
    pub fn data_type(self) -> PacketType {
        match self {
            Self::Command => PacketType::Command,
            Self::Acl => PacketType::AclData,
            Self::Event => PacketType::Event,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Command => "CMD",
            Self::Acl => "ACL",
            Self::Event => "EVT",
        }
    }
}

/// HCI packet indicator, as used by the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Command,
    AclData,
    ScoData,
    Event,
    Vendor,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Command => 0x01,
            Self::AclData => 0x02,
            Self::ScoData => 0x03,
            Self::Event => 0x04,
            Self::Vendor => 0xFF,
        }
    }
}

/// One HCI frame travelling between the host stack and the chip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciFrame {
    pub pkt_type: PacketType,
    pub data: Vec<u8>,
}

impl HciFrame {
    pub fn new(pkt_type: PacketType, data: Vec<u8>) -> Self {
        Self { pkt_type, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Physical bus the chip is attached through, reported to the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BusType {
    #[default]
    Virtual,
    Usb,
    Pccard,
    Uart,
    Rs232,
    Pci,
    Sdio,
}

/// Reset progress of the HCI driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetState {
    /// No reset in progress
    #[default]
    Idle,
    /// Reset in progress
    Activated,
    /// The host device has been unregistered and freed
    Unregistered,
}

/// BT core enable progress of the HCI driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnableState {
    /// Loaded but not opened
    #[default]
    Idle,
    /// Waiting for Command Complete of VS BT Enable (true)
    WaitingEnabledAck,
    Enabled,
    /// Waiting for Command Complete of VS BT Enable (false)
    WaitingDisabledAck,
    Disabled,
    /// Something failed, the core is not expected to work
    Error,
}

/// State the driver has when BT is active
pub const ACTIVE_STATE: EnableState = EnableState::Enabled;

/// Traffic counters kept per host device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HciStats {
    pub byte_rx: u64,
    pub byte_tx: u64,
    pub evt_rx: u64,
    pub acl_rx: u64,
    pub cmd_tx: u64,
    pub acl_tx: u64,
}

/// Status notifications published by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    InstanceAdded(ParentId),
    ChannelProbed(ParentId, ChannelKind),
    ChannelRemoved(ParentId, ChannelKind),
    DeviceRegistered(ParentId),
    DeviceUnregistered(ParentId),
    EnableState(ParentId, EnableState),
    ResetStarted(ParentId),
    InstanceRemoved(ParentId),
}
