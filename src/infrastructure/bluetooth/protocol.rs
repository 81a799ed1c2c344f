//! CG2900 HCI Protocol
//!
//! Wire constants and parsers for the part of HCI the driver itself speaks:
//! the vendor specific Bluetooth_Enable command and the events answering it.

use crate::domain::models::{HciFrame, PacketType};

/// Length of the common HCI command header (opcode + parameter length)
pub const BT_HEADER_LENGTH: usize = 3;

/// HCI_Cmd_VS_Bluetooth_Enable
pub const BT_VS_BT_ENABLE: u16 = 0xFF10;
pub const VS_BT_DISABLE: u8 = 0x00;
pub const VS_BT_ENABLE: u8 = 0x01;

/// Size of the full VS Bluetooth_Enable command
pub const VS_BT_ENABLE_CMD_LEN: usize = 4;

pub const HCI_EV_CMD_COMPLETE: u8 = 0x0E;
pub const HCI_EV_CMD_STATUS: u8 = 0x0F;

pub const HCI_ERR_NO_ERROR: u8 = 0x00;
pub const HCI_ERR_CMD_DISALLOWED: u8 = 0x0C;

/// Hardware revisions reported by Read_Local_Version
pub const STLC2690_HCI_REV: u16 = 0x0600;
pub const CG2900_PG1_HCI_REV: u16 = 0x0101;
pub const CG2900_PG2_HCI_REV: u16 = 0x0200;
pub const CG2900_PG1_SPECIAL_HCI_REV: u16 = 0x0700;

/// Local version information as reported by the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionData {
    pub revision: u16,
    pub sub_version: u16,
}

impl RevisionData {
    pub fn new(revision: u16, sub_version: u16) -> Self {
        Self {
            revision,
            sub_version,
        }
    }

    /// Only CG2900 silicon understands VS Bluetooth_Enable
    pub fn supports_bt_enable(&self) -> bool {
        matches!(
            self.revision,
            CG2900_PG1_SPECIAL_HCI_REV | CG2900_PG1_HCI_REV | CG2900_PG2_HCI_REV
        )
    }
}

/// Build a VS Bluetooth_Enable command
///
/// ```text
/// [0-1] : Opcode 0xFF10 (u16 little-endian)
/// [2]   : Parameter length, always 1
/// [3]   : 0 = disable BT core, 1 = enable BT core
/// ```
pub fn bt_enable_cmd(enable: bool) -> HciFrame {
    let [lo, hi] = BT_VS_BT_ENABLE.to_le_bytes();
    let flag = if enable { VS_BT_ENABLE } else { VS_BT_DISABLE };
    let len = (VS_BT_ENABLE_CMD_LEN - BT_HEADER_LENGTH) as u8;
    HciFrame::new(PacketType::Command, vec![lo, hi, len, flag])
}

/// Events the driver cares about while a handshake is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEvent {
    /// Command Complete carrying the first return parameter (status)
    Complete { opcode: u16, status: u8 },
    /// Command Status
    Status { opcode: u16, status: u8 },
}

impl CommandEvent {
    pub fn opcode(&self) -> u16 {
        match self {
            Self::Complete { opcode, .. } | Self::Status { opcode, .. } => *opcode,
        }
    }
}

/// Parse an HCI event packet (without packet indicator)
///
/// ```text
/// Command Complete: [0x0E, plen, ncmd, op_lo, op_hi, status, ...]
/// Command Status:   [0x0F, plen, status, ncmd, op_lo, op_hi]
/// ```
///
/// Returns `None` for other events and for packets too short to hold the fields.
pub fn parse_command_event(data: &[u8]) -> Option<CommandEvent> {
    match *data {
        [HCI_EV_CMD_COMPLETE, _, _, op_lo, op_hi, status, ..] => Some(CommandEvent::Complete {
            opcode: u16::from_le_bytes([op_lo, op_hi]),
            status,
        }),
        [HCI_EV_CMD_STATUS, _, status, _, op_lo, op_hi, ..] => Some(CommandEvent::Status {
            opcode: u16::from_le_bytes([op_lo, op_hi]),
            status,
        }),
        _ => None,
    }
}

/// Build a Command Complete event for `opcode` with a single status parameter
pub fn cmd_complete_event(opcode: u16, status: u8) -> HciFrame {
    let [lo, hi] = opcode.to_le_bytes();
    HciFrame::new(PacketType::Event, vec![HCI_EV_CMD_COMPLETE, 4, 1, lo, hi, status])
}

/// Build a Command Status event for `opcode`
pub fn cmd_status_event(opcode: u16, status: u8) -> HciFrame {
    let [lo, hi] = opcode.to_le_bytes();
    HciFrame::new(PacketType::Event, vec![HCI_EV_CMD_STATUS, 4, status, 1, lo, hi])
}

/// Extract the enable flag from a VS Bluetooth_Enable command, if it is one
pub fn as_bt_enable_cmd(data: &[u8]) -> Option<bool> {
    match *data {
        [op_lo, op_hi, 1, flag] if u16::from_le_bytes([op_lo, op_hi]) == BT_VS_BT_ENABLE => {
            Some(flag == VS_BT_ENABLE)
        }
        _ => None,
    }
}
