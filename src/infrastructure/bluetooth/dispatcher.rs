//! Receive Dispatcher
//!
//! Every frame the chip sends passes through here. Answers to the driver's
//! own VS Bluetooth_Enable command are consumed; everything else is tagged
//! with the channel's packet type and handed to the host stack.

use crate::domain::models::{ChannelKind, EnableState, HciFrame, ACTIVE_STATE};
use crate::infrastructure::bluetooth::chip::ChannelUser;
use crate::infrastructure::bluetooth::instance::{ControllerInstance, DriverContext, InstanceState};
use crate::infrastructure::bluetooth::lifecycle;
use crate::infrastructure::bluetooth::protocol::{
    self, CommandEvent, BT_VS_BT_ENABLE, HCI_ERR_CMD_DISALLOWED, HCI_ERR_NO_ERROR,
};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Per-channel callback object installed in the chip-management layer
pub struct ChannelHandler {
    kind: ChannelKind,
    ctx: Arc<DriverContext>,
    info: Weak<ControllerInstance>,
}

impl ChannelHandler {
    pub fn new(kind: ChannelKind, ctx: Arc<DriverContext>, info: Weak<ControllerInstance>) -> Self {
        Self { kind, ctx, info }
    }
}

impl ChannelUser for ChannelHandler {
    fn on_receive(&self, frame: HciFrame) {
        match self.info.upgrade() {
            Some(info) => on_receive(&self.ctx, &info, self.kind, frame),
            None => warn!("{} data for a removed controller dropped", self.kind.name()),
        }
    }

    fn on_reset(&self) {
        match self.info.upgrade() {
            Some(info) => lifecycle::on_reset(&self.ctx, &info),
            None => warn!("{} reset for a removed controller ignored", self.kind.name()),
        }
    }
}

/// Route one frame received on `kind`
pub fn on_receive(ctx: &DriverContext, info: &ControllerInstance, kind: ChannelKind, mut frame: HciFrame) {
    if kind == ChannelKind::Event && handle_rx_evt(ctx, info, &frame) {
        return;
    }

    let Some(hdev) = info.hdev() else {
        warn!("No HCI device registered, dropping {} bytes", frame.len());
        return;
    };

    frame.pkt_type = kind.data_type();
    hdev.record_rx(&frame);

    debug!("Data receive {} bytes", frame.len());

    if let Err(err) = ctx.host.recv_frame(&hdev, frame) {
        error!("Failed in supplying packet to Bluetooth stack ({})", err);
    }
}

/// Check if a received event answers an internal command
///
/// Returns true if the event has been handled internally.
pub fn handle_rx_evt(ctx: &DriverContext, info: &ControllerInstance, frame: &HciFrame) -> bool {
    let mut state = info.lock_state();

    // BT enable/disable answers are not expected once the core is active
    if state.enable_state == ACTIVE_STATE {
        return false;
    }

    match protocol::parse_command_event(&frame.data) {
        Some(CommandEvent::Complete {
            opcode: BT_VS_BT_ENABLE,
            status,
        }) => {
            let handled = handle_bt_enable_comp(&mut state, status);
            if handled {
                let new_state = state.enable_state;
                drop(state);
                ctx.enable_state_changed(info.parent(), new_state);
                // Wake up whoever is waiting for this result
                info.wake_all();
            }
            handled
        }
        Some(CommandEvent::Status {
            opcode: BT_VS_BT_ENABLE,
            status,
        }) => handle_bt_enable_stat(&state, status),
        _ => false,
    }
}

fn is_awaiting(state: &InstanceState) -> bool {
    matches!(
        state.enable_state,
        EnableState::WaitingEnabledAck | EnableState::WaitingDisabledAck
    )
}

/// Command Complete for VS Bluetooth_Enable
///
/// NO_ERROR means the core changed state now, CMD_DISALLOWED that it was
/// already in the requested state. Both count as success.
fn handle_bt_enable_comp(state: &mut InstanceState, status: u8) -> bool {
    if !is_awaiting(state) {
        return false;
    }

    if status != HCI_ERR_NO_ERROR && status != HCI_ERR_CMD_DISALLOWED {
        error!("Could not enable/disable BT core (0x{:X})", status);
        state.enable_state = EnableState::Error;
        return true;
    }

    if state.enable_state == EnableState::WaitingEnabledAck {
        state.enable_state = EnableState::Enabled;
        info!("CG2900 BT core is enabled");
    } else {
        state.enable_state = EnableState::Disabled;
        info!("CG2900 BT core is disabled");
    }
    true
}

/// Command Status for VS Bluetooth_Enable, the result follows in Command Complete
fn handle_bt_enable_stat(state: &InstanceState, status: u8) -> bool {
    if !is_awaiting(state) {
        return false;
    }

    debug!("HCI Driver received Command Status (BT enable): 0x{:X}", status);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{PacketType, ParentId};
    use crate::domain::settings::DriverSettings;
    use crate::infrastructure::bluetooth::host::{HciDevice, HostStack};
    use crate::infrastructure::bluetooth::loopback::LoopbackHost;
    use crate::infrastructure::bluetooth::protocol::{cmd_complete_event, cmd_status_event};

    fn setup(state: EnableState) -> (Arc<LoopbackHost>, DriverContext, ControllerInstance) {
        let host = LoopbackHost::new();
        let ctx = DriverContext::new(host.clone(), DriverSettings::default(), None);
        let info = ControllerInstance::new(ParentId(4));
        let hdev = Arc::new(HciDevice::default());
        host.register_dev(hdev.clone()).unwrap();
        {
            let mut s = info.lock_state();
            s.hdev = Some(hdev);
            s.enable_state = state;
        }
        (host, ctx, info)
    }

    #[test]
    fn test_enable_complete_is_consumed() {
        let (host, ctx, info) = setup(EnableState::WaitingEnabledAck);
        on_receive(&ctx, &info, ChannelKind::Event, cmd_complete_event(BT_VS_BT_ENABLE, 0x00));
        assert_eq!(info.enable_state(), EnableState::Enabled);
        assert!(host.received().is_empty());
    }

    #[test]
    fn test_disable_complete_disallowed_is_success() {
        let (host, ctx, info) = setup(EnableState::WaitingDisabledAck);
        on_receive(
            &ctx,
            &info,
            ChannelKind::Event,
            cmd_complete_event(BT_VS_BT_ENABLE, HCI_ERR_CMD_DISALLOWED),
        );
        assert_eq!(info.enable_state(), EnableState::Disabled);
        assert!(host.received().is_empty());
    }

    #[test]
    fn test_other_status_sets_error() {
        let (host, ctx, info) = setup(EnableState::WaitingEnabledAck);
        on_receive(&ctx, &info, ChannelKind::Event, cmd_complete_event(BT_VS_BT_ENABLE, 0x01));
        assert_eq!(info.enable_state(), EnableState::Error);
        assert!(host.received().is_empty());
    }

    #[test]
    fn test_command_status_consumed_without_state_change() {
        let (host, ctx, info) = setup(EnableState::WaitingEnabledAck);
        on_receive(&ctx, &info, ChannelKind::Event, cmd_status_event(BT_VS_BT_ENABLE, 0x00));
        assert_eq!(info.enable_state(), EnableState::WaitingEnabledAck);
        assert!(host.received().is_empty());
    }

    #[test]
    fn test_enable_answer_forwarded_when_not_waiting() {
        let (host, ctx, info) = setup(EnableState::Idle);
        on_receive(&ctx, &info, ChannelKind::Event, cmd_complete_event(BT_VS_BT_ENABLE, 0x00));
        assert_eq!(info.enable_state(), EnableState::Idle);
        assert_eq!(host.received().len(), 1);
    }

    #[test]
    fn test_active_state_forwards_everything() {
        let (host, ctx, info) = setup(EnableState::Enabled);
        on_receive(&ctx, &info, ChannelKind::Event, cmd_complete_event(BT_VS_BT_ENABLE, 0x00));
        on_receive(&ctx, &info, ChannelKind::Event, cmd_status_event(BT_VS_BT_ENABLE, 0x00));
        on_receive(&ctx, &info, ChannelKind::Event, cmd_complete_event(0x0C03, 0x00));
        assert_eq!(info.enable_state(), EnableState::Enabled);
        assert_eq!(host.received().len(), 3);
    }

    #[test]
    fn test_only_event_channel_is_filtered() {
        let (host, ctx, info) = setup(EnableState::WaitingEnabledAck);
        let frame = cmd_complete_event(BT_VS_BT_ENABLE, 0x00);
        on_receive(&ctx, &info, ChannelKind::Acl, frame);
        assert_eq!(info.enable_state(), EnableState::WaitingEnabledAck);

        let received = host.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].pkt_type, PacketType::AclData);
    }

    #[test]
    fn test_forwarding_updates_stats() {
        let (host, ctx, info) = setup(EnableState::Enabled);
        on_receive(&ctx, &info, ChannelKind::Acl, HciFrame::new(PacketType::Vendor, vec![0; 12]));
        on_receive(&ctx, &info, ChannelKind::Event, cmd_complete_event(0x1001, 0x00));

        let stats = info.hdev().unwrap().stats();
        assert_eq!(stats.byte_rx, 18);
        assert_eq!(stats.acl_rx, 1);
        assert_eq!(stats.evt_rx, 1);
        assert_eq!(host.received()[1].pkt_type, PacketType::Event);
    }

    #[test]
    fn test_frames_dropped_without_device() {
        let (host, ctx, info) = setup(EnableState::Enabled);
        info.lock_state().hdev = None;
        on_receive(&ctx, &info, ChannelKind::Acl, HciFrame::new(PacketType::AclData, vec![1, 2]));
        assert!(host.received().is_empty());
    }
}
