//! Device Lifecycle Controller
//!
//! Creates, registers, resets and destroys the logical HCI device once all
//! three channels of a controller are present, and implements the entry
//! points the host stack calls on that device.

use crate::domain::error::{DriverError, DriverResult};
use crate::domain::models::{
    ChannelKind, DriverEvent, EnableState, HciFrame, PacketType, ResetState,
};
use crate::infrastructure::bluetooth::chip::ChipChannel;
use crate::infrastructure::bluetooth::handshake::{self, EnableRequest};
use crate::infrastructure::bluetooth::host::{HciDevice, HciDriver};
use crate::infrastructure::bluetooth::instance::{BtChannels, ControllerInstance, DriverContext};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// Driver entry points bound into a registered [`HciDevice`]
pub struct HciBinding {
    ctx: Arc<DriverContext>,
    info: Weak<ControllerInstance>,
}

impl HciBinding {
    pub fn new(ctx: Arc<DriverContext>, info: Weak<ControllerInstance>) -> Self {
        Self { ctx, info }
    }

    fn info(&self) -> DriverResult<Arc<ControllerInstance>> {
        self.info
            .upgrade()
            .ok_or(DriverError::InvalidArgument("controller no longer exists"))
    }
}

impl HciDriver for HciBinding {
    fn open(&self, hdev: &HciDevice) -> DriverResult<()> {
        let info = self.info()?;
        open(&self.ctx, &info, hdev)
    }

    fn close(&self, hdev: &HciDevice) -> DriverResult<()> {
        let info = self.info()?;
        close(&self.ctx, &info, hdev)
    }

    fn send(&self, hdev: &HciDevice, frame: HciFrame) -> DriverResult<()> {
        let info = self.info()?;
        send(&info, hdev, frame)
    }

    fn destruct(&self, hdev: &HciDevice) {
        match self.info() {
            Ok(info) => destruct(&self.ctx, &info, hdev),
            Err(e) => error!("Destruct without controller: {}", e),
        }
    }
}

fn open_bt_users(channels: &BtChannels) -> DriverResult<()> {
    let order: [(&str, &Arc<dyn ChipChannel>); 3] = [
        ("ACL", &channels.acl),
        ("CMD", &channels.cmd),
        ("EVT", &channels.evt),
    ];
    for (name, channel) in order {
        channel.open().map_err(|err| {
            error!("Couldn't open BT {} channel ({})", name, err);
            DriverError::from(err)
        })?;
    }
    Ok(())
}

/// Close every channel that is currently open
fn close_bt_users(info: &ControllerInstance) {
    for (_, channel) in info.present_channels() {
        if channel.is_opened() {
            channel.close();
        }
    }
}

/// Open the HCI interface: channels first, then enable the BT core
pub fn open(ctx: &DriverContext, info: &ControllerInstance, hdev: &HciDevice) -> DriverResult<()> {
    info!("Open ST-Ericsson CG2900 driver");

    if hdev.test_and_set_running() {
        error!("Device already opened!");
        return Err(DriverError::Busy("device already opened"));
    }

    let result = open_and_enable(ctx, info);
    if result.is_err() {
        close_bt_users(info);
        hdev.test_and_clear_running();
    }
    result
}

fn open_and_enable(ctx: &DriverContext, info: &ControllerInstance) -> DriverResult<()> {
    let channels = info
        .channels()
        .ok_or(DriverError::InvalidArgument("BT channels missing"))?;
    open_bt_users(&channels)?;

    {
        let mut state = info.lock_state();
        if state.reset_state == ResetState::Activated {
            debug!("New reset_state: {:?}", ResetState::Idle);
            state.reset_state = ResetState::Idle;
        }
    }

    // First enable the BT core
    handshake::send_enable_cmd(ctx, info, &EnableRequest::bt_enable()).map_err(|err| {
        error!("Couldn't enable BT core ({})", err);
        err
    })
}

/// Close the HCI interface: disable the BT core, then release the channels
pub fn close(ctx: &DriverContext, info: &ControllerInstance, hdev: &HciDevice) -> DriverResult<()> {
    debug!("btcg2900_close");

    if !hdev.test_and_clear_running() {
        error!("Device already closed!");
        return Err(DriverError::Busy("device already closed"));
    }

    // The chip is going away anyway while a reset is ongoing
    if info.reset_state() != ResetState::Activated {
        if let Err(err) = handshake::send_enable_cmd(ctx, info, &EnableRequest::bt_disable()) {
            error!("Couldn't disable BT core ({})", err);
        }
    }

    close_bt_users(info);
    Ok(())
}

/// Transmit a frame from the host on the channel matching its packet type
pub fn send(info: &ControllerInstance, hdev: &HciDevice, frame: HciFrame) -> DriverResult<()> {
    hdev.record_tx_bytes(frame.len());

    debug!("Data transmit {} bytes", frame.len());

    let kind = match frame.pkt_type {
        PacketType::Command => ChannelKind::Command,
        PacketType::AclData => ChannelKind::Acl,
        other => {
            error!(
                "Trying to transmit unsupported packet type (0x{:02X})",
                other.as_u8()
            );
            return Err(DriverError::Unsupported(other.as_u8()));
        }
    };

    let channel = info
        .channel(kind)
        .ok_or(DriverError::InvalidArgument("BT channel missing"))?;
    let pkt_type = frame.pkt_type;
    let result = channel.write(frame);
    hdev.record_tx_packet(pkt_type);
    result.map_err(DriverError::from)
}

/// The host stack is done with `hdev`
///
/// Normally the device is freed when a channel is removed. During a reset it
/// is freed here instead, and the reset handler is woken so it can register a
/// replacement.
pub fn destruct(ctx: &DriverContext, info: &ControllerInstance, hdev: &HciDevice) {
    debug!("btcg2900_destruct");

    let released = {
        let mut state = info.lock_state();
        if state.reset_state != ResetState::Activated {
            return;
        }
        let is_current = state
            .hdev
            .as_ref()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), hdev));
        if is_current {
            state.hdev.take()
        } else {
            None
        }
    };

    // A device replaced after an earlier timeout says nothing about the current one
    let Some(old) = released else {
        debug!("Destruct of a replaced HCI device ignored");
        return;
    };
    ctx.host.free_dev(old);

    debug!("New reset_state: {:?}", ResetState::Unregistered);
    info.lock_state().reset_state = ResetState::Unregistered;
    info.wake_all();
}

/// Allocate, fill in and register the HCI device
///
/// Does nothing until all three channels have been probed.
pub fn register_device(ctx: &Arc<DriverContext>, info: &Arc<ControllerInstance>) -> DriverResult<()> {
    // Check if all channels have been probed
    let Some(channels) = info.channels() else {
        return Ok(());
    };

    let Some(mut hdev) = ctx.host.alloc_dev() else {
        error!("Could not allocate mem for CG2900 BT driver");
        return Err(DriverError::OutOfMemory);
    };

    hdev.set_parent(info.parent());
    hdev.set_bus(channels.cmd.bus());
    hdev.bind(Arc::new(HciBinding::new(ctx.clone(), Arc::downgrade(info))));
    let hdev = Arc::new(hdev);

    {
        let mut state = info.lock_state();
        if state.hdev.is_some() {
            // Old device was never destructed, it stays with the host
            error!("Replacing HCI device that was not released");
        }
        state.hdev = Some(hdev.clone());
    }

    if let Err(code) = ctx.host.register_dev(hdev.clone()) {
        error!("Can not register BTCG2900 HCI device ({})", code);
        info.lock_state().hdev = None;
        hdev.unbind();
        ctx.host.free_dev(hdev);
        return Err(DriverError::Registration(code));
    }

    info!("CG2900 registered");

    {
        let mut state = info.lock_state();
        state.enable_state = EnableState::Idle;
        state.reset_state = ResetState::Idle;
    }
    ctx.emit(DriverEvent::DeviceRegistered(info.parent()));
    Ok(())
}

/// Unregister and free the device of `info`, if any
pub fn unregister_device(ctx: &DriverContext, info: &ControllerInstance) {
    let Some(hdev) = info.lock_state().hdev.take() else {
        return;
    };

    info!("Unregistering CG2900");
    // The host may still close the device through the binding
    ctx.host.unregister_dev(&hdev);
    hdev.unbind();
    ctx.host.free_dev(hdev);
    ctx.emit(DriverEvent::DeviceUnregistered(info.parent()));
}

/// Reset notification from the chip-management layer for one channel
///
/// Once every channel has reported closed, the device is unregistered, the
/// host's destruct is awaited and a new device is registered.
pub fn on_reset(ctx: &Arc<DriverContext>, info: &Arc<ControllerInstance>) {
    info!("hci_reset_cb");

    debug!("New reset_state: {:?}", ResetState::Activated);
    info.lock_state().reset_state = ResetState::Activated;
    ctx.emit(DriverEvent::ResetStarted(info.parent()));

    // Continue only when all channels have been reset
    if info
        .present_channels()
        .iter()
        .any(|(_, channel)| channel.is_opened())
    {
        return;
    }

    if let Some(hdev) = info.hdev() {
        // Close and destruct are called by the host stack in turn
        debug!("Deregister HCI device");
        ctx.host.unregister_dev(&hdev);
        drop(hdev);

        let state = info.lock_state();
        let state = info.wait_while(state, ctx.settings.reset_timeout(), |s| {
            s.reset_state != ResetState::Unregistered
        });
        if state.reset_state != ResetState::Unregistered {
            // Register a new device anyway even though the old one leaks
            error!("Timeout expired. Could not deregister HCI device");
        }
        drop(state);
        ctx.emit(DriverEvent::DeviceUnregistered(info.parent()));
    }

    debug!("Register HCI device");
    if let Err(err) = register_device(ctx, info) {
        error!("HCI Device registration error ({})", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::EIO;
    use crate::domain::models::ParentId;
    use crate::domain::settings::DriverSettings;
    use crate::infrastructure::bluetooth::dispatcher::ChannelHandler;
    use crate::infrastructure::bluetooth::loopback::{EnableResponse, LoopbackChip, LoopbackHost};
    use crate::infrastructure::bluetooth::protocol;

    struct Fixture {
        ctx: Arc<DriverContext>,
        host: Arc<LoopbackHost>,
        chip: Arc<LoopbackChip>,
        info: Arc<ControllerInstance>,
    }

    fn fixture() -> Fixture {
        let host = LoopbackHost::new();
        let settings = DriverSettings {
            response_timeout_ms: 150,
            reset_timeout_ms: 150,
            ..Default::default()
        };
        let ctx = Arc::new(DriverContext::new(host.clone(), settings, None));
        let chip = LoopbackChip::new(ParentId(9));
        let info = Arc::new(ControllerInstance::new(ParentId(9)));
        for kind in ChannelKind::ALL {
            let channel = chip.channel(kind);
            channel.set_user(Some(Arc::new(ChannelHandler::new(
                kind,
                ctx.clone(),
                Arc::downgrade(&info),
            ))));
            info.set_channel(kind, Some(channel));
        }
        register_device(&ctx, &info).unwrap();
        Fixture {
            ctx,
            host,
            chip,
            info,
        }
    }

    #[test]
    fn test_register_waits_for_all_channels() {
        let host = LoopbackHost::new();
        let ctx = Arc::new(DriverContext::new(host.clone(), DriverSettings::default(), None));
        let chip = LoopbackChip::new(ParentId(5));
        let info = Arc::new(ControllerInstance::new(ParentId(5)));

        info.set_channel(ChannelKind::Acl, Some(chip.channel(ChannelKind::Acl)));
        register_device(&ctx, &info).unwrap();
        info.set_channel(ChannelKind::Event, Some(chip.channel(ChannelKind::Event)));
        register_device(&ctx, &info).unwrap();
        assert_eq!(host.registrations(), 0);
        assert!(info.hdev().is_none());

        info.set_channel(ChannelKind::Command, Some(chip.channel(ChannelKind::Command)));
        register_device(&ctx, &info).unwrap();
        assert_eq!(host.registrations(), 1);

        let hdev = info.hdev().unwrap();
        assert_eq!(hdev.parent(), Some(ParentId(5)));
        assert_eq!(hdev.bus(), chip.channel(ChannelKind::Command).bus());
        assert!(hdev.is_bound());
    }

    #[test]
    fn test_register_failure_releases_descriptor() {
        let f = fixture();
        f.host.configure(|c| c.fail_register = Some(-17));
        unregister_device(&f.ctx, &f.info);

        assert_eq!(register_device(&f.ctx, &f.info), Err(DriverError::Registration(-17)));
        assert!(f.info.hdev().is_none());
        // One free from the unregister, one from the failed registration
        assert_eq!(f.host.freed(), 2);
    }

    #[test]
    fn test_register_out_of_memory() {
        let f = fixture();
        unregister_device(&f.ctx, &f.info);
        f.host.configure(|c| c.fail_alloc = true);
        assert_eq!(register_device(&f.ctx, &f.info), Err(DriverError::OutOfMemory));
    }

    #[test]
    fn test_open_and_close() {
        let f = fixture();
        let hdev = f.info.hdev().unwrap();

        hdev.open().unwrap();
        assert_eq!(f.info.enable_state(), EnableState::Enabled);
        assert!(hdev.is_running());
        for kind in ChannelKind::ALL {
            assert!(f.chip.is_opened(kind));
        }
        assert_eq!(hdev.open(), Err(DriverError::Busy("device already opened")));

        hdev.close().unwrap();
        assert_eq!(f.info.enable_state(), EnableState::Disabled);
        for kind in ChannelKind::ALL {
            assert!(!f.chip.is_opened(kind));
        }
        assert_eq!(hdev.close(), Err(DriverError::Busy("device already closed")));
    }

    #[test]
    fn test_open_channel_failure_closes_opened_ones() {
        let f = fixture();
        f.chip.configure(|c| c.fail_open = Some(ChannelKind::Event));
        let hdev = f.info.hdev().unwrap();

        let err = hdev.open().unwrap_err();
        assert!(matches!(err, DriverError::Transport(_)));
        assert!(!hdev.is_running());
        for kind in ChannelKind::ALL {
            assert!(!f.chip.is_opened(kind));
        }
        // Open order is ACL, CMD, EVT
        assert_eq!(f.chip.open_log(), vec![ChannelKind::Acl, ChannelKind::Command]);

        // Not a permanent failure
        f.chip.configure(|c| c.fail_open = None);
        hdev.open().unwrap();
    }

    #[test]
    fn test_open_timeout_closes_channels() {
        let f = fixture();
        f.chip.configure(|c| c.enable_response = EnableResponse::Silent);
        let hdev = f.info.hdev().unwrap();

        assert_eq!(
            hdev.open(),
            Err(DriverError::AccessDenied("VS BT Enable (true)"))
        );
        assert_eq!(f.info.enable_state(), EnableState::Disabled);
        assert!(!hdev.is_running());
        for kind in ChannelKind::ALL {
            assert!(!f.chip.is_opened(kind));
        }
    }

    #[test]
    fn test_close_logs_but_ignores_disable_failure() {
        let f = fixture();
        let hdev = f.info.hdev().unwrap();
        hdev.open().unwrap();

        f.chip.configure(|c| c.enable_response = EnableResponse::Silent);
        hdev.close().unwrap();
        assert_eq!(f.info.enable_state(), EnableState::Enabled);
        assert!(!f.chip.is_opened(ChannelKind::Command));
    }

    #[test]
    fn test_send_routes_by_packet_type() {
        let f = fixture();
        let hdev = f.info.hdev().unwrap();
        hdev.open().unwrap();

        let reset = HciFrame::new(PacketType::Command, vec![0x03, 0x0C, 0x00]);
        let acl = HciFrame::new(PacketType::AclData, vec![0x01, 0x20, 0x02, 0x00, 0xAA, 0xBB]);
        hdev.send(reset.clone()).unwrap();
        hdev.send(acl.clone()).unwrap();
        assert_eq!(
            hdev.send(HciFrame::new(PacketType::ScoData, vec![0; 3])),
            Err(DriverError::Unsupported(0x03))
        );

        assert_eq!(
            f.chip.written(ChannelKind::Command),
            vec![protocol::bt_enable_cmd(true), reset]
        );
        assert_eq!(f.chip.written(ChannelKind::Acl), vec![acl]);

        let stats = hdev.stats();
        assert_eq!(stats.byte_tx, 3 + 6 + 3);
        assert_eq!(stats.cmd_tx, 1);
        assert_eq!(stats.acl_tx, 1);
    }

    #[test]
    fn test_send_write_error_propagates() {
        let f = fixture();
        let hdev = f.info.hdev().unwrap();
        f.chip.configure(|c| c.fail_write = true);
        let err = hdev
            .send(HciFrame::new(PacketType::AclData, vec![0; 4]))
            .unwrap_err();
        assert_eq!(err.errno(), -EIO);
        assert_eq!(hdev.stats().acl_tx, 1);
    }

    #[test]
    fn test_destruct_ignored_outside_reset() {
        let f = fixture();
        let hdev = f.info.hdev().unwrap();
        hdev.destruct();
        assert!(f.info.hdev().is_some());
        assert_eq!(f.info.reset_state(), ResetState::Idle);
    }

    #[test]
    fn test_reset_waits_for_last_channel() {
        let f = fixture();
        let old = f.info.hdev().unwrap();
        old.open().unwrap();

        f.chip.reset_channel(ChannelKind::Acl);
        f.chip.reset_channel(ChannelKind::Command);
        assert_eq!(f.info.reset_state(), ResetState::Activated);
        assert_eq!(f.host.unregistrations(), 0);
        assert!(Arc::ptr_eq(&f.info.hdev().unwrap(), &old));

        f.chip.reset_channel(ChannelKind::Event);
        assert_eq!(f.host.unregistrations(), 1);
        assert_eq!(f.host.registrations(), 2);
        assert!(!old.is_running());

        let new = f.info.hdev().unwrap();
        assert!(!Arc::ptr_eq(&new, &old));
        assert_eq!(f.info.reset_state(), ResetState::Idle);
        assert_eq!(f.info.enable_state(), EnableState::Idle);
        // Disable is skipped during reset: only the enable command went out
        assert_eq!(f.chip.written(ChannelKind::Command).len(), 1);

        new.open().unwrap();
        assert_eq!(f.info.enable_state(), EnableState::Enabled);
    }

    #[test]
    fn test_reset_registers_again_after_destruct_timeout() {
        let f = fixture();
        f.host.configure(|c| c.defer_destruct = true);
        f.info.hdev().unwrap().open().unwrap();

        f.chip.reset();
        assert_eq!(f.host.unregistrations(), 1);
        assert_eq!(f.host.registrations(), 2);
        assert_eq!(f.info.reset_state(), ResetState::Idle);

        // Late destruct of the old device must not touch the new one
        f.host.complete_destruct();
        assert!(f.info.hdev().is_some());
        assert_eq!(f.info.reset_state(), ResetState::Idle);
    }

    #[test]
    fn test_stale_destruct_does_not_end_next_reset() {
        let f = fixture();
        f.host.configure(|c| c.defer_destruct = true);
        f.info.hdev().unwrap().open().unwrap();
        f.chip.reset();
        let current = f.info.hdev().unwrap();
        current.open().unwrap();

        // Next reset has started but the current device is still registered
        f.chip.reset_channel(ChannelKind::Acl);
        assert_eq!(f.info.reset_state(), ResetState::Activated);

        f.host.complete_destruct();
        assert_eq!(f.info.reset_state(), ResetState::Activated);
        assert!(Arc::ptr_eq(&f.info.hdev().unwrap(), &current));
        assert_eq!(f.host.freed(), 0);
    }
}
