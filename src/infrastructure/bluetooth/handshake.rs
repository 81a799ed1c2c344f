//! Enable/Disable Handshake
//!
//! Drives the VS Bluetooth_Enable command and blocks until the receive path
//! reports the matching Command Complete, or the response timeout expires.

use crate::domain::error::{DriverError, DriverResult};
use crate::domain::models::{ChannelKind, EnableState, HciFrame};
use crate::infrastructure::bluetooth::instance::{ControllerInstance, DriverContext};
use crate::infrastructure::bluetooth::protocol;
use tracing::{debug, error};

/// Builds the chip dependent enable command, `None` if nothing must be sent
pub type CommandBuilder = fn(&ControllerInstance, bool) -> Option<HciFrame>;

/// Parameters of one enable/disable exchange
#[derive(Clone, Copy)]
pub struct EnableRequest {
    /// True if the command should enable the functionality
    pub enable: bool,
    /// Only informative
    pub name: &'static str,
    pub get_cmd: CommandBuilder,
    /// State to set upon success
    pub success: EnableState,
    /// State to set while waiting for the response
    pub awaiting: EnableState,
    /// State to set upon failure
    pub failed: EnableState,
}

impl EnableRequest {
    /// Turn the BT core on, used when the host opens the device
    pub fn bt_enable() -> Self {
        Self {
            enable: true,
            name: "VS BT Enable (true)",
            get_cmd: get_bt_enable_cmd,
            success: EnableState::Enabled,
            awaiting: EnableState::WaitingEnabledAck,
            failed: EnableState::Disabled,
        }
    }

    /// Turn the BT core off, used when the host closes the device
    pub fn bt_disable() -> Self {
        Self {
            enable: false,
            name: "VS BT Enable (false)",
            get_cmd: get_bt_enable_cmd,
            success: EnableState::Disabled,
            awaiting: EnableState::WaitingDisabledAck,
            failed: EnableState::Enabled,
        }
    }
}

/// VS Bluetooth_Enable for CG2900 silicon, nothing for other chips
pub fn get_bt_enable_cmd(info: &ControllerInstance, bt_enable: bool) -> Option<HciFrame> {
    let cmd = info.channel(ChannelKind::Command)?;

    let Some(rev_data) = cmd.local_revision() else {
        error!("Couldn't get revision");
        return None;
    };

    // If connected chip does not support the command return None
    if !rev_data.supports_bt_enable() {
        debug!("Revision 0x{:04X} has no BT enable command", rev_data.revision);
        return None;
    }

    Some(protocol::bt_enable_cmd(bt_enable))
}

/// Send a command with only enable/disable functionality and wait for its result
///
/// Returns `AccessDenied` if the chip does not confirm in time, or the
/// transport error if the command could not be written.
pub fn send_enable_cmd(
    ctx: &DriverContext,
    info: &ControllerInstance,
    en_info: &EnableRequest,
) -> DriverResult<()> {
    let _in_flight = info.lock_handshake();
    let parent = info.parent();

    let Some(enable_cmd) = (en_info.get_cmd)(info, en_info.enable) else {
        info.lock_state().enable_state = en_info.success;
        ctx.enable_state_changed(parent, en_info.success);
        return Ok(());
    };

    let cmd = info
        .channel(ChannelKind::Command)
        .ok_or(DriverError::InvalidArgument("BT command channel missing"))?;

    // Set the state before sending so the answer cannot overtake us
    info.lock_state().enable_state = en_info.awaiting;
    ctx.enable_state_changed(parent, en_info.awaiting);

    if let Err(err) = cmd.write(enable_cmd) {
        error!("Couldn't send {} command ({})", en_info.name, err);
        info.lock_state().enable_state = en_info.failed;
        ctx.enable_state_changed(parent, en_info.failed);
        return Err(err.into());
    }

    // An error completion ends the wait as well, the outcome is already known
    let state = info.lock_state();
    let mut state = info.wait_while(state, ctx.settings.response_timeout(), |s| {
        s.enable_state != en_info.success && s.enable_state != EnableState::Error
    });

    if state.enable_state != en_info.success {
        error!(
            "Could not change {} state ({:?})",
            en_info.name, state.enable_state
        );
        state.enable_state = en_info.failed;
        drop(state);
        ctx.enable_state_changed(parent, en_info.failed);
        return Err(DriverError::AccessDenied(en_info.name));
    }

    Ok(())
}
