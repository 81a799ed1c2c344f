//! Per-controller state shared by the three BT channels of one chip.

use crate::domain::models::{ChannelKind, DriverEvent, EnableState, ParentId, ResetState};
use crate::domain::settings::DriverSettings;
use crate::infrastructure::bluetooth::chip::ChipChannel;
use crate::infrastructure::bluetooth::host::{HciDevice, HostStack};
use crate::infrastructure::bluetooth::lock;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Collaborators and tunables shared by every controller of the driver
pub struct DriverContext {
    pub host: Arc<dyn HostStack>,
    pub settings: DriverSettings,
    events: Option<mpsc::UnboundedSender<DriverEvent>>,
}

impl DriverContext {
    pub fn new(
        host: Arc<dyn HostStack>,
        settings: DriverSettings,
        events: Option<mpsc::UnboundedSender<DriverEvent>>,
    ) -> Self {
        Self {
            host,
            settings,
            events,
        }
    }

    pub(crate) fn emit(&self, event: DriverEvent) {
        if let Some(sender) = &self.events {
            // Nobody listening is fine
            let _ = sender.send(event);
        }
    }

    pub(crate) fn enable_state_changed(&self, parent: ParentId, state: EnableState) {
        debug!("{} New enable_state: {:?}", parent, state);
        self.emit(DriverEvent::EnableState(parent, state));
    }
}

/// All three channels of a fully probed controller
#[derive(Clone)]
pub struct BtChannels {
    pub cmd: Arc<dyn ChipChannel>,
    pub acl: Arc<dyn ChipChannel>,
    pub evt: Arc<dyn ChipChannel>,
}

#[derive(Default)]
pub(crate) struct InstanceState {
    pub cmd: Option<Arc<dyn ChipChannel>>,
    pub acl: Option<Arc<dyn ChipChannel>>,
    pub evt: Option<Arc<dyn ChipChannel>>,
    pub hdev: Option<Arc<HciDevice>>,
    pub reset_state: ResetState,
    pub enable_state: EnableState,
}

impl InstanceState {
    fn slot_mut(&mut self, kind: ChannelKind) -> &mut Option<Arc<dyn ChipChannel>> {
        match kind {
            ChannelKind::Command => &mut self.cmd,
            ChannelKind::Acl => &mut self.acl,
            ChannelKind::Event => &mut self.evt,
        }
    }

    fn slot(&self, kind: ChannelKind) -> Option<&Arc<dyn ChipChannel>> {
        match kind {
            ChannelKind::Command => self.cmd.as_ref(),
            ChannelKind::Acl => self.acl.as_ref(),
            ChannelKind::Event => self.evt.as_ref(),
        }
    }
}

/// One CG2900 chip, identified by the parent device of its channels
///
/// A single mutex guards channels, device handle and both state machines. It
/// is paired with one condition variable that is broadcast whenever a
/// handshake completes or the host destructs the device; every waiter
/// re-checks its own predicate. The lock is never held across calls into the
/// chip layer or the host stack.
pub struct ControllerInstance {
    parent: ParentId,
    state: Mutex<InstanceState>,
    wait_queue: Condvar,
    handshake: Mutex<()>,
}

impl ControllerInstance {
    pub fn new(parent: ParentId) -> Self {
        Self {
            parent,
            state: Mutex::new(InstanceState::default()),
            wait_queue: Condvar::new(),
            handshake: Mutex::new(()),
        }
    }

    pub fn parent(&self) -> ParentId {
        self.parent
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, InstanceState> {
        lock(&self.state)
    }

    /// Serialises enable/disable handshakes on this controller
    pub(crate) fn lock_handshake(&self) -> MutexGuard<'_, ()> {
        lock(&self.handshake)
    }

    /// Block while `condition` holds, at most `timeout`
    pub(crate) fn wait_while<'a, F>(
        &self,
        guard: MutexGuard<'a, InstanceState>,
        timeout: Duration,
        condition: F,
    ) -> MutexGuard<'a, InstanceState>
    where
        F: FnMut(&mut InstanceState) -> bool,
    {
        let (guard, _) = self
            .wait_queue
            .wait_timeout_while(guard, timeout, condition)
            .unwrap_or_else(PoisonError::into_inner);
        guard
    }

    pub(crate) fn wake_all(&self) {
        self.wait_queue.notify_all();
    }

    pub fn channel(&self, kind: ChannelKind) -> Option<Arc<dyn ChipChannel>> {
        self.lock_state().slot(kind).cloned()
    }

    /// Replace a channel handle, returning the old one
    pub(crate) fn set_channel(
        &self,
        kind: ChannelKind,
        channel: Option<Arc<dyn ChipChannel>>,
    ) -> Option<Arc<dyn ChipChannel>> {
        std::mem::replace(self.lock_state().slot_mut(kind), channel)
    }

    /// All three channels, or `None` while any is missing
    pub fn channels(&self) -> Option<BtChannels> {
        let state = self.lock_state();
        Some(BtChannels {
            cmd: state.cmd.clone()?,
            acl: state.acl.clone()?,
            evt: state.evt.clone()?,
        })
    }

    /// Channels currently present, in CMD, ACL, EVT order
    pub fn present_channels(&self) -> Vec<(ChannelKind, Arc<dyn ChipChannel>)> {
        let state = self.lock_state();
        ChannelKind::ALL
            .iter()
            .filter_map(|kind| state.slot(*kind).map(|ch| (*kind, ch.clone())))
            .collect()
    }

    /// True when no channel handle is left
    pub fn is_empty(&self) -> bool {
        let state = self.lock_state();
        state.cmd.is_none() && state.acl.is_none() && state.evt.is_none()
    }

    pub fn hdev(&self) -> Option<Arc<HciDevice>> {
        self.lock_state().hdev.clone()
    }

    pub fn enable_state(&self) -> EnableState {
        self.lock_state().enable_state
    }

    pub fn reset_state(&self) -> ResetState {
        self.lock_state().reset_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::loopback::LoopbackChip;

    #[test]
    fn test_channels_require_all_three() {
        let chip = LoopbackChip::new(ParentId(1));
        let instance = ControllerInstance::new(ParentId(1));
        assert!(instance.is_empty());

        instance.set_channel(ChannelKind::Command, Some(chip.channel(ChannelKind::Command)));
        instance.set_channel(ChannelKind::Event, Some(chip.channel(ChannelKind::Event)));
        assert!(instance.channels().is_none());
        assert_eq!(instance.present_channels().len(), 2);

        instance.set_channel(ChannelKind::Acl, Some(chip.channel(ChannelKind::Acl)));
        assert!(instance.channels().is_some());
        assert!(!instance.is_empty());
    }

    #[test]
    fn test_wait_returns_on_timeout() {
        let instance = ControllerInstance::new(ParentId(2));
        let guard = instance.lock_state();
        let guard = instance.wait_while(guard, Duration::from_millis(20), |s| {
            s.reset_state != ResetState::Unregistered
        });
        assert_eq!(guard.reset_state, ResetState::Idle);
    }
}
