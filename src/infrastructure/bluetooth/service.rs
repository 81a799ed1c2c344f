//! CG2900 Driver Service
//!
//! Front end registered with the platform framework: three probe/remove
//! entry points, one per BT channel, feeding a shared controller registry.

use crate::domain::error::{DriverError, DriverResult};
use crate::domain::models::{ChannelKind, DriverEvent};
use crate::domain::settings::DriverSettings;
use crate::infrastructure::bluetooth::chip::ChipChannel;
use crate::infrastructure::bluetooth::dispatcher::ChannelHandler;
use crate::infrastructure::bluetooth::host::HostStack;
use crate::infrastructure::bluetooth::instance::{ControllerInstance, DriverContext};
use crate::infrastructure::bluetooth::lifecycle;
use crate::infrastructure::bluetooth::registry::ChannelRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Platform device names of the three BT channels
pub const CMD_DRIVER_NAME: &str = "cg2900-btcmd";
pub const ACL_DRIVER_NAME: &str = "cg2900-btacl";
pub const EVT_DRIVER_NAME: &str = "cg2900-btevt";

/// Platform name to channel mapping, in registration order
pub const PLATFORM_DRIVERS: [(&str, ChannelKind); 3] = [
    (CMD_DRIVER_NAME, ChannelKind::Command),
    (ACL_DRIVER_NAME, ChannelKind::Acl),
    (EVT_DRIVER_NAME, ChannelKind::Event),
];

pub fn channel_for_name(name: &str) -> Option<ChannelKind> {
    PLATFORM_DRIVERS
        .iter()
        .find(|(driver, _)| *driver == name)
        .map(|(_, kind)| *kind)
}

/// The CG2900 BT HCI driver
///
/// Owns the controller registry for its whole lifetime. Dropping the driver
/// without [`Cg2900Driver::shutdown`] leaves registered devices with the host.
pub struct Cg2900Driver {
    ctx: Arc<DriverContext>,
    registry: ChannelRegistry,
}

impl Cg2900Driver {
    pub fn new(host: Arc<dyn HostStack>, settings: DriverSettings) -> Self {
        Self::build(host, settings, None)
    }

    /// Same as [`Cg2900Driver::new`], publishing [`DriverEvent`]s to `events`
    pub fn with_events(
        host: Arc<dyn HostStack>,
        settings: DriverSettings,
        events: mpsc::UnboundedSender<DriverEvent>,
    ) -> Self {
        Self::build(host, settings, Some(events))
    }

    fn build(
        host: Arc<dyn HostStack>,
        settings: DriverSettings,
        events: Option<mpsc::UnboundedSender<DriverEvent>>,
    ) -> Self {
        debug!("btcg2900_init");
        for (name, kind) in PLATFORM_DRIVERS {
            debug!("Registered platform driver {} ({})", name, kind.name());
        }
        Self {
            ctx: Arc::new(DriverContext::new(host, settings, events)),
            registry: ChannelRegistry::new(),
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn instance(&self, channel: &dyn ChipChannel) -> Option<Arc<ControllerInstance>> {
        self.registry.find(channel.parent())
    }

    /// Probe by platform device name
    pub fn probe_named(&self, name: &str, channel: Arc<dyn ChipChannel>) -> DriverResult<()> {
        let kind = channel_for_name(name).ok_or(DriverError::InvalidArgument("unknown platform device"))?;
        self.probe(kind, channel)
    }

    /// A BT channel appeared; register the HCI device once all three are here
    pub fn probe(&self, kind: ChannelKind, channel: Arc<dyn ChipChannel>) -> DriverResult<()> {
        debug!("Starting CG2900 {} channel", kind.name());

        let (info, created) = self.registry.find_or_create(channel.parent());
        if created {
            self.ctx.emit(DriverEvent::InstanceAdded(info.parent()));
        }

        if info.channel(kind).is_some() {
            error!("{} channel already probed for {}", kind.name(), info.parent());
            return Err(DriverError::Busy("channel already probed"));
        }

        info.set_channel(kind, Some(channel.clone()));
        channel.set_user(Some(Arc::new(ChannelHandler::new(
            kind,
            self.ctx.clone(),
            Arc::downgrade(&info),
        ))));

        if let Err(err) = lifecycle::register_device(&self.ctx, &info) {
            error!("Failed to initialize channel ({})", err);
            channel.set_user(None);
            info.set_channel(kind, None);
            self.forget_if_empty(&info);
            return Err(err);
        }

        self.ctx.emit(DriverEvent::ChannelProbed(info.parent(), kind));
        Ok(())
    }

    /// A BT channel went away; the HCI device goes with it
    pub fn remove(&self, kind: ChannelKind, channel: &Arc<dyn ChipChannel>) -> DriverResult<()> {
        debug!("Removing CG2900 {} channel", kind.name());

        let info = self
            .registry
            .find(channel.parent())
            .ok_or(DriverError::InvalidArgument("channel was never probed"))?;

        match info.channel(kind) {
            Some(current) if std::ptr::addr_eq(Arc::as_ptr(&current), Arc::as_ptr(channel)) => {}
            _ => return Err(DriverError::InvalidArgument("channel was never probed")),
        }

        // The host closes a running device on unregister, which needs every channel
        lifecycle::unregister_device(&self.ctx, &info);

        info.set_channel(kind, None);
        channel.set_user(None);

        self.ctx.emit(DriverEvent::ChannelRemoved(info.parent(), kind));
        self.forget_if_empty(&info);
        Ok(())
    }

    /// Remove every channel of every controller
    pub fn shutdown(&self) {
        debug!("btcg2900_exit");
        for info in self.registry.snapshot() {
            for (kind, channel) in info.present_channels() {
                if let Err(err) = self.remove(kind, &channel) {
                    error!("Failed to remove {} channel ({})", kind.name(), err);
                }
            }
        }
        info!("CG2900 BT driver stopped");
    }

    fn forget_if_empty(&self, info: &Arc<ControllerInstance>) {
        if self.registry.remove_if_empty(info) {
            self.ctx.emit(DriverEvent::InstanceRemoved(info.parent()));
        }
    }
}
