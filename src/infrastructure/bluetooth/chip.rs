//! Chip-management layer boundary
//!
//! The CG2900 core driver owns the physical transport and hands out one
//! [`ChipChannel`] per logical BT channel. The HCI driver installs a
//! [`ChannelUser`] on each channel to receive data and reset notifications.

use crate::domain::error::TransportError;
use crate::domain::models::{BusType, HciFrame, ParentId};
use crate::infrastructure::bluetooth::protocol::RevisionData;
use std::sync::Arc;

/// Callbacks the chip-management layer invokes on a channel user
///
/// Both may be called from any thread, including while another thread is
/// blocked inside a handshake on the same controller.
pub trait ChannelUser: Send + Sync {
    /// Data received from the chip on this channel
    fn on_receive(&self, frame: HciFrame);

    /// The chip has been reset and this channel has been closed
    fn on_reset(&self);
}

/// One logical channel exported by the chip-management layer
pub trait ChipChannel: Send + Sync {
    /// Parent bus device shared by all channels of the same chip
    fn parent(&self) -> ParentId;

    fn open(&self) -> Result<(), TransportError>;

    fn close(&self);

    fn is_opened(&self) -> bool;

    /// Queue a frame for transmission to the chip
    fn write(&self, frame: HciFrame) -> Result<(), TransportError>;

    /// Revision reported by the chip, `None` if it could not be read
    fn local_revision(&self) -> Option<RevisionData>;

    /// Bus the chip is connected through
    fn bus(&self) -> BusType;

    /// Install or clear the user receiving callbacks for this channel
    fn set_user(&self, user: Option<Arc<dyn ChannelUser>>);
}
