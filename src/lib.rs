//! ST-Ericsson CG2900 Bluetooth HCI driver
//!
//! Binds the command, ACL and event channels of a CG2900 connectivity
//! controller into a single HCI device of a host Bluetooth stack.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{DriverError, DriverResult};
pub use domain::models::{ChannelKind, DriverEvent, EnableState, HciFrame, PacketType, ParentId};
pub use domain::settings::{DriverSettings, SettingsService};
pub use infrastructure::bluetooth::Cg2900Driver;
