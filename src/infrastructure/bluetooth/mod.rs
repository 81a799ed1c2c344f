//! CG2900 Bluetooth HCI Driver
//!
//! Glues the three BT channels exported by the CG2900 chip-management layer
//! into one logical HCI device of the host Bluetooth stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Cg2900Driver                         │
//! │   (platform probe/remove for cg2900-bt{cmd,acl,evt})     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┬──────────────┐
//!         │             │              │              │
//!         ▼             ▼              ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │  Registry  │ │ Lifecycle  │ │ Dispatcher │ │ Handshake  │
//! │            │ │            │ │            │ │            │
//! │ - instance │ │ - register │ │ - rx path  │ │ - VS BT    │
//! │   per chip │ │ - open/    │ │ - enable   │ │   Enable   │
//! │            │ │   close    │ │   answers  │ │ - timeout  │
//! │            │ │ - reset    │ │            │ │            │
//! └────────────┘ └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`chip`] - chip-management layer boundary
//! - [`host`] - host stack boundary and the HCI device object
//! - [`protocol`] - VS Bluetooth_Enable command and event parsing
//! - [`instance`] - per-controller shared state
//! - [`registry`] - controllers keyed by parent device
//! - [`handshake`] - enable/disable command exchange
//! - [`dispatcher`] - receive path
//! - [`lifecycle`] - HCI device lifecycle and host entry points
//! - [`service`] - platform driver front end
//! - [`loopback`] - in-process chip and host

pub mod chip;
pub mod dispatcher;
pub mod handshake;
pub mod host;
pub mod instance;
pub mod lifecycle;
pub mod loopback;
pub mod protocol;
pub mod registry;
pub mod service;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export main driver for convenience
pub use service::Cg2900Driver;

/// Lock a mutex, carrying on with the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
