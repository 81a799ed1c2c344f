//! Channel Registry
//!
//! Correlates independently probed channels by their parent device. There is
//! one entry per physical chip, so lookups are a linear scan.

use crate::domain::models::ParentId;
use crate::infrastructure::bluetooth::instance::ControllerInstance;
use crate::infrastructure::bluetooth::lock;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Default)]
pub struct ChannelRegistry {
    devices: Mutex<Vec<Arc<ControllerInstance>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, parent: ParentId) -> Option<Arc<ControllerInstance>> {
        lock(&self.devices)
            .iter()
            .find(|info| info.parent() == parent)
            .cloned()
    }

    /// Existing instance for `parent`, or a new one appended to the list.
    /// The flag tells whether the instance was just created.
    pub fn find_or_create(&self, parent: ParentId) -> (Arc<ControllerInstance>, bool) {
        let mut devices = lock(&self.devices);
        if let Some(info) = devices.iter().find(|info| info.parent() == parent) {
            return (info.clone(), false);
        }

        let info = Arc::new(ControllerInstance::new(parent));
        devices.push(info.clone());
        debug!("CG2900 device added ({})", parent);
        (info, true)
    }

    /// Drop `info` from the list once none of its channels is left
    pub fn remove_if_empty(&self, info: &Arc<ControllerInstance>) -> bool {
        if !info.is_empty() {
            // There are still channels active
            return false;
        }

        let mut devices = lock(&self.devices);
        let before = devices.len();
        devices.retain(|tmp| !Arc::ptr_eq(tmp, info));
        let removed = devices.len() != before;
        if removed {
            debug!("CG2900 device removed ({})", info.parent());
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<Arc<ControllerInstance>> {
        lock(&self.devices).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.devices).is_empty()
    }
}
