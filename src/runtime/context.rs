//! Explicit runtime context
//!
//! Created at runtime start and passed by reference to everything that needs
//! the device table or the transport. Nothing here is global.

use std::sync::Arc;

use tracing::info;

use crate::runtime::data::LocalTransport;
use crate::runtime::device::{DeviceError, DeviceRegistry};
use crate::util::config::RuntimeConfig;

#[derive(Debug)]
pub struct RuntimeContext {
    devices: Arc<DeviceRegistry>,
    transport: LocalTransport,
}

impl RuntimeContext {
    pub fn new(devices: DeviceRegistry) -> Self {
        Self {
            devices: Arc::new(devices),
            transport: LocalTransport::new(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self, DeviceError> {
        let devices = DeviceRegistry::from_config(&config.devices)?;
        info!(devices = devices.len(), "runtime context ready");
        Ok(Self::new(devices))
    }

    #[inline]
    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    #[inline]
    pub fn transport(&self) -> &LocalTransport {
        &self.transport
    }
}
