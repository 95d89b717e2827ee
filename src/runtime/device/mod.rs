//! Device table
//!
//! A device is anything with its own memory space that can hold a copy of a
//! datum: the host, or an accelerator. The registry is built once at runtime
//! start and passed around by reference; there is no process-wide table.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runtime::memory::{BoundedAllocator, BufferAllocator, HostAllocator};
use crate::util::config::DeviceConfig;

/// Upper bound on registered devices; the last `u8` value means "none".
pub const MAX_DEVICES: usize = u8::MAX as usize;

/// Kind of memory space a device exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Host memory, allocated from the global allocator
    Cpu,
    /// Accelerator memory with a fixed budget
    Accelerator,
}

impl fmt::Display for DeviceKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Position of a device in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIndex(pub u8);

impl DeviceIndex {
    /// Encoded "no device", used by atomic owner fields.
    pub(crate) const NONE_RAW: u8 = u8::MAX;

    #[inline]
    pub fn value(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        (raw != Self::NONE_RAW).then_some(DeviceIndex(raw))
    }

    #[inline]
    pub(crate) fn to_raw(index: Option<Self>) -> u8 {
        index.map_or(Self::NONE_RAW, |d| d.0)
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("device registry is full ({max} devices)")]
    RegistryFull { max: usize },
    #[error("accelerator `{0}` needs a memory budget")]
    MissingBudget(String),
}

/// One registered device and its allocation strategy.
#[derive(Debug, Clone)]
pub struct Device {
    index: DeviceIndex,
    name: String,
    kind: DeviceKind,
    allocator: Arc<dyn BufferAllocator>,
}

impl Device {
    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.allocator
    }
}

/// All devices known to a runtime instance.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with one host device and `accelerators` budgeted devices.
    pub fn host_with_accelerators(
        accelerators: usize,
        budget: usize,
    ) -> Result<Self, DeviceError> {
        let mut registry = Self::new();
        registry.register("host", DeviceKind::Cpu, Arc::new(HostAllocator::new()))?;
        for i in 0..accelerators {
            registry.register(
                format!("accel{i}"),
                DeviceKind::Accelerator,
                Arc::new(BoundedAllocator::with_capacity(budget)),
            )?;
        }
        Ok(registry)
    }

    /// Build the table from configuration, picking an allocator per kind.
    pub fn from_config(devices: &[DeviceConfig]) -> Result<Self, DeviceError> {
        let mut registry = Self::new();
        for device in devices {
            let allocator: Arc<dyn BufferAllocator> = match (device.kind, device.memory_bytes) {
                (DeviceKind::Cpu, None) => Arc::new(HostAllocator::new()),
                (_, Some(budget)) => Arc::new(BoundedAllocator::with_capacity(budget)),
                (DeviceKind::Accelerator, None) => {
                    return Err(DeviceError::MissingBudget(device.name.clone()))
                }
            };
            registry.register(device.name.clone(), device.kind, allocator)?;
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        kind: DeviceKind,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<DeviceIndex, DeviceError> {
        if self.devices.len() >= MAX_DEVICES {
            return Err(DeviceError::RegistryFull { max: MAX_DEVICES });
        }
        let index = DeviceIndex(self.devices.len() as u8);
        let name = name.into();
        debug!(%index, %name, %kind, "device registered");
        self.devices.push(Device {
            index,
            name,
            kind,
            allocator,
        });
        Ok(index)
    }

    #[inline]
    pub fn get(
        &self,
        index: DeviceIndex,
    ) -> Option<&Device> {
        self.devices.get(index.value())
    }

    pub fn find(
        &self,
        name: &str,
    ) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Bytes currently allocated across every device.
    pub fn allocated(&self) -> usize {
        self.devices.iter().map(|d| d.allocator.allocated()).sum()
    }
}
