//! Coherency directory for distributed data
//!
//! Every logical datum (a tile of a matrix, say) is a [`DataObject`]. Each
//! device that touches it gets at most one [`DataCopy`]; the object records
//! which copy is authoritative and the copies record whether they are valid,
//! being transferred, or stale.
//!
//! ```text
//!   INVALID ──begin_transfer──▶ UNDER_TRANSFER ──complete──▶ SHARED | OWNED
//!      ▲                                                          │
//!      └────────────────────── peer write ────────────────────────┘
//! ```
//!
//! The directory records state; it does not serialize competing writers.
//! Mutual exclusion of writers to one object is the scheduler's contract.
//! A copy that goes stale with nothing referencing it is detached, and its
//! buffer handed back, as soon as the ownership change lands.

mod collection;
mod copy;
mod object;
mod transfer;

pub use collection::DataCollection;
pub use copy::{CopyRef, DataCopy};
pub use object::{DataObject, ReadAccess};
pub use transfer::{LocalTransport, TransferHandle, TransferRequest, TransportStats};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::runtime::device::DeviceIndex;
use crate::runtime::memory::AllocError;

/// Stable identifier of a logical datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataKey(pub u64);

impl fmt::Display for DataKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Data({})", self.0)
    }
}

/// How a task intends to use a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

/// Coherency state of one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoherencyState {
    /// Stale or never filled
    Invalid = 0,
    /// Valid read-only replica
    Shared = 1,
    /// The sole writable replica
    Owned = 2,
}

impl CoherencyState {
    #[inline]
    pub(crate) fn from_u8(val: u8) -> Self {
        match val {
            1 => CoherencyState::Shared,
            2 => CoherencyState::Owned,
            _ => CoherencyState::Invalid,
        }
    }
}

/// Whether a copy is being populated from another device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferStatus {
    NotTransferred = 0,
    UnderTransfer = 1,
    TransferComplete = 2,
}

impl TransferStatus {
    #[inline]
    pub(crate) fn from_u8(val: u8) -> Self {
        match val {
            1 => TransferStatus::UnderTransfer,
            2 => TransferStatus::TransferComplete,
            _ => TransferStatus::NotTransferred,
        }
    }
}

/// Directory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceIndex),
    #[error("copy on {device} is under transfer")]
    TransferInFlight { device: DeviceIndex },
    #[error("copy on {device} still has {readers} active readers")]
    ReadersActive { device: DeviceIndex, readers: u32 },
    #[error("no device holds a valid copy of {key}")]
    NoValidSource { key: DataKey },
    #[error("copy on {device} does not belong to {key}")]
    ForeignCopy { key: DataKey, device: DeviceIndex },
    #[error("tile size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

#[cfg(test)]
mod tests;
