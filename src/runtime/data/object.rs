//! Directory record for one logical datum.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::copy::{CopyRef, DataCopy};
use super::transfer::TransferRequest;
use super::{AccessMode, CoherencyState, DataKey, DirectoryError};
use crate::runtime::device::{DeviceIndex, DeviceRegistry};
use crate::runtime::memory::MemoryLayout;

type CopyTable = SmallVec<[Option<Arc<DataCopy>>; 4]>;

/// Outcome of [`DataObject::acquire_for_read`].
#[derive(Debug)]
pub enum ReadAccess {
    /// The local copy is valid and current.
    Ready(CopyRef),
    /// The copy must be filled first; retry once the transfer completes.
    Pending(TransferRequest),
}

/// Coherency record of one datum across all devices.
///
/// The copy table has one slot per registered device and never grows after
/// construction. The structural lock guards only the table itself; per-copy
/// state lives in atomics on [`DataCopy`].
pub struct DataObject {
    key: DataKey,
    size: usize,
    layout: MemoryLayout,
    owner: AtomicU8,
    preferred: AtomicU8,
    version: AtomicU32,
    devices: Arc<DeviceRegistry>,
    copies: RwLock<CopyTable>,
}

impl DataObject {
    pub fn new(
        key: DataKey,
        size: usize,
        devices: Arc<DeviceRegistry>,
    ) -> Result<Arc<Self>, DirectoryError> {
        let layout = MemoryLayout::for_buffer(size)?;
        let copies = (0..devices.len()).map(|_| None).collect();
        Ok(Arc::new(Self {
            key,
            size,
            layout,
            owner: AtomicU8::new(DeviceIndex::NONE_RAW),
            preferred: AtomicU8::new(DeviceIndex::NONE_RAW),
            version: AtomicU32::new(0),
            devices,
            copies: RwLock::new(copies),
        }))
    }

    #[inline]
    pub fn key(&self) -> DataKey {
        self.key
    }

    /// Bytes of one copy.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current authoritative version.
    #[inline]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn owner_device(&self) -> Option<DeviceIndex> {
        DeviceIndex::from_raw(self.owner.load(Ordering::Acquire))
    }

    /// Advisory placement hint.
    #[inline]
    pub fn preferred_device(&self) -> Option<DeviceIndex> {
        DeviceIndex::from_raw(self.preferred.load(Ordering::Relaxed))
    }

    pub fn set_preferred_device(
        &self,
        device: Option<DeviceIndex>,
    ) {
        self.preferred
            .store(DeviceIndex::to_raw(device), Ordering::Relaxed);
    }

    /// Valid and holding the current version.
    pub fn is_current(
        &self,
        copy: &DataCopy,
    ) -> bool {
        copy.is_valid() && copy.version() == self.version()
    }

    /// Peek at the copy on `device` without creating it.
    pub fn copy(
        &self,
        device: DeviceIndex,
    ) -> Option<CopyRef> {
        let copies = self.copies.read();
        copies
            .get(device.value())
            .and_then(Option::as_ref)
            .map(CopyRef::retain)
    }

    /// Number of devices currently holding a copy.
    pub fn copy_count(&self) -> usize {
        self.copies.read().iter().flatten().count()
    }

    /// Guards outstanding across every copy.
    pub fn active_refs(&self) -> usize {
        self.copies
            .read()
            .iter()
            .flatten()
            .map(|copy| copy.ref_count())
            .sum()
    }

    /// Existing copy on `device`, or a fresh INVALID one.
    pub fn get_or_create_copy(
        self: &Arc<Self>,
        device: DeviceIndex,
    ) -> Result<CopyRef, DirectoryError> {
        let slot = device.value();
        {
            let copies = self.copies.read();
            match copies.get(slot) {
                None => return Err(DirectoryError::UnknownDevice(device)),
                Some(Some(copy)) => return Ok(CopyRef::retain(copy)),
                Some(None) => {}
            }
        }

        let allocator = self
            .devices
            .get(device)
            .ok_or(DirectoryError::UnknownDevice(device))?
            .allocator()
            .clone();

        let mut copies = self.copies.write();
        if let Some(copy) = &copies[slot] {
            return Ok(CopyRef::retain(copy));
        }
        let copy = Arc::new(DataCopy::new(
            device,
            self.size,
            self.layout,
            allocator,
            Arc::downgrade(self),
        ));
        let guard = CopyRef::retain(&copy);
        copies[slot] = Some(copy);
        debug!(key = %self.key, %device, "copy created");
        Ok(guard)
    }

    /// Read access on `device`.
    ///
    /// Returns the copy when it is valid and current; a reader slot is taken
    /// unless the copy is the owner's. Otherwise a transfer from the owner
    /// (or any current copy) is started, or reported as already in flight.
    pub fn acquire_for_read(
        self: &Arc<Self>,
        device: DeviceIndex,
    ) -> Result<ReadAccess, DirectoryError> {
        let target = self.get_or_create_copy(device)?;

        if self.is_current(&target) {
            if target.coherency() == CoherencyState::Owned {
                return Ok(ReadAccess::Ready(target));
            }
            if target.try_add_reader() {
                let reader = target.into_reader();
                if self.is_current(&reader) {
                    trace!(key = %self.key, %device, readers = reader.reader_count(), "read hit");
                    return Ok(ReadAccess::Ready(reader));
                }
                // Lost a race with a writer elsewhere: give the reader slot
                // back before refilling.
                let target = reader.clone();
                drop(reader);
                return self.fetch_into(target, device).map(ReadAccess::Pending);
            }
        }

        self.fetch_into(target, device).map(ReadAccess::Pending)
    }

    fn fetch_into(
        self: &Arc<Self>,
        target: CopyRef,
        device: DeviceIndex,
    ) -> Result<TransferRequest, DirectoryError> {
        let source = self
            .find_source(device)
            .ok_or(DirectoryError::NoValidSource { key: self.key })?;
        self.begin_transfer(&target, &source, AccessMode::Read)
    }

    /// The owner's copy if it is current, else any other current copy.
    fn find_source(
        &self,
        exclude: DeviceIndex,
    ) -> Option<CopyRef> {
        let copies = self.copies.read();
        let usable = |copy: &&Arc<DataCopy>| copy.device() != exclude && self.is_current(copy);

        let owner = self
            .owner_device()
            .and_then(|owner| copies.get(owner.value()))
            .and_then(Option::as_ref)
            .filter(usable);

        owner
            .or_else(|| copies.iter().flatten().find(usable))
            .map(CopyRef::retain)
    }

    /// Exclusive write access on `device`.
    ///
    /// The target is claimed first, then the previous owner, if any, is
    /// invalidated before this copy becomes OWNED, and the version moves one
    /// past the prior maximum. A refused write leaves every copy as it was.
    /// Concurrent writers on the same object are a caller bug.
    pub fn acquire_for_write(
        self: &Arc<Self>,
        device: DeviceIndex,
    ) -> Result<CopyRef, DirectoryError> {
        let target = self.get_or_create_copy(device)?;
        target.ensure_buffer()?;
        let claim = target.try_reserve_write()?;

        if let Some(previous) = self.owner_device().filter(|&owner| owner != device) {
            if let Err(err) = self.invalidate_slot(previous) {
                target.cancel_write(claim);
                return Err(err);
            }
            debug!(key = %self.key, device = %previous, "previous owner invalidated");
        }

        let version = self.version() + 1;
        target.set_version(version);
        self.version.store(version, Ordering::Release);
        target.publish_owned(claim);
        self.owner.store(device.0, Ordering::Release);
        debug_assert_eq!(self.owned_copies(), 1, "{} has several owners", self.key);
        debug!(key = %self.key, %device, version, "copy owned");

        self.release_stale();
        Ok(target)
    }

    /// Force `copy` to INVALID, dropping ownership if it held it.
    pub fn invalidate(
        &self,
        copy: &DataCopy,
    ) -> Result<(), DirectoryError> {
        let ours = copy
            .original()
            .is_some_and(|object| std::ptr::eq(Arc::as_ptr(&object), self));
        if !ours {
            return Err(DirectoryError::ForeignCopy {
                key: self.key,
                device: copy.device(),
            });
        }
        copy.try_invalidate()?;
        self.clear_owner(copy.device());
        debug!(key = %self.key, device = %copy.device(), "copy invalidated");
        Ok(())
    }

    /// INVALID for the copy in `device`'s slot, if there is one. Takes no
    /// reference on the copy.
    pub(crate) fn invalidate_slot(
        &self,
        device: DeviceIndex,
    ) -> Result<(), DirectoryError> {
        let copy = self.copies.read().get(device.value()).cloned().flatten();
        match copy {
            Some(copy) => copy.try_invalidate().map(drop),
            None => Ok(()),
        }
    }

    /// Detach every copy that is neither current nor referenced, handing its
    /// buffer back to the device.
    pub(crate) fn release_stale(&self) {
        let detached: CopyTable = {
            let mut copies = self.copies.write();
            copies
                .iter_mut()
                .filter(|slot| {
                    matches!(slot, Some(copy) if copy.ref_count() == 0 && !self.is_current(copy))
                })
                .map(Option::take)
                .collect()
        };
        for copy in detached.iter().flatten() {
            self.clear_owner(copy.device());
            debug!(key = %self.key, device = %copy.device(), "stale copy released");
        }
    }

    /// Hook run when the last [`CopyRef`] to `copy` is dropped.
    pub(crate) fn on_last_release(
        &self,
        copy: &Arc<DataCopy>,
    ) {
        if self.is_current(copy) {
            return;
        }
        let removed = {
            let mut copies = self.copies.write();
            let slot = &mut copies[copy.device().value()];
            match slot {
                Some(entry) if Arc::ptr_eq(entry, copy) && entry.ref_count() == 0 => slot.take(),
                _ => None,
            }
        };
        if removed.is_some() {
            self.clear_owner(copy.device());
            debug!(key = %self.key, device = %copy.device(), "stale copy released");
        }
    }

    /// Record `device` as the owner.
    pub(crate) fn set_owner(
        &self,
        device: DeviceIndex,
    ) {
        self.owner.store(device.0, Ordering::Release);
    }

    /// Clear ownership if `device` holds it.
    pub(crate) fn clear_owner(
        &self,
        device: DeviceIndex,
    ) {
        let _ = self.owner.compare_exchange(
            device.0,
            DeviceIndex::NONE_RAW,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Copies currently in OWNED state.
    pub(crate) fn owned_copies(&self) -> usize {
        self.copies
            .read()
            .iter()
            .flatten()
            .filter(|copy| copy.coherency() == CoherencyState::Owned)
            .count()
    }
}

impl fmt::Debug for DataObject {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("DataObject")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("version", &self.version())
            .field("owner", &self.owner_device())
            .field("copies", &self.copy_count())
            .finish()
    }
}
