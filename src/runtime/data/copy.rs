//! One physical replica of a datum on one device.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::object::DataObject;
use super::{CoherencyState, DirectoryError, TransferStatus};
use crate::runtime::device::DeviceIndex;
use crate::runtime::memory::{AllocError, BufferAllocator, DeviceBuffer, MemoryLayout};

/// Coherency state, transfer status and reader count in one word, so that
/// "add a reader only while SHARED" and "invalidate only without readers"
/// are each a single compare-and-swap.
///
/// Layout: bits 0..8 coherency, 8..16 transfer status, 32..64 readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateWord(u64);

impl StateWord {
    const READER: u64 = 1 << 32;

    fn new(
        coherency: CoherencyState,
        transfer: TransferStatus,
        readers: u32,
    ) -> Self {
        StateWord(coherency as u64 | (transfer as u64) << 8 | (readers as u64) << 32)
    }

    fn coherency(self) -> CoherencyState {
        CoherencyState::from_u8(self.0 as u8)
    }

    fn transfer(self) -> TransferStatus {
        TransferStatus::from_u8((self.0 >> 8) as u8)
    }

    fn readers(self) -> u32 {
        (self.0 >> 32) as u32
    }

    fn with_coherency(
        self,
        coherency: CoherencyState,
    ) -> Self {
        Self::new(coherency, self.transfer(), self.readers())
    }
}

/// A replica of a [`DataObject`] on one device.
///
/// Created on demand with no buffer; the buffer is allocated through the
/// device's allocator on first write and handed back when the copy is
/// dropped.
pub struct DataCopy {
    device: DeviceIndex,
    state: AtomicU64,
    version: AtomicU32,
    refs: AtomicUsize,
    size: usize,
    layout: MemoryLayout,
    buffer: RwLock<Option<DeviceBuffer>>,
    allocator: Arc<dyn BufferAllocator>,
    original: Weak<DataObject>,
}

impl DataCopy {
    pub(crate) fn new(
        device: DeviceIndex,
        size: usize,
        layout: MemoryLayout,
        allocator: Arc<dyn BufferAllocator>,
        original: Weak<DataObject>,
    ) -> Self {
        Self {
            device,
            state: AtomicU64::new(
                StateWord::new(CoherencyState::Invalid, TransferStatus::NotTransferred, 0).0,
            ),
            version: AtomicU32::new(0),
            refs: AtomicUsize::new(0),
            size,
            layout,
            buffer: RwLock::new(None),
            allocator,
            original,
        }
    }

    #[inline]
    fn load(&self) -> StateWord {
        StateWord(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    #[inline]
    pub fn coherency(&self) -> CoherencyState {
        self.load().coherency()
    }

    #[inline]
    pub fn transfer_status(&self) -> TransferStatus {
        self.load().transfer()
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Concurrent readers; meaningful only while SHARED.
    #[inline]
    pub fn reader_count(&self) -> u32 {
        self.load().readers()
    }

    /// Outstanding [`CopyRef`] guards.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// SHARED or OWNED and not mid-transfer. Says nothing about staleness;
    /// see [`DataObject::is_current`].
    #[inline]
    pub fn is_valid(&self) -> bool {
        let word = self.load();
        word.coherency() != CoherencyState::Invalid
            && word.transfer() != TransferStatus::UnderTransfer
    }

    /// The object this copy belongs to, if it is still alive.
    pub fn original(&self) -> Option<Arc<DataObject>> {
        self.original.upgrade()
    }

    #[inline]
    pub fn has_buffer(&self) -> bool {
        self.buffer.read().is_some()
    }

    /// Contents of the copy, `None` until a buffer exists.
    pub fn bytes(&self) -> Option<MappedRwLockReadGuard<'_, [u8]>> {
        let size = self.size;
        RwLockReadGuard::try_map(self.buffer.read(), |buffer| {
            buffer.as_ref().map(|b| &b.as_slice()[..size])
        })
        .ok()
    }

    /// Mutable contents, allocating the buffer on first use.
    pub fn bytes_mut(&self) -> Result<MappedRwLockWriteGuard<'_, [u8]>, AllocError> {
        let size = self.size;
        let mut guard = self.buffer.write();
        if guard.is_none() {
            *guard = Some(self.allocator.alloc(self.layout)?);
        }
        Ok(RwLockWriteGuard::map(guard, |buffer| match buffer {
            Some(b) => &mut b.as_mut_slice()[..size],
            None => unreachable!("buffer allocated above"),
        }))
    }

    pub(crate) fn ensure_buffer(&self) -> Result<(), AllocError> {
        if self.has_buffer() {
            return Ok(());
        }
        self.bytes_mut().map(drop)
    }

    #[inline]
    pub(crate) fn set_version(
        &self,
        version: u32,
    ) {
        self.version.store(version, Ordering::Release);
    }

    /// Compare-and-swap loop over the state word. `step` returns the next
    /// word, or an early result that ends the loop without writing.
    fn update<R>(
        &self,
        mut step: impl FnMut(StateWord) -> Result<StateWord, R>,
    ) -> Result<StateWord, R> {
        let mut current = self.load();
        loop {
            let next = step(current)?;
            match self.state.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = StateWord(actual),
            }
        }
    }

    /// Register a reader; succeeds only while SHARED and not mid-transfer.
    pub(crate) fn try_add_reader(&self) -> bool {
        self.update(|word| {
            if word.coherency() == CoherencyState::Shared
                && word.transfer() != TransferStatus::UnderTransfer
            {
                Ok(StateWord(word.0 + StateWord::READER))
            } else {
                Err(())
            }
        })
        .is_ok()
    }

    pub(crate) fn remove_reader(&self) {
        let previous = StateWord(self.state.fetch_sub(StateWord::READER, Ordering::AcqRel));
        debug_assert!(previous.readers() > 0, "reader count underflow on {}", self.device);
    }

    /// Enter UNDER_TRANSFER. `Ok(false)` when a transfer is already in flight
    /// or the copy is OWNED; the owner is never refilled from elsewhere.
    pub(crate) fn try_begin_transfer(&self) -> Result<bool, DirectoryError> {
        let outcome = self.update(|word| {
            if word.transfer() == TransferStatus::UnderTransfer
                || word.coherency() == CoherencyState::Owned
            {
                return Err(None);
            }
            if word.readers() > 0 {
                return Err(Some(DirectoryError::ReadersActive {
                    device: self.device,
                    readers: word.readers(),
                }));
            }
            Ok(StateWord::new(
                CoherencyState::Invalid,
                TransferStatus::UnderTransfer,
                0,
            ))
        });
        match outcome {
            Ok(_) => Ok(true),
            Err(None) => Ok(false),
            Err(Some(err)) => Err(err),
        }
    }

    /// Leave UNDER_TRANSFER with `coherency`. Only the transfer owner calls this.
    pub(crate) fn finish_transfer(
        &self,
        coherency: CoherencyState,
    ) {
        debug_assert_eq!(self.transfer_status(), TransferStatus::UnderTransfer);
        self.state.store(
            StateWord::new(coherency, TransferStatus::TransferComplete, 0).0,
            Ordering::Release,
        );
    }

    /// Undo a transfer that will never complete.
    pub(crate) fn abort_transfer(&self) {
        self.state.store(
            StateWord::new(CoherencyState::Invalid, TransferStatus::NotTransferred, 0).0,
            Ordering::Release,
        );
    }

    /// INVALID unless readers are active. Returns the previous state.
    pub(crate) fn try_invalidate(&self) -> Result<CoherencyState, DirectoryError> {
        self.update(|word| {
            if word.readers() > 0 {
                return Err(DirectoryError::ReadersActive {
                    device: self.device,
                    readers: word.readers(),
                });
            }
            Ok(word.with_coherency(CoherencyState::Invalid))
        })
        .map(StateWord::coherency)
    }

    /// Claim the copy for a write. It reads as INVALID and UNDER_TRANSFER
    /// until the claim is published or cancelled, so no reader or transfer
    /// can slip in. Refused while readers are active or a transfer is in
    /// flight.
    pub(crate) fn try_reserve_write(&self) -> Result<WriteClaim, DirectoryError> {
        self.update(|word| {
            if word.transfer() == TransferStatus::UnderTransfer {
                return Err(DirectoryError::TransferInFlight {
                    device: self.device,
                });
            }
            if word.readers() > 0 {
                return Err(DirectoryError::ReadersActive {
                    device: self.device,
                    readers: word.readers(),
                });
            }
            Ok(StateWord::new(
                CoherencyState::Invalid,
                TransferStatus::UnderTransfer,
                0,
            ))
        })
        .map(|previous| WriteClaim { previous })
    }

    /// Finish a write claim as OWNED.
    pub(crate) fn publish_owned(
        &self,
        claim: WriteClaim,
    ) {
        self.state.store(
            StateWord::new(CoherencyState::Owned, claim.previous.transfer(), 0).0,
            Ordering::Release,
        );
    }

    /// Drop a write claim, putting back the state it replaced.
    pub(crate) fn cancel_write(
        &self,
        claim: WriteClaim,
    ) {
        self.state.store(claim.previous.0, Ordering::Release);
    }
}

/// Exclusive hold on a copy between [`DataCopy::try_reserve_write`] and
/// publishing or cancelling it.
#[must_use]
pub(crate) struct WriteClaim {
    previous: StateWord,
}

impl Drop for DataCopy {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.get_mut().take() {
            self.allocator.release(buffer);
        }
    }
}

impl fmt::Debug for DataCopy {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let word = self.load();
        f.debug_struct("DataCopy")
            .field("device", &self.device)
            .field("coherency", &word.coherency())
            .field("transfer", &word.transfer())
            .field("version", &self.version())
            .field("readers", &word.readers())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Counted reference to a [`DataCopy`].
///
/// Tasks and pending transfers hold copies through this guard. A guard
/// handed out by a read acquisition also holds one reader slot. When the
/// last guard goes away and the copy is no longer current, the copy is
/// detached from its object and its buffer returned to the device.
pub struct CopyRef {
    copy: Arc<DataCopy>,
    reading: bool,
}

impl CopyRef {
    pub(crate) fn retain(copy: &Arc<DataCopy>) -> Self {
        copy.refs.fetch_add(1, Ordering::AcqRel);
        CopyRef {
            copy: Arc::clone(copy),
            reading: false,
        }
    }

    /// Mark this guard as owning a reader slot already taken on the copy.
    pub(crate) fn into_reader(mut self) -> Self {
        self.reading = true;
        self
    }

    /// Whether this guard holds a reader slot.
    #[inline]
    pub fn is_reader(&self) -> bool {
        self.reading
    }

    /// Give the reference back.
    pub fn release(self) {
        drop(self);
    }

    pub(crate) fn arc(&self) -> &Arc<DataCopy> {
        &self.copy
    }
}

impl Deref for CopyRef {
    type Target = DataCopy;

    fn deref(&self) -> &DataCopy {
        &self.copy
    }
}

/// Clones are plain references; the reader slot stays with the original.
impl Clone for CopyRef {
    fn clone(&self) -> Self {
        CopyRef::retain(&self.copy)
    }
}

impl Drop for CopyRef {
    fn drop(&mut self) {
        if self.reading {
            self.copy.remove_reader();
        }
        if self.copy.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(object) = self.copy.original.upgrade() {
                object.on_last_release(&self.copy);
            }
        }
    }
}

impl fmt::Debug for CopyRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CopyRef")
            .field("copy", &*self.copy)
            .field("reading", &self.reading)
            .finish()
    }
}
