//! Transfer hooks between copies
//!
//! [`DataObject::begin_transfer`] moves the target copy to UNDER_TRANSFER and
//! returns a [`TransferHandle`] that keeps both copies alive. Whoever moves
//! the bytes calls [`TransferHandle::complete`] (the
//! `on_transfer_complete` hook) when done. A handle dropped without
//! completing puts the target back to INVALID.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::copy::CopyRef;
use super::object::DataObject;
use super::{AccessMode, CoherencyState, DirectoryError, TransferStatus};

/// Result of asking for a transfer.
#[derive(Debug)]
#[must_use]
pub enum TransferRequest {
    /// A new transfer; the caller must drive it to completion.
    Started(TransferHandle),
    /// The target is already being filled. Wait for that transfer instead.
    AlreadyInFlight,
}

impl TransferRequest {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TransferRequest::AlreadyInFlight)
    }

    pub fn into_handle(self) -> Option<TransferHandle> {
        match self {
            TransferRequest::Started(handle) => Some(handle),
            TransferRequest::AlreadyInFlight => None,
        }
    }
}

/// An outstanding transfer into `target` from `source`.
#[derive(Debug)]
pub struct TransferHandle {
    object: Arc<DataObject>,
    target: CopyRef,
    source: CopyRef,
    source_version: u32,
    mode: AccessMode,
    done: bool,
}

impl TransferHandle {
    pub fn object(&self) -> &Arc<DataObject> {
        &self.object
    }

    pub fn target(&self) -> &CopyRef {
        &self.target
    }

    pub fn source(&self) -> &CopyRef {
        &self.source
    }

    /// Version the target will carry once complete.
    pub fn source_version(&self) -> u32 {
        self.source_version
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Bytes that move with this transfer.
    pub fn len(&self) -> usize {
        self.object.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the transfer complete.
    pub fn complete(self) {
        let object = Arc::clone(&self.object);
        object.on_transfer_complete(self);
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        if !self.done {
            warn!(
                key = %self.object.key(),
                device = %self.target.device(),
                "transfer abandoned"
            );
            self.target.abort_transfer();
        }
    }
}

impl DataObject {
    /// Start filling `target` from `source`.
    ///
    /// A target already UNDER_TRANSFER yields
    /// [`TransferRequest::AlreadyInFlight`]; a SHARED target with active
    /// readers is refused, and so is a source that is not current.
    pub fn begin_transfer(
        self: &Arc<Self>,
        target: &CopyRef,
        source: &CopyRef,
        mode: AccessMode,
    ) -> Result<TransferRequest, DirectoryError> {
        if target.transfer_status() == TransferStatus::UnderTransfer {
            return Ok(TransferRequest::AlreadyInFlight);
        }
        if !self.is_current(source) || source.device() == target.device() {
            return Err(DirectoryError::NoValidSource { key: self.key() });
        }

        // Pin a shared source so it cannot be invalidated mid-copy.
        let source = if source.try_add_reader() {
            source.clone().into_reader()
        } else {
            source.clone()
        };

        if !target.try_begin_transfer()? {
            return Ok(TransferRequest::AlreadyInFlight);
        }
        self.clear_owner(target.device());

        let source_version = source.version();
        debug!(
            key = %self.key(),
            from = %source.device(),
            to = %target.device(),
            version = source_version,
            ?mode,
            "transfer started"
        );
        Ok(TransferRequest::Started(TransferHandle {
            object: Arc::clone(self),
            target: target.clone(),
            source,
            source_version,
            mode,
            done: false,
        }))
    }

    /// Completion hook: version and state land on the target.
    pub fn on_transfer_complete(
        &self,
        mut handle: TransferHandle,
    ) {
        let target = &handle.target;
        let device = target.device();
        target.set_version(handle.source_version);

        let coherency = match handle.mode {
            AccessMode::Read => CoherencyState::Shared,
            AccessMode::Write => {
                if let Some(previous) = self.owner_device().filter(|&owner| owner != device) {
                    // An OWNED copy never hands out reader slots.
                    let invalidated = self.invalidate_slot(previous);
                    debug_assert!(invalidated.is_ok(), "owner on {previous} held readers");
                }
                CoherencyState::Owned
            }
        };
        target.finish_transfer(coherency);
        if coherency == CoherencyState::Owned {
            self.set_owner(device);
        }
        debug!(
            key = %self.key(),
            %device,
            version = handle.source_version,
            ?coherency,
            "transfer complete"
        );
        handle.done = true;
        if coherency == CoherencyState::Owned {
            self.release_stale();
        }
    }
}

/// Counters of a [`LocalTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub transfers: u64,
    pub bytes_moved: u64,
}

/// Moves bytes between device buffers inside one process.
#[derive(Debug, Default)]
pub struct LocalTransport {
    transfers: AtomicU64,
    bytes_moved: AtomicU64,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy source into target, then complete the transfer.
    ///
    /// A source that was never written reads as zeroes.
    pub fn execute(
        &self,
        handle: TransferHandle,
    ) -> Result<(), DirectoryError> {
        {
            let mut dst = handle.target().bytes_mut()?;
            match handle.source().bytes() {
                Some(src) => dst.copy_from_slice(&src),
                None => dst.fill(0),
            }
        }
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.bytes_moved
            .fetch_add(handle.len() as u64, Ordering::Relaxed);
        handle.complete();
        Ok(())
    }

    /// Run `request` if it started a transfer. `true` when bytes moved.
    pub fn drive(
        &self,
        request: TransferRequest,
    ) -> Result<bool, DirectoryError> {
        match request.into_handle() {
            Some(handle) => self.execute(handle).map(|()| true),
            None => Ok(false),
        }
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            transfers: self.transfers.load(Ordering::Relaxed),
            bytes_moved: self.bytes_moved.load(Ordering::Relaxed),
        }
    }
}
