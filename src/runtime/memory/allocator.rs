//! Buffer allocation strategies for device copies
//!
//! Each device owns one [`BufferAllocator`]. Data copies never allocate on
//! their own: they ask the allocator of the device they live on, and hand the
//! buffer back to it when the last reference goes away.
//!
//! # Design Principles
//! - Simple trait: alloc / release / accounting
//! - Buffers own their memory exclusively (like `Box<[u8]>`)
//! - Send + Sync so one allocator serves every worker thread

use core::alloc::Layout;
use core::ptr::NonNull;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment of every device buffer, wide enough for vector loads.
pub const BUFFER_ALIGNMENT: usize = 64;

/// Memory allocation error
///
/// Always fatal for the enclosing task graph: no local recovery is defined.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Not enough memory to satisfy the allocation
    #[error("out of memory")]
    OutOfMemory,
    /// Alignment requirements cannot be satisfied
    #[error("alignment error")]
    AlignmentError,
    /// A bounded device pool cannot fit the request
    #[error("device memory exhausted: requested {requested} bytes, {available} available")]
    CapacityExceeded {
        requested: usize,
        available: usize,
    },
    /// Every slot of a node arena is taken
    #[error("node arena exhausted ({capacity} slots)")]
    ArenaExhausted { capacity: usize },
}

/// Memory layout helper
///
/// Wraps `std::alloc::Layout` with convenient constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    size: usize,
    align: usize,
}

impl MemoryLayout {
    /// Create a layout from size and alignment
    ///
    /// # Returns
    /// `Some(MemoryLayout)` if alignment is valid (power of 2), `None` otherwise.
    pub fn from_size_align(
        size: usize,
        align: usize,
    ) -> Option<Self> {
        if align == 0 || !align.is_power_of_two() {
            return None;
        }

        // Adjust size to meet alignment requirements
        let aligned_size = size.checked_add(align - 1)? & !(align - 1);
        Layout::from_size_align(aligned_size, align).ok()?;

        Some(Self {
            size: aligned_size,
            align,
        })
    }

    /// Layout of a tile buffer of `size` bytes at [`BUFFER_ALIGNMENT`].
    pub fn for_buffer(size: usize) -> Result<Self, AllocError> {
        Self::from_size_align(size, BUFFER_ALIGNMENT).ok_or(AllocError::AlignmentError)
    }

    /// Get the size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the alignment
    pub fn align(&self) -> usize {
        self.align
    }

    /// Convert to std::alloc::Layout
    pub fn to_std_layout(&self) -> Layout {
        // Safety: size and align are validated in from_size_align
        unsafe { Layout::from_size_align_unchecked(self.size, self.align) }
    }
}

/// Device-resident memory exclusively owned by one data copy.
pub struct DeviceBuffer {
    ptr: NonNull<u8>,
    layout: MemoryLayout,
}

// Safety: the buffer owns its allocation and hands out access only through
// `&self` / `&mut self`, exactly like `Box<[u8]>`.
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    /// Allocate a zeroed buffer.
    fn zeroed(layout: MemoryLayout) -> Result<Self, AllocError> {
        if layout.size() == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                layout,
            });
        }
        // Safety: size is non-zero and the layout was validated
        let raw = unsafe { std::alloc::alloc_zeroed(layout.to_std_layout()) };
        let ptr = NonNull::new(raw).ok_or(AllocError::OutOfMemory)?;
        Ok(Self { ptr, layout })
    }

    pub fn layout(&self) -> MemoryLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr is valid for `len` initialised bytes (or dangling with len 0)
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, and `&mut self` guarantees exclusivity
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            // Safety: allocated in `zeroed` with this exact layout
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout.to_std_layout()) };
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Per-device allocation capability
///
/// # Implementations
/// - `HostAllocator`: system heap, unbounded
/// - `BoundedAllocator`: fixed memory budget, models accelerator memory
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    /// Allocate a zeroed buffer with the given layout
    fn alloc(
        &self,
        layout: MemoryLayout,
    ) -> Result<DeviceBuffer, AllocError>;

    /// Give a buffer back to the device
    fn release(
        &self,
        buffer: DeviceBuffer,
    );

    /// Bytes currently handed out
    fn allocated(&self) -> usize;
}

/// Host memory, backed by the global allocator.
#[derive(Debug, Default)]
pub struct HostAllocator {
    allocated: AtomicUsize,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferAllocator for HostAllocator {
    fn alloc(
        &self,
        layout: MemoryLayout,
    ) -> Result<DeviceBuffer, AllocError> {
        let buffer = DeviceBuffer::zeroed(layout)?;
        self.allocated.fetch_add(layout.size(), Ordering::AcqRel);
        Ok(buffer)
    }

    fn release(
        &self,
        buffer: DeviceBuffer,
    ) {
        self.allocated.fetch_sub(buffer.len(), Ordering::AcqRel);
    }

    fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}

/// Allocator with a hard byte budget, used for accelerator memory.
#[derive(Debug)]
pub struct BoundedAllocator {
    capacity: usize,
    allocated: AtomicUsize,
}

impl BoundedAllocator {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            allocated: AtomicUsize::new(0),
        }
    }

    /// Total budget in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.allocated())
    }

    fn reserve(
        &self,
        size: usize,
    ) -> Result<(), AllocError> {
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            let available = self.capacity.saturating_sub(current);
            if size > available {
                return Err(AllocError::CapacityExceeded {
                    requested: size,
                    available,
                });
            }
            match self.allocated.compare_exchange_weak(
                current,
                current + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

impl BufferAllocator for BoundedAllocator {
    fn alloc(
        &self,
        layout: MemoryLayout,
    ) -> Result<DeviceBuffer, AllocError> {
        self.reserve(layout.size())?;
        DeviceBuffer::zeroed(layout).inspect_err(|_| {
            self.allocated.fetch_sub(layout.size(), Ordering::AcqRel);
        })
    }

    fn release(
        &self,
        buffer: DeviceBuffer,
    ) {
        self.allocated.fetch_sub(buffer.len(), Ordering::AcqRel);
    }

    fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}
