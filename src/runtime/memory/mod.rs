//! Memory for data copies
//!
//! Device buffers are allocated through a per-device [`BufferAllocator`]
//! chosen by device kind: host memory comes from the global allocator,
//! accelerator memory from a fixed budget. Allocation failure is reported as
//! [`AllocError`] and treated as fatal by callers.

mod allocator;

pub use allocator::{
    AllocError, BoundedAllocator, BufferAllocator, DeviceBuffer, HostAllocator, MemoryLayout,
    BUFFER_ALIGNMENT,
};
