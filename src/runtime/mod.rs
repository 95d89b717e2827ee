//! Runtime system
//!
//! Ready stacks, the data coherency directory, devices and their memory,
//! and the worker pool that ties them together.

pub mod context;
pub mod data;
pub mod device;
pub mod lifo;
pub mod memory;
pub mod scheduler;

pub use context::RuntimeContext;
