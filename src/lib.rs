//! tessera runtime
//!
//! Task-ready LIFO stacks and a data coherency directory for a
//! heterogeneous tiled runtime: worker threads pop tasks from concurrent
//! stacks, and the directory tracks which device holds a current copy of
//! each datum.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera::runtime::{scheduler::Scheduler, RuntimeContext};
//! use tessera::util::config::RuntimeConfig;
//!
//! fn main() -> tessera::Result<()> {
//!     let config = RuntimeConfig::default();
//!     let context = Arc::new(RuntimeContext::from_config(&config)?);
//!     let scheduler = Scheduler::with_config(context, &config)?;
//!     let task = scheduler.task("hello", |ctx| {
//!         tracing::info!(worker = ctx.worker_id(), "hello from a worker");
//!     });
//!     scheduler.spawn(task)?;
//!     scheduler.wait_idle();
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

// Public modules
pub mod runtime;
pub mod workload;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use runtime::lifo::{AnyLifo, AtomicLifo, Lifo, LifoKind, LockedLifo, NodeArena};
pub use runtime::RuntimeContext;
pub use workload::{run_stress, run_tiles};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name
pub const NAME: &str = "tessera";
