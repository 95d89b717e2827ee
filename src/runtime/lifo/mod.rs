//! Concurrent LIFO stacks used as task-ready queues.
//!
//! Nodes live in a [`NodeArena`]; stacks only link and unlink them. Two
//! variants share one contract through the [`Lifo`] trait:
//!
//! - [`AtomicLifo`] - lock-free, head word packs `(index, tag)` for ABA safety
//! - [`LockedLifo`] - single mutex over the head, same observable behaviour
//!
//! Both accept a single node or a pre-linked [`NodeChain`]; a chain is
//! spliced in one step and pops back out in the order it was built.

mod arena;
mod atomic;
mod locked;
mod node;

pub use arena::{NodeArena, NodeChain, NodeHandle};
pub use atomic::AtomicLifo;
pub use locked::LockedLifo;
pub use node::{ListNode, NodeIndex};

use std::fmt;
use std::ptr;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::runtime::memory::AllocError;
use node::DETACHED;

/// Operations shared by every ready-stack implementation.
///
/// All methods may be called from any number of threads at once.
pub trait Lifo<T>: Send + Sync {
    /// Arena the stack links nodes from.
    fn arena(&self) -> &Arc<NodeArena<T>>;

    /// Advisory emptiness check; re-check through [`Lifo::pop`].
    fn is_empty(&self) -> bool;

    /// Push one node.
    fn push(
        &self,
        handle: NodeHandle,
    );

    /// Push a pre-linked chain as one unit.
    fn push_chain(
        &self,
        chain: NodeChain<'_, T>,
    );

    /// Detach the top node. `None` is the normal "nothing ready" answer.
    fn pop(&self) -> Option<NodeHandle>;
}

/// Which stack implementation backs a ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifoKind {
    #[default]
    Atomic,
    Locked,
}

impl fmt::Display for LifoKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            LifoKind::Atomic => write!(f, "atomic"),
            LifoKind::Locked => write!(f, "locked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown lifo kind `{0}`, expected `atomic` or `locked`")]
pub struct ParseLifoKindError(String);

impl FromStr for LifoKind {
    type Err = ParseLifoKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "atomic" | "lock-free" | "lockfree" => Ok(LifoKind::Atomic),
            "locked" | "lock" | "mutex" => Ok(LifoKind::Locked),
            other => Err(ParseLifoKindError(other.to_string())),
        }
    }
}

/// A ready stack whose implementation is picked at runtime.
#[derive(Debug)]
pub enum AnyLifo<T> {
    Atomic(AtomicLifo<T>),
    Locked(LockedLifo<T>),
}

impl<T> AnyLifo<T> {
    pub fn new(
        kind: LifoKind,
        arena: Arc<NodeArena<T>>,
    ) -> Result<Self, AllocError> {
        Ok(match kind {
            LifoKind::Atomic => AnyLifo::Atomic(AtomicLifo::new(arena)?),
            LifoKind::Locked => AnyLifo::Locked(LockedLifo::new(arena)?),
        })
    }

    #[inline]
    pub fn kind(&self) -> LifoKind {
        match self {
            AnyLifo::Atomic(_) => LifoKind::Atomic,
            AnyLifo::Locked(_) => LifoKind::Locked,
        }
    }
}

impl<T: Send> Lifo<T> for AnyLifo<T> {
    fn arena(&self) -> &Arc<NodeArena<T>> {
        match self {
            AnyLifo::Atomic(stack) => stack.arena(),
            AnyLifo::Locked(stack) => stack.arena(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            AnyLifo::Atomic(stack) => stack.is_empty(),
            AnyLifo::Locked(stack) => stack.is_empty(),
        }
    }

    fn push(
        &self,
        handle: NodeHandle,
    ) {
        match self {
            AnyLifo::Atomic(stack) => stack.push(handle),
            AnyLifo::Locked(stack) => stack.push(handle),
        }
    }

    fn push_chain(
        &self,
        chain: NodeChain<'_, T>,
    ) {
        match self {
            AnyLifo::Atomic(stack) => stack.push_chain(chain),
            AnyLifo::Locked(stack) => stack.push_chain(chain),
        }
    }

    fn pop(&self) -> Option<NodeHandle> {
        match self {
            AnyLifo::Atomic(stack) => stack.pop(),
            AnyLifo::Locked(stack) => stack.pop(),
        }
    }
}

/// A single node is a chain whose head is its own tail.
fn prepare_single<T>(
    arena: &NodeArena<T>,
    handle: NodeHandle,
) -> NodeIndex {
    arena.check(&handle);
    let index = handle.index();
    arena.link(index).set_prev(index);
    index
}

fn prepare_chain<T>(
    arena: &NodeArena<T>,
    chain: NodeChain<'_, T>,
) -> Option<(NodeIndex, NodeIndex)> {
    assert!(
        ptr::eq(chain.arena(), arena),
        "chain was built on a different arena"
    );
    let (head, tail, len) = chain.into_ends()?;
    debug_assert_eq!(arena.link(head).prev(), tail);
    trace!(len, %head, %tail, "splicing chain");
    Some((head, tail))
}

/// Membership bookkeeping for the run `first..=last`, debug builds only.
fn attach_run<T>(
    arena: &NodeArena<T>,
    container: u32,
    first: NodeIndex,
    last: NodeIndex,
) {
    if !cfg!(debug_assertions) {
        return;
    }
    let mut cursor = first;
    loop {
        let node = arena.link(cursor);
        let previous = node.attach(container);
        debug_assert_eq!(
            previous, DETACHED,
            "{cursor} pushed while still attached to container {previous}"
        );
        if cursor == last {
            break;
        }
        cursor = node.next_word().index();
    }
}

fn detach_node<T>(
    arena: &NodeArena<T>,
    container: u32,
    index: NodeIndex,
) {
    if !cfg!(debug_assertions) {
        return;
    }
    let previous = arena.link(index).detach();
    debug_assert_eq!(
        previous, container,
        "{index} popped from container {container} but was attached to {previous}"
    );
}

#[cfg(test)]
mod tests;
