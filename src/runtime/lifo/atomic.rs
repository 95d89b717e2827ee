//! Lock-free LIFO (Treiber stack with a tagged head).
//!
//! The head is one 64-bit word holding `(slot index, tag)`, and every `next`
//! link carries the tag of the node it names. A successful pop bumps the
//! popped node's tag, so a node that is popped, recycled and pushed again
//! (alone or inside a chain) comes back under a different word, and any
//! compare-and-swap still holding the old word fails and retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::{Backoff, CachePadded};
use tracing::{debug, warn};

use super::arena::{NodeArena, NodeChain, NodeHandle};
use super::node::{NodeIndex, TaggedWord};
use super::{attach_run, detach_node, prepare_chain, prepare_single, Lifo};
use crate::runtime::memory::AllocError;

/// Splice the pre-linked run `first..=last` on top of `head`.
pub(crate) fn push_tagged<T>(
    head: &AtomicU64,
    arena: &NodeArena<T>,
    first: NodeIndex,
    last: NodeIndex,
) {
    let word = TaggedWord::new(first, arena.link(first).tag());
    let tail = arena.link(last);
    let backoff = Backoff::new();
    let mut current = head.load(Ordering::Relaxed);
    loop {
        tail.set_next(TaggedWord::from_raw(current));
        match head.compare_exchange_weak(current, word.raw(), Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => {
                current = actual;
                backoff.spin();
            }
        }
    }
}

/// Detach the node on top of `head`, or `None` once `terminator` is reached.
pub(crate) fn pop_tagged<T>(
    head: &AtomicU64,
    arena: &NodeArena<T>,
    terminator: NodeIndex,
) -> Option<NodeIndex> {
    let backoff = Backoff::new();
    let mut current = TaggedWord::from_raw(head.load(Ordering::Acquire));
    loop {
        if current.index() == terminator {
            return None;
        }
        // The node may already have been popped and recycled by another
        // thread; its slot is still valid memory and the tag check below
        // rejects the stale word.
        let next = arena.link(current.index()).next_word();
        match head.compare_exchange_weak(
            current.raw(),
            next.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let node = arena.link(current.index());
                node.set_tag(current.tag().wrapping_add(1));
                node.clear_links();
                return Some(current.index());
            }
            Err(actual) => {
                current = TaggedWord::from_raw(actual);
                backoff.spin();
            }
        }
    }
}

/// Unbounded lock-free LIFO over arena nodes.
#[derive(Debug)]
pub struct AtomicLifo<T> {
    id: u32,
    head: CachePadded<AtomicU64>,
    ghost: NodeIndex,
    arena: Arc<NodeArena<T>>,
}

impl<T> AtomicLifo<T> {
    /// Build an empty stack; the ghost sentinel is taken from `arena`.
    pub fn new(arena: Arc<NodeArena<T>>) -> Result<Self, AllocError> {
        let ghost = arena.alloc_slot()?;
        let id = arena.next_container_id();
        let sentinel = arena.link(ghost);
        sentinel.set_next(TaggedWord::new(ghost, 0));
        sentinel.set_prev(ghost);
        sentinel.attach(id);
        debug!(stack = id, %ghost, "atomic lifo constructed");

        Ok(Self {
            id,
            head: CachePadded::new(AtomicU64::new(TaggedWord::new(ghost, 0).raw())),
            ghost,
            arena,
        })
    }

    #[inline]
    pub fn arena(&self) -> &Arc<NodeArena<T>> {
        &self.arena
    }

    /// True when the head is the ghost. Stale as soon as it returns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        TaggedWord::from_raw(self.head.load(Ordering::Acquire)).index() == self.ghost
    }

    pub fn push(
        &self,
        handle: NodeHandle,
    ) {
        let index = prepare_single(&self.arena, handle);
        self.splice(index, index);
    }

    pub fn push_chain(
        &self,
        chain: NodeChain<'_, T>,
    ) {
        if let Some((first, last)) = prepare_chain(&self.arena, chain) {
            self.splice(first, last);
        }
    }

    pub fn pop(&self) -> Option<NodeHandle> {
        let index = pop_tagged(&self.head, &self.arena, self.ghost)?;
        detach_node(&self.arena, self.id, index);
        Some(self.arena.handle(index))
    }

    fn splice(
        &self,
        first: NodeIndex,
        last: NodeIndex,
    ) {
        attach_run(&self.arena, self.id, first, last);
        push_tagged(&self.head, &self.arena, first, last);
    }
}

impl<T: Send> Lifo<T> for AtomicLifo<T> {
    fn arena(&self) -> &Arc<NodeArena<T>> {
        AtomicLifo::arena(self)
    }

    fn is_empty(&self) -> bool {
        AtomicLifo::is_empty(self)
    }

    fn push(
        &self,
        handle: NodeHandle,
    ) {
        AtomicLifo::push(self, handle)
    }

    fn push_chain(
        &self,
        chain: NodeChain<'_, T>,
    ) {
        AtomicLifo::push_chain(self, chain)
    }

    fn pop(&self) -> Option<NodeHandle> {
        AtomicLifo::pop(self)
    }
}

impl<T> Drop for AtomicLifo<T> {
    fn drop(&mut self) {
        let mut reclaimed = 0usize;
        while let Some(handle) = self.pop() {
            drop(self.arena.free(handle));
            reclaimed += 1;
        }
        if reclaimed > 0 {
            warn!(stack = self.id, reclaimed, "lifo dropped with queued nodes");
        }
        self.arena.release_slot(self.ghost);
    }
}
