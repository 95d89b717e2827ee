//! Lock-based LIFO with the same external semantics as [`AtomicLifo`].
//!
//! A single mutex guards the head. Valid when contention is low, and handy
//! as a reference implementation when chasing a suspected lock-free bug.
//!
//! [`AtomicLifo`]: super::AtomicLifo

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::arena::{NodeArena, NodeChain, NodeHandle};
use super::node::{NodeIndex, TaggedWord};
use super::{attach_run, detach_node, prepare_chain, prepare_single, Lifo};
use crate::runtime::memory::AllocError;

#[derive(Debug)]
pub struct LockedLifo<T> {
    id: u32,
    head: Mutex<NodeIndex>,
    ghost: NodeIndex,
    arena: Arc<NodeArena<T>>,
}

impl<T> LockedLifo<T> {
    pub fn new(arena: Arc<NodeArena<T>>) -> Result<Self, AllocError> {
        let ghost = arena.alloc_slot()?;
        let id = arena.next_container_id();
        let sentinel = arena.link(ghost);
        sentinel.set_next(TaggedWord::new(ghost, 0));
        sentinel.set_prev(ghost);
        sentinel.attach(id);
        debug!(stack = id, %ghost, "locked lifo constructed");

        Ok(Self {
            id,
            head: Mutex::new(ghost),
            ghost,
            arena,
        })
    }

    #[inline]
    pub fn arena(&self) -> &Arc<NodeArena<T>> {
        &self.arena
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self.head.lock() == self.ghost
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
        let index = {
            let mut head = self.head.lock();
            let item = *head;
            if item == self.ghost {
                return None;
            }
            *head = self.arena.link(item).next_word().index();
            item
        };
        self.arena.link(index).clear_links();
        detach_node(&self.arena, self.id, index);
        Some(self.arena.handle(index))
    }

    fn splice(
        &self,
        first: NodeIndex,
        last: NodeIndex,
    ) {
        attach_run(&self.arena, self.id, first, last);
        let mut head = self.head.lock();
        self.arena.link(last).set_next(TaggedWord::new(*head, 0));
        *head = first;
    }
}

impl<T: Send> Lifo<T> for LockedLifo<T> {
    fn arena(&self) -> &Arc<NodeArena<T>> {
        LockedLifo::arena(self)
    }

    fn is_empty(&self) -> bool {
        LockedLifo::is_empty(self)
    }

    fn push(
        &self,
        handle: NodeHandle,
    ) {
        LockedLifo::push(self, handle)
    }

    fn push_chain(
        &self,
        chain: NodeChain<'_, T>,
    ) {
        LockedLifo::push_chain(self, chain)
    }

    fn pop(&self) -> Option<NodeHandle> {
        LockedLifo::pop(self)
    }
}

impl<T> Drop for LockedLifo<T> {
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
