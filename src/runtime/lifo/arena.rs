//! Slab of stable node slots.
//!
//! Slots never move once the arena is built, so a thread racing with a pop
//! always reads a valid `next` word even if the node was recycled in the
//! meantime; the tag carried in the head word makes its stale
//! compare-and-swap fail. The free list is itself a tagged stack over the
//! same slots.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use tracing::{debug, trace};

use super::atomic::{pop_tagged, push_tagged};
use super::node::{ListNode, NodeIndex, TaggedWord};
use crate::runtime::memory::AllocError;

static ARENA_IDS: AtomicU32 = AtomicU32::new(1);

struct Slot<T> {
    node: ListNode,
    value: UnsafeCell<Option<T>>,
}

/// Owned reference to an occupied arena slot.
///
/// Holding the handle is holding membership: pushing it onto a stack moves
/// it into the stack, popping hands it back. Dropping a handle without
/// [`NodeArena::free`] keeps the slot reserved until the arena is dropped.
#[must_use = "a dropped handle keeps its slot reserved until the arena is dropped"]
#[derive(Debug, PartialEq, Eq)]
pub struct NodeHandle {
    arena: u32,
    index: NodeIndex,
}

impl NodeHandle {
    /// Slot index of this handle.
    #[inline]
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

/// Fixed-capacity slab handing out [`NodeHandle`]s.
pub struct NodeArena<T> {
    id: u32,
    slots: Box<[Slot<T>]>,
    free: CachePadded<AtomicU64>,
    in_use: AtomicUsize,
    containers: AtomicU32,
}

// SAFETY: payloads are only reached through a unique `NodeHandle` (or by the
// arena itself while it holds `&mut self` / on drop), so at most one thread
// touches a given payload at a time. Every other shared field is atomic.
// This is the same contract as `Mutex<T>`: sharing requires only `T: Send`.
unsafe impl<T: Send> Send for NodeArena<T> {}
unsafe impl<T: Send> Sync for NodeArena<T> {}

impl<T> NodeArena<T> {
    /// Build an arena with `capacity` slots, all free.
    pub fn with_capacity(capacity: usize) -> Result<Self, AllocError> {
        let limit = NodeIndex::NIL.value() as usize;
        if capacity >= limit {
            return Err(AllocError::CapacityExceeded {
                requested: capacity,
                available: limit - 1,
            });
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| AllocError::OutOfMemory)?;
        for i in 0..capacity {
            let node = ListNode::new();
            if i + 1 < capacity {
                node.set_next(TaggedWord::new(NodeIndex((i + 1) as u32), 0));
            }
            slots.push(Slot {
                node,
                value: UnsafeCell::new(None),
            });
        }

        let free = if capacity > 0 {
            TaggedWord::new(NodeIndex(0), 0)
        } else {
            TaggedWord::NIL
        };

        let id = ARENA_IDS.fetch_add(1, Ordering::Relaxed);
        debug!(arena = id, capacity, "node arena created");

        Ok(Self {
            id,
            slots: slots.into_boxed_slice(),
            free: CachePadded::new(AtomicU64::new(free.raw())),
            in_use: AtomicUsize::new(0),
            containers: AtomicU32::new(1),
        })
    }

    /// Total number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently taken (by handles, stacked nodes and sentinels).
    #[inline]
    pub fn len(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots still free.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }

    /// Store `value` in a free slot.
    pub fn alloc(
        &self,
        value: T,
    ) -> Result<NodeHandle, AllocError> {
        let index = self.alloc_slot()?;
        // SAFETY: the slot was just taken off the free list, nothing else
        // refers to its payload.
        unsafe {
            *self.slot(index).value.get() = Some(value);
        }
        Ok(NodeHandle {
            arena: self.id,
            index,
        })
    }

    /// Shared access to the payload behind `handle`.
    pub fn get<'a>(
        &'a self,
        handle: &'a NodeHandle,
    ) -> &'a T {
        self.check(handle);
        // SAFETY: `handle` is the unique owner of this occupied slot and is
        // borrowed for the lifetime of the returned reference.
        match unsafe { &*self.slot(handle.index).value.get() } {
            Some(value) => value,
            None => unreachable!("handle {} points at an empty slot", handle.index),
        }
    }

    /// Exclusive access to the payload behind `handle`.
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut<'a>(
        &'a self,
        handle: &'a mut NodeHandle,
    ) -> &'a mut T {
        self.check(handle);
        // SAFETY: as in `get`, and the handle is borrowed mutably so no other
        // reference to this payload can exist.
        match unsafe { &mut *self.slot(handle.index).value.get() } {
            Some(value) => value,
            None => unreachable!("handle {} points at an empty slot", handle.index),
        }
    }

    /// Release the slot behind `handle`, returning its payload.
    pub fn free(
        &self,
        handle: NodeHandle,
    ) -> T {
        self.check(&handle);
        match self.take_value(handle.index) {
            Some(value) => value,
            None => unreachable!("handle {} points at an empty slot", handle.index),
        }
    }

    /// Link fields of the slot behind `handle`.
    #[inline]
    pub fn node(
        &self,
        handle: &NodeHandle,
    ) -> &ListNode {
        self.check(handle);
        &self.slot(handle.index).node
    }

    /// Start an empty chain of nodes from this arena.
    #[inline]
    pub fn chain(&self) -> NodeChain<'_, T> {
        NodeChain {
            arena: self,
            ends: None,
            len: 0,
        }
    }

    #[inline]
    fn slot(
        &self,
        index: NodeIndex,
    ) -> &Slot<T> {
        &self.slots[index.value() as usize]
    }

    #[inline]
    pub(crate) fn link(
        &self,
        index: NodeIndex,
    ) -> &ListNode {
        &self.slot(index).node
    }

    #[inline]
    pub(crate) fn check(
        &self,
        handle: &NodeHandle,
    ) {
        assert_eq!(
            handle.arena, self.id,
            "handle {} used with an arena that did not allocate it",
            handle.index
        );
    }

    /// Rebuild the handle for a slot a container just gave up.
    #[inline]
    pub(crate) fn handle(
        &self,
        index: NodeIndex,
    ) -> NodeHandle {
        NodeHandle {
            arena: self.id,
            index,
        }
    }

    /// Fresh id for a container built on this arena.
    #[inline]
    pub(crate) fn next_container_id(&self) -> u32 {
        self.containers.fetch_add(1, Ordering::Relaxed)
    }

    /// Take a free slot without storing a payload (stack sentinels).
    pub(crate) fn alloc_slot(&self) -> Result<NodeIndex, AllocError> {
        match pop_tagged(&self.free, self, NodeIndex::NIL) {
            Some(index) => {
                self.in_use.fetch_add(1, Ordering::AcqRel);
                trace!(arena = self.id, %index, "slot taken");
                Ok(index)
            }
            None => Err(AllocError::ArenaExhausted {
                capacity: self.capacity(),
            }),
        }
    }

    /// Return a slot whose payload has already been taken.
    pub(crate) fn release_slot(
        &self,
        index: NodeIndex,
    ) {
        let node = self.link(index);
        node.detach();
        node.clear_links();
        push_tagged(&self.free, self, index, index);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    /// Move the payload out of a slot and return the slot to the free list.
    ///
    /// Callers must own the slot (through a handle or a container).
    pub(crate) fn take_value(
        &self,
        index: NodeIndex,
    ) -> Option<T> {
        // SAFETY: the caller owns the slot, see above.
        let value = unsafe { (*self.slot(index).value.get()).take() };
        self.release_slot(index);
        value
    }
}

impl<T> fmt::Debug for NodeArena<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("NodeArena")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("in_use", &self.len())
            .finish()
    }
}

/// A pre-linked run of nodes pushed onto a stack as one unit.
///
/// The head's `prev` names the tail; popping the chain back yields its nodes
/// in append order. Dropping a chain that was never pushed frees its nodes.
pub struct NodeChain<'a, T> {
    arena: &'a NodeArena<T>,
    ends: Option<(NodeIndex, NodeIndex)>,
    len: usize,
}

impl<'a, T> NodeChain<'a, T> {
    /// Link `handle` after the current tail.
    pub fn append(
        &mut self,
        handle: NodeHandle,
    ) {
        self.arena.check(&handle);
        let index = handle.index;
        let node = self.arena.link(index);
        node.set_next(TaggedWord::NIL);

        match self.ends {
            None => {
                node.set_prev(index);
                self.ends = Some((index, index));
            }
            Some((head, tail)) => {
                self.arena
                    .link(tail)
                    .set_next(TaggedWord::new(index, node.tag()));
                self.arena.link(head).set_prev(index);
                self.ends = Some((head, index));
            }
        }
        self.len += 1;
    }

    /// Number of nodes linked so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn arena(&self) -> &'a NodeArena<T> {
        self.arena
    }

    /// Give up ownership of the linked nodes: `(head, tail, len)`.
    pub(crate) fn into_ends(mut self) -> Option<(NodeIndex, NodeIndex, usize)> {
        let len = mem::take(&mut self.len);
        self.ends.take().map(|(head, tail)| (head, tail, len))
    }
}

impl<T> Extend<NodeHandle> for NodeChain<'_, T> {
    fn extend<I: IntoIterator<Item = NodeHandle>>(
        &mut self,
        iter: I,
    ) {
        for handle in iter {
            self.append(handle);
        }
    }
}

impl<T> Drop for NodeChain<'_, T> {
    fn drop(&mut self) {
        let Some((head, tail)) = self.ends.take() else {
            return;
        };
        let mut members = Vec::with_capacity(self.len);
        let mut cursor = head;
        loop {
            members.push(cursor);
            if cursor == tail {
                break;
            }
            cursor = self.arena.link(cursor).next_word().index();
        }
        for index in members {
            drop(self.arena.take_value(index));
        }
    }
}

impl<T> fmt::Debug for NodeChain<'_, T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("NodeChain")
            .field("ends", &self.ends)
            .field("len", &self.len)
            .finish()
    }
}
