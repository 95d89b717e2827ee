//! Intrusive link primitive for the ready stacks.
//!
//! Every queueable slot embeds one [`ListNode`]. Links are stable arena
//! indices rather than addresses, and the ABA tag travels next to the index
//! in a single 64-bit word so one compare-and-swap observes both.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Index of a slot inside a [`NodeArena`](super::NodeArena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub(crate) u32);

impl NodeIndex {
    /// Terminator used by free lists and cleared links.
    pub const NIL: NodeIndex = NodeIndex(u32::MAX);

    /// Returns the raw slot number.
    #[inline]
    pub fn value(&self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// A stack head or `next` link: slot index in the high half, tag in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaggedWord(u64);

impl TaggedWord {
    pub(crate) const NIL: TaggedWord = TaggedWord((u32::MAX as u64) << 32);

    #[inline]
    pub(crate) fn new(
        index: NodeIndex,
        tag: u32,
    ) -> Self {
        TaggedWord(((index.0 as u64) << 32) | tag as u64)
    }

    #[inline]
    pub(crate) fn from_raw(raw: u64) -> Self {
        TaggedWord(raw)
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn index(self) -> NodeIndex {
        NodeIndex((self.0 >> 32) as u32)
    }

    #[inline]
    pub(crate) fn tag(self) -> u32 {
        self.0 as u32
    }
}

/// Owner value of a node that belongs to no container.
pub(crate) const DETACHED: u32 = 0;

/// Link fields embedded in every arena slot.
///
/// `prev` is only meaningful on the head of a pre-linked chain, where it
/// names the chain's tail. `owner` records the container the node is
/// attached to; it is bookkeeping for debug assertions and carries no
/// ordering guarantee.
#[derive(Debug)]
pub struct ListNode {
    next: AtomicU64,
    prev: AtomicU32,
    tag: AtomicU32,
    owner: AtomicU32,
}

impl ListNode {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(TaggedWord::NIL.raw()),
            prev: AtomicU32::new(NodeIndex::NIL.0),
            tag: AtomicU32::new(0),
            owner: AtomicU32::new(DETACHED),
        }
    }

    /// Generation counter of this node.
    ///
    /// Advances by one each time the node leaves a lock-free stack or the
    /// arena free list.
    #[inline]
    pub fn tag(&self) -> u32 {
        self.tag.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_tag(
        &self,
        tag: u32,
    ) {
        self.tag.store(tag, Ordering::Release);
    }

    #[inline]
    pub(crate) fn next_word(&self) -> TaggedWord {
        TaggedWord::from_raw(self.next.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_next(
        &self,
        word: TaggedWord,
    ) {
        self.next.store(word.raw(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn prev(&self) -> NodeIndex {
        NodeIndex(self.prev.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_prev(
        &self,
        index: NodeIndex,
    ) {
        self.prev.store(index.0, Ordering::Release);
    }

    /// Clears both relations of a node leaving a container.
    #[inline]
    pub(crate) fn clear_links(&self) {
        self.set_next(TaggedWord::NIL);
        self.set_prev(NodeIndex::NIL);
    }

    /// Marks the node as a member of `container`, returning the previous owner.
    #[inline]
    pub(crate) fn attach(
        &self,
        container: u32,
    ) -> u32 {
        self.owner.swap(container, Ordering::Relaxed)
    }

    /// Clears the membership mark, returning the previous owner.
    #[inline]
    pub(crate) fn detach(&self) -> u32 {
        self.owner.swap(DETACHED, Ordering::Relaxed)
    }
}

impl Default for ListNode {
    fn default() -> Self {
        Self::new()
    }
}
