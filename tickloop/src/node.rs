// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::event::EventId;
use crate::ticks::Ticks;

/// A callback invoked by the loop with the opaque argument it was posted with.
///
/// The loop never dereferences the argument; it is a token carried from the
/// posting site to the handler.
pub type Handler = fn(*mut ());

/// Release action for a managed payload, invoked exactly once after the last
/// consumer of the payload has returned.
pub type Dtor = fn(*mut ());

/// Returns a destructor that runs `T`'s `Drop` glue in place.
///
/// This is the bridge between the loop's type-erased payload slot and owned
/// payloads kept in caller-managed storage: park a `T` somewhere stable, emit
/// its address, and let the returned destructor retire it once every
/// subscriber has seen it.
///
/// # Safety
///
/// Every argument the returned function is ever invoked with must be a valid,
/// uniquely-owned `*mut T`. In practice that means passing it exclusively to
/// [`emit_managed`][crate::Scheduler::emit_managed] alongside a matching
/// payload pointer.
#[must_use]
pub unsafe fn dtor_of<T>() -> Dtor {
    |arg| {
        // Safety: the `dtor_of` caller promised that this function is only
        // ever handed arguments that point to a live, uniquely-owned `T`.
        unsafe { arg.cast::<T>().drop_in_place() }
    }
}

/// Pool-private handle to a node slot.
///
/// Indices are only ever minted by [`Pool`] itself, so a `NodeIdx` cannot
/// name out-of-pool storage; this replaces the address range check a
/// pointer-based free list would need.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct NodeIdx(u16);

/// Largest pool capacity representable by [`NodeIdx`].
pub(crate) const MAX_POOL: usize = 65_535;

/// What a node does when the loop reaches it.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Action {
    /// The slot is on the free list.
    Vacant,
    /// Run one handler.
    Task(Handler),
    /// Fan an event out to every matching subscription.
    Event(EventId),
}

/// A uniformly-sized task descriptor.
///
/// At any instant a node is in exactly one place: the free list, the ready
/// queue, the timer queue, or the run step's detached batch. The `next` link
/// is reused for whichever of those lists currently owns it.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Node {
    pub(crate) next: Option<NodeIdx>,
    pub(crate) action: Action,
    pub(crate) arg: *mut (),
    pub(crate) dtor: Option<Dtor>,
    /// Tick at which a delayed node becomes ready. Meaningless while
    /// `delayed` is unset.
    pub(crate) expires: Ticks,
    pub(crate) delayed: bool,
}

/// Fixed-capacity node pool with an index-linked free list.
pub(crate) struct Pool<const CAP: usize> {
    slots: [Node; CAP],
    free_head: Option<NodeIdx>,
}

// === impl NodeIdx ===

impl NodeIdx {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "pool capacities are asserted to fit the index width"
    )]
    pub(crate) const fn new(raw: usize) -> Self {
        debug_assert!(raw < MAX_POOL);
        Self(raw as u16)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        usize::from(self.0)
    }
}

// === impl Node ===

// Safety: `arg` and `dtor` are opaque tokens. The loop never dereferences
// them; they are only handed back to handler code running in the single
// execution context that drains the loop.
unsafe impl Send for Node {}

impl Node {
    pub(crate) const VACANT: Self = Self {
        next: None,
        action: Action::Vacant,
        arg: core::ptr::null_mut(),
        dtor: None,
        expires: Ticks::ZERO,
        delayed: false,
    };
}

// === impl Pool ===

impl<const CAP: usize> Pool<CAP> {
    /// Creates the pool with slot `i` chained to slot `i + 1`.
    pub(crate) const fn new() -> Self {
        assert!(CAP > 0, "node pool capacity must be non-zero");
        assert!(CAP < MAX_POOL, "node pool capacity exceeds the index width");

        let mut slots = [Node::VACANT; CAP];
        let mut i = 0;
        while i + 1 < CAP {
            slots[i].next = Some(NodeIdx::new(i + 1));
            i += 1;
        }

        Self {
            slots,
            free_head: Some(NodeIdx::new(0)),
        }
    }

    /// Pops the free-list head. Returns `None` when the pool is exhausted.
    pub(crate) fn alloc(&mut self) -> Option<NodeIdx> {
        let idx = self.free_head?;
        self.free_head = self.node(idx).next;
        self.node_mut(idx).next = None;
        Some(idx)
    }

    /// Pushes a retired node back onto the free list.
    pub(crate) fn free(&mut self, idx: NodeIdx) {
        let head = self.free_head;
        let node = self.node_mut(idx);
        debug_assert!(
            !matches!(node.action, Action::Vacant),
            "released a node slot twice"
        );

        *node = Node::VACANT;
        node.next = head;
        self.free_head = Some(idx);
    }

    #[inline]
    pub(crate) fn node(&self, idx: NodeIdx) -> &Node {
        &self.slots[idx.index()]
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, idx: NodeIdx) -> &mut Node {
        &mut self.slots[idx.index()]
    }

    /// Number of slots currently on the free list. O(n).
    pub(crate) fn free_count(&self) -> usize {
        let mut count = 0;
        let mut curr = self.free_head;
        while let Some(idx) = curr {
            count += 1;
            curr = self.node(idx).next;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_fully_chained() {
        let pool = Pool::<8>::new();
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn alloc_drains_and_free_replenishes() {
        let mut pool = Pool::<4>::new();

        let taken: [NodeIdx; 4] = core::array::from_fn(|_| {
            let idx = pool.alloc().unwrap();
            pool.node_mut(idx).action = Action::Task(|_| {});
            idx
        });
        assert_eq!(pool.free_count(), 0);
        assert!(pool.alloc().is_none());

        for idx in taken {
            pool.free(idx);
        }
        assert_eq!(pool.free_count(), 4);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn freed_slots_are_reused_first() {
        let mut pool = Pool::<4>::new();

        let idx = pool.alloc().unwrap();
        pool.node_mut(idx).action = Action::Task(|_| {});
        pool.free(idx);

        assert_eq!(pool.alloc(), Some(idx));
    }
}
