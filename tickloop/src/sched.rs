// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::Ordering;

use critical_section::Mutex;

use crate::error::Full;
use crate::event::{EventId, Subscription};
use crate::node::{Action, Dtor, Handler, Node, NodeIdx, Pool};
use crate::ticks::{RawTick, TickAtomic, Ticks};

/// Default node pool capacity.
pub const POOL_SIZE: usize = 32;

static_assertions::const_assert!(POOL_SIZE < crate::node::MAX_POOL);

/// Posting seam of the loop.
///
/// Everything that enqueues work goes through this trait, so components that
/// only need to post (like the [timeline driver][crate::Timeline]) can hold a
/// `&'static (dyn Schedule + Sync)` and stay independent of the pool
/// capacity.
pub trait Schedule {
    /// Enqueues `handler` to run on the next run step.
    fn post(&self, handler: Handler, arg: *mut ()) -> Result<(), Full>;

    /// Enqueues `handler` to run once `delay` ticks have elapsed.
    fn post_delayed(&self, handler: Handler, arg: *mut (), delay: RawTick) -> Result<(), Full>;

    /// Removes every pending task posted with exactly this `(handler, arg)`
    /// pair. Returns how many were removed.
    fn cancel(&self, handler: Handler, arg: *mut ()) -> usize;

    /// Broadcasts `event` to its subscribers on the next run step.
    fn emit(&self, event: EventId, arg: *mut ());

    /// Broadcasts `event` with a payload release action.
    fn emit_managed(&self, event: EventId, arg: *mut (), dtor: Option<Dtor>);
}

/// A cooperative, interrupt-tolerant event loop.
///
/// One execution context drains the loop by calling [`run`][Self::run] (and
/// may idle for the returned hint between calls); a periodic interrupt drives
/// [`tick`][Self::tick]. Every other operation may be called from either
/// side: all shared state is touched inside a host-provided
/// [`critical_section`], and handlers execute with the critical section
/// released.
///
/// Handlers run to completion in posting order (FIFO for immediate work,
/// expiration order for delayed work) and must not block.
///
/// The loop is a static resource:
///
/// ```
/// use tickloop::Scheduler;
///
/// static SCHED: Scheduler = Scheduler::new(&[]);
///
/// fn heartbeat(_arg: *mut ()) {}
///
/// SCHED.post(heartbeat, core::ptr::null_mut()).unwrap();
/// let hint = SCHED.run();
///
/// // nothing pending anymore, the caller may sleep indefinitely
/// assert!(hint.is_none());
/// ```
pub struct Scheduler<const CAP: usize = POOL_SIZE> {
    /// Incremented by the tick interrupt, read by everyone else. This is the
    /// only shared field accessed outside the critical section.
    ticks: TickAtomic,
    core: Mutex<RefCell<Core<CAP>>>,
    subs: &'static [Subscription],
}

struct Core<const CAP: usize> {
    pool: Pool<CAP>,
    ready_head: Option<NodeIdx>,
    ready_tail: Option<NodeIdx>,
    /// Sorted by ascending expiration under signed modular difference.
    timer_head: Option<NodeIdx>,
}

// === impl Scheduler ===

impl Scheduler<POOL_SIZE> {
    /// Creates a loop with the default pool capacity and the given
    /// subscription table.
    ///
    /// The table must be complete before the first [`run`][Self::run]; it is
    /// never consulted for anything but [`emit`][Self::emit] fan-out.
    #[must_use]
    pub const fn new(subscriptions: &'static [Subscription]) -> Self {
        Self::with_capacity(subscriptions)
    }
}

impl<const CAP: usize> Scheduler<CAP> {
    /// Creates a loop whose pool holds `CAP` nodes.
    #[must_use]
    pub const fn with_capacity(subscriptions: &'static [Subscription]) -> Self {
        Self {
            ticks: TickAtomic::new(0),
            core: Mutex::new(RefCell::new(Core {
                pool: Pool::new(),
                ready_head: None,
                ready_tail: None,
                timer_head: None,
            })),
            subs: subscriptions,
        }
    }

    /// Advances the tick counter by one.
    ///
    /// This is the whole tick path, safe to call from the timer interrupt;
    /// expired work is promoted lazily by the next [`run`][Self::run].
    #[inline]
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of the tick counter.
    #[inline]
    #[must_use]
    pub fn now(&self) -> Ticks {
        Ticks(self.ticks.load(Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn set_now(&self, now: Ticks) {
        self.ticks.store(now.0, Ordering::Relaxed);
    }

    /// Pool capacity this loop was built with.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Number of free node slots. O(capacity).
    #[must_use]
    pub fn free_slots(&self) -> usize {
        critical_section::with(|cs| self.core.borrow_ref(cs).pool.free_count())
    }

    /// Enqueues `handler` at the tail of the ready queue.
    ///
    /// Immediate posts run in FIFO order on the next run step. `arg` is
    /// carried through untouched.
    ///
    /// # Errors
    ///
    /// [`Full`] when no node slot is free.
    pub fn post(&self, handler: Handler, arg: *mut ()) -> Result<(), Full> {
        critical_section::with(|cs| {
            let mut core = self.core.borrow_ref_mut(cs);
            let idx = core.alloc_node(Action::Task(handler), arg, None)?;
            core.push_ready(idx);
            Ok(())
        })
    }

    /// Enqueues `handler` to run once `delay` ticks have elapsed.
    ///
    /// A `delay` of 0 still takes the timer path: the task becomes ready on
    /// the very next run step, after everything already in the ready queue.
    /// Delays must stay below half the tick-counter range for the modular
    /// expiration ordering to hold.
    ///
    /// # Errors
    ///
    /// [`Full`] when no node slot is free.
    pub fn post_delayed(&self, handler: Handler, arg: *mut (), delay: RawTick) -> Result<(), Full> {
        critical_section::with(|cs| {
            let mut core = self.core.borrow_ref_mut(cs);
            let idx = core.alloc_node(Action::Task(handler), arg, None)?;

            let expires = self.now().wrapping_add(delay);
            let node = core.pool.node_mut(idx);
            node.delayed = true;
            node.expires = expires;
            core.insert_timer(idx);

            tracing::trace!(delay, %expires, "armed delayed task");
            Ok(())
        })
    }

    /// Removes every pending task whose `(handler, arg)` pair matches by
    /// pointer equality, from the ready queue and the timer queue alike.
    ///
    /// Returns the number of tasks removed. Event emissions are never
    /// cancelled: with multiple subscribers an emission is not unambiguously
    /// identified by `(id, arg)`.
    pub fn cancel(&self, handler: Handler, arg: *mut ()) -> usize {
        let count =
            critical_section::with(|cs| self.core.borrow_ref_mut(cs).cancel_tasks(handler, arg));
        if count > 0 {
            tracing::trace!(count, "cancelled pending tasks");
        }
        count
    }

    /// Broadcasts `event` to every matching subscription on the next run
    /// step.
    ///
    /// Equivalent to [`emit_managed`][Self::emit_managed] with no release
    /// action.
    pub fn emit(&self, event: EventId, arg: *mut ()) {
        self.emit_managed(event, arg, None);
    }

    /// Broadcasts `event`, releasing the payload with `dtor` after the last
    /// subscriber has returned.
    ///
    /// Subscribers run synchronously, in table order, within one run step;
    /// `dtor` runs exactly once after all of them. If no node slot is free
    /// the emission is dropped and `dtor` is invoked right here, so the
    /// payload cannot leak.
    pub fn emit_managed(&self, event: EventId, arg: *mut (), dtor: Option<Dtor>) {
        let posted = critical_section::with(|cs| {
            let mut core = self.core.borrow_ref_mut(cs);
            match core.alloc_node(Action::Event(event), arg, dtor) {
                Ok(idx) => {
                    core.push_ready(idx);
                    true
                }
                Err(Full(())) => false,
            }
        });

        if !posted {
            tracing::warn!(%event, "node pool exhausted, dropping emission");
            if let Some(dtor) = dtor {
                dtor(arg);
            }
        }
    }

    /// One run step: promote expired timers, drain the ready queue, report a
    /// sleep hint.
    ///
    /// The entire ready chain is detached atomically, then executed with the
    /// critical section released, so interrupts (and the posting they do) are
    /// serviced normally during handler bodies. Work posted while the batch
    /// executes lands in the fresh ready queue and runs on a *subsequent*
    /// step.
    ///
    /// The return value is a hint for the caller's idle strategy: `Some(0)`
    /// when more work is already pending, `Some(n)` when the nearest timer
    /// expires in `n` ticks, `None` when the loop is empty and the caller may
    /// sleep until something is posted.
    pub fn run(&self) -> Option<RawTick> {
        let mut batch = critical_section::with(|cs| {
            let mut core = self.core.borrow_ref_mut(cs);
            core.promote_expired(self.now());
            core.take_ready()
        });

        while let Some(idx) = batch {
            let node = critical_section::with(|cs| *self.core.borrow_ref(cs).pool.node(idx));
            batch = node.next;

            match node.action {
                Action::Task(handler) => handler(node.arg),
                Action::Event(event) => {
                    for sub in self.subs {
                        if sub.event == event {
                            (sub.handler)(node.arg);
                        }
                    }
                    // every subscriber is done with the payload, release it
                    if let Some(dtor) = node.dtor {
                        dtor(node.arg);
                    }
                }
                // a detached node is never vacant; `Pool::free` flags the
                // slot in debug builds if this is ever reached
                Action::Vacant => {}
            }

            critical_section::with(|cs| self.core.borrow_ref_mut(cs).pool.free(idx));
        }

        critical_section::with(|cs| {
            let core = self.core.borrow_ref(cs);
            if core.ready_head.is_some() {
                return Some(0);
            }
            let head = core.timer_head?;
            let until = core.pool.node(head).expires.since(self.now());
            Some(RawTick::try_from(until).unwrap_or(0))
        })
    }
}

impl<const CAP: usize> Schedule for Scheduler<CAP> {
    fn post(&self, handler: Handler, arg: *mut ()) -> Result<(), Full> {
        Scheduler::post(self, handler, arg)
    }

    fn post_delayed(&self, handler: Handler, arg: *mut (), delay: RawTick) -> Result<(), Full> {
        Scheduler::post_delayed(self, handler, arg, delay)
    }

    fn cancel(&self, handler: Handler, arg: *mut ()) -> usize {
        Scheduler::cancel(self, handler, arg)
    }

    fn emit(&self, event: EventId, arg: *mut ()) {
        Scheduler::emit(self, event, arg);
    }

    fn emit_managed(&self, event: EventId, arg: *mut (), dtor: Option<Dtor>) {
        Scheduler::emit_managed(self, event, arg, dtor);
    }
}

impl<const CAP: usize> fmt::Debug for Scheduler<CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("capacity", &CAP)
            .field("subscriptions", &self.subs.len())
            .field("now", &self.now())
            .finish_non_exhaustive()
    }
}

// === impl Core ===

impl<const CAP: usize> Core<CAP> {
    fn alloc_node(
        &mut self,
        action: Action,
        arg: *mut (),
        dtor: Option<Dtor>,
    ) -> Result<NodeIdx, Full> {
        let idx = self.pool.alloc().ok_or(Full(()))?;
        let node = self.pool.node_mut(idx);
        node.action = action;
        node.arg = arg;
        node.dtor = dtor;
        node.delayed = false;
        Ok(idx)
    }

    fn push_ready(&mut self, idx: NodeIdx) {
        self.pool.node_mut(idx).next = None;
        match self.ready_tail {
            Some(tail) => self.pool.node_mut(tail).next = Some(idx),
            None => self.ready_head = Some(idx),
        }
        self.ready_tail = Some(idx);
    }

    fn take_ready(&mut self) -> Option<NodeIdx> {
        self.ready_tail = None;
        self.ready_head.take()
    }

    /// Inserts before the first strictly-later entry, so equal expirations
    /// keep their insertion order.
    fn insert_timer(&mut self, idx: NodeIdx) {
        let expires = self.pool.node(idx).expires;

        let mut prev: Option<NodeIdx> = None;
        let mut curr = self.timer_head;
        while let Some(c) = curr {
            if self.pool.node(c).expires.since(expires) > 0 {
                break;
            }
            prev = Some(c);
            curr = self.pool.node(c).next;
        }

        self.pool.node_mut(idx).next = curr;
        match prev {
            None => self.timer_head = Some(idx),
            Some(p) => self.pool.node_mut(p).next = Some(idx),
        }
    }

    /// Moves every expired timer to the ready tail, preserving expiration
    /// order. Stops at the first pending entry; the list is sorted.
    fn promote_expired(&mut self, now: Ticks) {
        while let Some(idx) = self.timer_head {
            if now.since(self.pool.node(idx).expires) < 0 {
                break;
            }

            debug_assert!(self.pool.node(idx).delayed);
            self.timer_head = self.pool.node(idx).next;
            self.pool.node_mut(idx).delayed = false;
            self.push_ready(idx);
        }
    }

    fn cancel_tasks(&mut self, handler: Handler, arg: *mut ()) -> usize {
        let mut count = 0;

        let mut prev: Option<NodeIdx> = None;
        let mut curr = self.timer_head;
        while let Some(idx) = curr {
            let node = *self.pool.node(idx);
            if Self::matches(&node, handler, arg) {
                match prev {
                    None => self.timer_head = node.next,
                    Some(p) => self.pool.node_mut(p).next = node.next,
                }
                self.retire(idx, &node);
                count += 1;
            } else {
                prev = Some(idx);
            }
            curr = node.next;
        }

        let mut removed_tail = false;
        let mut prev: Option<NodeIdx> = None;
        let mut curr = self.ready_head;
        while let Some(idx) = curr {
            let node = *self.pool.node(idx);
            if Self::matches(&node, handler, arg) {
                match prev {
                    None => self.ready_head = node.next,
                    Some(p) => self.pool.node_mut(p).next = node.next,
                }
                removed_tail |= self.ready_tail == Some(idx);
                self.retire(idx, &node);
                count += 1;
            } else {
                prev = Some(idx);
            }
            curr = node.next;
        }
        if removed_tail {
            // the tail went away, find the new one with a second walk
            self.recompute_ready_tail();
        }

        count
    }

    fn matches(node: &Node, handler: Handler, arg: *mut ()) -> bool {
        match node.action {
            Action::Task(h) => core::ptr::fn_addr_eq(h, handler) && node.arg == arg,
            Action::Event(_) | Action::Vacant => false,
        }
    }

    fn retire(&mut self, idx: NodeIdx, node: &Node) {
        if let Some(dtor) = node.dtor {
            dtor(node.arg);
        }
        self.pool.free(idx);
    }

    fn recompute_ready_tail(&mut self) {
        let mut tail = None;
        let mut curr = self.ready_head;
        while let Some(idx) = curr {
            tail = Some(idx);
            curr = self.pool.node(idx).next;
        }
        self.ready_tail = tail;
    }
}
