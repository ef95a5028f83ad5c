// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::node::Handler;

/// Small-integer identity of a broadcast event.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EventId(pub u16);

/// A static binding of an event id to a handler.
///
/// The subscription table is handed to [`Scheduler::new`] as a
/// `&'static [Subscription]` and is immutable from then on. The same id may
/// appear any number of times; an emission invokes every matching handler in
/// table order.
///
/// [`Scheduler::new`]: crate::Scheduler::new
#[derive(Copy, Clone, Debug)]
pub struct Subscription {
    pub(crate) event: EventId,
    pub(crate) handler: Handler,
}

// === impl EventId ===

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

// === impl Subscription ===

impl Subscription {
    #[must_use]
    pub const fn new(event: EventId, handler: Handler) -> Self {
        Self { event, handler }
    }
}
