// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

pub(crate) fn trace_init() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

/// Type-erases a borrow into the loop's opaque `arg` slot.
pub(crate) fn arg_of<T>(value: &T) -> *mut () {
    ptr::from_ref(value).cast::<()>().cast_mut()
}

/// Handler that increments the counter its argument points to.
pub(crate) fn bump(arg: *mut ()) {
    // Safety: tests only post `bump` with pointers to live counters
    let counter = unsafe { &*arg.cast_const().cast::<AtomicUsize>() };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_of(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::Relaxed)
}
