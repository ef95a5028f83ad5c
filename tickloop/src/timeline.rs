// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::fmt;
use core::ptr;

use critical_section::Mutex;

use crate::node::Handler;
use crate::sched::Schedule;
use crate::ticks::RawTick;

/// One scripted action: at `at` ticks past the timeline origin, call
/// `handler` with `arg`.
#[derive(Copy, Clone, Debug)]
pub struct Step {
    pub(crate) at: RawTick,
    pub(crate) handler: Handler,
    pub(crate) arg: *mut (),
}

/// Replays a static step table through the loop, optionally cycling.
///
/// The step table is owned by the caller and referenced here; the `Timeline`
/// itself is the mutable control block and its identity is the handle. Steps
/// fire in table order at their declared offsets; with a non-zero cycle
/// period the whole table repeats every `cycle` ticks until
/// [`stop`][Self::stop].
///
/// Stopping is lazy: the control block only clears its flag, and the
/// already-armed internal callback observes it and self-terminates, so no
/// cancellation traffic is needed.
///
/// The [`timeline!`][crate::timeline!] macro declares the table and control
/// block as one item.
pub struct Timeline {
    steps: &'static [Step],
    /// Cycle period in ticks, 0 for one-shot.
    cycle: RawTick,
    state: Mutex<Cell<State>>,
}

#[derive(Copy, Clone)]
struct State {
    running: bool,
    index: usize,
    driver: Option<&'static (dyn Schedule + Sync)>,
}

// === impl Step ===

// Safety: `arg` is an opaque token. The timeline never dereferences it, it
// is only handed to the step handler in the loop's single execution context.
unsafe impl Sync for Step {}
// Safety: see the `Sync` impl above.
unsafe impl Send for Step {}

impl Step {
    #[must_use]
    pub const fn new(at: RawTick, handler: Handler, arg: *mut ()) -> Self {
        Self { at, handler, arg }
    }
}

// === impl Timeline ===

impl Timeline {
    #[must_use]
    pub const fn new(steps: &'static [Step], cycle: RawTick) -> Self {
        Self {
            steps,
            cycle,
            state: Mutex::new(Cell::new(State {
                running: false,
                index: 0,
                driver: None,
            })),
        }
    }

    /// Arms the timeline on `sched`, starting from step 0.
    ///
    /// A no-op when the timeline is already running or the step table is
    /// empty.
    pub fn start(&'static self, sched: &'static (dyn Schedule + Sync)) {
        if self.steps.is_empty() {
            return;
        }

        let armed = critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            if state.running {
                return false;
            }
            state.running = true;
            state.index = 0;
            state.driver = Some(sched);
            cell.set(state);
            true
        });
        if !armed {
            return;
        }

        if sched
            .post_delayed(Self::step, self.as_arg(), self.steps[0].at)
            .is_err()
        {
            tracing::warn!("node pool exhausted, timeline not started");
            self.disarm();
        }
    }

    /// Stops the timeline. The in-flight internal callback (if any) observes
    /// the cleared flag and does not reschedule.
    pub fn stop(&self) {
        self.disarm();
    }

    /// Stops the timeline and rewinds it to step 0.
    pub fn reset(&self) {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            state.running = false;
            state.index = 0;
            cell.set(state);
        });
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        critical_section::with(|cs| self.state.borrow(cs).get().running)
    }

    /// The internal callback the timeline posts for itself.
    fn step(arg: *mut ()) {
        // Safety: this callback is only ever posted by `start`/`advance`
        // with the address of a live `&'static Timeline`
        let timeline = unsafe { &*arg.cast_const().cast::<Timeline>() };
        timeline.advance();
    }

    /// Runs the current step, then arms the next one.
    fn advance(&self) {
        let Some((current, driver)) = critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            if !state.running {
                return None;
            }
            if state.index >= self.steps.len() {
                state.running = false;
                cell.set(state);
                return None;
            }
            Some((self.steps[state.index], state.driver?))
        }) else {
            return;
        };

        // the handler runs outside the critical section and may itself
        // start, stop or reset this timeline
        (current.handler)(current.arg);

        let repost = critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();

            state.index += 1;
            let mut delay = 0;
            let mut more = false;

            if state.index < self.steps.len() {
                // a non-monotonic table clamps to 0 instead of wrapping
                delay = self.steps[state.index].at.saturating_sub(current.at);
                more = true;
            } else if self.cycle > 0 {
                delay = self
                    .cycle
                    .saturating_sub(current.at)
                    .saturating_add(self.steps[0].at);
                state.index = 0;
                more = true;
            } else {
                state.running = false;
                state.index = 0;
            }

            let repost = more && state.running;
            cell.set(state);
            repost.then_some(delay)
        });

        if let Some(delay) = repost
            && driver.post_delayed(Self::step, self.as_arg(), delay).is_err()
        {
            tracing::warn!("node pool exhausted, timeline stopped");
            self.disarm();
        }
    }

    fn disarm(&self) {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            state.running = false;
            cell.set(state);
        });
    }

    fn as_arg(&self) -> *mut () {
        ptr::from_ref(self).cast::<()>().cast_mut()
    }
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeline")
            .field("steps", &self.steps.len())
            .field("cycle", &self.cycle)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Declares a static step table and its [`Timeline`] control block as one
/// item.
///
/// ```
/// use tickloop::{Scheduler, timeline};
///
/// static SCHED: Scheduler = Scheduler::new(&[]);
///
/// fn valve_open(_arg: *mut ()) {}
/// fn valve_close(_arg: *mut ()) {}
///
/// timeline! {
///     static PURGE: cycle = 25, steps = [
///         (0, valve_open, core::ptr::null_mut()),
///         (10, valve_close, core::ptr::null_mut()),
///     ]
/// }
///
/// PURGE.start(&SCHED);
/// assert!(PURGE.is_running());
/// ```
#[macro_export]
macro_rules! timeline {
    (
        $(#[$meta:meta])*
        $vis:vis static $name:ident: cycle = $cycle:expr, steps = [
            $(($at:expr, $handler:expr, $arg:expr)),+ $(,)?
        ]
    ) => {
        $(#[$meta])*
        $vis static $name: $crate::Timeline = {
            static STEPS: &[$crate::Step] = &[
                $($crate::Step::new($at, $handler, $arg)),+
            ];
            $crate::Timeline::new(STEPS, $cycle)
        };
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;
    use crate::test_util::{arg_of, trace_init};
    use crate::ticks::RawTick;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    struct Ctx {
        sched: &'static Scheduler<8>,
        log: StdMutex<Vec<(char, RawTick)>>,
    }

    fn ctx_of(arg: *mut ()) -> &'static Ctx {
        // Safety: these tests only pass pointers to leaked `Ctx` values
        unsafe { &*arg.cast_const().cast::<Ctx>() }
    }

    fn mark_f(arg: *mut ()) {
        let ctx = ctx_of(arg);
        ctx.log.lock().unwrap().push(('f', ctx.sched.now().0));
    }

    fn mark_g(arg: *mut ()) {
        let ctx = ctx_of(arg);
        ctx.log.lock().unwrap().push(('g', ctx.sched.now().0));
    }

    fn fixture(steps: &[(RawTick, Handler)], cycle: RawTick) -> (&'static Ctx, &'static Timeline) {
        let sched: &'static Scheduler<8> = Box::leak(Box::new(Scheduler::with_capacity(&[])));
        let ctx: &'static Ctx = Box::leak(Box::new(Ctx {
            sched,
            log: StdMutex::new(Vec::new()),
        }));

        let steps: Vec<Step> = steps
            .iter()
            .map(|&(at, handler)| Step::new(at, handler, arg_of(ctx)))
            .collect();
        let timeline: &'static Timeline =
            Box::leak(Box::new(Timeline::new(steps.leak(), cycle)));

        (ctx, timeline)
    }

    fn drive(sched: &Scheduler<8>, ticks: RawTick) {
        sched.run();
        for _ in 0..ticks {
            sched.tick();
            sched.run();
        }
    }

    #[test]
    fn cycling_timeline_fires_at_scripted_offsets() {
        let _trace = trace_init();
        let (ctx, timeline) = fixture(&[(0, mark_f), (10, mark_g)], 25);

        timeline.start(ctx.sched);
        drive(ctx.sched, 60);

        assert_eq!(
            *ctx.log.lock().unwrap(),
            [('f', 0), ('g', 10), ('f', 25), ('g', 35), ('f', 50), ('g', 60)],
        );
        assert!(timeline.is_running());
    }

    #[test]
    fn stop_before_the_first_step_fires_nothing() {
        let _trace = trace_init();
        let (ctx, timeline) = fixture(&[(0, mark_f), (10, mark_g)], 25);

        timeline.start(ctx.sched);
        timeline.stop();
        drive(ctx.sched, 10);

        assert!(ctx.log.lock().unwrap().is_empty());
        assert!(!timeline.is_running());
        // the armed callback self-terminated and gave its node back
        assert_eq!(ctx.sched.free_slots(), 8);
    }

    #[test]
    fn stop_mid_cycle_ends_the_replay() {
        let _trace = trace_init();
        let (ctx, timeline) = fixture(&[(0, mark_f), (10, mark_g)], 25);

        timeline.start(ctx.sched);
        drive(ctx.sched, 0);
        timeline.stop();
        drive(ctx.sched, 15);

        assert_eq!(*ctx.log.lock().unwrap(), [('f', 0)]);
        assert_eq!(ctx.sched.free_slots(), 8);
    }

    #[test]
    fn one_shot_timeline_completes_and_rewinds() {
        let _trace = trace_init();
        let (ctx, timeline) = fixture(&[(0, mark_f), (5, mark_g)], 0);

        timeline.start(ctx.sched);
        drive(ctx.sched, 5);

        assert_eq!(*ctx.log.lock().unwrap(), [('f', 0), ('g', 5)]);
        assert!(!timeline.is_running());

        // the run-off-the-end branch rewound the index, so the timeline is
        // silently re-armable
        timeline.start(ctx.sched);
        drive(ctx.sched, 5);

        assert_eq!(
            *ctx.log.lock().unwrap(),
            [('f', 0), ('g', 5), ('f', 5), ('g', 10)],
        );
    }

    #[test]
    fn start_while_running_is_a_noop() {
        let _trace = trace_init();
        let (ctx, timeline) = fixture(&[(0, mark_f), (10, mark_g)], 0);

        timeline.start(ctx.sched);
        timeline.start(ctx.sched);
        drive(ctx.sched, 10);

        assert_eq!(*ctx.log.lock().unwrap(), [('f', 0), ('g', 10)]);
    }

    #[test]
    fn empty_timeline_does_not_start() {
        let _trace = trace_init();
        let sched: &'static Scheduler<8> = Box::leak(Box::new(Scheduler::with_capacity(&[])));
        let timeline: &'static Timeline = Box::leak(Box::new(Timeline::new(&[], 25)));

        timeline.start(sched);

        assert!(!timeline.is_running());
        assert_eq!(sched.free_slots(), 8);
    }

    #[test]
    fn non_monotonic_offsets_clamp_to_zero() {
        let _trace = trace_init();
        let (ctx, timeline) = fixture(&[(5, mark_f), (3, mark_g)], 0);

        timeline.start(ctx.sched);
        drive(ctx.sched, 5);
        // the malformed gap clamps to a zero delay, which needs one more
        // run step at the same tick
        ctx.sched.run();

        assert_eq!(*ctx.log.lock().unwrap(), [('f', 5), ('g', 5)]);
    }

    #[test]
    fn reset_rewinds_to_the_first_step() {
        let _trace = trace_init();
        let (ctx, timeline) = fixture(&[(0, mark_f), (10, mark_g)], 0);

        timeline.start(ctx.sched);
        drive(ctx.sched, 0);
        timeline.stop();
        timeline.reset();
        assert!(!timeline.is_running());

        timeline.start(ctx.sched);
        drive(ctx.sched, 0);

        assert_eq!(*ctx.log.lock().unwrap(), [('f', 0), ('f', 0)]);
    }

    #[test]
    fn declared_timeline_drives_static_handlers() {
        let _trace = trace_init();
        use core::sync::atomic::{AtomicUsize, Ordering};

        static SCHED: Scheduler = Scheduler::new(&[]);
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        fn fire(_arg: *mut ()) {
            FIRED.fetch_add(1, Ordering::Relaxed);
        }

        timeline! {
            static PULSE: cycle = 0, steps = [
                (0, fire, core::ptr::null_mut()),
                (2, fire, core::ptr::null_mut()),
            ]
        }

        PULSE.start(&SCHED);
        assert!(PULSE.is_running());

        SCHED.run();
        SCHED.tick();
        SCHED.run();
        SCHED.tick();
        SCHED.run();

        assert_eq!(FIRED.load(Ordering::Relaxed), 2);
        assert!(!PULSE.is_running());
    }
}
