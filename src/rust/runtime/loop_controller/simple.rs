// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    loop_controller::{
        LoopController,
        ThreadSafeSchedule,
    },
    scheduler::Scheduler,
    SharedObject,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::{
        Rc,
        Weak,
    },
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Flags shared with other threads.
#[derive(Default)]
struct SimpleSignal {
    scheduled: AtomicBool,
    remote_schedule_called: AtomicUsize,
}

struct SimpleLoopControllerInner {
    scheduler: RefCell<Weak<Scheduler>>,
    signal: Arc<SimpleSignal>,
    stopped: Cell<bool>,
    /// Pending timed callbacks, unordered.
    timers: RefCell<Vec<(Instant, Box<dyn FnOnce()>)>>,
}

/// Pull-mode loop controller. The owner of the thread calls [SimpleLoopController::run_loop], which alternates between a
/// caller supplied step and scheduler drain passes.
#[derive(Clone)]
pub struct SimpleLoopController(SharedObject<SimpleLoopControllerInner>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SimpleLoopController {
    pub fn new() -> Self {
        Self(SharedObject::new(SimpleLoopControllerInner {
            scheduler: RefCell::new(Weak::new()),
            signal: Arc::new(SimpleSignal::default()),
            stopped: Cell::new(false),
            timers: RefCell::new(Vec::new()),
        }))
    }

    /// Runs `step`, due timers and requested drain passes in a loop. Returns once [SimpleLoopController::stop] was called
    /// and the last drain pass left no fiber suspended.
    pub fn run_loop<F: FnMut()>(&self, mut step: F) {
        let mut waiting: bool = false;
        self.0.stopped.set(false);
        while waiting || !self.0.stopped.get() {
            step();
            self.fire_due_timers();
            if self.0.signal.scheduled.swap(false, Ordering::AcqRel) {
                let scheduler: Option<Rc<Scheduler>> = self.0.scheduler.borrow().upgrade();
                match scheduler {
                    Some(scheduler) => waiting = scheduler.loop_until_no_ready(),
                    None => waiting = false,
                }
            }
        }
    }

    /// Asks [SimpleLoopController::run_loop] to return.
    pub fn stop(&self) {
        self.0.stopped.set(true);
    }

    /// Number of drain pass requests that came from other threads and were not coalesced.
    pub fn remote_schedule_called(&self) -> usize {
        self.0.signal.remote_schedule_called.load(Ordering::Acquire)
    }

    /// Is a drain pass requested?
    pub fn is_scheduled(&self) -> bool {
        self.0.signal.scheduled.load(Ordering::Acquire)
    }

    fn fire_due_timers(&self) {
        let now: Instant = Instant::now();
        let due: Vec<(Instant, Box<dyn FnOnce()>)> = {
            let mut timers = self.0.timers.borrow_mut();
            let (due, pending): (Vec<_>, Vec<_>) = timers.drain(..).partition(|(deadline, _)| *deadline <= now);
            *timers = pending;
            due
        };
        for (_, callback) in due {
            callback();
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SimpleLoopController {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadSafeSchedule for SimpleSignal {
    fn schedule_thread_safe(&self) {
        self.remote_schedule_called.fetch_add(1, Ordering::AcqRel);
        self.scheduled.store(true, Ordering::Release);
    }
}

impl LoopController for SimpleLoopController {
    fn attach(&self, scheduler: Weak<Scheduler>) {
        *self.0.scheduler.borrow_mut() = scheduler;
    }

    fn schedule(&self) {
        self.0.signal.scheduled.store(true, Ordering::Release);
    }

    fn thread_safe(&self) -> Arc<dyn ThreadSafeSchedule> {
        self.0.signal.clone()
    }

    fn timed_schedule(&self, callback: Box<dyn FnOnce()>, deadline: Instant) {
        self.0.timers.borrow_mut().push((deadline, callback));
    }

    fn cancel(&self) {
        self.0.signal.scheduled.store(false, Ordering::Release);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
