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
    cell::RefCell,
    rc::{
        Rc,
        Weak,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Instant,
};
use ::tokio::{
    sync::Notify,
    task::{
        self,
        JoinHandle,
        LocalSet,
    },
    time,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Wakes the drain task, from any thread.
#[derive(Default)]
struct TokioSignal {
    scheduled: AtomicBool,
    notify: Notify,
}

struct TokioLoopControllerInner {
    scheduler: RefCell<Weak<Scheduler>>,
    signal: Arc<TokioSignal>,
    /// Task running drain passes.
    driver: RefCell<Option<JoinHandle<()>>>,
    /// Tasks sleeping until a timed callback is due.
    timers: RefCell<Vec<JoinHandle<()>>>,
}

/// Loop controller that piggybacks on a tokio [LocalSet]. Drain passes run as a local task woken through a [Notify]
/// and timed callbacks are local tasks sleeping on the tokio timer wheel, so the scheduler has no thread or busy loop
/// of its own.
#[derive(Clone)]
pub struct TokioLoopController(SharedObject<TokioLoopControllerInner>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TokioLoopController {
    pub fn new() -> Self {
        Self(SharedObject::new(TokioLoopControllerInner {
            scheduler: RefCell::new(Weak::new()),
            signal: Arc::new(TokioSignal::default()),
            driver: RefCell::new(None),
            timers: RefCell::new(Vec::new()),
        }))
    }

    /// Spawns the drain task onto `local`. The scheduler must have been built with this controller already.
    pub fn attach_local_set(&self, local: &LocalSet) {
        let scheduler: Weak<Scheduler> = self.0.scheduler.borrow().clone();
        assert!(
            scheduler.upgrade().is_some(),
            "attach_local_set() called before a scheduler was built with this controller"
        );
        let signal: Arc<TokioSignal> = self.0.signal.clone();
        let driver: JoinHandle<()> = local.spawn_local(async move {
            loop {
                signal.notify.notified().await;
                if !signal.scheduled.swap(false, Ordering::AcqRel) {
                    continue;
                }
                let scheduler: Rc<Scheduler> = match scheduler.upgrade() {
                    Some(scheduler) => scheduler,
                    None => {
                        debug!("attach_local_set(): scheduler is gone, stopping drain task");
                        return;
                    },
                };
                scheduler.loop_until_no_ready();
            }
        });
        if let Some(previous) = self.0.driver.borrow_mut().replace(driver) {
            previous.abort();
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for TokioLoopController {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadSafeSchedule for TokioSignal {
    fn schedule_thread_safe(&self) {
        self.scheduled.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

impl LoopController for TokioLoopController {
    fn attach(&self, scheduler: Weak<Scheduler>) {
        *self.0.scheduler.borrow_mut() = scheduler;
    }

    fn schedule(&self) {
        self.0.signal.schedule_thread_safe();
    }

    fn thread_safe(&self) -> Arc<dyn ThreadSafeSchedule> {
        self.0.signal.clone()
    }

    /// Must be called from within the [LocalSet] the controller is attached to.
    fn timed_schedule(&self, callback: Box<dyn FnOnce()>, deadline: Instant) {
        let timer: JoinHandle<()> = task::spawn_local(async move {
            time::sleep_until(time::Instant::from_std(deadline)).await;
            callback();
        });
        let mut timers = self.0.timers.borrow_mut();
        timers.retain(|timer: &JoinHandle<()>| !timer.is_finished());
        timers.push(timer);
    }

    fn cancel(&self) {
        self.0.signal.scheduled.store(false, Ordering::Release);
    }
}

impl Drop for TokioLoopControllerInner {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
        for timer in self.timers.get_mut().drain(..) {
            timer.abort();
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
