// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-waiter wake primitive.
//!
//! A baton connects one poster with one waiter for one episode. The waiter may be a fiber, which gets suspended and
//! rescheduled, or a plain thread, which spins briefly and then parks on a futex word. The whole protocol goes through
//! compare-and-set operations on a single state word that holds either one of the markers below or a pointer to the
//! boxed [FiberWaker] of a suspended fiber.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::futex,
    runtime::{
        limits,
        scheduler::{
            self,
            FiberWaker,
            SharedScheduler,
        },
    },
};
use ::std::{
    cell::Cell,
    fmt,
    hint,
    rc::Rc,
    sync::atomic::{
        AtomicU32,
        AtomicUsize,
        Ordering,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Nobody waits and nothing was posted.
const NO_WAITER: usize = 0;
/// Posted before or while someone waited.
const POSTED: usize = 1;
/// The waiter gave up. Later posts are ignored.
const TIMEOUT: usize = 2;
/// A plain thread waits on the futex word.
const THREAD_WAITING: usize = 3;

/// Futex word values while a plain thread waits.
const FUTEX_WAITING: u32 = 0;
const FUTEX_POSTED: u32 = 1;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Single-waiter wake primitive usable from fibers and plain threads.
pub struct Baton {
    state: AtomicUsize,
    futex: AtomicU32,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Baton {
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(NO_WAITER),
            futex: AtomicU32::new(FUTEX_WAITING),
        }
    }

    /// Blocks until the baton is posted. Suspends the calling fiber, or the calling thread outside fibers. Returns
    /// right away if the baton was posted already.
    pub fn wait(&self) {
        if self.try_wait() {
            return;
        }
        self.wait_with(|| {});
    }

    /// Same as [Baton::wait], but `main_context_func` runs on the scheduler's stack once the fiber is suspended, so it
    /// may hand the baton to code that posts right away. Outside fibers it is simply called before blocking.
    pub fn wait_with<F: FnOnce() + 'static>(&self, main_context_func: F) {
        let posted: bool = if SharedScheduler::in_fiber() {
            self.wait_fiber(Box::new(main_context_func))
        } else {
            main_context_func();
            self.wait_thread(None)
        };
        debug_assert!(posted);
    }

    /// Consumes a post that already happened. Never blocks.
    pub fn try_wait(&self) -> bool {
        self.state
            .compare_exchange(POSTED, NO_WAITER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Waits for a post for at most `timeout`. Returns `true` if the baton was posted and `false` if the timeout won
    /// the race. After a timeout the baton ignores posts until [Baton::reset].
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        if self.try_wait() {
            return true;
        }
        if SharedScheduler::in_fiber() {
            self.timed_wait_fiber(timeout)
        } else {
            // A deadline past the end of representable time is no deadline.
            self.wait_thread(Instant::now().checked_add(timeout))
        }
    }

    /// Wakes the waiter, or lets the next wait return right away. A post that lost a race against a timeout is
    /// ignored. At most one post per episode.
    pub fn post(&self) {
        let mut current: usize = self.state.load(Ordering::Acquire);
        loop {
            match current {
                TIMEOUT => {
                    trace!("post(): waiter timed out already");
                    return;
                },
                POSTED => {
                    warn!("post(): baton posted twice in the same episode");
                    return;
                },
                _ => (),
            }
            match self
                .state
                .compare_exchange(current, POSTED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        match current {
            NO_WAITER => (),
            THREAD_WAITING => {
                // The waiter may return and release the baton as soon as the word flips.
                let word: *const AtomicU32 = &self.futex;
                self.futex.store(FUTEX_POSTED, Ordering::Release);
                futex::futex_wake_all(word);
            },
            waiter => {
                // Safety: pointers in the state word come from `Box::into_raw` and the successful exchange above
                // made this call their only owner.
                let waker: Box<FiberWaker> = unsafe { Box::from_raw(waiter as *mut FiberWaker) };
                waker.wake();
            },
        }
    }

    /// Starts a new episode. Only valid while nobody waits.
    pub fn reset(&self) {
        let previous: usize = self.state.swap(NO_WAITER, Ordering::AcqRel);
        assert!(previous < THREAD_WAITING, "reset() while a waiter is parked");
        self.futex.store(FUTEX_WAITING, Ordering::Release);
    }

    /// Suspends the calling fiber until posted or timed out. Returns whether the baton was posted.
    fn wait_fiber(&self, main_context_func: Box<dyn FnOnce()>) -> bool {
        let waker: FiberWaker = match SharedScheduler::current() {
            Some(scheduler) => scheduler.waker_for_active(),
            None => panic!("wait_fiber() called outside of a fiber"),
        };
        let baton: *const Baton = self;

        scheduler::suspend_current(
            Some(Box::new(move || {
                // Safety: the waiting fiber is suspended inside a method borrowing the baton, so it is alive.
                let baton: &Baton = unsafe { &*baton };
                let waiter: usize = Box::into_raw(Box::new(waker)) as usize;
                match baton
                    .state
                    .compare_exchange(NO_WAITER, waiter, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => (),
                    Err(POSTED) => {
                        // Safety: the box was never published.
                        let waker: Box<FiberWaker> = unsafe { Box::from_raw(waiter as *mut FiberWaker) };
                        waker.wake();
                    },
                    Err(state) => panic!("baton already has a waiter (state={:#x})", state),
                }
                main_context_func();
            })),
            false,
        );

        match self.state.load(Ordering::Acquire) {
            POSTED => {
                self.state.store(NO_WAITER, Ordering::Release);
                true
            },
            TIMEOUT => false,
            state => panic!("fiber resumed with baton in state {:#x}", state),
        }
    }

    /// Arms a timer on the scheduler's loop controller that races the post.
    fn timed_wait_fiber(&self, timeout: Duration) -> bool {
        let done: Rc<Cell<bool>> = Rc::new(Cell::new(false));
        let done_: Rc<Cell<bool>> = done.clone();
        let baton: *const Baton = self;
        let on_timeout: Box<dyn FnOnce()> = Box::new(move || {
            if done_.get() {
                return;
            }
            // Safety: `done` is set before the waiting frame returns, so the baton is alive here.
            let baton: &Baton = unsafe { &*baton };
            let waiter: usize = baton.state.load(Ordering::Acquire);
            if waiter <= THREAD_WAITING {
                return;
            }
            if baton
                .state
                .compare_exchange(waiter, TIMEOUT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Safety: the exchange above took the pointer out of the state word.
                let waker: Box<FiberWaker> = unsafe { Box::from_raw(waiter as *mut FiberWaker) };
                waker.wake();
            }
        });
        let scheduler: SharedScheduler = match SharedScheduler::current() {
            Some(scheduler) => scheduler,
            None => panic!("timed_wait_fiber() called outside of a fiber"),
        };
        match Instant::now().checked_add(timeout) {
            Some(deadline) => scheduler.controller().timed_schedule(on_timeout, deadline),
            None => trace!("timed_wait_fiber(): timeout {:?} never expires", timeout),
        }
        // The suspended fiber must not keep its scheduler alive.
        drop(scheduler);

        let posted: bool = self.wait_fiber(Box::new(|| {}));
        done.set(true);
        posted
    }

    /// Blocks the calling thread until posted or `deadline`. Returns whether the baton was posted.
    fn wait_thread(&self, deadline: Option<Instant>) -> bool {
        for _ in 0..limits::BATON_SPIN_ATTEMPTS {
            if self.try_wait() {
                return true;
            }
            hint::spin_loop();
        }

        self.futex.store(FUTEX_WAITING, Ordering::Release);
        match self
            .state
            .compare_exchange(NO_WAITER, THREAD_WAITING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => (),
            Err(POSTED) => {
                self.state.store(NO_WAITER, Ordering::Release);
                return true;
            },
            Err(state) => panic!("baton already has a waiter (state={:#x})", state),
        }

        loop {
            if self.futex.load(Ordering::Acquire) == FUTEX_POSTED {
                self.state.store(NO_WAITER, Ordering::Release);
                return true;
            }
            let timeout: Option<Duration> = match deadline {
                None => None,
                Some(deadline) => {
                    let now: Instant = Instant::now();
                    if now >= deadline {
                        if self
                            .state
                            .compare_exchange(THREAD_WAITING, TIMEOUT, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            return false;
                        }
                        // The poster won and is about to flip the futex word.
                        None
                    } else {
                        Some(deadline - now)
                    }
                },
            };
            futex::futex_wait(&self.futex, FUTEX_WAITING, timeout);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Baton {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Baton {
    fn drop(&mut self) {
        let state: usize = *self.state.get_mut();
        if state > THREAD_WAITING {
            warn!("drop(): baton dropped while a fiber waits on it");
            // Safety: nobody else can reach the state word anymore.
            drop(unsafe { Box::from_raw(state as *mut FiberWaker) });
        }
    }
}

impl fmt::Debug for Baton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state: &str = match self.state.load(Ordering::Acquire) {
            NO_WAITER => "no waiter",
            POSTED => "posted",
            TIMEOUT => "timeout",
            THREAD_WAITING => "thread waiting",
            _ => "fiber waiting",
        };
        f.debug_struct("Baton").field("state", &state).finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
