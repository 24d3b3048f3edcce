// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Implementation of our single-threaded fiber scheduler.
//!
//! Fibers live in a slab and are referred to by their slot index. The ready queue and the pool of idle fibers are
//! queues of such indices. A drain pass pulls in whatever other threads queued, then dispatches ready fibers in FIFO
//! order until none is left. Fiber bodies and the scheduler share the owning thread, so the scheduler state sits in a
//! [RefCell] that is never borrowed across a switch into a fiber.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::{
        ExecutionContext,
        SuspendPoint,
    },
    fail::Fail,
    fiber::{
        fiber_main,
        Fiber,
        FiberId,
        FiberState,
        TaskPayload,
        HANDOFF_RESUME,
    },
    loop_controller::LoopController,
    scheduler::{
        options::{
            ExceptionCallback,
            SchedulerOptions,
        },
        remote::{
            FiberWaker,
            RemoteQueue,
            RemoteScheduler,
            RemoteTask,
        },
    },
};
use ::slab::Slab;
use ::std::{
    cell::RefCell,
    collections::{
        HashMap,
        VecDeque,
    },
    fmt,
    ops::Deref,
    panic::{
        self,
        AssertUnwindSafe,
    },
    rc::{
        Rc,
        Weak,
    },
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of scheduler identifiers.
static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Scheduler running a drain pass on this thread.
    static CURRENT: RefCell<Option<Weak<Scheduler>>> = RefCell::new(None);
    /// Schedulers owned by this thread, so wake ups issued here skip the remote queue.
    static REGISTRY: RefCell<HashMap<u64, Weak<Scheduler>>> = RefCell::new(HashMap::new());
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Mutable state of a scheduler.
struct SchedulerState {
    fibers: Slab<Fiber>,
    /// Fibers to dispatch, oldest first.
    ready: VecDeque<FiberId>,
    /// Idle fibers. Reused from the back.
    pool: VecDeque<FiberId>,
    /// Fiber being dispatched, if any.
    active: Option<FiberId>,
    /// Tasks added and not yet finished.
    fibers_active: usize,
    /// A drain pass was requested from the loop controller and has not run yet.
    loop_scheduled: bool,
    stack_high_watermark: usize,
}

/// Fiber scheduler.
pub struct Scheduler {
    id: u64,
    self_ref: Weak<Scheduler>,
    state: RefCell<SchedulerState>,
    remote: Arc<RemoteQueue>,
    controller: Box<dyn LoopController>,
    options: SchedulerOptions,
    exception_callback: ExceptionCallback,
}

/// Handle to a scheduler.
#[derive(Clone)]
pub struct SharedScheduler(Rc<Scheduler>);

/// Makes a scheduler the current one for the duration of a drain pass.
struct CurrentGuard {
    previous: Option<Weak<Scheduler>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scheduler {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn controller(&self) -> &dyn LoopController {
        self.controller.as_ref()
    }

    /// Runs `func` in a new fiber.
    pub fn add_task<F: FnOnce() + 'static>(&self, func: F) -> Result<(), Fail> {
        self.add_task_internal(TaskPayload::Detached(Box::new(func)))
    }

    /// Runs `func` in a new fiber and hands its outcome to `finally`, which runs on the scheduler's own stack after the
    /// fiber is done. A panic in `func` reaches `finally` as a failure.
    pub fn add_task_finally<T, F, G>(&self, func: F, finally: G) -> Result<(), Fail>
    where
        T: 'static,
        F: FnOnce() -> Result<T, Fail> + 'static,
        G: FnOnce(Result<T, Fail>) + 'static,
    {
        let body: Box<dyn FnOnce() -> Box<dyn FnOnce()>> = Box::new(move || {
            let result: Result<T, Fail> = match panic::catch_unwind(AssertUnwindSafe(func)) {
                Ok(result) => result,
                Err(payload) => Err(Fail::from_panic(payload)),
            };
            let finally: Box<dyn FnOnce()> = Box::new(move || finally(result));
            finally
        });
        self.add_task_internal(TaskPayload::WithFinally(body))
    }

    /// Returns a handle that other threads may use to submit tasks.
    pub fn remote(&self) -> RemoteScheduler {
        RemoteScheduler::new(self.remote.clone())
    }

    fn add_task_internal(&self, payload: TaskPayload) -> Result<(), Fail> {
        let id: FiberId = self.acquire_fiber()?;
        {
            let mut state = self.state.borrow_mut();
            state.fibers[id].arm(payload);
            state.fibers_active += 1;
            state.ready.push_back(id);
        }
        self.ensure_loop_scheduled();
        Ok(())
    }

    /// Takes a fiber from the pool, or creates one.
    fn acquire_fiber(&self) -> Result<FiberId, Fail> {
        let mut state = self.state.borrow_mut();
        if let Some(id) = state.pool.pop_back() {
            trace!("acquire_fiber(): reusing fiber {}", id);
            return Ok(id);
        }

        let entry = state.fibers.vacant_entry();
        let id: FiberId = entry.key();
        let context: ExecutionContext = ExecutionContext::new(
            self.options.stack_size,
            self.options.debug_record_stack_used,
            fiber_main(self.self_ref.clone(), id),
        )?;
        entry.insert(Fiber::new(context));
        trace!("acquire_fiber(): allocated fiber {}", id);
        Ok(id)
    }

    /// Returns a finished fiber to the pool, or destroys it if the pool is full.
    fn recycle_fiber(&self, id: FiberId) {
        let evicted: Option<Fiber> = {
            let mut state = self.state.borrow_mut();
            let state: &mut SchedulerState = &mut state;
            state.fibers_active -= 1;
            let fiber: &mut Fiber = &mut state.fibers[id];
            if let Some(used) = fiber.stack_used() {
                state.stack_high_watermark = state.stack_high_watermark.max(used);
            }
            fiber.reset();

            match self.options.max_fibers_pool_size {
                Some(max) if state.pool.len() >= max => {
                    trace!("recycle_fiber(): pool is full, destroying fiber {}", id);
                    Some(state.fibers.remove(id))
                },
                _ => {
                    state.pool.push_back(id);
                    None
                },
            }
        };
        if let Some(fiber) = evicted {
            fiber.destroy();
        }
    }

    /// Requests a drain pass from the loop controller, unless one is already pending.
    fn ensure_loop_scheduled(&self) {
        let schedule: bool = {
            let mut state = self.state.borrow_mut();
            !std::mem::replace(&mut state.loop_scheduled, true)
        };
        if schedule {
            self.controller.schedule();
        }
    }

    /// Marks an awaiting fiber ready. Owning thread only.
    pub(crate) fn ready_fiber(&self, id: FiberId) {
        {
            let mut state = self.state.borrow_mut();
            state.fibers[id].set_state(FiberState::ReadyToRun);
            state.ready.push_back(id);
        }
        self.ensure_loop_scheduled();
    }

    /// Builds a waker for the fiber being dispatched.
    pub(crate) fn waker_for_active(&self) -> FiberWaker {
        let id: FiberId = match self.state.borrow().active {
            Some(id) => id,
            None => panic!("no fiber is running"),
        };
        FiberWaker::new(id, self.id, self.remote.clone())
    }

    /// Parks the fiber being dispatched and returns where to switch out to. See [suspend_current].
    fn prepare_suspend(&self, func: Option<Box<dyn FnOnce()>>, resume_immediately: bool) -> SuspendPoint {
        let mut state = self.state.borrow_mut();
        let state: &mut SchedulerState = &mut state;
        let id: FiberId = match state.active {
            Some(id) => id,
            None => panic!("suspend outside of a fiber"),
        };
        let fiber: &mut Fiber = &mut state.fibers[id];
        fiber.prepare_await(func, resume_immediately);
        state.stack_high_watermark = state.stack_high_watermark.max(fiber.stack_position());
        fiber.suspend_point()
    }

    /// Called on the fiber stack when a task starts.
    pub(crate) fn begin_fiber_task(&self, id: FiberId, suspend: SuspendPoint) -> (Option<TaskPayload>, ExceptionCallback) {
        let mut state = self.state.borrow_mut();
        let fiber: &mut Fiber = &mut state.fibers[id];
        fiber.set_suspend_point(suspend);
        (fiber.take_payload(), self.exception_callback.clone())
    }

    /// Called on the fiber stack when a task is done.
    pub(crate) fn end_fiber_task(&self, id: FiberId, finally: Option<Box<dyn FnOnce()>>) {
        let mut state = self.state.borrow_mut();
        let state: &mut SchedulerState = &mut state;
        let fiber: &mut Fiber = &mut state.fibers[id];
        state.stack_high_watermark = state.stack_high_watermark.max(fiber.stack_position());
        fiber.finish(finally);
    }

    /// Dispatches a ready fiber until it suspends or finishes.
    fn run_ready_fiber(&self, id: FiberId) {
        loop {
            let mut context: ExecutionContext = {
                let mut state = self.state.borrow_mut();
                state.active = Some(id);
                let fiber: &mut Fiber = &mut state.fibers[id];
                fiber.set_state(FiberState::Running);
                fiber.take_context()
            };

            if context.switch_into(HANDOFF_RESUME).is_none() {
                panic!("fiber {} left its entry loop while dispatched", id);
            }

            let (func, resume_immediately, finished): (Option<Box<dyn FnOnce()>>, bool, bool) = {
                let mut state = self.state.borrow_mut();
                state.active = None;
                let fiber: &mut Fiber = &mut state.fibers[id];
                fiber.restore_context(context);
                match fiber.state() {
                    FiberState::Awaiting => {
                        let (func, resume_immediately) = fiber.take_main_context_func();
                        (func, resume_immediately, false)
                    },
                    FiberState::Invalid => (fiber.take_finally(), false, true),
                    state => panic!("fiber {} switched out in state {:?}", id, state),
                }
            };

            if let Some(func) = func {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(func)) {
                    let context: &str = if finished {
                        "running finally func"
                    } else {
                        "running main context func"
                    };
                    (self.exception_callback)(&Fail::from_panic(payload), context);
                }
            }

            if finished {
                self.recycle_fiber(id);
                return;
            }
            if !resume_immediately {
                return;
            }
            self.state.borrow_mut().fibers[id].set_state(FiberState::ReadyToRun);
        }
    }

    /// Runs ready fibers until there are none left, including the ones other threads woke or submitted meanwhile.
    /// Returns whether tasks are still outstanding (suspended fibers).
    pub fn loop_until_no_ready(&self) -> bool {
        assert!(!self.has_active_fiber(), "loop_until_no_ready() called from a fiber");
        let _guard: CurrentGuard = CurrentGuard::enter(self.self_ref.clone());
        self.state.borrow_mut().loop_scheduled = true;

        loop {
            self.remote.begin_pass();
            let mut had_remote: bool = false;

            for id in self.remote.take_ready() {
                had_remote = true;
                let mut state = self.state.borrow_mut();
                state.fibers[id].set_state(FiberState::ReadyToRun);
                state.ready.push_back(id);
            }

            let tasks: Vec<RemoteTask> = self.remote.take_tasks();
            for task in tasks {
                had_remote = true;
                if let Err(e) = self.add_task_internal(TaskPayload::Detached(task)) {
                    (self.exception_callback)(&e, "adding remote task");
                }
            }

            loop {
                let next: Option<FiberId> = self.state.borrow_mut().ready.pop_front();
                match next {
                    Some(id) => self.run_ready_fiber(id),
                    None => break,
                }
            }

            if !had_remote {
                break;
            }
        }

        let mut state = self.state.borrow_mut();
        state.loop_scheduled = false;
        state.fibers_active > 0
    }

    /// Are there tasks that did not finish yet, locally or queued by other threads?
    pub fn has_tasks(&self) -> bool {
        self.state.borrow().fibers_active > 0 || self.remote.has_ready() || self.remote.has_tasks()
    }

    /// Is a fiber being dispatched right now?
    pub fn has_active_fiber(&self) -> bool {
        self.state.borrow().active.is_some()
    }

    /// Number of fibers holding a stack, pooled ones included.
    pub fn fibers_allocated(&self) -> usize {
        self.state.borrow().fibers.len()
    }

    /// Number of idle fibers kept for reuse.
    pub fn fibers_pool_size(&self) -> usize {
        self.state.borrow().pool.len()
    }

    /// Deepest stack usage observed on any fiber, in bytes.
    pub fn stack_high_watermark(&self) -> usize {
        self.state.borrow().stack_high_watermark
    }
}

impl SharedScheduler {
    /// Creates a scheduler driven by `controller`.
    pub fn new<C: LoopController + 'static>(controller: C, options: SchedulerOptions) -> Self {
        let scheduler: Rc<Scheduler> = Rc::new_cyclic(|self_ref: &Weak<Scheduler>| {
            controller.attach(self_ref.clone());
            let remote: Arc<RemoteQueue> = Arc::new(RemoteQueue::new(controller.thread_safe()));
            Scheduler {
                id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
                self_ref: self_ref.clone(),
                state: RefCell::new(SchedulerState {
                    fibers: Slab::new(),
                    ready: VecDeque::new(),
                    pool: VecDeque::new(),
                    active: None,
                    fibers_active: 0,
                    loop_scheduled: false,
                    stack_high_watermark: 0,
                }),
                remote,
                controller: Box::new(controller),
                exception_callback: options.exception_callback(),
                options,
            }
        });
        REGISTRY.with(|registry| {
            registry
                .borrow_mut()
                .insert(scheduler.id, Rc::downgrade(&scheduler))
        });
        debug!("new(): scheduler {} ({:?})", scheduler.id, scheduler.options);
        Self(scheduler)
    }

    /// Scheduler running a drain pass on this thread.
    pub fn current() -> Option<Self> {
        CURRENT
            .try_with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
            .ok()
            .flatten()
            .map(Self)
    }

    /// Is the caller running inside a fiber?
    pub fn in_fiber() -> bool {
        match Self::current() {
            Some(scheduler) => scheduler.has_active_fiber(),
            None => false,
        }
    }
}

impl CurrentGuard {
    fn enter(scheduler: Weak<Scheduler>) -> Self {
        let previous: Option<Weak<Scheduler>> = CURRENT.with(|current| current.replace(Some(scheduler)));
        Self { previous }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Finds a scheduler owned by this thread.
pub(crate) fn lookup(id: u64) -> Option<Rc<Scheduler>> {
    REGISTRY
        .try_with(|registry| registry.borrow().get(&id).and_then(Weak::upgrade))
        .ok()
        .flatten()
}

/// Suspends the calling fiber. `func` runs on the scheduler's stack right after the switch. With `resume_immediately`
/// the fiber is dispatched again as soon as `func` returns, otherwise it stays parked until woken.
///
/// No strong reference to the scheduler is held while the fiber is parked.
pub(crate) fn suspend_current(func: Option<Box<dyn FnOnce()>>, resume_immediately: bool) {
    let suspend: SuspendPoint = match SharedScheduler::current() {
        Some(scheduler) => scheduler.prepare_suspend(func, resume_immediately),
        None => panic!("suspend outside of a fiber"),
    };
    suspend.switch_out(HANDOFF_RESUME);
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedScheduler {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous: Option<Weak<Scheduler>> = self.previous.take();
        let _ = CURRENT.try_with(|current| *current.borrow_mut() = previous);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = REGISTRY.try_with(|registry| registry.borrow_mut().remove(&self.id));
        let state: &mut SchedulerState = self.state.get_mut();
        if state.fibers_active > 0 {
            warn!("drop(): scheduler {} dropped with {} unfinished tasks", self.id, state.fibers_active);
        }
        let fibers: Vec<Fiber> = state.fibers.drain().collect();
        for fiber in fibers {
            fiber.destroy();
        }
    }
}

impl fmt::Debug for SharedScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedScheduler")
            .field("id", &self.id)
            .field("fibers_allocated", &self.fibers_allocated())
            .field("fibers_pool_size", &self.fibers_pool_size())
            .finish_non_exhaustive()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
