// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::{
        current_stack_position,
        ExecutionContext,
        SuspendPoint,
    },
    fail::Fail,
    scheduler::{
        self,
        ExceptionCallback,
        Scheduler,
        SharedScheduler,
    },
};
use ::std::{
    any::Any,
    cell::RefCell,
    fmt,
    mem,
    panic::{
        self,
        AssertUnwindSafe,
    },
    rc::{
        Rc,
        Weak,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Handoff that asks a fiber to run its next task.
pub const HANDOFF_RESUME: usize = 0;
/// Handoff that asks an idle fiber to leave its entry loop.
pub const HANDOFF_EXIT: usize = 1;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Stable handle of a fiber slot inside its scheduler.
pub type FiberId = usize;

/// Life cycle of a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    /// Armed with a task (or idle in the pool) and never dispatched for it.
    NotStarted,
    /// Currently executing on the owning thread.
    Running,
    /// Woken up and queued for dispatch.
    ReadyToRun,
    /// Suspended until a baton is posted.
    Awaiting,
    /// Finished its task and waiting to be recycled.
    Invalid,
}

/// Work a fiber runs.
pub enum TaskPayload {
    /// A closure whose failures go to the scheduler's exception callback.
    Detached(Box<dyn FnOnce()>),
    /// A closure run on the fiber that returns a continuation to run on the scheduler's stack once the fiber is done.
    WithFinally(Box<dyn FnOnce() -> Box<dyn FnOnce()>>),
}

/// A fiber slot.
pub struct Fiber {
    state: FiberState,
    /// Taken out while the fiber runs.
    context: Option<ExecutionContext>,
    suspend_point: Option<SuspendPoint>,
    stack_base: usize,
    payload: Option<TaskPayload>,
    /// Runs on the scheduler's stack right after the fiber switched out.
    main_context_func: Option<Box<dyn FnOnce()>>,
    /// Dispatch the fiber again as soon as `main_context_func` returns.
    resume_immediately: bool,
    finally: Option<Box<dyn FnOnce()>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Fiber {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            state: FiberState::NotStarted,
            stack_base: context.stack_base(),
            context: Some(context),
            suspend_point: None,
            payload: None,
            main_context_func: None,
            resume_immediately: false,
            finally: None,
        }
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    /// Moves the fiber along its life cycle. Panics on a transition the life cycle does not allow.
    pub fn set_state(&mut self, next: FiberState) {
        let legal: bool = matches!(
            (self.state, next),
            (FiberState::NotStarted, FiberState::Running)
                | (FiberState::Running, FiberState::Awaiting)
                | (FiberState::Running, FiberState::Invalid)
                | (FiberState::Awaiting, FiberState::ReadyToRun)
                | (FiberState::ReadyToRun, FiberState::Running)
                | (FiberState::Invalid, FiberState::NotStarted)
        );
        assert!(legal, "illegal fiber transition ({:?} -> {:?})", self.state, next);
        self.state = next;
    }

    /// Hands a task to an idle fiber.
    pub fn arm(&mut self, payload: TaskPayload) {
        assert_eq!(self.state, FiberState::NotStarted);
        debug_assert!(self.payload.is_none());
        self.payload = Some(payload);
    }

    pub fn take_payload(&mut self) -> Option<TaskPayload> {
        self.payload.take()
    }

    pub fn take_context(&mut self) -> ExecutionContext {
        match self.context.take() {
            Some(context) => context,
            None => panic!("fiber context is already in use"),
        }
    }

    pub fn restore_context(&mut self, context: ExecutionContext) {
        debug_assert!(self.context.is_none());
        self.context = Some(context);
    }

    pub fn set_suspend_point(&mut self, suspend_point: SuspendPoint) {
        self.suspend_point = Some(suspend_point);
    }

    pub fn suspend_point(&self) -> SuspendPoint {
        match self.suspend_point {
            Some(suspend_point) => suspend_point,
            None => panic!("fiber never started"),
        }
    }

    /// Parks the fiber. `func` runs on the scheduler's stack once the switch happened.
    pub fn prepare_await(&mut self, func: Option<Box<dyn FnOnce()>>, resume_immediately: bool) {
        self.set_state(FiberState::Awaiting);
        self.main_context_func = func;
        self.resume_immediately = resume_immediately;
    }

    /// Retrieves what the scheduler should do after the fiber switched out: a function to run on its own stack and
    /// whether to dispatch the fiber again right away.
    pub fn take_main_context_func(&mut self) -> (Option<Box<dyn FnOnce()>>, bool) {
        (self.main_context_func.take(), mem::take(&mut self.resume_immediately))
    }

    pub fn finish(&mut self, finally: Option<Box<dyn FnOnce()>>) {
        self.set_state(FiberState::Invalid);
        self.finally = finally;
    }

    pub fn take_finally(&mut self) -> Option<Box<dyn FnOnce()>> {
        self.finally.take()
    }

    /// Clears leftovers of the previous task so the fiber may be pooled.
    pub fn reset(&mut self) {
        self.payload = None;
        self.main_context_func = None;
        self.finally = None;
        self.set_state(FiberState::NotStarted);
    }

    /// Depth of the current frame on this fiber's stack. Only meaningful when called on that stack.
    pub fn stack_position(&self) -> usize {
        self.stack_base.saturating_sub(current_stack_position())
    }

    /// Stack usage measured through the fill pattern, if enabled.
    pub fn stack_used(&self) -> Option<usize> {
        self.context.as_ref().and_then(ExecutionContext::stack_used)
    }

    /// Releases the fiber stack. Fibers suspended in the middle of a task cannot be unwound, so they are leaked.
    pub fn destroy(mut self) {
        match self.state {
            FiberState::Awaiting | FiberState::ReadyToRun | FiberState::Running => {
                warn!("destroy(): leaking a fiber suspended in the middle of a task");
                mem::forget(self);
            },
            FiberState::NotStarted | FiberState::Invalid => {
                if let Some(mut context) = self.context.take() {
                    if context.started() && !context.done() {
                        context.switch_into(HANDOFF_EXIT);
                    }
                }
            },
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Builds the function every fiber runs on its own stack. It runs one task per dispatch and parks itself between
/// tasks, so a pooled fiber keeps its stack warm. No strong reference to the scheduler is held while the task runs.
pub fn fiber_main(scheduler: Weak<Scheduler>, id: FiberId) -> impl FnOnce(SuspendPoint, usize) + 'static {
    move |suspend: SuspendPoint, mut handoff: usize| loop {
        if handoff == HANDOFF_EXIT {
            return;
        }
        let (payload, exception_callback): (Option<TaskPayload>, ExceptionCallback) = match scheduler.upgrade() {
            Some(scheduler) => scheduler.begin_fiber_task(id, suspend),
            None => return,
        };

        let finally: Option<Box<dyn FnOnce()>> = match payload {
            Some(TaskPayload::Detached(body)) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                    exception_callback(&Fail::from_panic(payload), "running task");
                }
                None
            },
            Some(TaskPayload::WithFinally(body)) => match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(finally) => Some(finally),
                Err(payload) => {
                    exception_callback(&Fail::from_panic(payload), "running task");
                    None
                },
            },
            None => {
                warn!("fiber_main(): fiber {} dispatched without a task", id);
                None
            },
        };
        drop(exception_callback);

        match scheduler.upgrade() {
            Some(scheduler) => scheduler.end_fiber_task(id, finally),
            None => return,
        }
        handoff = suspend.switch_out(HANDOFF_RESUME);
    }
}

/// Runs `func` on the scheduler's stack instead of the calling fiber's and returns its result. Useful for code with
/// deep stacks. Outside a fiber, `func` is just called.
pub fn run_in_main_context<F, R>(func: F) -> R
where
    F: FnOnce() -> R + 'static,
    R: 'static,
{
    if !SharedScheduler::in_fiber() {
        return func();
    }

    let slot: Rc<RefCell<Option<Result<R, Box<dyn Any + Send>>>>> = Rc::new(RefCell::new(None));
    let slot_: Rc<RefCell<Option<Result<R, Box<dyn Any + Send>>>>> = slot.clone();
    scheduler::suspend_current(
        Some(Box::new(move || {
            let result: Result<R, Box<dyn Any + Send>> = panic::catch_unwind(AssertUnwindSafe(func));
            *slot_.borrow_mut() = Some(result);
        })),
        true,
    );

    let result: Option<Result<R, Box<dyn Any + Send>>> = slot.borrow_mut().take();
    match result {
        Some(Ok(value)) => value,
        Some(Err(payload)) => panic::resume_unwind(payload),
        None => panic!("main context function did not run"),
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("state", &self.state)
            .field("stack_base", &format_args!("{:#x}", self.stack_base))
            .finish_non_exhaustive()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
