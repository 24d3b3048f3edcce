// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    promise::{
        await_promise,
        Promise,
    },
    scheduler::SharedScheduler,
};
use ::std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    panic::{
        self,
        AssertUnwindSafe,
    },
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Body of a child task.
type TaskFn<T> = Box<dyn FnOnce() -> Result<T, Fail>>;

/// State shared by a [TaskIterator] and the children it launched. Children keep it alive, so completions that arrive
/// after the iterator is gone land here and are dropped with it.
struct Context<T> {
    /// Closures not launched yet, with their submission index.
    queued: VecDeque<(usize, TaskFn<T>)>,
    /// Completions not consumed yet, in completion order.
    completed: VecDeque<(usize, Result<T, Fail>)>,
    /// Launched and not completed.
    running: usize,
    /// Launched and not consumed.
    in_flight: usize,
    /// Maximum of `in_flight`.
    limit: Option<usize>,
    /// Fiber suspended in [TaskIterator::await_next].
    waiter: Option<Promise<()>>,
}

/// Iterates over the completions of a batch of child tasks, in completion order.
pub struct TaskIterator<T: 'static> {
    context: Rc<RefCell<Context<T>>>,
    last_id: Option<usize>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: 'static> Context<T> {
    fn complete(context: &Rc<RefCell<Context<T>>>, id: usize, result: Result<T, Fail>) {
        let waiter: Option<Promise<()>> = {
            let mut context = context.borrow_mut();
            context.running -= 1;
            context.completed.push_back((id, result));
            context.waiter.take()
        };
        if let Some(waiter) = waiter {
            waiter.set_value(());
        }
    }
}

impl<T: 'static> TaskIterator<T> {
    /// Is there a completion left to consume, now or later?
    pub fn has_next(&self) -> bool {
        self.has_completed() || self.has_pending()
    }

    /// Are there children that did not complete yet, launched or not?
    pub fn has_pending(&self) -> bool {
        let context = self.context.borrow();
        context.running > 0 || !context.queued.is_empty()
    }

    /// Is a completion ready to be consumed without suspending?
    pub fn has_completed(&self) -> bool {
        !self.context.borrow().completed.is_empty()
    }

    /// Bounds the number of children launched and not consumed yet to `n`. Applies to children launched after this
    /// call.
    pub fn reserve(&mut self, n: usize) {
        assert!(n > 0, "reserve() needs room for at least one task");
        self.context.borrow_mut().limit = Some(n);
    }

    /// Index, in submission order, of the task whose completion [Self::await_next] returned last.
    pub fn get_task_id(&self) -> usize {
        match self.last_id {
            Some(id) => id,
            None => panic!("get_task_id() called before await_next()"),
        }
    }

    /// Suspends the calling fiber until a child completes, and returns its submission index and result.
    pub fn await_next(&mut self) -> (usize, Result<T, Fail>) {
        assert!(self.has_next(), "await_next() called with no task left");
        self.launch();

        if !self.has_completed() {
            let context: Rc<RefCell<Context<T>>> = self.context.clone();
            let woken: Result<(), Fail> =
                await_promise(move |promise: Promise<()>| context.borrow_mut().waiter = Some(promise));
            if let Err(e) = woken {
                panic!("await_next(): lost track of child tasks ({:?})", e);
            }
        }

        let next: Option<(usize, Result<T, Fail>)> = {
            let mut context = self.context.borrow_mut();
            context.in_flight -= 1;
            context.completed.pop_front()
        };
        let (id, result): (usize, Result<T, Fail>) = match next {
            Some(next) => next,
            None => panic!("await_next() woken without a completion"),
        };
        self.last_id = Some(id);
        self.launch();
        (id, result)
    }

    /// Starts queued children while the concurrency limit allows.
    fn launch(&self) {
        loop {
            let (id, func): (usize, TaskFn<T>) = {
                let mut context = self.context.borrow_mut();
                if context.limit.is_some_and(|limit| context.in_flight >= limit) {
                    return;
                }
                match context.queued.pop_front() {
                    Some(task) => {
                        context.in_flight += 1;
                        context.running += 1;
                        task
                    },
                    None => return,
                }
            };
            spawn_child(&self.context, id, func);
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Schedules `tasks` as child fibers of the calling fiber and returns an iterator over their completions. Children are
/// launched once the iterator is first awaited on.
pub fn add_tasks<T, F, I>(tasks: I) -> TaskIterator<T>
where
    T: 'static,
    F: FnOnce() -> Result<T, Fail> + 'static,
    I: IntoIterator<Item = F>,
{
    assert!(SharedScheduler::in_fiber(), "add_tasks() called outside of a fiber");
    let queued: VecDeque<(usize, TaskFn<T>)> = tasks
        .into_iter()
        .enumerate()
        .map(|(id, func)| -> (usize, TaskFn<T>) { (id, Box::new(func)) })
        .collect();
    trace!("add_tasks(): {} tasks", queued.len());
    TaskIterator {
        context: Rc::new(RefCell::new(Context {
            queued,
            completed: VecDeque::new(),
            running: 0,
            in_flight: 0,
            limit: None,
            waiter: None,
        })),
        last_id: None,
    }
}

fn spawn_child<T: 'static>(context: &Rc<RefCell<Context<T>>>, id: usize, func: TaskFn<T>) {
    let scheduler: SharedScheduler = match SharedScheduler::current() {
        Some(scheduler) => scheduler,
        None => {
            let cause: String = format!("no scheduler to run task {}", id);
            error!("spawn_child(): {}", cause);
            Context::complete(context, id, Err(Fail::new(libc::ESRCH, &cause)));
            return;
        },
    };

    let context_: Rc<RefCell<Context<T>>> = context.clone();
    let added: Result<(), Fail> = scheduler.add_task(move || {
        let result: Result<T, Fail> = match panic::catch_unwind(AssertUnwindSafe(func)) {
            Ok(result) => result,
            Err(payload) => Err(Fail::from_panic(payload)),
        };
        Context::complete(&context_, id, result);
    });
    if let Err(e) = added {
        warn!("spawn_child(): failed to add task {} ({:?})", id, e);
        Context::complete(context, id, Err(e));
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T: 'static> Drop for TaskIterator<T> {
    /// Children not launched yet still run. Their completions are discarded.
    fn drop(&mut self) {
        self.context.borrow_mut().limit = None;
        self.launch();
    }
}

impl<T: 'static> fmt::Debug for TaskIterator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let context = self.context.borrow();
        f.debug_struct("TaskIterator")
            .field("queued", &context.queued.len())
            .field("completed", &context.completed.len())
            .field("running", &context.running)
            .field("limit", &context.limit)
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
