// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::fibers::{
    add_tasks,
    await_promise,
    for_each,
    runtime::logging,
    when_all,
    when_any,
    when_n,
    Fail,
    Promise,
    SchedulerOptions,
    SharedScheduler,
    SimpleLoopController,
    TaskIterator,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Promises handed out by parked tasks, with the index of the task that parked.
type Pending = Rc<RefCell<Vec<(usize, Promise<usize>)>>>;

type Task = Box<dyn FnOnce() -> Result<usize, Fail>>;

//======================================================================================================================
// Helper Functions
//======================================================================================================================

fn new_scheduler() -> (SimpleLoopController, SharedScheduler) {
    logging::initialize();
    let controller: SimpleLoopController = SimpleLoopController::new();
    let scheduler: SharedScheduler = SharedScheduler::new(controller.clone(), SchedulerOptions::default());
    (controller, scheduler)
}

/// Tasks that park until the test loop fulfils their promise. The promise carries the task index times ten.
fn parked_tasks(pending: &Pending, count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| -> Task {
            let pending: Pending = pending.clone();
            Box::new(move || await_promise(move |promise: Promise<usize>| pending.borrow_mut().push((i, promise))))
        })
        .collect()
}

/// Runs `body` in a fiber and drives the pull loop, fulfilling the most recently parked promise on each iteration
/// until the fiber is done. Returns the number of promises fulfilled.
fn drive<F: FnOnce() + 'static>(pending: &Pending, body: F) -> Result<usize> {
    let (controller, scheduler): (SimpleLoopController, SharedScheduler) = new_scheduler();
    let done: Rc<Cell<bool>> = Rc::new(Cell::new(false));
    let done_: Rc<Cell<bool>> = done.clone();
    scheduler.add_task(move || {
        body();
        done_.set(true);
    })?;

    let mut fulfilled: usize = 0;
    let controller_: SimpleLoopController = controller.clone();
    controller.run_loop(|| {
        let next: Option<(usize, Promise<usize>)> = pending.borrow_mut().pop();
        match next {
            Some((i, promise)) => {
                fulfilled += 1;
                promise.set_value(i * 10);
            },
            None if done.get() => controller_.stop(),
            None => (),
        }
    });
    fibers::ensure_eq!(done.get(), true);
    fibers::ensure_eq!(scheduler.has_tasks(), false);
    Ok(fulfilled)
}

//======================================================================================================================
// Tests
//======================================================================================================================

#[test]
fn test_add_tasks() -> Result<()> {
    let pending: Pending = Rc::new(RefCell::new(Vec::new()));
    let tasks: Vec<Task> = parked_tasks(&pending, 3);
    let seen: Rc<RefCell<Vec<(usize, Result<usize, Fail>)>>> = Rc::new(RefCell::new(Vec::new()));
    let seen_: Rc<RefCell<Vec<(usize, Result<usize, Fail>)>>> = seen.clone();
    let fulfilled: usize = drive(&pending, move || {
        let mut iter: TaskIterator<usize> = add_tasks(tasks);
        while iter.has_next() {
            let (id, result): (usize, Result<usize, Fail>) = iter.await_next();
            seen_.borrow_mut().push((id, result));
        }
    })?;
    fibers::ensure_eq!(fulfilled, 3);
    // The loop fulfils the latest parked task first.
    fibers::ensure_eq!(*seen.borrow(), vec![(2, Ok(20)), (1, Ok(10)), (0, Ok(0))]);
    Ok(())
}

/// With room for two, the third task starts only once a completion was consumed.
#[test]
fn test_add_tasks_reserve() -> Result<()> {
    let pending: Pending = Rc::new(RefCell::new(Vec::new()));
    let tasks: Vec<Task> = parked_tasks(&pending, 3);
    let pending_: Pending = pending.clone();
    let flags: Rc<RefCell<Vec<(bool, bool, bool)>>> = Rc::new(RefCell::new(Vec::new()));
    let flags_: Rc<RefCell<Vec<(bool, bool, bool)>>> = flags.clone();
    let max_parked: Rc<Cell<usize>> = Rc::new(Cell::new(0));
    let max_parked_: Rc<Cell<usize>> = max_parked.clone();
    let fulfilled: usize = drive(&pending, move || {
        let mut iter: TaskIterator<usize> = add_tasks(tasks);
        iter.reserve(2);
        record_flags(&iter, &flags_);
        while iter.has_next() {
            let _ = iter.await_next();
            max_parked_.set(max_parked_.get().max(pending_.borrow().len()));
            record_flags(&iter, &flags_);
        }
    })?;
    fibers::ensure_eq!(fulfilled, 3);
    fibers::ensure_eq!(max_parked.get() <= 2, true);
    fibers::ensure_eq!(
        *flags.borrow(),
        vec![(false, true, true), (false, true, true), (false, true, true), (false, false, false)]
    );
    Ok(())
}

fn record_flags(iter: &TaskIterator<usize>, flags: &Rc<RefCell<Vec<(bool, bool, bool)>>>) {
    flags
        .borrow_mut()
        .push((iter.has_completed(), iter.has_pending(), iter.has_next()));
}

#[test]
fn test_for_each() -> Result<()> {
    let pending: Pending = Rc::new(RefCell::new(Vec::new()));
    let tasks: Vec<Task> = parked_tasks(&pending, 3);
    let seen: Rc<RefCell<Vec<(usize, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    let seen_: Rc<RefCell<Vec<(usize, usize)>>> = seen.clone();
    drive(&pending, move || {
        for_each(tasks, |id, result| {
            if let Ok(value) = result {
                seen_.borrow_mut().push((id, value));
            }
        })
    })?;
    fibers::ensure_eq!(*seen.borrow(), vec![(2, 20), (1, 10), (0, 0)]);
    Ok(())
}

#[test]
fn test_when_n() -> Result<()> {
    let pending: Pending = Rc::new(RefCell::new(Vec::new()));
    let tasks: Vec<Task> = parked_tasks(&pending, 3);
    let outcome: Rc<RefCell<Option<Result<Vec<(usize, usize)>, Fail>>>> = Rc::new(RefCell::new(None));
    let outcome_: Rc<RefCell<Option<Result<Vec<(usize, usize)>, Fail>>>> = outcome.clone();
    let fulfilled: usize = drive(&pending, move || *outcome_.borrow_mut() = Some(when_n(tasks, 2)))?;
    // The third task still runs to completion after when_n returned.
    fibers::ensure_eq!(fulfilled, 3);
    fibers::ensure_eq!(outcome.borrow_mut().take(), Some(Ok(vec![(2, 20), (1, 10)])));
    Ok(())
}

#[test]
fn test_when_all_keeps_submission_order() -> Result<()> {
    let pending: Pending = Rc::new(RefCell::new(Vec::new()));
    let tasks: Vec<Task> = parked_tasks(&pending, 4);
    let outcome: Rc<RefCell<Option<Result<Vec<usize>, Fail>>>> = Rc::new(RefCell::new(None));
    let outcome_: Rc<RefCell<Option<Result<Vec<usize>, Fail>>>> = outcome.clone();
    drive(&pending, move || *outcome_.borrow_mut() = Some(when_all(tasks)))?;
    fibers::ensure_eq!(outcome.borrow_mut().take(), Some(Ok(vec![0, 10, 20, 30])));
    Ok(())
}

#[test]
fn test_when_all_drains_before_failing() -> Result<()> {
    let pending: Pending = Rc::new(RefCell::new(Vec::new()));
    let mut tasks: Vec<Task> = parked_tasks(&pending, 2);
    tasks.insert(0, Box::new(|| -> Result<usize, Fail> { Err(Fail::new(libc::EIO, "failed early")) }));
    let outcome: Rc<RefCell<Option<Result<Vec<usize>, Fail>>>> = Rc::new(RefCell::new(None));
    let outcome_: Rc<RefCell<Option<Result<Vec<usize>, Fail>>>> = outcome.clone();
    let pending_: Pending = pending.clone();
    let parked_at_return: Rc<Cell<usize>> = Rc::new(Cell::new(usize::MAX));
    let parked_at_return_: Rc<Cell<usize>> = parked_at_return.clone();
    let fulfilled: usize = drive(&pending, move || {
        *outcome_.borrow_mut() = Some(when_all(tasks));
        parked_at_return_.set(pending_.borrow().len());
    })?;
    fibers::ensure_eq!(fulfilled, 2);
    fibers::ensure_eq!(parked_at_return.get(), 0);
    fibers::ensure_eq!(outcome.borrow_mut().take(), Some(Err(Fail::new(libc::EIO, "failed early"))));
    Ok(())
}

/// when_any returns the first completion, and only after every promise was fulfilled.
#[test]
fn test_when_any() -> Result<()> {
    let pending: Pending = Rc::new(RefCell::new(Vec::new()));
    let tasks: Vec<Task> = parked_tasks(&pending, 3);
    let outcome: Rc<RefCell<Option<Result<(usize, usize), Fail>>>> = Rc::new(RefCell::new(None));
    let outcome_: Rc<RefCell<Option<Result<(usize, usize), Fail>>>> = outcome.clone();
    let pending_: Pending = pending.clone();
    let parked_at_return: Rc<Cell<usize>> = Rc::new(Cell::new(usize::MAX));
    let parked_at_return_: Rc<Cell<usize>> = parked_at_return.clone();
    let fulfilled: usize = drive(&pending, move || {
        *outcome_.borrow_mut() = Some(when_any(tasks));
        parked_at_return_.set(pending_.borrow().len());
    })?;
    fibers::ensure_eq!(fulfilled, 3);
    fibers::ensure_eq!(parked_at_return.get(), 0);
    fibers::ensure_eq!(outcome.borrow_mut().take(), Some(Ok((2, 20))));
    Ok(())
}
