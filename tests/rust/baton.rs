// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::fibers::{
    runtime::logging,
    Baton,
    SchedulerOptions,
    SharedScheduler,
    SimpleLoopController,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of rounds of the post/timeout race.
const RACE_ROUNDS: usize = 64;

//======================================================================================================================
// Helper Functions
//======================================================================================================================

fn new_scheduler() -> (SimpleLoopController, SharedScheduler) {
    logging::initialize();
    let controller: SimpleLoopController = SimpleLoopController::new();
    let scheduler: SharedScheduler = SharedScheduler::new(controller.clone(), SchedulerOptions::default());
    (controller, scheduler)
}

/// Runs the pull loop until every fiber finished.
fn run_to_completion(controller: &SimpleLoopController) {
    let controller_: SimpleLoopController = controller.clone();
    controller.run_loop(move || controller_.stop());
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// A fiber waiting with a deadline is resumed by the loop controller's timer.
#[test]
fn test_fiber_timed_wait_times_out() -> Result<()> {
    let (controller, scheduler): (SimpleLoopController, SharedScheduler) = new_scheduler();
    let outcome: Rc<Cell<Option<(bool, Duration)>>> = Rc::new(Cell::new(None));
    let outcome_: Rc<Cell<Option<(bool, Duration)>>> = outcome.clone();
    scheduler.add_task(move || {
        let baton: Baton = Baton::new();
        let start: Instant = Instant::now();
        let posted: bool = baton.timed_wait(Duration::from_millis(50));
        outcome_.set(Some((posted, start.elapsed())));
    })?;

    run_to_completion(&controller);
    match outcome.get() {
        Some((posted, elapsed)) => {
            fibers::ensure_eq!(posted, false);
            fibers::ensure_eq!(elapsed >= Duration::from_millis(50), true);
        },
        None => anyhow::bail!("fiber did not finish"),
    }
    Ok(())
}

/// A post that beats the deadline resumes the fiber with `true`, and the stale timer is harmless.
#[test]
fn test_fiber_timed_wait_posted() -> Result<()> {
    let (controller, scheduler): (SimpleLoopController, SharedScheduler) = new_scheduler();
    let baton: Rc<Baton> = Rc::new(Baton::new());
    let outcome: Rc<Cell<Option<bool>>> = Rc::new(Cell::new(None));
    let baton_: Rc<Baton> = baton.clone();
    let outcome_: Rc<Cell<Option<bool>>> = outcome.clone();
    scheduler.add_task(move || outcome_.set(Some(baton_.timed_wait(Duration::from_millis(100)))))?;

    let start: Instant = Instant::now();
    let posted: Cell<bool> = Cell::new(false);
    let controller_: SimpleLoopController = controller.clone();
    controller.run_loop(|| {
        if !posted.get() && start.elapsed() >= Duration::from_millis(10) {
            posted.set(true);
            baton.post();
        }
        // Stay around past the deadline so the stale timer fires.
        if start.elapsed() >= Duration::from_millis(150) {
            controller_.stop();
        }
    });
    fibers::ensure_eq!(outcome.get(), Some(true));
    Ok(())
}

/// The same baton type serves a fiber waiter posted by a thread.
#[test]
fn test_fiber_waits_thread_posts() -> Result<()> {
    let (controller, scheduler): (SimpleLoopController, SharedScheduler) = new_scheduler();
    let baton: Arc<Baton> = Arc::new(Baton::new());
    let done: Rc<Cell<bool>> = Rc::new(Cell::new(false));
    let baton_: Arc<Baton> = baton.clone();
    let done_: Rc<Cell<bool>> = done.clone();
    scheduler.add_task(move || {
        baton_.wait();
        done_.set(true);
    })?;

    let poster: thread::JoinHandle<()> = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        baton.post();
    });
    run_to_completion(&controller);
    poster.join().map_err(|_| anyhow::anyhow!("poster thread panicked"))?;
    fibers::ensure_eq!(done.get(), true);
    Ok(())
}

/// The same baton type serves a thread waiter posted by a fiber.
#[test]
fn test_thread_waits_fiber_posts() -> Result<()> {
    let (controller, scheduler): (SimpleLoopController, SharedScheduler) = new_scheduler();
    let baton: Arc<Baton> = Arc::new(Baton::new());
    let waiter_baton: Arc<Baton> = baton.clone();
    let waiter: thread::JoinHandle<bool> = thread::spawn(move || waiter_baton.timed_wait(Duration::from_secs(10)));

    scheduler.add_task(move || {
        thread::sleep(Duration::from_millis(10));
        baton.post();
    })?;
    run_to_completion(&controller);
    let posted: bool = waiter.join().map_err(|_| anyhow::anyhow!("waiter thread panicked"))?;
    fibers::ensure_eq!(posted, true);
    Ok(())
}

/// Posts from another thread race against the fiber timer. Every round ends with exactly one winner.
#[test]
fn test_post_races_timeout() -> Result<()> {
    let (controller, scheduler): (SimpleLoopController, SharedScheduler) = new_scheduler();
    let mut rng: SmallRng = SmallRng::seed_from_u64(0x5eed);
    let outcomes: Rc<RefCell<Vec<bool>>> = Rc::new(RefCell::new(Vec::new()));

    for _ in 0..RACE_ROUNDS {
        let timeout: Duration = Duration::from_micros(rng.gen_range(0..2000));
        let delay: Duration = Duration::from_micros(rng.gen_range(0..2000));
        let baton: Arc<Baton> = Arc::new(Baton::new());
        let baton_: Arc<Baton> = baton.clone();
        let outcomes_: Rc<RefCell<Vec<bool>>> = outcomes.clone();
        scheduler.add_task(move || outcomes_.borrow_mut().push(baton_.timed_wait(timeout)))?;

        let poster: thread::JoinHandle<()> = thread::spawn(move || {
            thread::sleep(delay);
            baton.post();
        });
        run_to_completion(&controller);
        poster.join().map_err(|_| anyhow::anyhow!("poster thread panicked"))?;
    }

    fibers::ensure_eq!(outcomes.borrow().len(), RACE_ROUNDS);
    fibers::ensure_eq!(scheduler.has_tasks(), false);
    Ok(())
}

/// A thread waiting with a timeout too large to express as a deadline waits until posted.
#[test]
fn test_thread_timed_wait_unbounded() -> Result<()> {
    logging::initialize();
    let baton: Arc<Baton> = Arc::new(Baton::new());
    let baton_: Arc<Baton> = baton.clone();
    let poster: thread::JoinHandle<()> = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        baton_.post();
    });
    fibers::ensure_eq!(baton.timed_wait(Duration::MAX), true);
    poster.join().map_err(|_| anyhow::anyhow!("poster thread panicked"))?;
    Ok(())
}

/// A fiber waiting with a timeout too large to express as a deadline arms no timer and waits until posted.
#[test]
fn test_fiber_timed_wait_unbounded() -> Result<()> {
    let (controller, scheduler): (SimpleLoopController, SharedScheduler) = new_scheduler();
    let baton: Rc<Baton> = Rc::new(Baton::new());
    let outcome: Rc<Cell<Option<bool>>> = Rc::new(Cell::new(None));
    let baton_: Rc<Baton> = baton.clone();
    let outcome_: Rc<Cell<Option<bool>>> = outcome.clone();
    scheduler.add_task(move || outcome_.set(Some(baton_.timed_wait(Duration::MAX))))?;

    fibers::ensure_eq!(scheduler.loop_until_no_ready(), true);
    baton.post();
    run_to_completion(&controller);
    fibers::ensure_eq!(outcome.get(), Some(true));
    fibers::ensure_eq!(scheduler.has_tasks(), false);
    Ok(())
}
