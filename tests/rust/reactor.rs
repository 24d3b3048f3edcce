// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::fibers::{
    runtime::logging,
    Baton,
    Fail,
    RemoteScheduler,
    SchedulerOptions,
    SharedScheduler,
    TokioLoopController,
};
use ::std::{
    cell::Cell,
    rc::Rc,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};
use ::tokio::{
    runtime::{
        Builder,
        Runtime,
    },
    task::LocalSet,
    time,
};

//======================================================================================================================
// Helper Functions
//======================================================================================================================

/// Builds a scheduler driven by a tokio local set on a current-thread runtime.
fn new_reactor() -> Result<(Runtime, LocalSet, SharedScheduler)> {
    logging::initialize();
    let runtime: Runtime = Builder::new_current_thread().enable_time().build()?;
    let local: LocalSet = LocalSet::new();
    let controller: TokioLoopController = TokioLoopController::new();
    let scheduler: SharedScheduler = SharedScheduler::new(controller.clone(), SchedulerOptions::default());
    controller.attach_local_set(&local);
    Ok((runtime, local, scheduler))
}

/// Polls until `scheduler` has no outstanding task, for at most `limit`.
async fn settle(scheduler: &SharedScheduler, limit: Duration) {
    let start: Instant = Instant::now();
    while scheduler.has_tasks() && start.elapsed() < limit {
        time::sleep(Duration::from_millis(1)).await;
    }
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// A post issued on the reactor resumes a fiber timed wait well before its deadline.
#[test]
fn test_timed_wait_posted_by_reactor_timer() -> Result<()> {
    let (runtime, local, scheduler): (Runtime, LocalSet, SharedScheduler) = new_reactor()?;
    let baton: Rc<Baton> = Rc::new(Baton::new());
    let outcome: Rc<Cell<Option<(bool, Duration)>>> = Rc::new(Cell::new(None));

    let baton_: Rc<Baton> = baton.clone();
    let outcome_: Rc<Cell<Option<(bool, Duration)>>> = outcome.clone();
    local.block_on(&runtime, async {
        scheduler.add_task(move || {
            let start: Instant = Instant::now();
            let posted: bool = baton_.timed_wait(Duration::from_millis(130));
            outcome_.set(Some((posted, start.elapsed())));
        })?;
        time::sleep(Duration::from_millis(100)).await;
        baton.post();
        settle(&scheduler, Duration::from_secs(5)).await;
        Ok::<(), Fail>(())
    })?;

    match outcome.get() {
        Some((posted, elapsed)) => {
            fibers::ensure_eq!(posted, true);
            fibers::ensure_eq!(elapsed >= Duration::from_millis(95), true);
            fibers::ensure_eq!(elapsed <= Duration::from_millis(110), true);
        },
        None => anyhow::bail!("fiber did not finish"),
    }
    Ok(())
}

/// Without a post the reactor timer resumes the fiber at its deadline.
#[test]
fn test_timed_wait_times_out_on_reactor() -> Result<()> {
    let (runtime, local, scheduler): (Runtime, LocalSet, SharedScheduler) = new_reactor()?;
    let outcome: Rc<Cell<Option<(bool, Duration)>>> = Rc::new(Cell::new(None));
    let outcome_: Rc<Cell<Option<(bool, Duration)>>> = outcome.clone();
    local.block_on(&runtime, async {
        scheduler.add_task(move || {
            let baton: Baton = Baton::new();
            let start: Instant = Instant::now();
            let posted: bool = baton.timed_wait(Duration::from_millis(30));
            outcome_.set(Some((posted, start.elapsed())));
        })?;
        settle(&scheduler, Duration::from_secs(5)).await;
        Ok::<(), Fail>(())
    })?;

    match outcome.get() {
        Some((posted, elapsed)) => {
            fibers::ensure_eq!(posted, false);
            fibers::ensure_eq!(elapsed >= Duration::from_millis(30), true);
        },
        None => anyhow::bail!("fiber did not finish"),
    }
    Ok(())
}

/// Remote tasks wake the reactor's drain task through the thread-safe signal.
#[test]
fn test_remote_tasks_on_reactor() -> Result<()> {
    let (runtime, local, scheduler): (Runtime, LocalSet, SharedScheduler) = new_reactor()?;
    let baton: Arc<Baton> = Arc::new(Baton::new());
    let remote: RemoteScheduler = scheduler.remote();
    let baton_: Arc<Baton> = baton.clone();
    local.block_on(&runtime, async {
        let submitter: std::thread::JoinHandle<()> = std::thread::spawn(move || {
            remote.add_task_remote(move || baton_.post());
        });
        settle(&scheduler, Duration::from_secs(5)).await;
        // The task may not have been queued by the time the first settle returned.
        while !submitter.is_finished() {
            time::sleep(Duration::from_millis(1)).await;
        }
        settle(&scheduler, Duration::from_secs(5)).await;
        submitter.join().map_err(|_| Fail::new(libc::EIO, "submitter thread panicked"))?;
        Ok::<(), Fail>(())
    })?;
    fibers::ensure_eq!(baton.try_wait(), true);
    Ok(())
}
