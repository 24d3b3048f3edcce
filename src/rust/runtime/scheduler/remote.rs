// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cross-thread entry points of a scheduler.
//!
//! Other threads never touch scheduler state. They push fiber ids (wake ups) or closures (new tasks) into lock-free
//! channels and ask the loop controller for a drain pass. Requests issued while a pass is already pending are
//! coalesced into one signal.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fiber::FiberId,
    loop_controller::ThreadSafeSchedule,
    scheduler::scheduler,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread::{
        self,
        ThreadId,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Task submitted from another thread.
pub type RemoteTask = Box<dyn FnOnce() + Send>;

/// Queues filled by other threads and drained by the owning thread.
pub struct RemoteQueue {
    ready_tx: Sender<FiberId>,
    ready_rx: Receiver<FiberId>,
    task_tx: Sender<RemoteTask>,
    task_rx: Receiver<RemoteTask>,
    /// Set once a drain pass was requested and cleared when the pass starts.
    wake_pending: AtomicBool,
    signal: Arc<dyn ThreadSafeSchedule>,
}

/// Thread safe handle to submit tasks to a scheduler.
#[derive(Clone)]
pub struct RemoteScheduler {
    remote: Arc<RemoteQueue>,
}

/// Wakes one awaiting fiber. Holds enough to do it from any thread.
pub struct FiberWaker {
    fiber: FiberId,
    scheduler_id: u64,
    owner: ThreadId,
    remote: Arc<RemoteQueue>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RemoteQueue {
    pub fn new(signal: Arc<dyn ThreadSafeSchedule>) -> Self {
        let (ready_tx, ready_rx): (Sender<FiberId>, Receiver<FiberId>) = crossbeam_channel::unbounded();
        let (task_tx, task_rx): (Sender<RemoteTask>, Receiver<RemoteTask>) = crossbeam_channel::unbounded();
        Self {
            ready_tx,
            ready_rx,
            task_tx,
            task_rx,
            wake_pending: AtomicBool::new(false),
            signal,
        }
    }

    /// Queues a wake up for `fiber`.
    pub fn push_ready(&self, fiber: FiberId) {
        if self.ready_tx.send(fiber).is_err() {
            unreachable!("remote ready queue owns its receiver");
        }
        self.request_pass();
    }

    /// Queues a new task.
    pub fn push_task(&self, task: RemoteTask) {
        if self.task_tx.send(task).is_err() {
            unreachable!("remote task queue owns its receiver");
        }
        self.request_pass();
    }

    fn request_pass(&self) {
        if !self.wake_pending.swap(true, Ordering::AcqRel) {
            self.signal.schedule_thread_safe();
        }
    }

    /// Marks the start of a drain pass. Anything queued after this requests a new one.
    pub fn begin_pass(&self) {
        self.wake_pending.store(false, Ordering::Release);
    }

    /// Removes the queued wake ups, in submission order.
    pub fn take_ready(&self) -> Vec<FiberId> {
        self.ready_rx.try_iter().collect()
    }

    /// Removes the queued tasks, in submission order.
    pub fn take_tasks(&self) -> Vec<RemoteTask> {
        self.task_rx.try_iter().collect()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready_rx.is_empty()
    }

    pub fn has_tasks(&self) -> bool {
        !self.task_rx.is_empty()
    }
}

impl RemoteScheduler {
    pub fn new(remote: Arc<RemoteQueue>) -> Self {
        Self { remote }
    }

    /// Runs `func` in a new fiber on the owning thread of the scheduler.
    pub fn add_task_remote<F: FnOnce() + Send + 'static>(&self, func: F) {
        self.remote.push_task(Box::new(func));
    }
}

impl FiberWaker {
    pub fn new(fiber: FiberId, scheduler_id: u64, remote: Arc<RemoteQueue>) -> Self {
        Self {
            fiber,
            scheduler_id,
            owner: thread::current().id(),
            remote,
        }
    }

    /// Marks the fiber ready. On the owning thread this goes straight to the ready queue, anywhere else it goes
    /// through the remote queue.
    pub fn wake(self) {
        if thread::current().id() == self.owner {
            if let Some(scheduler) = scheduler::lookup(self.scheduler_id) {
                scheduler.ready_fiber(self.fiber);
                return;
            }
        }
        self.remote.push_ready(self.fiber);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for RemoteScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteScheduler").finish_non_exhaustive()
    }
}

impl fmt::Debug for FiberWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberWaker")
            .field("fiber", &self.fiber)
            .field("scheduler_id", &self.scheduler_id)
            .finish_non_exhaustive()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
