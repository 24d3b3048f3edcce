// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Strategies that decide when a scheduler drains its ready queue.

mod reactor;
mod simple;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    reactor::TokioLoopController,
    simple::SimpleLoopController,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::Scheduler;
use ::std::{
    rc::Weak,
    sync::Arc,
    time::Instant,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Part of a loop controller that other threads may poke.
pub trait ThreadSafeSchedule: Send + Sync {
    /// Requests a drain pass on the owning thread. Callable from any thread.
    fn schedule_thread_safe(&self);
}

/// Drives a scheduler: runs its drain passes and its timers.
pub trait LoopController {
    /// Binds the controller to the scheduler it drives. Called once, while the scheduler is being built.
    fn attach(&self, scheduler: Weak<Scheduler>);

    /// Requests a drain pass on the owning thread soon.
    fn schedule(&self);

    /// Returns the handle other threads use to request drain passes.
    fn thread_safe(&self) -> Arc<dyn ThreadSafeSchedule>;

    /// Requests a drain pass. Callable from any thread.
    fn schedule_thread_safe(&self) {
        self.thread_safe().schedule_thread_safe()
    }

    /// Runs `callback` once, on the owning thread, at or after `deadline`.
    fn timed_schedule(&self, callback: Box<dyn FnOnce()>, deadline: Instant);

    /// Withdraws a pending drain pass request.
    fn cancel(&self);
}
