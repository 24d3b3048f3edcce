// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod options;
mod remote;

//==============================================================================
// Exports
//==============================================================================

pub mod scheduler;

pub use self::{
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
    scheduler::{
        Scheduler,
        SharedScheduler,
    },
};

pub(crate) use self::scheduler::suspend_current;
