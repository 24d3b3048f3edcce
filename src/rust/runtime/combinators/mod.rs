// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Concurrency helpers built on [crate::runtime::promise::await_promise]. They must be called from inside a fiber and
//! run each task in a child fiber of the same scheduler.

mod add_tasks;
mod when;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    add_tasks::{
        add_tasks,
        TaskIterator,
    },
    when::{
        for_each,
        when_all,
        when_any,
        when_n,
    },
};
