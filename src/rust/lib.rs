// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod pal;
pub mod runtime;

pub use self::runtime::{
    baton::Baton,
    combinators::{
        add_tasks,
        for_each,
        when_all,
        when_any,
        when_n,
        TaskIterator,
    },
    config::Config,
    fail::Fail,
    fiber::run_in_main_context,
    loop_controller::{
        LoopController,
        SimpleLoopController,
        ThreadSafeSchedule,
        TokioLoopController,
    },
    promise::{
        await_promise,
        Promise,
    },
    scheduler::{
        RemoteScheduler,
        SchedulerOptions,
        SharedScheduler,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equivalent. Bails out of the enclosing function with an [anyhow] error otherwise.
#[macro_export]
#[doc(hidden)]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure failed: `(left == right)`\n  left: `{:?}`,\n right: `{:?}`",
                        left_val,
                        right_val
                    )
                }
            },
        }
    }};
}

/// Ensures that two expressions are not equivalent. Bails out of the enclosing function with an [anyhow] error
/// otherwise.
#[macro_export]
#[doc(hidden)]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    ::anyhow::bail!(
                        "ensure failed: `(left != right)`\n  left: `{:?}`,\n right: `{:?}`",
                        left_val,
                        right_val
                    )
                }
            },
        }
    }};
}
