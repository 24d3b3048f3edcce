// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
};
use ::std::{
    fmt,
    process,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Callback invoked with failures that escape a task nobody observes. The second argument names where the failure
/// was caught.
pub type ExceptionCallback = Rc<dyn Fn(&Fail, &str)>;

/// Tunables of a scheduler.
#[derive(Clone)]
pub struct SchedulerOptions {
    /// Size of every fiber stack, in bytes.
    pub stack_size: usize,
    /// Maximum number of idle fibers kept for reuse. `None` keeps all of them.
    pub max_fibers_pool_size: Option<usize>,
    /// Fill fiber stacks with a known pattern and measure how much of it was overwritten.
    pub debug_record_stack_used: bool,
    exception_callback: ExceptionCallback,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SchedulerOptions {
    /// Replaces the callback that receives failures escaping unobserved tasks.
    pub fn with_exception_callback<F: Fn(&Fail, &str) + 'static>(mut self, callback: F) -> Self {
        self.exception_callback = Rc::new(callback);
        self
    }

    pub fn exception_callback(&self) -> ExceptionCallback {
        self.exception_callback.clone()
    }
}

/// Unobserved task failures are fatal unless a callback says otherwise.
fn abort_on_exception(fail: &Fail, context: &str) {
    error!("unhandled task failure ({}): {:?}", context, fail);
    process::abort();
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            stack_size: limits::DEFAULT_STACK_SIZE,
            max_fibers_pool_size: None,
            debug_record_stack_used: false,
            exception_callback: Rc::new(abort_on_exception),
        }
    }
}

impl fmt::Debug for SchedulerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerOptions")
            .field("stack_size", &self.stack_size)
            .field("max_fibers_pool_size", &self.max_fibers_pool_size)
            .field("debug_record_stack_used", &self.debug_record_stack_used)
            .finish_non_exhaustive()
    }
}
