// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    baton::Baton,
    fail::Fail,
    scheduler::SharedScheduler,
};
use ::parking_lot::Mutex;
use ::std::{
    fmt,
    panic::{
        self,
        AssertUnwindSafe,
    },
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Result slot shared by a promise and the fiber awaiting it.
struct PromiseCell<T> {
    result: Mutex<Option<Result<T, Fail>>>,
    baton: Baton,
}

/// One-shot handle that delivers a value or a failure to a fiber suspended in [await_promise]. Every fulfilment
/// method consumes the promise. Dropping it unfulfilled delivers [Fail::broken_promise].
pub struct Promise<T> {
    cell: Option<Arc<PromiseCell<T>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> PromiseCell<T> {
    fn deliver(&self, result: Result<T, Fail>) {
        *self.result.lock() = Some(result);
        self.baton.post();
    }
}

impl<T> Promise<T> {
    pub fn set_value(self, value: T) {
        self.fulfil_try(Ok(value))
    }

    pub fn set_exception(self, fail: Fail) {
        self.fulfil_try(Err(fail))
    }

    pub fn fulfil_try(mut self, result: Result<T, Fail>) {
        if let Some(cell) = self.cell.take() {
            cell.deliver(result);
        }
    }

    /// Delivers the outcome of `func`. A panic in `func` is delivered as a failure.
    pub fn fulfil<F: FnOnce() -> Result<T, Fail>>(self, func: F) {
        let result: Result<T, Fail> = match panic::catch_unwind(AssertUnwindSafe(func)) {
            Ok(result) => result,
            Err(payload) => Err(Fail::from_panic(payload)),
        };
        self.fulfil_try(result)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Suspends the calling fiber until the promise handed to `setup` is fulfilled, and returns what it delivered.
/// `setup` runs right away, on the fiber, and typically stores the promise where the producer will find it. The
/// promise may be fulfilled from any thread.
pub fn await_promise<T, F: FnOnce(Promise<T>)>(setup: F) -> Result<T, Fail> {
    assert!(SharedScheduler::in_fiber(), "await_promise() called outside of a fiber");
    let cell: Arc<PromiseCell<T>> = Arc::new(PromiseCell {
        result: Mutex::new(None),
        baton: Baton::new(),
    });
    setup(Promise {
        cell: Some(cell.clone()),
    });
    cell.baton.wait();

    let result: Option<Result<T, Fail>> = cell.result.lock().take();
    match result {
        Some(result) => result,
        None => panic!("promise posted without a result"),
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            warn!("drop(): promise dropped without being fulfilled");
            cell.deliver(Err(Fail::broken_promise()));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("fulfilled", &self.cell.is_none())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
