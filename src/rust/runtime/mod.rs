// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod baton;
pub mod combinators;
pub mod config;
pub mod context;
pub mod fail;
pub mod fiber;
pub mod limits;
pub mod logging;
pub mod loop_controller;
pub mod promise;
pub mod scheduler;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    ops::Deref,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The SharedObject wraps an object that is shared by the handles of one owning thread.
pub struct SharedObject<T>(Rc<T>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> SharedObject<T> {
    pub fn new(object: T) -> Self {
        Self(Rc::new(object))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Dereferences a shared object for use.
impl<T> Deref for SharedObject<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl<T> Clone for SharedObject<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
