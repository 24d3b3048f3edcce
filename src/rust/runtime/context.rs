// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Execution contexts for fibers.
//!
//! This module is the only place that switches stacks. A context owns a dedicated stack and a coroutine that runs an
//! entry function on it. Control is handed back and forth with [ExecutionContext::switch_into] on the scheduler side
//! and [SuspendPoint::switch_out] on the fiber side, each carrying a `usize` handoff value.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
};
use ::corosensei::{
    stack::{
        DefaultStack,
        Stack,
    },
    Coroutine,
    CoroutineResult,
    Yielder,
};
use ::std::{
    hint,
    mem,
    ptr::{
        self,
        NonNull,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A stack plus the coroutine running on it.
pub struct ExecutionContext {
    coroutine: Coroutine<usize, usize, (), DefaultStack>,
    /// Highest address of the stack.
    base: usize,
    /// Lowest usable address of the stack, right above the guard page.
    limit: usize,
    /// Was the stack filled with [limits::STACK_MAGIC]?
    filled: bool,
}

/// Handle used by code running on a fiber stack to switch back to the scheduler.
#[derive(Clone, Copy)]
pub struct SuspendPoint(NonNull<Yielder<usize, usize>>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ExecutionContext {
    /// Allocates a stack of `stack_size` bytes and prepares `entry` to run on it. The entry function is not started
    /// until the first [ExecutionContext::switch_into].
    pub fn new<F>(stack_size: usize, fill_magic: bool, entry: F) -> Result<Self, Fail>
    where
        F: FnOnce(SuspendPoint, usize) + 'static,
    {
        let stack: DefaultStack = match DefaultStack::new(stack_size) {
            Ok(stack) => stack,
            Err(e) => {
                let cause: String = format!("failed to allocate fiber stack (size={}, error={:?})", stack_size, e);
                error!("new(): {}", cause);
                return Err(Fail::new(libc::ENOMEM, &cause));
            },
        };
        let base: usize = stack.base().get();
        // The lowest page of the mapping is the guard page.
        let limit: usize = stack.limit().get() + page_size();

        if fill_magic {
            // Safety: the range between the guard page and the base is mapped read-write and nothing runs on it yet.
            unsafe { fill_stack(limit, base) };
        }

        let coroutine: Coroutine<usize, usize, (), DefaultStack> =
            Coroutine::with_stack(stack, move |yielder: &Yielder<usize, usize>, handoff: usize| {
                entry(SuspendPoint(NonNull::from(yielder)), handoff)
            });

        Ok(Self {
            coroutine,
            base,
            limit,
            filled: fill_magic,
        })
    }

    /// Runs the context until it switches out. Returns the handoff value passed to [SuspendPoint::switch_out], or
    /// `None` if the entry function returned.
    pub fn switch_into(&mut self, handoff: usize) -> Option<usize> {
        match self.coroutine.resume(handoff) {
            CoroutineResult::Yield(value) => Some(value),
            CoroutineResult::Return(()) => None,
        }
    }

    /// Has the entry function started running?
    pub fn started(&self) -> bool {
        self.coroutine.started()
    }

    /// Has the entry function returned?
    pub fn done(&self) -> bool {
        self.coroutine.done()
    }

    pub fn stack_base(&self) -> usize {
        self.base
    }

    /// Number of bytes of the fill pattern that were overwritten since the context was created. Only available when
    /// the stack was filled.
    pub fn stack_used(&self) -> Option<usize> {
        if !self.filled {
            return None;
        }
        let word: usize = mem::size_of::<u64>();
        let mut addr: usize = align_up(self.limit, word);
        while addr + word <= self.base {
            // Safety: the address lies within the mapped stack and the context is not running.
            let value: u64 = unsafe { ptr::read_volatile(addr as *const u64) };
            if value != limits::STACK_MAGIC {
                break;
            }
            addr += word;
        }
        Some(self.base - addr)
    }
}

impl SuspendPoint {
    /// Switches from the fiber stack back to whoever called [ExecutionContext::switch_into]. Returns the handoff value
    /// of the next switch into this context.
    ///
    /// Must only be called while running on the stack this suspend point belongs to.
    pub fn switch_out(&self, handoff: usize) -> usize {
        // Safety: the yielder lives in the entry frame of the coroutine, which outlives any code running on it.
        let yielder: &Yielder<usize, usize> = unsafe { self.0.as_ref() };
        yielder.suspend(handoff)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Address of a local on the current stack. Compared against a stack base, this tells how deep the caller is.
#[inline(never)]
pub fn current_stack_position() -> usize {
    let marker: u8 = 0;
    hint::black_box(&marker) as *const u8 as usize
}

/// Size of a virtual memory page.
fn page_size() -> usize {
    // Safety: sysconf() has no preconditions.
    let size: libc::c_long = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        limits::DEFAULT_PAGE_SIZE
    }
}

fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Writes [limits::STACK_MAGIC] over `[limit, base)`.
unsafe fn fill_stack(limit: usize, base: usize) {
    let word: usize = mem::size_of::<u64>();
    let mut addr: usize = align_up(limit, word);
    while addr + word <= base {
        ptr::write_volatile(addr as *mut u64, limits::STACK_MAGIC);
        addr += word;
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
