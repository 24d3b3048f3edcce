// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    combinators::add_tasks::{
        add_tasks,
        TaskIterator,
    },
    fail::Fail,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Runs `tasks` concurrently and hands each completion to `callback`, in completion order.
pub fn for_each<T, F, I, C>(tasks: I, mut callback: C)
where
    T: 'static,
    F: FnOnce() -> Result<T, Fail> + 'static,
    I: IntoIterator<Item = F>,
    C: FnMut(usize, Result<T, Fail>),
{
    let mut iter: TaskIterator<T> = add_tasks(tasks);
    while iter.has_next() {
        let (id, result): (usize, Result<T, Fail>) = iter.await_next();
        callback(id, result);
    }
}

/// Runs `tasks` concurrently and returns the first `n` completions, as `(index, value)` pairs in completion order.
/// Fails with the first failure among them. Tasks completing later keep running and their results are dropped.
pub fn when_n<T, F, I>(tasks: I, n: usize) -> Result<Vec<(usize, T)>, Fail>
where
    T: 'static,
    F: FnOnce() -> Result<T, Fail> + 'static,
    I: IntoIterator<Item = F>,
{
    let tasks: Vec<F> = tasks.into_iter().collect();
    let n: usize = n.min(tasks.len());
    let mut iter: TaskIterator<T> = add_tasks(tasks);
    let mut results: Vec<(usize, T)> = Vec::with_capacity(n);
    while results.len() < n {
        let (id, result): (usize, Result<T, Fail>) = iter.await_next();
        results.push((id, result?));
    }
    Ok(results)
}

/// Runs `tasks` concurrently and returns their values in submission order. Every task completes before this returns.
/// Fails with the first failure observed.
pub fn when_all<T, F, I>(tasks: I) -> Result<Vec<T>, Fail>
where
    T: 'static,
    F: FnOnce() -> Result<T, Fail> + 'static,
    I: IntoIterator<Item = F>,
{
    let mut iter: TaskIterator<T> = add_tasks(tasks);
    let mut values: Vec<Option<T>> = Vec::new();
    let mut first_failure: Option<Fail> = None;
    while iter.has_next() {
        match iter.await_next() {
            (id, Ok(value)) => {
                if values.len() <= id {
                    values.resize_with(id + 1, || None);
                }
                values[id] = Some(value);
            },
            (id, Err(e)) => {
                debug!("when_all(): task {} failed ({:?})", id, e);
                first_failure.get_or_insert(e);
            },
        }
    }

    match first_failure {
        Some(e) => Err(e),
        None => Ok(values.into_iter().flatten().collect()),
    }
}

/// Runs `tasks` concurrently and returns the first completion as `(index, value)`. Every task completes before this
/// returns. Failures of the other tasks are ignored.
pub fn when_any<T, F, I>(tasks: I) -> Result<(usize, T), Fail>
where
    T: 'static,
    F: FnOnce() -> Result<T, Fail> + 'static,
    I: IntoIterator<Item = F>,
{
    let mut iter: TaskIterator<T> = add_tasks(tasks);
    if !iter.has_next() {
        let cause: String = "no task to wait for".to_string();
        error!("when_any(): {}", cause);
        return Err(Fail::new(libc::EINVAL, &cause));
    }

    let (id, first): (usize, Result<T, Fail>) = iter.await_next();
    while iter.has_next() {
        if let (other, Err(e)) = iter.await_next() {
            debug!("when_any(): ignoring failure of task {} ({:?})", other, e);
        }
    }
    Ok((id, first?))
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
