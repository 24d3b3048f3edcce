// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    sync::atomic::AtomicU32,
    time::Duration,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Blocks the calling thread while `word` holds `expected`, for at most `timeout`. Returns on wake, timeout,
        /// signal or value mismatch, so callers must re-check their condition.
        pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
            let ts: Option<libc::timespec> = timeout.map(|d: Duration| libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            });
            let ts_ptr: *const libc::timespec = match ts.as_ref() {
                Some(ts) => ts as *const libc::timespec,
                None => ::std::ptr::null(),
            };
            // Safety: `word` is a live atomic for the duration of the call and the kernel only reads it.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word as *const AtomicU32 as *const u32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    expected,
                    ts_ptr,
                );
            }
        }

        /// Wakes every thread blocked on `word`. The word need not be alive anymore.
        pub fn futex_wake_all(word: *const AtomicU32) {
            // Safety: the kernel uses the address as a key only and never dereferences it for a wake.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word as *const u32,
                    libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                    i32::MAX,
                );
            }
        }
    } else {
        use ::std::{
            sync::atomic::Ordering,
            thread,
        };

        /// Poll interval used where no futex is available.
        const POLL_INTERVAL: Duration = Duration::from_micros(50);

        /// Sleeps in short slices while `word` holds `expected`, for at most `timeout`.
        pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
            if word.load(Ordering::Acquire) != expected {
                return;
            }
            let nap: Duration = match timeout {
                Some(timeout) => timeout.min(POLL_INTERVAL),
                None => POLL_INTERVAL,
            };
            thread::sleep(nap);
        }

        /// Sleepers poll, so there is nothing to wake.
        pub fn futex_wake_all(_word: *const AtomicU32) {}
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
