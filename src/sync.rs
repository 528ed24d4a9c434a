// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning instead of panicking.
//!
//! A worker that panics while holding the task registry lock would poison
//! it for every other worker. The pool must keep serving the remaining
//! tasks, so the guard is recovered and the event is logged at ERROR.
//!
//! ```no_run
//! use std::sync::Mutex;
//! use distroget::sync::resilient_lock;
//!
//! let queue = Mutex::new(vec![1, 2, 3]);
//! resilient_lock(&queue).push(4);
//! ```

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "sync::locks",
                event = "LOCK_POISONED",
                "Mutex was poisoned; a worker panicked while holding it. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}
