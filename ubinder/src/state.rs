/*
 * Copyright (C) 2023 The Android Open Source Project
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const DEFAULT_MAX_BINDER_THREADS: usize = 15;

static MAX_THREADS: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_BINDER_THREADS);
static THREAD_POOL_STARTED: AtomicBool = AtomicBool::new(false);

/// Static utility functions to manage binder process state.
pub struct ProcessState;

impl ProcessState {
    /// Set the maximum number of threads serving transactions for this
    /// process, not counting the main thread.
    pub fn set_thread_pool_max_thread_count(num_threads: usize) {
        if THREAD_POOL_STARTED.load(Ordering::Acquire) {
            log::warn!("Extra binder threads started, but max thread count changed afterwards");
        }
        MAX_THREADS.store(num_threads, Ordering::Release);
    }

    /// Total number of threads that may serve transactions, including the
    /// main thread.
    pub fn get_thread_pool_max_total_thread_count() -> usize {
        MAX_THREADS.load(Ordering::Acquire) + 1
    }

    /// Mark the thread pool as running. Worker threads themselves are
    /// spawned by the transports that need them.
    pub fn start_thread_pool() {
        THREAD_POOL_STARTED.store(true, Ordering::Release);
    }

    pub fn thread_pool_started() -> bool {
        THREAD_POOL_STARTED.load(Ordering::Acquire)
    }
}

thread_local! {
    static CALLING_IDENTITY: Cell<Option<(libc::uid_t, libc::pid_t)>> = const { Cell::new(None) };
}

/// Static utility functions to manage per-thread binder state.
pub struct ThreadState;

impl ThreadState {
    /// The effective uid of the caller of the transaction currently being
    /// dispatched on this thread, or of this process when no transaction
    /// is in flight.
    pub fn get_calling_uid() -> libc::uid_t {
        CALLING_IDENTITY.with(|c| match c.get() {
            Some((uid, _)) => uid,
            // SAFETY: geteuid is always safe to call.
            None => unsafe { libc::geteuid() },
        })
    }

    /// The pid of the caller of the transaction currently being
    /// dispatched on this thread.
    pub fn get_calling_pid() -> libc::pid_t {
        CALLING_IDENTITY.with(|c| match c.get() {
            Some((_, pid)) => pid,
            // SAFETY: getpid is always safe to call.
            None => unsafe { libc::getpid() },
        })
    }

    /// Install a caller identity for the duration of the returned guard.
    ///
    /// Used by transport dispatch loops to attribute inbound transactions
    /// to the peer, and by tests to simulate callers with different
    /// privileges.
    pub fn set_calling_identity(uid: libc::uid_t, pid: libc::pid_t) -> CallingIdentityGuard {
        let previous = CALLING_IDENTITY.with(|c| c.replace(Some((uid, pid))));
        CallingIdentityGuard { previous }
    }
}

/// Restores the previously installed calling identity when dropped.
pub struct CallingIdentityGuard {
    previous: Option<(libc::uid_t, libc::pid_t)>,
}

impl Drop for CallingIdentityGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        CALLING_IDENTITY.with(|c| c.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_guard_nests_and_restores() {
        let real_uid = ThreadState::get_calling_uid();
        {
            let _outer = ThreadState::set_calling_identity(1000, 42);
            assert_eq!(ThreadState::get_calling_uid(), 1000);
            assert_eq!(ThreadState::get_calling_pid(), 42);
            {
                let _inner = ThreadState::set_calling_identity(0, 1);
                assert_eq!(ThreadState::get_calling_uid(), 0);
            }
            assert_eq!(ThreadState::get_calling_uid(), 1000);
        }
        assert_eq!(ThreadState::get_calling_uid(), real_uid);
    }

    #[test]
    fn total_thread_count_includes_main_thread() {
        assert!(ProcessState::get_thread_pool_max_total_thread_count() >= 1);
    }
}
