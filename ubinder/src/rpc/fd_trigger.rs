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

use std::io;
use std::os::unix::io::{BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Mutex;

/// Allocate a cloexec pipe, returned as (read end, write end).
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds is a valid out-pointer for two file descriptors.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: on success pipe2 returns two freshly opened descriptors
    // owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// A one-shot, multi-waiter wakeup primitive built on a pipe.
///
/// Waiters poll the read end alongside their own fd; triggering closes
/// the write end, which makes the read end readable (hangup) for every
/// waiter at once. A trigger cannot be rearmed.
pub(crate) struct FdTrigger {
    read: OwnedFd,
    write: Mutex<Option<OwnedFd>>,
}

impl FdTrigger {
    pub fn new() -> io::Result<FdTrigger> {
        let (read, write) = pipe()?;
        Ok(FdTrigger {
            read,
            write: Mutex::new(Some(write)),
        })
    }

    /// Wake all current and future waiters.
    pub fn trigger(&self) {
        self.write.lock().unwrap().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.write.lock().unwrap().is_none()
    }

    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        use std::os::unix::io::AsFd;
        self.read.as_fd()
    }
}
