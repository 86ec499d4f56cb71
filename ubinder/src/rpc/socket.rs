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

//! Raw fd plumbing for the RPC transport: blocking reads and writes over
//! an adopted socket, accept, poll, and peer credentials.

use super::fd_trigger::FdTrigger;

use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// Stream adapter over an adopted socket descriptor. Works for any
/// connected stream socket (TCP or unix domain).
pub(crate) struct RpcSocket(OwnedFd);

impl RpcSocket {
    pub fn new(fd: OwnedFd) -> RpcSocket {
        RpcSocket(fd)
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Read for RpcSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: buf is a valid writable buffer of the given length
            // for the duration of the call.
            let n = unsafe {
                libc::read(
                    self.0.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Write for RpcSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            // SAFETY: buf is a valid readable buffer of the given length
            // for the duration of the call.
            let n = unsafe {
                libc::write(
                    self.0.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Accept one pending connection. Returns `Ok(None)` if the listener had
/// nothing pending after all.
pub(crate) fn accept(listener: BorrowedFd<'_>) -> io::Result<Option<OwnedFd>> {
    loop {
        // SAFETY: the listener fd is valid for the duration of the
        // borrow; we pass no address out-parameters.
        let fd = unsafe {
            libc::accept4(
                listener.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if fd >= 0 {
            // SAFETY: accept4 returned a fresh descriptor owned by us.
            return Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(None),
            _ => return Err(err),
        }
    }
}

pub(crate) enum PollOutcome {
    Ready,
    Triggered,
}

fn poll2(fd: BorrowedFd<'_>, events: libc::c_short, other: BorrowedFd<'_>) -> io::Result<bool> {
    let mut fds = [
        libc::pollfd {
            fd: fd.as_raw_fd(),
            events,
            revents: 0,
        },
        libc::pollfd {
            fd: other.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        // SAFETY: fds is a valid array of two pollfd structs.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if fds[1].revents != 0 {
            return Ok(false);
        }
        if fds[0].revents != 0 {
            return Ok(true);
        }
    }
}

/// Block until `fd` is readable or `trigger` fires.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, trigger: &FdTrigger) -> io::Result<PollOutcome> {
    if trigger.is_triggered() {
        return Ok(PollOutcome::Triggered);
    }
    match poll2(fd, libc::POLLIN, trigger.poll_fd())? {
        true => Ok(PollOutcome::Ready),
        false => Ok(PollOutcome::Triggered),
    }
}

/// Block until the peer of `fd` hangs up, or `cancel` becomes readable
/// (it is the read end of a pipe whose writer closes it to cancel).
pub(crate) fn wait_hangup(fd: BorrowedFd<'_>, cancel: BorrowedFd<'_>) -> io::Result<PollOutcome> {
    let mut fds = [
        libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLRDHUP,
            revents: 0,
        },
        libc::pollfd {
            fd: cancel.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        // SAFETY: fds is a valid array of two pollfd structs.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if fds[1].revents != 0 {
            return Ok(PollOutcome::Triggered);
        }
        if fds[0].revents & (libc::POLLRDHUP | libc::POLLHUP | libc::POLLERR) != 0 {
            return Ok(PollOutcome::Ready);
        }
    }
}

/// For unix domain peers, the credentials of the connecting process.
pub(crate) fn peer_credentials(fd: BorrowedFd<'_>) -> Option<(libc::uid_t, libc::pid_t)> {
    // SAFETY: zeroed sockaddr_storage is a valid out-buffer for
    // getsockname.
    let family = unsafe {
        let mut addr: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        if libc::getsockname(
            fd.as_raw_fd(),
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        ) != 0
        {
            return None;
        }
        addr.ss_family
    };
    if libc::c_int::from(family) != libc::AF_UNIX {
        return None;
    }

    // SAFETY: zeroed ucred is a valid out-buffer for SO_PEERCRED.
    unsafe {
        let mut cred: libc::ucred = mem::zeroed();
        let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
        if libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        ) != 0
        {
            return None;
        }
        Some((cred.uid, cred.pid))
    }
}
