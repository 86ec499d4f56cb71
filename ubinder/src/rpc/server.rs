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

use super::fd_trigger::FdTrigger;
use super::session;
use super::socket::{self, PollOutcome};
use crate::error::{Result, StatusCode};
use crate::proxy::{SpIBinder, WpIBinder};

use std::net::TcpListener;
use std::os::unix::io::{AsFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

enum RootObject {
    None,
    Strong(SpIBinder),
    Weak(WpIBinder),
}

/// Serves transactions against a root object over a listening socket.
///
/// One session thread is spawned per accepted connection, bounded by
/// [`set_max_threads`](RpcServer::set_max_threads). A server is started
/// at most once and shut down at most once.
pub struct RpcServer {
    root: Mutex<RootObject>,
    max_threads: AtomicUsize,
    listener: Mutex<Option<OwnedFd>>,
    trigger: FdTrigger,
    started: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    session_threads: Mutex<Vec<JoinHandle<()>>>,
    active_sessions: AtomicUsize,
}

impl RpcServer {
    pub fn new() -> Arc<RpcServer> {
        Arc::new(RpcServer {
            root: Mutex::new(RootObject::None),
            max_threads: AtomicUsize::new(1),
            listener: Mutex::new(None),
            trigger: FdTrigger::new().expect("cannot allocate shutdown trigger"),
            started: AtomicBool::new(false),
            accept_thread: Mutex::new(None),
            session_threads: Mutex::new(Vec::new()),
            active_sessions: AtomicUsize::new(0),
        })
    }

    /// Hold the root object strongly; it stays alive as long as the
    /// server does.
    pub fn set_root_object(&self, root: SpIBinder) {
        *self.root.lock().unwrap() = RootObject::Strong(root);
    }

    /// Hold the root object weakly. Sessions fail with `DEAD_OBJECT` once
    /// the object is gone; used when the object owns the server.
    pub fn set_root_object_weak(&self, root: WpIBinder) {
        *self.root.lock().unwrap() = RootObject::Weak(root);
    }

    pub fn set_max_threads(&self, threads: usize) {
        assert!(threads > 0, "RpcServer needs at least one session thread");
        self.max_threads.store(threads, Ordering::Release);
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads.load(Ordering::Acquire)
    }

    /// Bind a TCP listener. Passing port 0 picks a free port; the bound
    /// port is returned either way.
    pub fn setup_inet_server(&self, address: &str, port: u16) -> Result<u16> {
        let listener = TcpListener::bind((address, port)).map_err(|e| {
            log::error!("setupInetServer: cannot bind {address}:{port}: {e}");
            StatusCode::from(e)
        })?;
        let bound_port = listener
            .local_addr()
            .map_err(StatusCode::from)?
            .port();
        self.adopt_listener(listener.into())?;
        Ok(bound_port)
    }

    pub fn setup_unix_domain_server(&self, path: &Path) -> Result<()> {
        let listener = UnixListener::bind(path).map_err(|e| {
            log::error!("setupUnixDomainServer: cannot bind {}: {e}", path.display());
            StatusCode::from(e)
        })?;
        self.adopt_listener(listener.into())
    }

    /// Adopt an externally prepared listening socket as this server's
    /// transport.
    pub fn setup_external_server(&self, fd: OwnedFd) -> Result<()> {
        self.adopt_listener(fd)
    }

    fn adopt_listener(&self, fd: OwnedFd) -> Result<()> {
        let mut listener = self.listener.lock().unwrap();
        if listener.is_some() {
            log::error!("RpcServer already has a server socket");
            return Err(StatusCode::ALREADY_EXISTS);
        }
        *listener = Some(fd);
        Ok(())
    }

    /// Give up ownership of the listening socket, e.g. to hand it to
    /// another object's debug bridge.
    pub fn release_server(&self) -> Result<OwnedFd> {
        self.listener.lock().unwrap().take().ok_or_else(|| {
            log::error!("releaseServer: no server socket to release");
            StatusCode::INVALID_OPERATION
        })
    }

    /// Spawn the accept loop. The server keeps running until
    /// [`shutdown`](RpcServer::shutdown).
    pub fn start(self: &Arc<Self>) {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "RpcServer can only be started once"
        );
        let server = self.clone();
        let handle = std::thread::Builder::new()
            .name("rpc_server_accept".to_string())
            .spawn(move || accept_loop(server))
            .expect("cannot spawn RPC accept thread");
        *self.accept_thread.lock().unwrap() = Some(handle);
    }

    /// Run the accept loop on the calling thread if the server was not
    /// started, otherwise wait for the started server to shut down.
    pub fn join(self: &Arc<Self>) {
        if !self.started.swap(true, Ordering::AcqRel) {
            accept_loop(self.clone());
        } else {
            let handle = self.accept_thread.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }

    /// Stop accepting connections and tear down live sessions. Returns
    /// false if the server was never started.
    pub fn shutdown(&self) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        self.trigger.trigger();

        let current = std::thread::current().id();
        let accept = self.accept_thread.lock().unwrap().take();
        if let Some(handle) = accept {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        let sessions: Vec<_> = self.session_threads.lock().unwrap().drain(..).collect();
        for handle in sessions {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        true
    }

    pub(crate) fn trigger(&self) -> &FdTrigger {
        &self.trigger
    }

    pub(crate) fn root_binder(&self) -> Option<SpIBinder> {
        match &*self.root.lock().unwrap() {
            RootObject::None => None,
            RootObject::Strong(root) => Some(root.clone()),
            RootObject::Weak(root) => root.promote(),
        }
    }
}

fn accept_loop(server: Arc<RpcServer>) {
    let listener = match server.listener.lock().unwrap().take() {
        Some(listener) => listener,
        None => {
            log::error!("RpcServer started without a server socket");
            return;
        }
    };

    loop {
        match socket::wait_readable(listener.as_fd(), &server.trigger) {
            Ok(PollOutcome::Ready) => {}
            Ok(PollOutcome::Triggered) => break,
            Err(e) => {
                log::error!("RpcServer poll failed: {e}");
                break;
            }
        }
        let conn = match socket::accept(listener.as_fd()) {
            Ok(Some(conn)) => conn,
            Ok(None) => continue,
            Err(e) => {
                log::error!("RpcServer accept failed: {e}");
                break;
            }
        };

        let active = server.active_sessions.load(Ordering::Acquire);
        if active >= server.max_threads() {
            log::warn!(
                "Dropping RPC connection: session limit ({}) reached",
                server.max_threads()
            );
            continue;
        }

        server.active_sessions.fetch_add(1, Ordering::AcqRel);
        let session_server = server.clone();
        let spawned = std::thread::Builder::new()
            .name("rpc_server_session".to_string())
            .spawn(move || {
                session::serve_connection(&session_server, conn);
                session_server
                    .active_sessions
                    .fetch_sub(1, Ordering::AcqRel);
            });
        match spawned {
            Ok(handle) => server.session_threads.lock().unwrap().push(handle),
            Err(e) => {
                log::error!("cannot spawn RPC session thread: {e}");
                server.active_sessions.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}
