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

use ubinder::{ProcessState, Result, SpIBinder};

use std::path::Path;
use std::sync::Arc;

/// A running RPC server hosting one binder service.
pub struct RpcServer {
    inner: Arc<ubinder::RpcServer>,
}

impl RpcServer {
    /// Create a binder RPC server, serving the supplied binder service
    /// implementation on the given address. Passing port 0 picks a free
    /// port; the bound port is returned alongside the server.
    pub fn new_inet(service: SpIBinder, address: &str, port: u16) -> Result<(RpcServer, u16)> {
        let inner = ubinder::RpcServer::new();
        inner.set_root_object(service);
        let bound_port = inner.setup_inet_server(address, port)?;
        inner.set_max_threads(ProcessState::get_thread_pool_max_total_thread_count());
        inner.start();
        Ok((RpcServer { inner }, bound_port))
    }

    /// Create a binder RPC server, serving the supplied binder service
    /// implementation on the given socket path.
    pub fn new_unix_domain(service: SpIBinder, path: &Path) -> Result<RpcServer> {
        let inner = ubinder::RpcServer::new();
        inner.set_root_object(service);
        inner.setup_unix_domain_server(path)?;
        inner.set_max_threads(ProcessState::get_thread_pool_max_total_thread_count());
        inner.start();
        Ok(RpcServer { inner })
    }

    /// Block until the server shuts down.
    pub fn join(&self) {
        self.inner.join();
    }

    /// Shut the server down. Returns false if it was never started.
    pub fn shutdown(&self) -> bool {
        self.inner.shutdown()
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if !self.inner.shutdown() {
            log::warn!("RpcServer dropped before it was started");
        }
    }
}

/// Runs a binder RPC server, serving the supplied binder service
/// implementation on the given address and port.
///
/// If and when the server is ready for connections (it is listening on
/// the port), `on_ready` is called to allow appropriate action to be
/// taken - e.g. to notify clients that they may now attempt to connect.
///
/// The current thread serves incoming messages until the server shuts
/// down.
///
/// Returns true if the server has shut down normally, false if it failed
/// in some way.
pub fn run_inet_rpc_server<F>(service: SpIBinder, address: &str, port: u16, on_ready: F) -> bool
where
    F: FnOnce(u16),
{
    let inner = ubinder::RpcServer::new();
    inner.set_root_object(service);
    let bound_port = match inner.setup_inet_server(address, port) {
        Ok(p) => p,
        Err(e) => {
            log::error!("Failed to set up inet RPC server: {e}");
            return false;
        }
    };
    inner.set_max_threads(ProcessState::get_thread_pool_max_total_thread_count());
    on_ready(bound_port);
    inner.join();
    true
}
