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

use ubinder::{FromIBinder, RpcSession, SpIBinder, StatusCode, Strong};

use std::os::unix::io::OwnedFd;
use std::path::Path;

/// Connects to an RPC binder server over TCP.
pub fn get_inet_rpc_service(address: &str, port: u16) -> Option<SpIBinder> {
    RpcSession::setup_inet_client(address, port).ok()
}

/// Connects to an RPC binder server for a particular interface over TCP.
pub fn get_inet_rpc_interface<T: FromIBinder + ?Sized>(
    address: &str,
    port: u16,
) -> Result<Strong<T>, StatusCode> {
    interface_cast(get_inet_rpc_service(address, port))
}

/// Connects to an RPC binder server over a unix domain socket.
pub fn get_unix_domain_rpc_service(path: &Path) -> Option<SpIBinder> {
    RpcSession::setup_unix_domain_client(path).ok()
}

/// Connects to an RPC binder server for a particular interface over a
/// unix domain socket.
pub fn get_unix_domain_rpc_interface<T: FromIBinder + ?Sized>(
    path: &Path,
) -> Result<Strong<T>, StatusCode> {
    interface_cast(get_unix_domain_rpc_service(path))
}

/// Adopts an already-connected socket as an RPC binder session.
pub fn get_preconnected_rpc_service(fd: OwnedFd) -> Option<SpIBinder> {
    RpcSession::setup_preconnected_client(fd).ok()
}

fn interface_cast<T: FromIBinder + ?Sized>(
    service: Option<SpIBinder>,
) -> Result<Strong<T>, StatusCode> {
    if let Some(service) = service {
        FromIBinder::try_from(service)
    } else {
        Err(StatusCode::NAME_NOT_FOUND)
    }
}
