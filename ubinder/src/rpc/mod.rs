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

//! Socket transport for binder transactions.
//!
//! This is the secondary transport used by the RPC debug bridge: a
//! [`RpcServer`] serves a root object over a listening socket, and a
//! [`RpcSession`] connects to one and hands back a remote proxy handle.
//! Capabilities and file descriptors cannot cross this transport.

mod fd_trigger;
mod server;
mod session;
mod socket;
mod wire;

pub use server::RpcServer;
pub use session::RpcSession;
