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

//! Process-wide feature gates.
//!
//! The original gates these behind build flags; they are runtime flags
//! here so disabled paths stay reachable from tests without a rebuild.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

static RPC_DEV_SERVERS: AtomicBool = AtomicBool::new(true);
static KERNEL_IPC: AtomicBool = AtomicBool::new(true);
static RECORDING: AtomicBool = AtomicBool::new(true);
static DEBUGGABLE: OnceLock<AtomicBool> = OnceLock::new();

fn debuggable_cell() -> &'static AtomicBool {
    DEBUGGABLE.get_or_init(|| {
        let from_env = std::env::var("UBINDER_DEBUGGABLE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        AtomicBool::new(from_env)
    })
}

/// Runtime feature configuration for this process.
pub struct BinderConfig;

impl BinderConfig {
    /// Whether ad-hoc RPC debug servers may be attached to local objects.
    pub fn rpc_dev_servers() -> bool {
        RPC_DEV_SERVERS.load(Ordering::Acquire)
    }

    pub fn set_rpc_dev_servers(enabled: bool) {
        RPC_DEV_SERVERS.store(enabled, Ordering::Release);
    }

    /// Whether the primary kernel transport is available to this process.
    pub fn kernel_ipc() -> bool {
        KERNEL_IPC.load(Ordering::Acquire)
    }

    pub fn set_kernel_ipc(enabled: bool) {
        KERNEL_IPC.store(enabled, Ordering::Release);
    }

    /// Whether transaction recording may be turned on.
    pub fn recording() -> bool {
        RECORDING.load(Ordering::Acquire)
    }

    pub fn set_recording(enabled: bool) {
        RECORDING.store(enabled, Ordering::Release);
    }

    /// Whether this is a debuggable deployment. Defaults from the
    /// `UBINDER_DEBUGGABLE` environment variable.
    pub fn debuggable() -> bool {
        debuggable_cell().load(Ordering::Acquire)
    }

    pub fn set_debuggable(enabled: bool) {
        debuggable_cell().store(enabled, Ordering::Release);
    }
}
