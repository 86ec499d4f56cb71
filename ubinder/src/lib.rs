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

//! Userspace binder: a typed, reference-counted object-capability IPC
//! layer with a socket RPC debug bridge.
//!
//! # Example
//!
//! ```
//! use ubinder::{declare_binder_interface, Interface, Parcel, TransactionCode};
//!
//! pub trait ITest: Interface {
//!     fn test(&self) -> ubinder::Result<String>;
//! }
//!
//! declare_binder_interface! {
//!     ITest["android.os.ITest"] {
//!         native: BnTest(on_transact),
//!         proxy: BpTest,
//!     }
//! }
//!
//! fn on_transact(
//!     service: &dyn ITest,
//!     _code: TransactionCode,
//!     _data: &Parcel,
//!     reply: &mut Parcel,
//! ) -> ubinder::Result<()> {
//!     reply.write(&service.test()?)
//! }
//!
//! impl ITest for BpTest {
//!     fn test(&self) -> ubinder::Result<String> {
//!         use ubinder::{IBinder, FIRST_CALL_TRANSACTION};
//!         let data = Parcel::new();
//!         let mut reply = Parcel::new();
//!         self.as_binder()
//!             .transact(FIRST_CALL_TRANSACTION, &data, Some(&mut reply), 0)?;
//!         reply.read()
//!     }
//! }
//!
//! impl ITest for ubinder::Binder<BnTest> {
//!     fn test(&self) -> ubinder::Result<String> {
//!         self.0.test()
//!     }
//! }
//!
//! struct TestService;
//!
//! impl Interface for TestService {}
//!
//! impl ITest for TestService {
//!     fn test(&self) -> ubinder::Result<String> {
//!         Ok("testing service".to_string())
//!     }
//! }
//!
//! let service = BnTest::new_binder(TestService);
//! assert_eq!(service.test().unwrap(), "testing service");
//! ```

#[macro_use]
mod binder;

mod config;
mod error;
mod native;
mod object_manager;
mod proxy;
mod record;
mod refbase;
mod state;

pub mod parcel;
pub mod rpc;
pub mod service_manager;

pub use binder::{
    FromIBinder, IBinder, Interface, Proxy, Remotable, TransactionCode, TransactionFlags,
    DEBUG_PID_TRANSACTION, DUMP_TRANSACTION, EXTENSION_TRANSACTION, FIRST_CALL_TRANSACTION,
    FLAG_CLEAR_BUF, FLAG_ONEWAY, FLAG_PRIVATE_VENDOR, INTERFACE_TRANSACTION,
    LAST_CALL_TRANSACTION, PING_TRANSACTION, SET_RPC_CLIENT_TRANSACTION,
    SHELL_COMMAND_TRANSACTION, START_RECORDING_TRANSACTION, STOP_RECORDING_TRANSACTION,
    SYSPROPS_TRANSACTION,
};
pub use config::BinderConfig;
pub use error::{result_status, status_result, status_t, Result, StatusCode};
pub use native::{Binder, SCHED_NORMAL};
pub use object_manager::{AttachedObject, ObjectCleanup, ObjectId, ObjectManager};
pub use parcel::Parcel;
pub use proxy::{BpRefBase, DeathRecipient, SpIBinder, Strong, Weak, WpIBinder};
pub use record::RecordedTransaction;
pub use rpc::{RpcServer, RpcSession};
pub use service_manager::{
    add_service, check_service, default_service_manager, get_interface, get_service, DumpFlags,
    IServiceManager, ServiceManager, ServiceManagerHost, ServiceManagerService,
};
pub use state::{CallingIdentityGuard, ProcessState, ThreadState};

/// Re-exports of core structures, prefixed with `Binder`.
///
/// This module renames binder exports so they can be glob-imported
/// without conflicting with standard structures. Import the prelude
/// with:
/// ```rust
/// use ubinder::prelude::*;
/// ```
pub mod prelude {
    pub use super::Binder;
    pub use super::IBinder;
    pub use super::Interface as BinderInterface;
    pub use super::Remotable as BinderRemotable;
    pub use super::Result as BinderResult;
    pub use super::StatusCode as BinderStatusCode;
}
