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

//! Local (in-process) binder objects.

use crate::binder::{
    IBinder, Remotable, TransactionCode, TransactionFlags, DEBUG_PID_TRANSACTION,
    DUMP_TRANSACTION, EXTENSION_TRANSACTION, FIRST_CALL_TRANSACTION, FLAG_CLEAR_BUF, FLAG_ONEWAY,
    INTERFACE_TRANSACTION, PING_TRANSACTION, SET_RPC_CLIENT_TRANSACTION,
    SHELL_COMMAND_TRANSACTION, START_RECORDING_TRANSACTION, STOP_RECORDING_TRANSACTION,
    SYSPROPS_TRANSACTION,
};
use crate::config::BinderConfig;
use crate::error::{result_status, Result, StatusCode};
use crate::object_manager::{AttachedObject, ObjectCleanup, ObjectId, ObjectManager};
use crate::parcel::Parcel;
use crate::proxy::{DeathRecipient, IBinderInternal, LocalNode, SpIBinder, WpIBinder};
use crate::record::RecordedTransaction;
use crate::refbase::{RefAware, RefCounts};
use crate::rpc::RpcServer;
use crate::state::{ProcessState, ThreadState};

use std::any::Any;
use std::ops::Deref;
use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak as ArcWeak};
use std::time::SystemTime;

/// Default scheduling policy for transactions dispatched to a service.
pub const SCHED_NORMAL: i32 = 0;

const UID_ROOT: libc::uid_t = 0;

// Log any reply transactions for which the data exceeds this size.
const LOG_REPLIES_OVER_SIZE: usize = 300 * 1024;

/// Death recipient that shuts down an ad-hoc RPC server when its
/// keep-alive binder dies, and removes itself from the owning object.
///
/// Holds the owning object only weakly, breaking the would-be cycle
/// binder -> link -> server -> binder.
pub(crate) struct RpcServerLink {
    rpc_server: Mutex<Option<Arc<RpcServer>>>,
    // Held so the death link stays armed for the link's lifetime.
    keep_alive: Mutex<Option<SpIBinder>>,
    binder: Mutex<Option<WpIBinder>>,
    recipient: DeathRecipient,
}

impl RpcServerLink {
    fn new(
        rpc_server: Arc<RpcServer>,
        keep_alive: SpIBinder,
        binder: WpIBinder,
    ) -> Arc<RpcServerLink> {
        Arc::new_cyclic(|weak: &ArcWeak<RpcServerLink>| {
            let weak = weak.clone();
            RpcServerLink {
                rpc_server: Mutex::new(Some(rpc_server)),
                keep_alive: Mutex::new(Some(keep_alive)),
                binder: Mutex::new(Some(binder)),
                recipient: DeathRecipient::new(move || {
                    if let Some(link) = weak.upgrade() {
                        link.binder_died();
                    }
                }),
            }
        })
    }

    pub(crate) fn recipient(&self) -> &DeathRecipient {
        &self.recipient
    }

    fn binder_died(&self) {
        let promoted = self
            .binder
            .lock()
            .unwrap()
            .clone()
            .and_then(|weak| weak.promote());
        let descriptor = promoted
            .as_ref()
            .and_then(|p| p.interface_descriptor().ok())
            .unwrap_or_else(|| "<NULL>".to_string());
        log::info!("RpcBinder: binder died, shutting down RpcServer for {descriptor}");

        match self.rpc_server.lock().unwrap().take() {
            None => {
                log::warn!("RpcServerLink: unable to shut down RpcServer because it does not exist.")
            }
            Some(server) => {
                if !server.shutdown() {
                    log::warn!("RpcServerLink: RpcServer did not shut down properly. Not started?");
                }
            }
        }

        if let Some(promoted) = promoted {
            if let Some(local) = promoted.inner().local() {
                local.remove_rpc_server_link(self);
            }
        }
        self.keep_alive.lock().unwrap().take();
        self.binder.lock().unwrap().take();
    }
}

#[derive(Default)]
struct ExtrasState {
    extension: Option<SpIBinder>,
    policy: i32,
    priority: i32,
    requesting_sid: bool,
    inherit_rt: bool,
    objects: ObjectManager,
    rpc_server_links: Vec<Arc<RpcServerLink>>,
    recording_file: Option<std::fs::File>,
}

// One coarse lock per object; none of these fields are touched on hot
// transaction paths.
struct Extras {
    state: Mutex<ExtrasState>,
}

pub(crate) struct BinderNode<T: Remotable> {
    remotable: T,
    parceled: AtomicBool,
    recording_on: AtomicBool,
    extras: OnceLock<Extras>,
    counts: RefCounts,
    self_weak: ArcWeak<BinderNode<T>>,
}

/// Rust wrapper around binder remotable objects.
///
/// Implements the C++ `BBinder` class, and therefore implements the
/// `IBinder` interface.
pub struct Binder<T: Remotable> {
    node: Arc<BinderNode<T>>,
}

impl<T: Remotable> Binder<T> {
    /// Create a new binder remotable object.
    pub fn new(remotable: T) -> Binder<T> {
        let node = Arc::new_cyclic(|weak| BinderNode {
            remotable,
            parceled: AtomicBool::new(false),
            recording_on: AtomicBool::new(false),
            extras: OnceLock::new(),
            counts: RefCounts::new(),
            self_weak: weak.clone(),
        });
        Binder { node }
    }

    /// Add an extension to this service.
    ///
    /// This allows someone to add their own additions to an interface
    /// without having to modify the original interface.
    pub fn set_extension(&self, extension: SpIBinder) {
        self.node.assert_not_parceled("setExtension()");
        let mut state = self.node.get_or_create_extras().state.lock().unwrap();
        state.extension = Some(extension);
    }

    pub fn get_extension(&self) -> Option<SpIBinder> {
        self.node.extension()
    }

    /// Indicate that the service intends to receive caller security
    /// contexts.
    pub fn set_requesting_sid(&self, requesting_sid: bool) {
        self.node.assert_not_parceled("setRequestingSid()");
        // Default is false; avoid allocating for objects that never ask.
        if self.node.extras.get().is_none() && !requesting_sid {
            return;
        }
        let mut state = self.node.get_or_create_extras().state.lock().unwrap();
        state.requesting_sid = requesting_sid;
    }

    pub fn is_requesting_sid(&self) -> bool {
        match self.node.extras.get() {
            Some(extras) => extras.state.lock().unwrap().requesting_sid,
            None => false,
        }
    }

    pub fn set_inherit_rt(&self, inherit_rt: bool) {
        self.node.assert_not_parceled("setInheritRt()");
        if self.node.extras.get().is_none() && !inherit_rt {
            return;
        }
        let mut state = self.node.get_or_create_extras().state.lock().unwrap();
        state.inherit_rt = inherit_rt;
    }

    pub fn is_inherit_rt(&self) -> bool {
        match self.node.extras.get() {
            Some(extras) => extras.state.lock().unwrap().inherit_rt,
            None => false,
        }
    }

    /// Set the minimum scheduler policy under which transactions on this
    /// object are dispatched.
    pub fn set_min_scheduler_policy(&self, policy: i32, priority: i32) {
        self.node.assert_not_parceled("setMinSchedulerPolicy()");
        match policy {
            SCHED_NORMAL => assert!(
                (-20..=19).contains(&priority),
                "Invalid priority for SCHED_NORMAL: {priority}"
            ),
            libc::SCHED_RR | libc::SCHED_FIFO => assert!(
                (1..=99).contains(&priority),
                "Invalid priority for sched {policy}: {priority}"
            ),
            _ => panic!("Unrecognized scheduling policy: {policy}"),
        }

        // Avoid allocations if called with the default.
        if self.node.extras.get().is_none() && policy == SCHED_NORMAL && priority == 0 {
            return;
        }
        let mut state = self.node.get_or_create_extras().state.lock().unwrap();
        state.policy = policy;
        state.priority = priority;
    }

    pub fn min_scheduler_policy(&self) -> i32 {
        match self.node.extras.get() {
            Some(extras) => extras.state.lock().unwrap().policy,
            None => SCHED_NORMAL,
        }
    }

    pub fn min_scheduler_priority(&self) -> i32 {
        match self.node.extras.get() {
            Some(extras) => extras.state.lock().unwrap().priority,
            None => 0,
        }
    }

    /// Whether this object has been sent to another process at least
    /// once.
    pub fn was_parceled(&self) -> bool {
        self.node.parceled.load(Ordering::Acquire)
    }

    /// Mark this object as having crossed a process boundary. One-way;
    /// configuration is frozen from this point on.
    pub fn set_parceled(&self) {
        self.node.parceled.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn has_extras(&self) -> bool {
        self.node.extras.get().is_some()
    }

    #[cfg(test)]
    pub(crate) fn rpc_server_link_count(&self) -> usize {
        match self.node.extras.get() {
            Some(extras) => extras.state.lock().unwrap().rpc_server_links.len(),
            None => 0,
        }
    }
}

impl<T: Remotable> crate::binder::Interface for Binder<T> {
    fn as_binder(&self) -> SpIBinder {
        SpIBinder::new(self.node.clone())
    }
}

impl<T: Remotable> IBinder for Binder<T> {
    fn interface_descriptor(&self) -> Result<String> {
        Ok(T::get_descriptor().to_string())
    }

    fn is_binder_alive(&self) -> bool {
        true
    }

    fn ping_binder(&self) -> Result<()> {
        use crate::binder::Interface;
        self.as_binder().ping_binder()
    }

    fn dump(&self, fd: std::os::unix::io::BorrowedFd<'_>, args: &[&str]) -> Result<()> {
        use crate::binder::Interface;
        self.as_binder().dump(fd, args)
    }

    fn get_extension(&self) -> Result<Option<SpIBinder>> {
        Ok(self.node.extension())
    }

    fn get_debug_pid(&self) -> Result<libc::pid_t> {
        Ok(self.node.debug_pid())
    }

    fn set_rpc_client_debug(
        &self,
        socket_fd: Option<OwnedFd>,
        keep_alive: Option<SpIBinder>,
    ) -> Result<()> {
        self.node.set_rpc_client_debug(socket_fd, keep_alive)
    }

    fn transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()> {
        self.node.transact_impl(code, data, reply, flags)
    }

    fn link_to_death(&self, _recipient: &DeathRecipient) -> Result<()> {
        // Local binders by definition cannot die out from under their
        // holder.
        Err(StatusCode::INVALID_OPERATION)
    }

    fn unlink_to_death(&self, _recipient: &DeathRecipient) -> Result<()> {
        Err(StatusCode::INVALID_OPERATION)
    }
}

impl<T: Remotable> Clone for Binder<T> {
    fn clone(&self) -> Binder<T> {
        Binder {
            node: self.node.clone(),
        }
    }
}

impl<T: Remotable> Deref for Binder<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.node.remotable
    }
}

impl<T: Remotable> From<Binder<T>> for SpIBinder {
    fn from(binder: Binder<T>) -> SpIBinder {
        use crate::binder::Interface;
        binder.as_binder()
    }
}

impl<T: Remotable> TryFrom<SpIBinder> for Binder<T> {
    type Error = StatusCode;

    fn try_from(ibinder: SpIBinder) -> Result<Binder<T>> {
        let any = ibinder.inner().clone().as_arc_any();
        match any.downcast::<BinderNode<T>>() {
            Ok(node) => Ok(Binder { node }),
            Err(_) => Err(StatusCode::BAD_TYPE),
        }
    }
}

impl<T: Remotable> std::fmt::Debug for Binder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("Binder")
    }
}

impl<T: Remotable> BinderNode<T> {
    fn self_binder(&self) -> SpIBinder {
        let arc = self
            .self_weak
            .upgrade()
            .expect("node is alive while self is borrowed");
        SpIBinder::new(arc)
    }

    fn get_or_create_extras(&self) -> &Extras {
        self.extras.get_or_init(|| Extras {
            state: Mutex::new(ExtrasState::default()),
        })
    }

    fn assert_not_parceled(&self, what: &str) {
        assert!(
            !self.parceled.load(Ordering::Acquire),
            "{what} should not be called after a binder object is parceled/sent to another process"
        );
    }

    fn extension(&self) -> Option<SpIBinder> {
        self.extras
            .get()
            .and_then(|e| e.state.lock().unwrap().extension.clone())
    }

    fn debug_pid(&self) -> libc::pid_t {
        // SAFETY: getpid is always safe to call.
        unsafe { libc::getpid() }
    }

    pub(crate) fn transact_impl(
        &self,
        code: TransactionCode,
        data: &Parcel,
        mut reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()> {
        // Callers may have pre-positioned the read cursor.
        data.set_data_position(0);

        if flags & FLAG_CLEAR_BUF != 0 {
            if let Some(reply) = reply.as_deref_mut() {
                reply.mark_sensitive();
            }
        }

        let status = match code {
            PING_TRANSACTION => Ok(()),
            START_RECORDING_TRANSACTION => self.start_recording_transactions(data),
            STOP_RECORDING_TRANSACTION => self.stop_recording_transactions(),
            EXTENSION_TRANSACTION => {
                let reply = reply.as_deref_mut().expect("reply == nullptr");
                reply.write_binder(self.extension().as_ref())
            }
            DEBUG_PID_TRANSACTION => {
                let reply = reply.as_deref_mut().expect("reply == nullptr");
                reply.write(&(self.debug_pid() as i32))
            }
            SET_RPC_CLIENT_TRANSACTION => self.set_rpc_client_debug_from_parcel(data),
            _ => match self
                .remotable
                .on_transact(code, data, reply.as_deref_mut(), flags)
            {
                Err(StatusCode::UNKNOWN_TRANSACTION) => {
                    self.default_transact(code, data, reply.as_deref_mut())
                }
                other => other,
            },
        };

        // In case this is being transacted on in the same process.
        if let Some(reply) = reply.as_deref_mut() {
            reply.set_data_position(0);
            if reply.data_size() > LOG_REPLIES_OVER_SIZE {
                log::warn!(
                    "Large reply transaction of {} bytes, interface descriptor {}, code {}",
                    reply.data_size(),
                    T::get_descriptor(),
                    code
                );
            }
        }

        if BinderConfig::kernel_ipc()
            && self.recording_on.load(Ordering::Acquire)
            && code != START_RECORDING_TRANSACTION
        {
            if let Some(extras) = self.extras.get() {
                let state = extras.state.lock().unwrap();
                if self.recording_on.load(Ordering::Acquire) {
                    if let Some(file) = &state.recording_file {
                        let empty = Parcel::new();
                        let reply_ref = reply.as_deref().map_or(&empty, |r| &*r);
                        let recorded = RecordedTransaction::from_details(
                            T::get_descriptor(),
                            code,
                            flags,
                            SystemTime::now(),
                            data,
                            reply_ref,
                            result_status(status),
                        );
                        match recorded {
                            Some(t) => {
                                if let Err(err) = t.dump_to_file(file.as_fd()) {
                                    log::info!(
                                        "Failed to dump RecordedTransaction to file with error {err}"
                                    );
                                }
                            }
                            None => log::info!("Failed to create RecordedTransaction object."),
                        }
                    }
                }
            }
        }

        status
    }

    fn default_transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: Option<&mut Parcel>,
    ) -> Result<()> {
        match code {
            INTERFACE_TRANSACTION => {
                let reply = reply.expect("reply == nullptr");
                reply.write(T::get_descriptor())
            }

            DUMP_TRANSACTION => {
                let fd = data.read_file_descriptor()?;
                let argc: i32 = data.read()?;
                let mut args = Vec::new();
                for _ in 0..argc {
                    if data.data_avail() == 0 {
                        break;
                    }
                    args.push(data.read::<String>()?);
                }
                self.remotable.on_dump(fd.as_fd(), &args)
            }

            SHELL_COMMAND_TRANSACTION => {
                let _in = data.read_file_descriptor()?;
                let _out = data.read_file_descriptor()?;
                let _err = data.read_file_descriptor()?;
                let argc: i32 = data.read()?;
                for _ in 0..argc {
                    if data.data_avail() == 0 {
                        break;
                    }
                    let _arg: String = data.read()?;
                }
                let _callback = data.read_binder()?;
                let result_receiver = data.read_binder()?;

                // Shell commands are not routed to services on this
                // transport; tell the receiver so it does not wait.
                if let Some(receiver) = result_receiver {
                    let mut msg = Parcel::new();
                    msg.write(&(StatusCode::INVALID_OPERATION as i32))?;
                    let _ = receiver
                        .inner()
                        .transact(FIRST_CALL_TRANSACTION, &msg, None, FLAG_ONEWAY);
                }
                Ok(())
            }

            SYSPROPS_TRANSACTION => {
                if !report_sysprop_change() {
                    return Err(StatusCode::INVALID_OPERATION);
                }
                Ok(())
            }

            _ => Err(StatusCode::UNKNOWN_TRANSACTION),
        }
    }

    fn start_recording_transactions(&self, data: &Parcel) -> Result<()> {
        if !BinderConfig::recording() {
            log::warn!("Binder recording disallowed because recording is not enabled");
            return Err(StatusCode::INVALID_OPERATION);
        }
        if !BinderConfig::kernel_ipc() {
            log::warn!("Binder recording disallowed because kernel binder is not enabled");
            return Err(StatusCode::INVALID_OPERATION);
        }
        let uid = ThreadState::get_calling_uid();
        if uid != UID_ROOT {
            log::error!("Binder recording not allowed because client {uid} is not root");
            return Err(StatusCode::PERMISSION_DENIED);
        }
        let extras = self.get_or_create_extras();
        let mut state = extras.state.lock().unwrap();
        if self.recording_on.load(Ordering::Acquire) {
            log::info!("Could not start Binder recording. Another is already in progress.");
            Err(StatusCode::INVALID_OPERATION)
        } else {
            let fd = data.read_unique_file_descriptor()?;
            state.recording_file = Some(std::fs::File::from(fd));
            self.recording_on.store(true, Ordering::Release);
            log::info!("Started Binder recording.");
            Ok(())
        }
    }

    fn stop_recording_transactions(&self) -> Result<()> {
        if !BinderConfig::recording() {
            log::warn!("Binder recording disallowed because recording is not enabled");
            return Err(StatusCode::INVALID_OPERATION);
        }
        if !BinderConfig::kernel_ipc() {
            log::warn!("Binder recording disallowed because kernel binder is not enabled");
            return Err(StatusCode::INVALID_OPERATION);
        }
        let uid = ThreadState::get_calling_uid();
        if uid != UID_ROOT {
            log::error!("Binder recording not allowed because client {uid} is not root");
            return Err(StatusCode::PERMISSION_DENIED);
        }
        let extras = self.get_or_create_extras();
        let mut state = extras.state.lock().unwrap();
        if self.recording_on.load(Ordering::Acquire) {
            state.recording_file = None;
            self.recording_on.store(false, Ordering::Release);
            log::info!("Stopped Binder recording.");
            Ok(())
        } else {
            log::info!("Could not stop Binder recording. One is not in progress.");
            Err(StatusCode::INVALID_OPERATION)
        }
    }

    fn set_rpc_client_debug_from_parcel(&self, data: &Parcel) -> Result<()> {
        if !BinderConfig::rpc_dev_servers() {
            log::warn!("setRpcClientDebug disallowed because RPC is not enabled");
            return Err(StatusCode::INVALID_OPERATION);
        }
        if !BinderConfig::kernel_ipc() {
            log::warn!("setRpcClientDebug disallowed because kernel binder is not enabled");
            return Err(StatusCode::INVALID_OPERATION);
        }
        let uid = ThreadState::get_calling_uid();
        if uid != UID_ROOT {
            log::error!("setRpcClientDebug not allowed because client {uid} is not root");
            return Err(StatusCode::PERMISSION_DENIED);
        }

        let has_socket_fd: bool = data.read()?;
        let socket_fd = if has_socket_fd {
            Some(data.read_unique_file_descriptor()?)
        } else {
            None
        };
        let keep_alive = data.read_binder()?;
        self.set_rpc_client_debug(socket_fd, keep_alive)
    }

    fn set_rpc_client_debug(
        &self,
        socket_fd: Option<OwnedFd>,
        keep_alive: Option<SpIBinder>,
    ) -> Result<()> {
        if !BinderConfig::rpc_dev_servers() {
            log::warn!("setRpcClientDebug disallowed because RPC is not enabled");
            return Err(StatusCode::INVALID_OPERATION);
        }
        if !BinderConfig::kernel_ipc() {
            log::warn!("setRpcClientDebug disallowed because kernel binder is not enabled");
            return Err(StatusCode::INVALID_OPERATION);
        }

        let Some(socket_fd) = socket_fd else {
            log::error!("setRpcClientDebug: no socket fd provided.");
            return Err(StatusCode::BAD_VALUE);
        };
        let Some(keep_alive) = keep_alive else {
            log::error!("setRpcClientDebug: no keepAliveBinder provided.");
            return Err(StatusCode::UNEXPECTED_NULL);
        };

        let thread_pool_max_count = ProcessState::get_thread_pool_max_total_thread_count();
        if thread_pool_max_count <= 1 {
            log::error!(
                "setRpcClientDebug: thread pool max count is {thread_pool_max_count}. RPC is \
                 disabled for this service because RPC requires the service to support \
                 multithreading."
            );
            return Err(StatusCode::INVALID_OPERATION);
        }

        // Weak ref to avoid circular dependency:
        // BBinder -> RpcServerLink ----> RpcServer -X-> BBinder
        //                          `-X-> BBinder
        let weak_self = self.self_binder().downgrade();

        let extras = self.get_or_create_extras();
        let mut state = extras.state.lock().unwrap();
        let rpc_server = RpcServer::new();
        let link = RpcServerLink::new(rpc_server.clone(), keep_alive.clone(), weak_self.clone());
        if let Err(status) = keep_alive.inner().link_to_death(link.recipient()) {
            log::error!("setRpcClientDebug: linkToDeath on keepAliveBinder returned {status}");
            return Err(status);
        }
        rpc_server.set_root_object_weak(weak_self);
        rpc_server.setup_external_server(socket_fd)?;
        rpc_server.set_max_threads(thread_pool_max_count);
        log::info!("RpcBinder: started Binder debug on {}", T::get_descriptor());
        rpc_server.start();
        state.rpc_server_links.push(link);
        Ok(())
    }
}

fn report_sysprop_change() -> bool {
    // There is no system property service on this transport.
    false
}

impl<T: Remotable> RefAware for BinderNode<T> {
    fn ref_counts(&self) -> &RefCounts {
        &self.counts
    }

    fn on_inc_strong_attempted(&self) -> bool {
        // The node is still allocated, so it can be resurrected from a
        // weak reference.
        true
    }
}

impl<T: Remotable> LocalNode for BinderNode<T> {
    fn descriptor(&self) -> &str {
        T::get_descriptor()
    }

    fn extension(&self) -> Option<SpIBinder> {
        BinderNode::extension(self)
    }

    fn debug_pid(&self) -> libc::pid_t {
        BinderNode::debug_pid(self)
    }

    fn set_parceled(&self) {
        self.parceled.store(true, Ordering::Release);
    }

    fn set_rpc_client_debug(
        &self,
        socket_fd: Option<OwnedFd>,
        keep_alive: Option<SpIBinder>,
    ) -> Result<()> {
        BinderNode::set_rpc_client_debug(self, socket_fd, keep_alive)
    }

    fn remove_rpc_server_link(&self, link: &RpcServerLink) {
        let Some(extras) = self.extras.get() else {
            return;
        };
        let mut state = extras.state.lock().unwrap();
        state
            .rpc_server_links
            .retain(|l| !std::ptr::eq(Arc::as_ptr(l), link));
    }
}

impl<T: Remotable> IBinderInternal for BinderNode<T> {
    fn transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()> {
        self.transact_impl(code, data, reply, flags)
    }

    fn interface_descriptor(&self) -> Result<String> {
        Ok(T::get_descriptor().to_string())
    }

    fn local(&self) -> Option<&dyn LocalNode> {
        Some(self)
    }

    fn attach_object(
        &self,
        id: ObjectId,
        value: AttachedObject,
        cleanup: Option<ObjectCleanup>,
    ) -> Option<AttachedObject> {
        let mut state = self.get_or_create_extras().state.lock().unwrap();
        state.objects.attach(id, value, cleanup)
    }

    fn find_object(&self, id: ObjectId) -> Option<AttachedObject> {
        let extras = self.extras.get()?;
        let state = extras.state.lock().unwrap();
        state.objects.find(id)
    }

    fn detach_object(&self, id: ObjectId) -> Option<AttachedObject> {
        let extras = self.extras.get()?;
        let mut state = extras.state.lock().unwrap();
        state.objects.detach(id)
    }

    fn with_lock(&self, f: &mut dyn FnMut()) {
        let _state = self.get_or_create_extras().state.lock().unwrap();
        f()
    }

    fn lookup_or_create_weak(&self, id: ObjectId, make: &dyn Fn() -> SpIBinder) -> SpIBinder {
        let mut state = self.get_or_create_extras().state.lock().unwrap();
        state.objects.lookup_or_create_weak(id, make)
    }

    fn as_arc_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: Remotable> Drop for BinderNode<T> {
    fn drop(&mut self) {
        if !self.parceled.load(Ordering::Relaxed) {
            // Configuration that was never observable from another
            // process silently had no effect; flag the likely bug.
            if let Some(extras) = self.extras.get() {
                let state = extras.state.lock().unwrap();
                if state.extension.is_some() {
                    log::warn!("Binder destroyed with extension attached before being parceled.");
                }
                if state.requesting_sid {
                    log::warn!("Binder destroyed when requesting SID before being parceled.");
                }
                if state.inherit_rt {
                    log::warn!("Binder destroyed after setInheritRt before being parceled.");
                }
                if state.policy != SCHED_NORMAL || state.priority != 0 {
                    log::warn!(
                        "Binder destroyed after setMinSchedulerPolicy before being parceled."
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::Interface;

    #[test]
    fn ping_returns_ok() {
        let binder = Binder::new(());
        let data = Parcel::new();
        assert_eq!(
            binder.transact(PING_TRANSACTION, &data, None, 0),
            Ok(())
        );
    }

    #[test]
    fn unknown_code_is_rejected() {
        let binder = Binder::new(());
        let data = Parcel::new();
        let mut reply = Parcel::new();
        assert_eq!(
            binder.transact(FIRST_CALL_TRANSACTION + 7, &data, Some(&mut reply), 0),
            Err(StatusCode::UNKNOWN_TRANSACTION)
        );
    }

    #[test]
    fn interface_query_reports_descriptor() {
        let binder = Binder::new(());
        let data = Parcel::new();
        let mut reply = Parcel::new();
        binder
            .transact(INTERFACE_TRANSACTION, &data, Some(&mut reply), 0)
            .unwrap();
        assert_eq!(reply.read::<String>().unwrap(), "");
    }

    #[test]
    fn defaults_do_not_allocate_extras() {
        let binder = Binder::new(());
        binder.set_requesting_sid(false);
        binder.set_inherit_rt(false);
        binder.set_min_scheduler_policy(SCHED_NORMAL, 0);
        assert!(!binder.has_extras());

        binder.set_requesting_sid(true);
        assert!(binder.has_extras());
        assert!(binder.is_requesting_sid());
    }

    #[test]
    fn extras_allocation_is_single_winner() {
        let binder = Binder::new(());
        std::thread::scope(|s| {
            for _ in 0..8 {
                let binder = binder.clone();
                s.spawn(move || {
                    for _ in 0..100 {
                        binder.as_binder().with_lock(|| {});
                    }
                });
            }
        });
        assert!(binder.has_extras());
    }

    #[test]
    #[should_panic(expected = "parceled")]
    fn requesting_sid_frozen_after_parceling() {
        let binder = Binder::new(());
        binder.set_parceled();
        binder.set_requesting_sid(true);
    }

    #[test]
    #[should_panic(expected = "parceled")]
    fn scheduler_policy_frozen_after_parceling() {
        let binder = Binder::new(());
        binder.set_parceled();
        binder.set_min_scheduler_policy(libc::SCHED_FIFO, 10);
    }

    #[test]
    #[should_panic(expected = "parceled")]
    fn extension_frozen_after_parceling() {
        let binder = Binder::new(());
        binder.set_parceled();
        binder.set_extension(Binder::new(()).as_binder());
    }

    #[test]
    #[should_panic(expected = "Unrecognized scheduling policy")]
    fn bogus_scheduler_policy_is_fatal() {
        let binder = Binder::new(());
        binder.set_min_scheduler_policy(99, 0);
    }

    #[test]
    fn writing_to_parcel_marks_parceled() {
        let binder = Binder::new(());
        assert!(!binder.was_parceled());
        let mut parcel = Parcel::new();
        parcel.write_binder(Some(&binder.as_binder())).unwrap();
        assert!(binder.was_parceled());
    }

    #[test]
    fn debug_pid_round_trips_through_transaction() {
        let binder = Binder::new(());
        let data = Parcel::new();
        let mut reply = Parcel::new();
        binder
            .transact(DEBUG_PID_TRANSACTION, &data, Some(&mut reply), 0)
            .unwrap();
        assert_eq!(reply.read::<i32>().unwrap(), std::process::id() as i32);
    }

    // Thread-pool configuration is process-global; serialize the tests
    // that reconfigure it.
    fn pool_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fresh_listener_socket() -> (OwnedFd, u16) {
        let listener = RpcServer::new();
        let port = listener.setup_inet_server("127.0.0.1", 0).unwrap();
        (listener.release_server().unwrap(), port)
    }

    #[test]
    fn bridge_rejects_missing_socket() {
        let _pool = pool_lock();
        ProcessState::set_thread_pool_max_thread_count(4);

        let binder = Binder::new(());
        let keep_alive = Binder::new(()).as_binder();
        assert_eq!(
            binder.set_rpc_client_debug(None, Some(keep_alive)),
            Err(StatusCode::BAD_VALUE)
        );
        assert!(!binder.has_extras());
    }

    #[test]
    fn bridge_rejects_missing_keep_alive() {
        let _pool = pool_lock();
        ProcessState::set_thread_pool_max_thread_count(4);

        let binder = Binder::new(());
        let (socket, _) = fresh_listener_socket();
        assert_eq!(
            binder.set_rpc_client_debug(Some(socket), None),
            Err(StatusCode::UNEXPECTED_NULL)
        );
        assert!(!binder.has_extras());
    }

    #[test]
    fn bridge_requires_multithreaded_pool() {
        let _pool = pool_lock();
        ProcessState::set_thread_pool_max_thread_count(0);

        let binder = Binder::new(());
        let (socket, _) = fresh_listener_socket();
        let keep_alive = Binder::new(()).as_binder();
        assert_eq!(
            binder.set_rpc_client_debug(Some(socket), Some(keep_alive)),
            Err(StatusCode::INVALID_OPERATION)
        );
        assert_eq!(binder.rpc_server_link_count(), 0);

        ProcessState::set_thread_pool_max_thread_count(4);
    }

    #[test]
    fn bridge_rejects_local_keep_alive() {
        let _pool = pool_lock();
        ProcessState::set_thread_pool_max_thread_count(4);

        // A local keep-alive cannot be watched for death.
        let binder = Binder::new(());
        let (socket, _) = fresh_listener_socket();
        let keep_alive = Binder::new(()).as_binder();
        assert_eq!(
            binder.set_rpc_client_debug(Some(socket), Some(keep_alive)),
            Err(StatusCode::INVALID_OPERATION)
        );
        assert_eq!(binder.rpc_server_link_count(), 0);
    }

    #[test]
    fn bridge_tears_down_when_keep_alive_dies() {
        use crate::rpc::RpcSession;
        use std::time::{Duration, Instant};

        let _pool = pool_lock();
        ProcessState::set_thread_pool_max_thread_count(4);

        let keep_alive_host = RpcServer::new();
        keep_alive_host.set_root_object(Binder::new(()).as_binder());
        let keep_alive_port = keep_alive_host.setup_inet_server("127.0.0.1", 0).unwrap();
        keep_alive_host.start();
        let keep_alive = RpcSession::setup_inet_client("127.0.0.1", keep_alive_port).unwrap();

        let binder = Binder::new(());
        let (socket, bridge_port) = fresh_listener_socket();
        binder
            .set_rpc_client_debug(Some(socket), Some(keep_alive))
            .unwrap();
        assert_eq!(binder.rpc_server_link_count(), 1);

        let debug_client = RpcSession::setup_inet_client("127.0.0.1", bridge_port).unwrap();
        debug_client.ping_binder().unwrap();

        assert!(keep_alive_host.shutdown());

        let deadline = Instant::now() + Duration::from_secs(5);
        while binder.rpc_server_link_count() != 0 {
            assert!(Instant::now() < deadline, "bridge link was not removed");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn extension_round_trips_through_transaction() {
        let service = Binder::new(());
        let extension = Binder::new(()).as_binder();
        service.set_extension(extension.clone());

        let data = Parcel::new();
        let mut reply = Parcel::new();
        service
            .transact(EXTENSION_TRANSACTION, &data, Some(&mut reply), 0)
            .unwrap();
        assert_eq!(reply.read_binder().unwrap(), Some(extension));
    }
}
