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

use super::server::RpcServer;
use super::socket::{self, PollOutcome, RpcSocket};
use super::wire::{self, CMD_REPLY, CMD_TRANSACT};
use crate::binder::{
    IBinder, TransactionCode, TransactionFlags, FLAG_ONEWAY, INTERFACE_TRANSACTION,
};
use crate::error::{result_status, status_result, Result, StatusCode};
use crate::object_manager::{AttachedObject, ObjectCleanup, ObjectId, ObjectManager};
use crate::parcel::Parcel;
use crate::proxy::{DeathRecipient, IBinderInternal, RemoteNode, SpIBinder};
use crate::refbase::{RefAware, RefCounts};
use crate::state::ThreadState;

use std::any::Any;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak as ArcWeak};

/// Client half of the RPC transport: connects to an [`RpcServer`] and
/// hands back a proxy for its root object.
pub struct RpcSession;

impl RpcSession {
    pub fn setup_inet_client(address: &str, port: u16) -> Result<SpIBinder> {
        let stream = TcpStream::connect((address, port)).map_err(|e| {
            log::error!("setupInetClient: cannot connect to {address}:{port}: {e}");
            StatusCode::from(e)
        })?;
        Self::setup_preconnected_client(stream.into())
    }

    pub fn setup_unix_domain_client(path: &Path) -> Result<SpIBinder> {
        let stream = UnixStream::connect(path).map_err(|e| {
            log::error!(
                "setupUnixDomainClient: cannot connect to {}: {e}",
                path.display()
            );
            StatusCode::from(e)
        })?;
        Self::setup_preconnected_client(stream.into())
    }

    /// Adopt an already-connected stream socket as a session.
    pub fn setup_preconnected_client(fd: OwnedFd) -> Result<SpIBinder> {
        let connection = SessionConnection::new(fd)?;
        Ok(SpIBinder::new(ProxyNode::new(connection)))
    }
}

struct SessionConnection {
    stream: Mutex<RpcSocket>,
    dead: AtomicBool,
    recipients: Mutex<Vec<(u64, ArcWeak<dyn Fn() + Send + Sync>)>>,
    // Write end of the monitor cancel pipe; closing it (on drop) stops
    // the monitor thread.
    monitor_cancel: Mutex<Option<OwnedFd>>,
}

impl SessionConnection {
    fn new(fd: OwnedFd) -> Result<Arc<SessionConnection>> {
        let monitor_fd = fd
            .as_fd()
            .try_clone_to_owned()
            .map_err(StatusCode::from)?;
        // The monitor polls the pipe's read end; the connection keeps the
        // write end so dropping the connection cancels the monitor.
        let (cancel_read, cancel_write) =
            super::fd_trigger::pipe().map_err(StatusCode::from)?;

        let connection = Arc::new(SessionConnection {
            stream: Mutex::new(RpcSocket::new(fd)),
            dead: AtomicBool::new(false),
            recipients: Mutex::new(Vec::new()),
            monitor_cancel: Mutex::new(Some(cancel_write)),
        });

        let weak = Arc::downgrade(&connection);
        std::thread::Builder::new()
            .name("rpc_session_monitor".to_string())
            .spawn(move || monitor_loop(weak, monitor_fd, cancel_read))
            .map_err(StatusCode::from)?;
        Ok(connection)
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Flip to dead exactly once and deliver death notifications.
    fn mark_dead(&self) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        let recipients: Vec<_> = self.recipients.lock().unwrap().drain(..).collect();
        for (_, callback) in recipients {
            if let Some(callback) = callback.upgrade() {
                callback();
            }
        }
    }

    fn transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()> {
        if self.is_dead() {
            return Err(StatusCode::DEAD_OBJECT);
        }
        wire::check_wire_safe(data)?;
        let oneway = flags & FLAG_ONEWAY != 0;

        let exchanged: io::Result<Option<(wire::FrameHeader, Vec<u8>)>> = {
            let mut stream = self.stream.lock().unwrap();
            (|| {
                wire::write_frame(&mut *stream, CMD_TRANSACT, code, flags, 0, data.data())?;
                if oneway {
                    return Ok(None);
                }
                wire::read_frame(&mut *stream).map(Some)
            })()
        };

        match exchanged {
            Err(e) => {
                log::warn!("RPC transaction failed, marking session dead: {e}");
                self.mark_dead();
                Err(StatusCode::DEAD_OBJECT)
            }
            Ok(None) => Ok(()),
            Ok(Some((header, body))) => {
                if header.command != CMD_REPLY {
                    self.mark_dead();
                    return Err(StatusCode::FAILED_TRANSACTION);
                }
                if let Some(reply) = reply {
                    reply.set_data(body);
                }
                status_result(header.status)
            }
        }
    }
}

impl Drop for SessionConnection {
    fn drop(&mut self) {
        self.monitor_cancel.lock().unwrap().take();
    }
}

fn monitor_loop(
    connection: ArcWeak<SessionConnection>,
    fd: OwnedFd,
    cancel: OwnedFd,
) {
    match socket::wait_hangup(fd.as_fd(), cancel.as_fd()) {
        Ok(PollOutcome::Ready) => {
            if let Some(connection) = connection.upgrade() {
                connection.mark_dead();
            }
        }
        Ok(PollOutcome::Triggered) | Err(_) => {}
    }
}

/// Remote proxy node: the object behind an [`SpIBinder`] whose peer
/// lives across a session.
pub(crate) struct ProxyNode {
    connection: Arc<SessionConnection>,
    descriptor: Mutex<Option<String>>,
    objects: Mutex<ObjectManager>,
    counts: RefCounts,
}

impl ProxyNode {
    fn new(connection: Arc<SessionConnection>) -> Arc<ProxyNode> {
        Arc::new(ProxyNode {
            connection,
            descriptor: Mutex::new(None),
            objects: Mutex::new(ObjectManager::new()),
            counts: RefCounts::new(),
        })
    }
}

impl RefAware for ProxyNode {
    fn ref_counts(&self) -> &RefCounts {
        &self.counts
    }

    fn on_inc_strong_attempted(&self) -> bool {
        !self.connection.is_dead()
    }
}

impl RemoteNode for ProxyNode {
    fn is_dead(&self) -> bool {
        self.connection.is_dead()
    }
}

impl IBinderInternal for ProxyNode {
    fn transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()> {
        self.connection.transact(code, data, reply, flags)
    }

    fn interface_descriptor(&self) -> Result<String> {
        if let Some(descriptor) = &*self.descriptor.lock().unwrap() {
            return Ok(descriptor.clone());
        }
        let data = Parcel::new();
        let mut reply = Parcel::new();
        self.connection
            .transact(INTERFACE_TRANSACTION, &data, Some(&mut reply), 0)?;
        let descriptor: String = reply.read()?;
        *self.descriptor.lock().unwrap() = Some(descriptor.clone());
        Ok(descriptor)
    }

    fn remote(&self) -> Option<&dyn RemoteNode> {
        Some(self)
    }

    fn link_to_death(&self, recipient: &DeathRecipient) -> Result<()> {
        if self.connection.is_dead() {
            return Err(StatusCode::DEAD_OBJECT);
        }
        self.connection
            .recipients
            .lock()
            .unwrap()
            .push((recipient.cookie(), recipient.weak_callback()));
        Ok(())
    }

    fn unlink_to_death(&self, recipient: &DeathRecipient) -> Result<()> {
        let mut recipients = self.connection.recipients.lock().unwrap();
        let before = recipients.len();
        recipients.retain(|(cookie, _)| *cookie != recipient.cookie());
        if recipients.len() == before {
            return Err(StatusCode::NAME_NOT_FOUND);
        }
        Ok(())
    }

    fn attach_object(
        &self,
        id: ObjectId,
        value: AttachedObject,
        cleanup: Option<ObjectCleanup>,
    ) -> Option<AttachedObject> {
        self.objects.lock().unwrap().attach(id, value, cleanup)
    }

    fn find_object(&self, id: ObjectId) -> Option<AttachedObject> {
        self.objects.lock().unwrap().find(id)
    }

    fn detach_object(&self, id: ObjectId) -> Option<AttachedObject> {
        self.objects.lock().unwrap().detach(id)
    }

    fn with_lock(&self, f: &mut dyn FnMut()) {
        let _objects = self.objects.lock().unwrap();
        f()
    }

    fn lookup_or_create_weak(&self, id: ObjectId, make: &dyn Fn() -> SpIBinder) -> SpIBinder {
        self.objects.lock().unwrap().lookup_or_create_weak(id, make)
    }

    fn as_arc_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Serve one accepted connection until the peer hangs up or the server
/// shuts down.
pub(crate) fn serve_connection(server: &Arc<RpcServer>, fd: OwnedFd) {
    let peer = socket::peer_credentials(fd.as_fd());
    let mut stream = RpcSocket::new(fd);

    loop {
        match socket::wait_readable(stream.as_fd(), server.trigger()) {
            Ok(PollOutcome::Ready) => {}
            Ok(PollOutcome::Triggered) | Err(_) => return,
        }
        let (header, body) = match wire::read_frame(&mut stream) {
            Ok(frame) => frame,
            // EOF is a normal client disconnect.
            Err(_) => return,
        };
        if header.command != CMD_TRANSACT {
            log::error!("RPC session received unexpected command {}", header.command);
            return;
        }
        let oneway = header.flags & FLAG_ONEWAY != 0;

        let Some(root) = server.root_binder() else {
            if !oneway {
                let _ = wire::write_frame(
                    &mut stream,
                    CMD_REPLY,
                    header.code,
                    header.flags,
                    StatusCode::DEAD_OBJECT as i32,
                    &[],
                );
            }
            continue;
        };

        // Attribute the dispatch to the connecting process where the
        // transport can tell us who that is.
        let identity = peer.map(|(uid, pid)| ThreadState::set_calling_identity(uid, pid));
        let data = Parcel::from_bytes(body);
        // Even oneway dispatches get a (discarded) reply parcel: handlers
        // that contractually require one must not be reachable as a fault
        // from across the transport.
        let mut reply = Parcel::new();
        let mut status = root.transact(header.code, &data, Some(&mut reply), header.flags);
        drop(identity);

        if oneway {
            continue;
        }

        let body = match (status, wire::check_wire_safe(&reply)) {
            (Ok(()), Ok(())) => reply.data().to_vec(),
            (Ok(()), Err(wire_err)) => {
                log::error!("RPC reply carries objects that cannot cross the transport");
                status = Err(wire_err);
                Vec::new()
            }
            _ => Vec::new(),
        };
        if wire::write_frame(
            &mut stream,
            CMD_REPLY,
            header.code,
            header.flags,
            result_status(status),
            &body,
        )
        .is_err()
        {
            return;
        }
    }
}
