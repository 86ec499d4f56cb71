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

//! Generic binder handles and the proxy ownership protocol.

use crate::binder::{
    FromIBinder, IBinder, Interface, TransactionCode, TransactionFlags, DEBUG_PID_TRANSACTION,
    DUMP_TRANSACTION, EXTENSION_TRANSACTION, PING_TRANSACTION, SET_RPC_CLIENT_TRANSACTION,
};
use crate::error::{Result, StatusCode};
use crate::object_manager::{AttachedObject, ObjectCleanup, ObjectId};
use crate::parcel::{Deserialize, Parcel, Serialize, SerializeOption};
use crate::refbase::{self, RefAware, RefCounts};

use std::any::Any;
use std::marker::PhantomData;
use std::ops::Deref;
use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak as ArcWeak};

/// Operations only a local (in-process) object supports.
pub(crate) trait LocalNode: Send + Sync {
    fn descriptor(&self) -> &str;
    fn extension(&self) -> Option<SpIBinder>;
    fn debug_pid(&self) -> libc::pid_t;
    fn set_parceled(&self);
    fn set_rpc_client_debug(
        &self,
        socket_fd: Option<OwnedFd>,
        keep_alive: Option<SpIBinder>,
    ) -> Result<()>;
    fn remove_rpc_server_link(&self, link: &crate::native::RpcServerLink);
}

/// Operations only a remote proxy supports.
pub(crate) trait RemoteNode: Send + Sync {
    fn is_dead(&self) -> bool;
}

/// The role-polymorphic object behind a binder handle. Exactly one of
/// `local()` / `remote()` returns `Some` for any concrete implementation.
pub(crate) trait IBinderInternal: RefAware + Send + Sync + 'static {
    fn transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()>;

    fn interface_descriptor(&self) -> Result<String>;

    fn local(&self) -> Option<&dyn LocalNode> {
        None
    }

    fn remote(&self) -> Option<&dyn RemoteNode> {
        None
    }

    fn link_to_death(&self, _recipient: &DeathRecipient) -> Result<()> {
        Err(StatusCode::INVALID_OPERATION)
    }

    fn unlink_to_death(&self, _recipient: &DeathRecipient) -> Result<()> {
        Err(StatusCode::INVALID_OPERATION)
    }

    fn attach_object(
        &self,
        id: ObjectId,
        value: AttachedObject,
        cleanup: Option<ObjectCleanup>,
    ) -> Option<AttachedObject>;

    fn find_object(&self, id: ObjectId) -> Option<AttachedObject>;

    fn detach_object(&self, id: ObjectId) -> Option<AttachedObject>;

    fn with_lock(&self, f: &mut dyn FnMut());

    fn lookup_or_create_weak(&self, id: ObjectId, make: &dyn Fn() -> SpIBinder) -> SpIBinder;

    fn as_arc_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A strong reference to a binder object, local or remote.
///
/// This is the Rust equivalent of the C++ `sp<IBinder>`: holding one
/// keeps a strong protocol reference on the underlying object, released
/// again on drop. The wrapper is untyped; typed interface access goes
/// through [`FromIBinder`] / [`Strong`].
pub struct SpIBinder(Arc<dyn IBinderInternal>);

impl SpIBinder {
    /// Take a new strong reference on `inner`.
    pub(crate) fn new(inner: Arc<dyn IBinderInternal>) -> SpIBinder {
        refbase::inc_strong(&*inner);
        SpIBinder(inner)
    }

    /// Adopt an already-counted strong reference (e.g. from a successful
    /// weak promotion).
    pub(crate) fn from_counted(inner: Arc<dyn IBinderInternal>) -> SpIBinder {
        SpIBinder(inner)
    }

    pub(crate) fn inner(&self) -> &Arc<dyn IBinderInternal> {
        &self.0
    }

    /// Return true if this binder object is hosted in a different process
    /// than the current one.
    pub fn is_remote(&self) -> bool {
        self.0.remote().is_some()
    }

    /// Create a weak handle to the same object.
    pub fn downgrade(&self) -> WpIBinder {
        WpIBinder::new(self)
    }

    pub(crate) fn mark_parceled_if_local(&self) {
        if let Some(local) = self.0.local() {
            local.set_parceled();
        }
    }

    /// Attach an object under `id`, replacing (and returning) any
    /// previous entry for that key.
    pub fn attach_object(
        &self,
        id: ObjectId,
        value: AttachedObject,
        cleanup: Option<ObjectCleanup>,
    ) -> Option<AttachedObject> {
        self.0.attach_object(id, value, cleanup)
    }

    pub fn find_object(&self, id: ObjectId) -> Option<AttachedObject> {
        self.0.find_object(id)
    }

    pub fn detach_object(&self, id: ObjectId) -> Option<AttachedObject> {
        self.0.detach_object(id)
    }

    /// Run `f` under the object's side-table lock.
    pub fn with_lock(&self, mut f: impl FnMut()) {
        self.0.with_lock(&mut f)
    }

    pub fn lookup_or_create_weak(
        &self,
        id: ObjectId,
        make: impl Fn() -> SpIBinder,
    ) -> SpIBinder {
        self.0.lookup_or_create_weak(id, &make)
    }

    #[cfg(test)]
    pub(crate) fn protocol_counts(&self) -> &RefCounts {
        self.0.ref_counts()
    }
}

impl IBinder for SpIBinder {
    fn interface_descriptor(&self) -> Result<String> {
        self.0.interface_descriptor()
    }

    fn is_binder_alive(&self) -> bool {
        match self.0.remote() {
            Some(remote) => !remote.is_dead(),
            None => true,
        }
    }

    fn ping_binder(&self) -> Result<()> {
        let data = Parcel::new();
        let mut reply = Parcel::new();
        self.transact(PING_TRANSACTION, &data, Some(&mut reply), 0)
    }

    fn dump(&self, fd: BorrowedFd<'_>, args: &[&str]) -> Result<()> {
        let mut data = Parcel::new();
        data.write_file_descriptor(fd)?;
        data.write(&(args.len() as i32))?;
        for arg in args {
            data.write(*arg)?;
        }
        let mut reply = Parcel::new();
        self.transact(DUMP_TRANSACTION, &data, Some(&mut reply), 0)
    }

    fn get_extension(&self) -> Result<Option<SpIBinder>> {
        if let Some(local) = self.0.local() {
            return Ok(local.extension());
        }
        let data = Parcel::new();
        let mut reply = Parcel::new();
        self.transact(EXTENSION_TRANSACTION, &data, Some(&mut reply), 0)?;
        reply.read_binder()
    }

    fn get_debug_pid(&self) -> Result<libc::pid_t> {
        if let Some(local) = self.0.local() {
            return Ok(local.debug_pid());
        }
        let data = Parcel::new();
        let mut reply = Parcel::new();
        self.transact(DEBUG_PID_TRANSACTION, &data, Some(&mut reply), 0)?;
        let pid: i32 = reply.read()?;
        if pid < 0 {
            return Err(StatusCode::BAD_VALUE);
        }
        Ok(pid as libc::pid_t)
    }

    fn set_rpc_client_debug(
        &self,
        socket_fd: Option<OwnedFd>,
        keep_alive: Option<SpIBinder>,
    ) -> Result<()> {
        if let Some(local) = self.0.local() {
            return local.set_rpc_client_debug(socket_fd, keep_alive);
        }
        let mut data = Parcel::new();
        data.write(&socket_fd.is_some())?;
        if let Some(fd) = socket_fd {
            data.write_owned_file_descriptor(fd)?;
        }
        data.write_binder(keep_alive.as_ref())?;
        let mut reply = Parcel::new();
        self.transact(SET_RPC_CLIENT_TRANSACTION, &data, Some(&mut reply), 0)
    }

    fn transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()> {
        self.0.transact(code, data, reply, flags)
    }

    fn link_to_death(&self, recipient: &DeathRecipient) -> Result<()> {
        self.0.link_to_death(recipient)
    }

    fn unlink_to_death(&self, recipient: &DeathRecipient) -> Result<()> {
        self.0.unlink_to_death(recipient)
    }
}

impl Clone for SpIBinder {
    fn clone(&self) -> SpIBinder {
        SpIBinder::new(self.0.clone())
    }
}

impl Drop for SpIBinder {
    fn drop(&mut self) {
        refbase::dec_strong(&*self.0);
    }
}

impl PartialEq for SpIBinder {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SpIBinder {}

impl std::fmt::Debug for SpIBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("SpIBinder")
    }
}

impl Serialize for SpIBinder {
    fn serialize(&self, parcel: &mut Parcel) -> Result<()> {
        parcel.write_binder(Some(self))
    }
}

impl SerializeOption for SpIBinder {
    fn serialize_option(this: Option<&Self>, parcel: &mut Parcel) -> Result<()> {
        parcel.write_binder(this)
    }
}

impl Deserialize for SpIBinder {
    fn deserialize(parcel: &Parcel) -> Result<SpIBinder> {
        parcel
            .read_binder()
            .transpose()
            .unwrap_or(Err(StatusCode::UNEXPECTED_NULL))
    }
}

impl crate::parcel::DeserializeOption for SpIBinder {
    fn deserialize_option(parcel: &Parcel) -> Result<Option<SpIBinder>> {
        parcel.read_binder()
    }
}

/// A weak reference to a binder object.
///
/// Holding one does not keep the object's strong protocol count alive;
/// [`promote`](WpIBinder::promote) attempts to recover a strong handle.
pub struct WpIBinder {
    inner: ArcWeak<dyn IBinderInternal>,
}

impl WpIBinder {
    fn new(binder: &SpIBinder) -> WpIBinder {
        refbase::inc_weak(binder.0.ref_counts());
        WpIBinder {
            inner: Arc::downgrade(&binder.0),
        }
    }

    /// Promote this weak reference to a strong reference, failing if the
    /// object no longer accepts strong references.
    pub fn promote(&self) -> Option<SpIBinder> {
        let arc = self.inner.upgrade()?;
        if refbase::attempt_inc_strong(&*arc) {
            Some(SpIBinder::from_counted(arc))
        } else {
            None
        }
    }
}

impl Clone for WpIBinder {
    fn clone(&self) -> WpIBinder {
        if let Some(arc) = self.inner.upgrade() {
            refbase::inc_weak(arc.ref_counts());
        }
        WpIBinder {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for WpIBinder {
    fn drop(&mut self) {
        if let Some(arc) = self.inner.upgrade() {
            refbase::dec_weak(arc.ref_counts());
        }
    }
}

impl std::fmt::Debug for WpIBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("WpIBinder")
    }
}

static NEXT_RECIPIENT_COOKIE: AtomicU64 = AtomicU64::new(1);

/// A callback invoked when a remote binder object dies.
///
/// Objects the recipient is linked to hold it weakly; dropping the
/// recipient disarms any remaining links.
pub struct DeathRecipient {
    cookie: u64,
    callback: Arc<dyn Fn() + Send + Sync + 'static>,
}

impl DeathRecipient {
    /// Create a new death recipient that will call the given callback
    /// when its associated object dies.
    pub fn new<F>(callback: F) -> DeathRecipient
    where
        F: Fn() + Send + Sync + 'static,
    {
        DeathRecipient {
            cookie: NEXT_RECIPIENT_COOKIE.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
        }
    }

    pub(crate) fn cookie(&self) -> u64 {
        self.cookie
    }

    pub(crate) fn weak_callback(&self) -> ArcWeak<dyn Fn() + Send + Sync + 'static> {
        Arc::downgrade(&self.callback)
    }
}

impl std::fmt::Debug for DeathRecipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeathRecipient")
            .field("cookie", &self.cookie)
            .finish()
    }
}

const REMOTE_ACQUIRED: u32 = 0x0000_0001;

/// Base of a typed interface proxy: manages transfer of the remote's
/// strong ownership from whoever constructed the proxy to the proxy
/// itself.
///
/// Construction provisionally takes a strong reference on the remote and
/// a weak reference held for the proxy's entire lifetime. The transfer is
/// confirmed the first time the proxy itself gains a strong referent
/// (via [`Strong`]); from then on, the matching release happens when the
/// proxy's own strong count reaches zero. If the transfer is never
/// confirmed, the destructor releases the provisional reference instead.
/// Exactly one of the two release paths runs.
pub struct BpRefBase {
    remote: Option<Arc<dyn IBinderInternal>>,
    refs: Option<WpIBinder>,
    state: AtomicU32,
    counts: RefCounts,
}

impl BpRefBase {
    pub fn new(binder: SpIBinder) -> BpRefBase {
        let remote = binder.0.clone();
        // Removed on first acquisition of the proxy itself, or by the
        // destructor if that never happens.
        refbase::inc_strong(&*remote);
        let refs = binder.downgrade();
        BpRefBase {
            remote: Some(remote),
            refs: Some(refs),
            state: AtomicU32::new(0),
            counts: RefCounts::new(),
        }
    }

    /// The remote object this proxy transacts on.
    pub fn remote(&self) -> Option<SpIBinder> {
        self.remote.as_ref().map(|r| SpIBinder::new(r.clone()))
    }
}

impl RefAware for BpRefBase {
    fn ref_counts(&self) -> &RefCounts {
        &self.counts
    }

    fn on_first_ref(&self) {
        self.state.fetch_or(REMOTE_ACQUIRED, Ordering::Relaxed);
    }

    fn on_last_strong_ref(&self) {
        if let Some(remote) = &self.remote {
            refbase::dec_strong(&**remote);
        }
    }

    fn on_inc_strong_attempted(&self) -> bool {
        match &self.remote {
            Some(remote) => refbase::attempt_inc_strong(&**remote),
            None => false,
        }
    }
}

impl Drop for BpRefBase {
    fn drop(&mut self) {
        if let Some(remote) = &self.remote {
            if self.state.load(Ordering::Relaxed) & REMOTE_ACQUIRED == 0 {
                refbase::dec_strong(&**remote);
            }
        }
        // `refs` drops here, releasing the weak reference held since
        // construction.
        self.refs.take();
    }
}

/// A strong reference to a typed binder interface.
///
/// For proxies, the first `Strong` created over an interface object
/// confirms the remote ownership transfer started at construction; the
/// last one dropped releases it.
pub struct Strong<I: FromIBinder + ?Sized>(Arc<I>);

impl<I: FromIBinder + ?Sized> Strong<I> {
    pub fn new(binder: Box<I>) -> Strong<I> {
        let arc: Arc<I> = Arc::from(binder);
        if let Some(proxy) = arc.as_proxy() {
            refbase::inc_strong(proxy);
        }
        Strong(arc)
    }

    /// Construct a new weak reference to this interface.
    pub fn downgrade(this: &Strong<I>) -> Weak<I> {
        Weak {
            weak_binder: this.0.as_binder().downgrade(),
            interface_type: PhantomData,
        }
    }
}

impl<I: FromIBinder + ?Sized> Clone for Strong<I> {
    fn clone(&self) -> Strong<I> {
        if let Some(proxy) = self.0.as_proxy() {
            refbase::inc_strong(proxy);
        }
        Strong(self.0.clone())
    }
}

impl<I: FromIBinder + ?Sized> Drop for Strong<I> {
    fn drop(&mut self) {
        if let Some(proxy) = self.0.as_proxy() {
            refbase::dec_strong(proxy);
        }
    }
}

impl<I: FromIBinder + ?Sized> Deref for Strong<I> {
    type Target = I;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<I: FromIBinder + ?Sized> std::fmt::Debug for Strong<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("Strong")
    }
}

/// A weak reference to a typed binder interface.
pub struct Weak<I: FromIBinder + ?Sized> {
    weak_binder: WpIBinder,
    interface_type: PhantomData<fn() -> Box<I>>,
}

impl<I: FromIBinder + ?Sized> Weak<I> {
    /// Upgrade to a [`Strong`] reference, re-associating the interface
    /// type.
    pub fn promote(&self) -> Result<Strong<I>> {
        let binder = self.weak_binder.promote().ok_or(StatusCode::DEAD_OBJECT)?;
        FromIBinder::try_from(binder)
    }
}

impl<I: FromIBinder + ?Sized> Clone for Weak<I> {
    fn clone(&self) -> Weak<I> {
        Weak {
            weak_binder: self.weak_binder.clone(),
            interface_type: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Binder;

    #[test]
    fn role_exclusivity() {
        let local = Binder::new(()).as_binder();
        assert!(local.inner().local().is_some());
        assert!(local.inner().remote().is_none());
        assert!(!local.is_remote());
    }

    #[test]
    fn weak_promotion_follows_liveness() {
        let service = Binder::new(());
        let strong = service.as_binder();
        let weak = strong.downgrade();
        assert!(weak.promote().is_some());

        // The service wrapper keeps the node alive, so promotion still
        // succeeds after all strong handles drop.
        drop(strong);
        assert!(weak.promote().is_some());
    }

    #[test]
    fn side_table_attach_find_detach() {
        use crate::object_manager::ObjectId;
        use std::sync::Arc as StdArc;

        let binder = Binder::new(()).as_binder();
        let id = ObjectId(42);
        assert!(binder.find_object(id).is_none());

        binder.attach_object(id, StdArc::new("payload"), None);
        let found = binder.find_object(id).unwrap();
        assert_eq!(*found.downcast::<&str>().unwrap(), "payload");

        // Replace silently, last writer wins.
        let displaced = binder.attach_object(id, StdArc::new("other"), None).unwrap();
        assert_eq!(*displaced.downcast::<&str>().unwrap(), "payload");

        assert!(binder.detach_object(id).is_some());
        assert!(binder.find_object(id).is_none());
    }

    #[test]
    fn lookup_or_create_weak_reuses_live_entries() {
        use crate::object_manager::ObjectId;

        let owner = Binder::new(()).as_binder();
        let id = ObjectId(7);

        let first = owner.lookup_or_create_weak(id, || Binder::new(()).as_binder());
        let second = owner.lookup_or_create_weak(id, || Binder::new(()).as_binder());
        assert_eq!(first, second);

        // Once the stored binder is gone, a fresh one is created.
        drop(first);
        drop(second);
        let third = owner.lookup_or_create_weak(id, || Binder::new(()).as_binder());
        let fourth = owner.lookup_or_create_weak(id, || Binder::new(()).as_binder());
        assert_eq!(third, fourth);
    }

    #[test]
    fn unconfirmed_proxy_releases_exactly_once() {
        let remote = Binder::new(()).as_binder();
        let strong_before = remote.protocol_counts().strong_count();
        let weak_before = remote.protocol_counts().weak_count();

        let base = BpRefBase::new(remote.clone());
        assert_eq!(remote.protocol_counts().strong_count(), strong_before + 1);
        assert_eq!(remote.protocol_counts().weak_count(), weak_before + 1);

        // Never acquired by a Strong handle: the destructor path must
        // release the provisional reference, once.
        drop(base);
        assert_eq!(remote.protocol_counts().strong_count(), strong_before);
        assert_eq!(remote.protocol_counts().weak_count(), weak_before);
    }

    #[test]
    fn confirmed_proxy_releases_via_last_strong_ref() {
        let remote = Binder::new(()).as_binder();
        let strong_before = remote.protocol_counts().strong_count();
        let weak_before = remote.protocol_counts().weak_count();

        let base = BpRefBase::new(remote.clone());

        // Simulate the proxy gaining and losing its first strong
        // referent.
        refbase::inc_strong(&base);
        assert_eq!(remote.protocol_counts().strong_count(), strong_before + 1);
        refbase::dec_strong(&base);

        // on_last_strong_ref released the remote already; the destructor
        // must not release it a second time.
        assert_eq!(remote.protocol_counts().strong_count(), strong_before);
        drop(base);
        assert_eq!(remote.protocol_counts().strong_count(), strong_before);
        assert_eq!(remote.protocol_counts().weak_count(), weak_before);
    }

    #[test]
    fn proxy_resurrection_reacquires_remote() {
        let remote = Binder::new(()).as_binder();
        let strong_before = remote.protocol_counts().strong_count();

        let base = BpRefBase::new(remote.clone());
        refbase::inc_strong(&base);
        refbase::dec_strong(&base);
        assert_eq!(remote.protocol_counts().strong_count(), strong_before);

        // A weak holder of the proxy promotes it back to life; this must
        // re-take a strong reference on the remote.
        assert!(refbase::attempt_inc_strong(&base));
        assert_eq!(remote.protocol_counts().strong_count(), strong_before + 1);
        refbase::dec_strong(&base);
        drop(base);
        assert_eq!(remote.protocol_counts().strong_count(), strong_before);
    }
}
