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

//! Trait definitions for binder objects

use crate::error::{Result, StatusCode};
use crate::parcel::Parcel;
use crate::proxy::{BpRefBase, DeathRecipient, SpIBinder, Strong};

use std::os::unix::io::{BorrowedFd, OwnedFd};

/// Binder action to perform.
///
/// This must be a number between [`FIRST_CALL_TRANSACTION`] and
/// [`LAST_CALL_TRANSACTION`], or one of the reserved framework codes.
pub type TransactionCode = u32;

/// Additional operation flags.
///
/// Can be either 0 for a normal RPC, or [`FLAG_ONEWAY`] for a one-way RPC.
pub type TransactionFlags = u32;

const fn b_pack_chars(c1: u8, c2: u8, c3: u8, c4: u8) -> u32 {
    ((c1 as u32) << 24) | ((c2 as u32) << 16) | ((c3 as u32) << 8) | (c4 as u32)
}

/// First transaction code available for user commands (inclusive).
pub const FIRST_CALL_TRANSACTION: TransactionCode = 0x0000_0001;
/// Last transaction code available for user commands (inclusive).
pub const LAST_CALL_TRANSACTION: TransactionCode = 0x00ff_ffff;

pub const PING_TRANSACTION: TransactionCode = b_pack_chars(b'_', b'P', b'N', b'G');
pub const DUMP_TRANSACTION: TransactionCode = b_pack_chars(b'_', b'D', b'M', b'P');
pub const SHELL_COMMAND_TRANSACTION: TransactionCode = b_pack_chars(b'_', b'C', b'M', b'D');
pub const INTERFACE_TRANSACTION: TransactionCode = b_pack_chars(b'_', b'N', b'T', b'F');
pub const SYSPROPS_TRANSACTION: TransactionCode = b_pack_chars(b'_', b'S', b'P', b'R');
pub const EXTENSION_TRANSACTION: TransactionCode = b_pack_chars(b'_', b'E', b'X', b'T');
pub const DEBUG_PID_TRANSACTION: TransactionCode = b_pack_chars(b'_', b'P', b'I', b'D');
pub const SET_RPC_CLIENT_TRANSACTION: TransactionCode = b_pack_chars(b'_', b'R', b'P', b'C');
pub const START_RECORDING_TRANSACTION: TransactionCode = b_pack_chars(b'_', b'S', b'R', b'D');
pub const STOP_RECORDING_TRANSACTION: TransactionCode = b_pack_chars(b'_', b'E', b'R', b'D');

/// Corresponds to TF_ONE_WAY -- an asynchronous call.
pub const FLAG_ONEWAY: TransactionFlags = 0x0000_0001;
/// Corresponds to TF_CLEAR_BUF -- zero the reply buffer after use.
pub const FLAG_CLEAR_BUF: TransactionFlags = 0x0000_0020;
/// Private userspace flag for transactions issued from a vendor context.
pub const FLAG_PRIVATE_VENDOR: TransactionFlags = 0x1000_0000;

/// Super-trait for binder interfaces.
///
/// This trait allows conversion of a binder interface trait object into an
/// [`SpIBinder`]. All binder remotable interfaces must implement this
/// trait.
pub trait Interface: Send + Sync {
    /// Convert this binder object into a generic [`SpIBinder`] reference.
    fn as_binder(&self) -> SpIBinder {
        panic!("This object was not a Binder object and cannot be converted into an SpIBinder.")
    }

    /// The proxy base of this object, if it is a remote interface proxy.
    fn as_proxy(&self) -> Option<&BpRefBase> {
        None
    }
}

/// A local service that can be remotable via binder.
///
/// An object implementing this trait is made into a binder service via
/// `Binder::new(object)`. This is a low-level interface; services are
/// normally declared through [`declare_binder_interface!`], which
/// generates the `Remotable` container for a user-defined interface trait.
pub trait Remotable: Send + Sync + 'static {
    /// The binder interface descriptor string.
    ///
    /// This string is a unique identifier for a binder interface, and
    /// should be the same between all implementations of that interface.
    fn get_descriptor() -> &'static str
    where
        Self: Sized;

    /// Handle and reply to a request to invoke a transaction on this
    /// object.
    ///
    /// `reply` may be [`None`] if the sender does not expect a reply.
    ///
    /// Returning `Err(StatusCode::UNKNOWN_TRANSACTION)` forwards the
    /// transaction to the framework's default handlers (interface query,
    /// dump, shell command, sysprop notification).
    fn on_transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()>;

    /// Dump the state of this object to `fd`.
    fn on_dump(&self, _fd: BorrowedFd<'_>, _args: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Tests often need a plain binder object with no interface of its own,
/// e.g. as a keep-alive token; allowing the unit type to be remotable
/// translates nicely to `Binder::new(())`.
impl Remotable for () {
    fn get_descriptor() -> &'static str {
        ""
    }

    fn on_transact(
        &self,
        _code: TransactionCode,
        _data: &Parcel,
        _reply: Option<&mut Parcel>,
        _flags: TransactionFlags,
    ) -> Result<()> {
        Err(StatusCode::UNKNOWN_TRANSACTION)
    }
}

/// Interface of binder local or remote objects.
///
/// This trait corresponds to the interface of the C++ `IBinder` class.
pub trait IBinder {
    const FIRST_CALL_TRANSACTION: TransactionCode = FIRST_CALL_TRANSACTION;
    const LAST_CALL_TRANSACTION: TransactionCode = LAST_CALL_TRANSACTION;
    const PING_TRANSACTION: TransactionCode = PING_TRANSACTION;
    const DUMP_TRANSACTION: TransactionCode = DUMP_TRANSACTION;
    const SHELL_COMMAND_TRANSACTION: TransactionCode = SHELL_COMMAND_TRANSACTION;
    const INTERFACE_TRANSACTION: TransactionCode = INTERFACE_TRANSACTION;
    const SYSPROPS_TRANSACTION: TransactionCode = SYSPROPS_TRANSACTION;
    const EXTENSION_TRANSACTION: TransactionCode = EXTENSION_TRANSACTION;
    const DEBUG_PID_TRANSACTION: TransactionCode = DEBUG_PID_TRANSACTION;
    const SET_RPC_CLIENT_TRANSACTION: TransactionCode = SET_RPC_CLIENT_TRANSACTION;
    const START_RECORDING_TRANSACTION: TransactionCode = START_RECORDING_TRANSACTION;
    const STOP_RECORDING_TRANSACTION: TransactionCode = STOP_RECORDING_TRANSACTION;

    const FLAG_ONEWAY: TransactionFlags = FLAG_ONEWAY;
    const FLAG_CLEAR_BUF: TransactionFlags = FLAG_CLEAR_BUF;
    const FLAG_PRIVATE_VENDOR: TransactionFlags = FLAG_PRIVATE_VENDOR;

    /// Return the canonical interface descriptor of this object.
    ///
    /// For a remote object this may require a round trip the first time it
    /// is called.
    fn interface_descriptor(&self) -> Result<String>;

    /// Is this object still alive?
    fn is_binder_alive(&self) -> bool;

    /// Send a ping transaction to this object.
    fn ping_binder(&self) -> Result<()>;

    /// Dump this object to the given file descriptor.
    fn dump(&self, fd: BorrowedFd<'_>, args: &[&str]) -> Result<()>;

    /// Get a new interface that exposes additional extension
    /// functionality, if available.
    fn get_extension(&self) -> Result<Option<SpIBinder>>;

    /// Return the process id hosting this object. For a remote object
    /// this performs a round trip.
    fn get_debug_pid(&self) -> Result<libc::pid_t>;

    /// Bridge this object onto a debug RPC listener: the provided socket
    /// must already be listening, and `keep_alive` is watched for death
    /// to tear the listener down again.
    fn set_rpc_client_debug(
        &self,
        socket_fd: Option<OwnedFd>,
        keep_alive: Option<SpIBinder>,
    ) -> Result<()>;

    /// Perform a generic operation with the object.
    ///
    /// `reply` is [`None`] for oneway calls.
    fn transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()>;

    /// Register the recipient for a notification if this binder goes
    /// away. The recipient callback fires if the object's hosting
    /// process or transport dies.
    ///
    /// You will only receive death notifications for remote binders, as
    /// local binders by definition can't die without you dying as well.
    /// Trying to use this function on a local binder will result in an
    /// INVALID_OPERATION code being returned and nothing happening.
    ///
    /// This link always holds a weak reference to its recipient.
    fn link_to_death(&self, recipient: &DeathRecipient) -> Result<()>;

    /// Remove a previously registered death notification. The recipient
    /// will no longer be called if this object dies.
    fn unlink_to_death(&self, recipient: &DeathRecipient) -> Result<()>;
}

/// Interface for transforming a generic [`SpIBinder`] into a specific
/// remote interface trait.
pub trait FromIBinder: Interface {
    /// Try to interpret a generic binder object as this interface.
    fn try_from(ibinder: SpIBinder) -> Result<Strong<Self>>;
}

/// Generic interface to remote binder objects.
///
/// Corresponds to the C++ `BpInterface` class.
pub trait Proxy: Sized + Interface {
    /// The binder interface descriptor string.
    fn get_descriptor() -> &'static str;

    /// Create a new interface from the given proxy, if it matches the
    /// expected type of this interface.
    fn from_binder(binder: SpIBinder) -> Result<Self>;
}

/// Declare typed interfaces for a binder object.
///
/// Given an interface trait and descriptor string, create a native and
/// remote proxy wrapper for this interface. The native service object
/// (`$native`) implements `Remotable` and will dispatch to the function
/// `$on_transact` to handle transactions. The typed proxy object
/// (`$proxy`) wraps remote binder objects for this interface and can
/// optionally contain additional fields.
///
/// Assuming the interface trait is `Interface`, the `$on_transact`
/// function must have the following type:
///
/// ```ignore
/// fn on_transact(
///     service: &dyn Interface,
///     code: TransactionCode,
///     data: &Parcel,
///     reply: &mut Parcel,
/// ) -> ubinder::Result<()>;
/// ```
///
/// # Examples
///
/// The following example declares the local service type `BnTest` and a
/// remote proxy type `BpTest` (the `n` and `p` stand for native and proxy
/// respectively) for the `ITest` binder interface, identified by the
/// descriptor string "android.os.ITest". The local service dispatches
/// transactions using the provided function, `on_transact`.
///
/// ```ignore
/// use ubinder::{declare_binder_interface, Interface, Parcel, TransactionCode};
///
/// pub trait ITest: Interface {
///     fn test(&self) -> ubinder::Result<String>;
/// }
///
/// declare_binder_interface! {
///     ITest["android.os.ITest"] {
///         native: BnTest(on_transact),
///         proxy: BpTest,
///     }
/// }
///
/// fn on_transact(
///     service: &dyn ITest,
///     code: TransactionCode,
///     data: &Parcel,
///     reply: &mut Parcel,
/// ) -> ubinder::Result<()> {
///     reply.write(&service.test()?)
/// }
/// ```
#[macro_export]
macro_rules! declare_binder_interface {
    {
        $interface:path[$descriptor:expr] {
            native: $native:ident($on_transact:path),
            proxy: $proxy:ident,
        }
    } => {
        $crate::declare_binder_interface! {
            $interface[$descriptor] {
                native: $native($on_transact),
                proxy: $proxy {},
            }
        }
    };

    {
        $interface:path[$descriptor:expr] {
            native: $native:ident($on_transact:path),
            proxy: $proxy:ident {
                $($fname:ident: $fty:ty = $finit:expr),*
            },
        }
    } => {
        #[doc = concat!("A binder [`Proxy`]($crate::Proxy) that holds an [`", stringify!($interface), "`] remote interface.")]
        pub struct $proxy {
            base: $crate::BpRefBase,
            $($fname: $fty,)*
        }

        impl $crate::Interface for $proxy {
            fn as_binder(&self) -> $crate::SpIBinder {
                self.base.remote().expect("proxy must have a remote")
            }

            fn as_proxy(&self) -> Option<&$crate::BpRefBase> {
                Some(&self.base)
            }
        }

        impl $crate::Proxy for $proxy
        where
            $proxy: $interface,
        {
            fn get_descriptor() -> &'static str {
                $descriptor
            }

            fn from_binder(binder: $crate::SpIBinder) -> $crate::Result<Self> {
                use $crate::IBinder;
                if binder.interface_descriptor()? != $descriptor {
                    return Err($crate::StatusCode::BAD_TYPE);
                }
                Ok(Self { base: $crate::BpRefBase::new(binder), $($fname: $finit),* })
            }
        }

        impl $proxy {
            /// The remote object this proxy transacts on.
            #[allow(dead_code)]
            pub(crate) fn remote(&self) -> $crate::SpIBinder {
                self.base.remote().expect("proxy must have a remote")
            }
        }

        #[doc = concat!("A binder [`Remotable`]($crate::Remotable) that holds an [`", stringify!($interface), "`] object.")]
        #[repr(transparent)]
        pub struct $native(Box<dyn $interface + Sync + Send + 'static>);

        impl $native {
            /// Create a new binder service.
            pub fn new_binder<T: $interface + Sync + Send + 'static>(inner: T) -> $crate::Binder<$native> {
                $crate::Binder::new($native(Box::new(inner)))
            }
        }

        impl $crate::Remotable for $native {
            fn get_descriptor() -> &'static str {
                $descriptor
            }

            fn on_transact(
                &self,
                code: $crate::TransactionCode,
                data: &$crate::Parcel,
                reply: Option<&mut $crate::Parcel>,
                _flags: $crate::TransactionFlags,
            ) -> $crate::Result<()> {
                // Oneway senders pass no reply; hand the handler a scratch
                // parcel it can write into.
                let mut scratch = $crate::Parcel::new();
                let reply = reply.unwrap_or(&mut scratch);
                $on_transact(&*self.0, code, data, reply)
            }
        }

        impl $crate::FromIBinder for dyn $interface {
            fn try_from(ibinder: $crate::SpIBinder) -> $crate::Result<$crate::Strong<dyn $interface>> {
                let service: $crate::Result<$crate::Binder<$native>> =
                    std::convert::TryFrom::try_from(ibinder.clone());
                if let Ok(service) = service {
                    // The binder is local to this process, call the
                    // implementation directly.
                    return Ok($crate::Strong::new(Box::new(service)));
                }
                Ok($crate::Strong::new(Box::new(
                    <$proxy as $crate::Proxy>::from_binder(ibinder)?,
                )))
            }
        }

        impl $crate::parcel::Serialize for dyn $interface + '_ {
            fn serialize(&self, parcel: &mut $crate::Parcel) -> $crate::Result<()> {
                let binder = $crate::Interface::as_binder(self);
                parcel.write_binder(Some(&binder))
            }
        }

        impl $crate::parcel::SerializeOption for dyn $interface + '_ {
            fn serialize_option(this: Option<&Self>, parcel: &mut $crate::Parcel) -> $crate::Result<()> {
                parcel.write_binder(this.map($crate::Interface::as_binder).as_ref())
            }
        }

        impl std::fmt::Debug for dyn $interface + '_ {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(stringify!($interface))
            }
        }
    };
}
