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

//! Service discovery: a process-local name registry, plus the
//! `IServiceManager` binder interface so the registry itself can be
//! served over a transport.

use crate::binder::{FromIBinder, IBinder, Interface, TransactionCode, FIRST_CALL_TRANSACTION};
use crate::error::{Result, StatusCode};
use crate::parcel::Parcel;
use crate::proxy::{SpIBinder, Strong};

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Dump priority classes services register under.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFlags {
    /// Allows services to dump sections according to priorities.
    PriorityCritical = 1 << 0,
    PriorityHigh = 1 << 1,
    PriorityNormal = 1 << 2,
    /// Services are by default registered with a Default dump priority.
    /// Default priority has the same priority as Normal priority but the
    /// services are not called with dump priority arguments.
    PriorityDefault = 1 << 3,
    PriorityAll = 0b1111,
    Proto = 1 << 4,
}

impl Default for DumpFlags {
    fn default() -> DumpFlags {
        DumpFlags::PriorityDefault
    }
}

struct Registry {
    services: Mutex<BTreeMap<String, (SpIBinder, i32)>>,
    available: Condvar,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        services: Mutex::new(BTreeMap::new()),
        available: Condvar::new(),
    })
}

fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 127
        && name
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || b"_-./:".contains(&c))
}

/// Handle to the process-wide service registry.
#[derive(Clone, Default)]
pub struct ServiceManager;

/// The discovery collaborator every process shares.
pub fn default_service_manager() -> ServiceManager {
    ServiceManager
}

impl ServiceManager {
    /// Register a service.
    pub fn add_service(
        &self,
        name: &str,
        service: SpIBinder,
        _allow_isolated: bool,
        dump_flags: DumpFlags,
    ) -> Result<()> {
        if !is_valid_service_name(name) {
            log::error!("Invalid service name: {name}");
            return Err(StatusCode::BAD_VALUE);
        }
        let mut services = registry().services.lock().unwrap();
        services.insert(name.to_string(), (service, dump_flags as i32));
        registry().available.notify_all();
        Ok(())
    }

    /// Retrieve an existing service, non-blocking.
    pub fn check_service(&self, name: &str) -> Option<SpIBinder> {
        let services = registry().services.lock().unwrap();
        services.get(name).map(|(binder, _)| binder.clone())
    }

    /// Retrieve an existing service, blocking for a few seconds if it
    /// doesn't yet exist.
    pub fn get_service(&self, name: &str) -> Option<SpIBinder> {
        const TIMEOUT: Duration = Duration::from_secs(5);
        let deadline = Instant::now() + TIMEOUT;
        let mut services = registry().services.lock().unwrap();
        loop {
            if let Some((binder, _)) = services.get(name) {
                return Some(binder.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, timeout) = registry()
                .available
                .wait_timeout(services, remaining)
                .unwrap();
            services = guard;
            if timeout.timed_out() {
                return services.get(name).map(|(binder, _)| binder.clone());
            }
        }
    }

    /// Wait however long it takes for a service to appear.
    pub fn wait_for_service(&self, name: &str) -> SpIBinder {
        let mut services = registry().services.lock().unwrap();
        loop {
            if let Some((binder, _)) = services.get(name) {
                return binder.clone();
            }
            services = registry().available.wait(services).unwrap();
        }
    }

    /// Names of all registered services matching the given priority
    /// mask.
    pub fn list_services(&self, dump_flags: DumpFlags) -> Vec<String> {
        self.list_services_mask(dump_flags as i32)
    }

    fn list_services_mask(&self, dump_priority: i32) -> Vec<String> {
        let services = registry().services.lock().unwrap();
        services
            .iter()
            .filter(|(_, (_, priority))| priority & dump_priority != 0)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Register a service with default parameters.
pub fn add_service(name: &str, service: SpIBinder) -> Result<()> {
    default_service_manager().add_service(name, service, false, DumpFlags::default())
}

/// Retrieve an existing service, blocking for a few seconds if it
/// doesn't yet exist.
pub fn get_service(name: &str) -> Option<SpIBinder> {
    default_service_manager().get_service(name)
}

/// Retrieve an existing service, non-blocking.
pub fn check_service(name: &str) -> Option<SpIBinder> {
    default_service_manager().check_service(name)
}

/// Retrieve an existing service for a particular interface, blocking for
/// a few seconds if it doesn't yet exist.
pub fn get_interface<T: FromIBinder + ?Sized>(name: &str) -> Result<Strong<T>> {
    match get_service(name) {
        Some(service) => FromIBinder::try_from(service),
        None => Err(StatusCode::NAME_NOT_FOUND),
    }
}

pub const GET_SERVICE_TRANSACTION: TransactionCode = FIRST_CALL_TRANSACTION;
pub const CHECK_SERVICE_TRANSACTION: TransactionCode = FIRST_CALL_TRANSACTION + 1;
pub const ADD_SERVICE_TRANSACTION: TransactionCode = FIRST_CALL_TRANSACTION + 2;
pub const LIST_SERVICES_TRANSACTION: TransactionCode = FIRST_CALL_TRANSACTION + 3;

/// Binder interface of the service registry.
pub trait IServiceManager: Interface {
    fn get_service(&self, name: &str) -> Result<Option<SpIBinder>>;

    fn check_service(&self, name: &str) -> Result<Option<SpIBinder>>;

    fn add_service(
        &self,
        name: &str,
        service: SpIBinder,
        allow_isolated: bool,
        dump_priority: i32,
    ) -> Result<()>;

    fn list_services(&self, dump_priority: i32) -> Result<Vec<String>>;
}

crate::declare_binder_interface! {
    IServiceManager["android.os.IServiceManager"] {
        native: BnServiceManager(on_service_manager_transact),
        proxy: BpServiceManager,
    }
}

fn on_service_manager_transact(
    service: &dyn IServiceManager,
    code: TransactionCode,
    data: &Parcel,
    reply: &mut Parcel,
) -> Result<()> {
    match code {
        GET_SERVICE_TRANSACTION => {
            let name: String = data.read()?;
            reply.write_binder(service.get_service(&name)?.as_ref())
        }
        CHECK_SERVICE_TRANSACTION => {
            let name: String = data.read()?;
            reply.write_binder(service.check_service(&name)?.as_ref())
        }
        ADD_SERVICE_TRANSACTION => {
            let name: String = data.read()?;
            let binder = data.read_binder()?.ok_or(StatusCode::UNEXPECTED_NULL)?;
            let allow_isolated: bool = data.read()?;
            let dump_priority: i32 = data.read()?;
            service.add_service(&name, binder, allow_isolated, dump_priority)
        }
        LIST_SERVICES_TRANSACTION => {
            let dump_priority: i32 = data.read()?;
            reply.write(&service.list_services(dump_priority)?)
        }
        _ => Err(StatusCode::UNKNOWN_TRANSACTION),
    }
}

impl IServiceManager for BpServiceManager {
    fn get_service(&self, name: &str) -> Result<Option<SpIBinder>> {
        let mut data = Parcel::new();
        data.write(name)?;
        let mut reply = Parcel::new();
        self.as_binder()
            .transact(GET_SERVICE_TRANSACTION, &data, Some(&mut reply), 0)?;
        reply.read_binder()
    }

    fn check_service(&self, name: &str) -> Result<Option<SpIBinder>> {
        let mut data = Parcel::new();
        data.write(name)?;
        let mut reply = Parcel::new();
        self.as_binder()
            .transact(CHECK_SERVICE_TRANSACTION, &data, Some(&mut reply), 0)?;
        reply.read_binder()
    }

    fn add_service(
        &self,
        name: &str,
        service: SpIBinder,
        allow_isolated: bool,
        dump_priority: i32,
    ) -> Result<()> {
        let mut data = Parcel::new();
        data.write(name)?;
        data.write_binder(Some(&service))?;
        data.write(&allow_isolated)?;
        data.write(&dump_priority)?;
        let mut reply = Parcel::new();
        self.as_binder()
            .transact(ADD_SERVICE_TRANSACTION, &data, Some(&mut reply), 0)
    }

    fn list_services(&self, dump_priority: i32) -> Result<Vec<String>> {
        let mut data = Parcel::new();
        data.write(&dump_priority)?;
        let mut reply = Parcel::new();
        self.as_binder()
            .transact(LIST_SERVICES_TRANSACTION, &data, Some(&mut reply), 0)?;
        reply.read()
    }
}

impl IServiceManager for crate::Binder<BnServiceManager> {
    fn get_service(&self, name: &str) -> Result<Option<SpIBinder>> {
        self.0.get_service(name)
    }

    fn check_service(&self, name: &str) -> Result<Option<SpIBinder>> {
        self.0.check_service(name)
    }

    fn add_service(
        &self,
        name: &str,
        service: SpIBinder,
        allow_isolated: bool,
        dump_priority: i32,
    ) -> Result<()> {
        self.0.add_service(name, service, allow_isolated, dump_priority)
    }

    fn list_services(&self, dump_priority: i32) -> Result<Vec<String>> {
        self.0.list_services(dump_priority)
    }
}

/// Full-fidelity `IServiceManager` over the process-local registry, for
/// serving in-process callers.
#[derive(Default)]
pub struct ServiceManagerService;

impl Interface for ServiceManagerService {}

impl IServiceManager for ServiceManagerService {
    fn get_service(&self, name: &str) -> Result<Option<SpIBinder>> {
        Ok(default_service_manager().get_service(name))
    }

    fn check_service(&self, name: &str) -> Result<Option<SpIBinder>> {
        Ok(default_service_manager().check_service(name))
    }

    fn add_service(
        &self,
        name: &str,
        service: SpIBinder,
        allow_isolated: bool,
        _dump_priority: i32,
    ) -> Result<()> {
        default_service_manager().add_service(name, service, allow_isolated, DumpFlags::default())
    }

    fn list_services(&self, dump_priority: i32) -> Result<Vec<String>> {
        Ok(default_service_manager().list_services_mask(dump_priority))
    }
}

/// `IServiceManager` adapter safe to serve over the RPC transport.
///
/// Every operation that would move a capability across the transport is
/// rejected outright; only queries carrying plain data are forwarded.
pub struct ServiceManagerHost {
    inner: ServiceManager,
}

impl ServiceManagerHost {
    pub fn new(inner: ServiceManager) -> ServiceManagerHost {
        ServiceManagerHost { inner }
    }
}

impl Interface for ServiceManagerHost {}

impl IServiceManager for ServiceManagerHost {
    fn get_service(&self, _name: &str) -> Result<Option<SpIBinder>> {
        // We can't send a kernel-transport capability over RPC.
        Err(StatusCode::INVALID_OPERATION)
    }

    fn check_service(&self, _name: &str) -> Result<Option<SpIBinder>> {
        // We can't send a kernel-transport capability over RPC.
        Err(StatusCode::INVALID_OPERATION)
    }

    fn add_service(
        &self,
        _name: &str,
        _service: SpIBinder,
        _allow_isolated: bool,
        _dump_priority: i32,
    ) -> Result<()> {
        // We can't accept an RPC capability for the kernel transport.
        Err(StatusCode::INVALID_OPERATION)
    }

    fn list_services(&self, dump_priority: i32) -> Result<Vec<String>> {
        Ok(self.inner.list_services_mask(dump_priority))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Binder;

    #[test]
    fn register_and_look_up() {
        let service = Binder::new(()).as_binder();
        add_service("sm.test.lookup", service.clone()).unwrap();
        assert_eq!(check_service("sm.test.lookup"), Some(service));
        assert!(check_service("sm.test.missing").is_none());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let service = Binder::new(()).as_binder();
        assert_eq!(
            add_service("bad name with spaces", service.clone()),
            Err(StatusCode::BAD_VALUE)
        );
        assert_eq!(add_service("", service), Err(StatusCode::BAD_VALUE));
    }

    #[test]
    fn list_services_filters_by_priority() {
        let sm = default_service_manager();
        sm.add_service(
            "sm.test.critical",
            Binder::new(()).as_binder(),
            false,
            DumpFlags::PriorityCritical,
        )
        .unwrap();
        let all = sm.list_services(DumpFlags::PriorityAll);
        assert!(all.contains(&"sm.test.critical".to_string()));
        let high = sm.list_services(DumpFlags::PriorityHigh);
        assert!(!high.contains(&"sm.test.critical".to_string()));
    }

    #[test]
    fn host_adapter_refuses_capability_transfer() {
        let host = ServiceManagerHost::new(default_service_manager());
        assert_eq!(
            host.get_service("anything"),
            Err(StatusCode::INVALID_OPERATION)
        );
        assert_eq!(
            host.add_service("x", Binder::new(()).as_binder(), false, 0),
            Err(StatusCode::INVALID_OPERATION)
        );
        assert!(host.list_services(DumpFlags::PriorityAll as i32).is_ok());
    }
}
