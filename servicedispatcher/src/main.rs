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

//! Dispatch calls to an RPC service.
//!
//! Given a service name, stands up a socket listener for that service's
//! binder object so a debugging client without kernel-transport access
//! can transact with it. Prints the bound port to stdout and blocks until
//! killed. The `manager` mode instead serves an RPC-friendly wrapper of
//! the service manager.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ubinder::service_manager::BnServiceManager;
use ubinder::{
    default_service_manager, BinderConfig, IBinder, Interface, ProcessState, RpcServer,
    RpcSession, ServiceManager, ServiceManagerHost, SpIBinder,
};

use std::path::Path;

const EX_USAGE: i32 = 64;
const EX_SOFTWARE: i32 = 70;
const EX_NOPERM: i32 = 77;

const LOCAL_INET_ADDRESS: &str = "127.0.0.1";

#[derive(Parser)]
#[command(
    name = "servicedispatcher",
    about = "dispatch calls to RPC service",
    after_help = "If successful, writes port number and a new line character to stdout, and\n\
                  blocks until killed. Otherwise, writes error message to stderr and exits\n\
                  with non-zero code."
)]
struct Args {
    /// Use getService() instead of checkService().
    #[arg(short = 'g')]
    get: bool,

    /// Address to bind the server to instead of 127.0.0.1.
    #[arg(short = 'i', value_name = "ip_address")]
    ip_address: Option<String>,

    /// The service to connect to, or `manager` to run an RPC-friendly
    /// service that redirects calls to servicemanager.
    service_name: String,
}

type ServiceRetriever = fn(&ServiceManager, &str) -> Option<SpIBinder>;

/// Log warnings and errors to stderr, prefixed with the program name.
struct DispatcherLogger;

static LOGGER: DispatcherLogger = DispatcherLogger;

impl log::Log for DispatcherLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record<'_>) {
        if record.level() > log::Level::Warn {
            return;
        }
        let progname = std::env::args()
            .next()
            .map(|arg| {
                Path::new(&arg)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or(arg)
            })
            .unwrap_or_else(|| "servicedispatcher".to_string());
        eprintln!("{progname}: {}", record.args());
    }

    fn flush(&self) {}
}

fn main() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(EX_USAGE);
        }
    };

    if !BinderConfig::debuggable() {
        log::error!("servicedispatcher is only allowed on debuggable builds.");
        std::process::exit(EX_NOPERM);
    }
    log::warn!("WARNING: servicedispatcher is debug only. Use with caution.");

    ProcessState::set_thread_pool_max_thread_count(1);
    ProcessState::start_thread_pool();

    let retriever: ServiceRetriever = if args.get {
        |sm, name| sm.get_service(name)
    } else {
        |sm, name| sm.check_service(name)
    };
    let ip_address = args.ip_address.as_deref().unwrap_or(LOCAL_INET_ADDRESS);

    let result = if args.service_name == "manager" {
        wrap_service_manager(ip_address)
    } else {
        dispatch(&args.service_name, retriever, ip_address)
    };
    match result {
        Ok(never) => match never {},
        Err(err) => {
            log::error!("{err:#}");
            std::process::exit(EX_SOFTWARE);
        }
    }
}

enum Never {}

fn dispatch(name: &str, retriever: ServiceRetriever, ip_address: &str) -> Result<Never> {
    let sm = default_service_manager();
    let binder = retriever(&sm, name).ok_or_else(|| anyhow!("No service {name:?}"))?;

    let rpc_server = RpcServer::new();
    let port = rpc_server
        .setup_inet_server(ip_address, 0)
        .map_err(|status| anyhow!("setupInetServer failed: {status}"))?;
    let socket = rpc_server
        .release_server()
        .map_err(|status| anyhow!("releaseServer failed: {status}"))?;

    // The keep-alive binder must be remote so its death is observable;
    // host a throwaway object on a loopback session and watch the proxy.
    let keep_alive_host = RpcServer::new();
    keep_alive_host.set_root_object(ubinder::Binder::new(()).as_binder());
    let keep_alive_port = keep_alive_host
        .setup_inet_server(LOCAL_INET_ADDRESS, 0)
        .map_err(|status| anyhow!("cannot host keep-alive binder: {status}"))?;
    keep_alive_host.start();
    let keep_alive = RpcSession::setup_inet_client(LOCAL_INET_ADDRESS, keep_alive_port)
        .map_err(|status| anyhow!("cannot connect keep-alive binder: {status}"))?;

    binder
        .set_rpc_client_debug(Some(socket), Some(keep_alive))
        .map_err(|status| anyhow!("setRpcClientDebug failed with {status}"))?;
    log::info!("Finish setting up RPC on service {name} on port {port}");

    println!("{port}");

    loop {
        std::thread::park();
    }
}

fn wrap_service_manager(ip_address: &str) -> Result<Never> {
    let sm = default_service_manager();

    // Work around the restriction that capabilities cannot cross the RPC
    // transport: serve an adapter that forwards plain queries only.
    let host = BnServiceManager::new_binder(ServiceManagerHost::new(sm));

    let rpc_server = RpcServer::new();
    rpc_server.set_root_object(host.as_binder());
    let port = rpc_server
        .setup_inet_server(ip_address, 0)
        .context("Unable to set up inet server")?;
    log::info!("Finish wrapping servicemanager with RPC on port {port}");
    println!("{port}");
    rpc_server.join();

    Err(anyhow!("Wrapped servicemanager exits; this should not happen!"))
}
