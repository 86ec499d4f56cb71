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

use ubinder::{
    declare_binder_interface, Binder, DeathRecipient, FromIBinder, IBinder, Interface, Parcel,
    ProcessState, Remotable, RpcServer, RpcSession, SpIBinder, StatusCode, Strong, ThreadState,
    TransactionCode, TransactionFlags, FIRST_CALL_TRANSACTION, PING_TRANSACTION,
    START_RECORDING_TRANSACTION, STOP_RECORDING_TRANSACTION,
};

use std::io::{Read, Seek, Write};
use std::os::unix::io::AsFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

pub trait ITest: Interface {
    fn test(&self) -> ubinder::Result<String>;

    fn poke(&self) -> ubinder::Result<()>;
}

declare_binder_interface! {
    ITest["android.os.ITest"] {
        native: BnTest(on_transact),
        proxy: BpTest,
    }
}

const TEST_TRANSACTION: TransactionCode = FIRST_CALL_TRANSACTION;
const POKE_TRANSACTION: TransactionCode = FIRST_CALL_TRANSACTION + 1;

fn on_transact(
    service: &dyn ITest,
    code: TransactionCode,
    data: &Parcel,
    reply: &mut Parcel,
) -> ubinder::Result<()> {
    let _ = data;
    match code {
        TEST_TRANSACTION => reply.write(&service.test()?),
        POKE_TRANSACTION => service.poke(),
        _ => Err(StatusCode::UNKNOWN_TRANSACTION),
    }
}

impl ITest for BpTest {
    fn test(&self) -> ubinder::Result<String> {
        let data = Parcel::new();
        let mut reply = Parcel::new();
        self.as_binder()
            .transact(TEST_TRANSACTION, &data, Some(&mut reply), 0)?;
        reply.read()
    }

    fn poke(&self) -> ubinder::Result<()> {
        let data = Parcel::new();
        self.as_binder()
            .transact(POKE_TRANSACTION, &data, None, ubinder::FLAG_ONEWAY)
    }
}

impl ITest for Binder<BnTest> {
    fn test(&self) -> ubinder::Result<String> {
        self.0.test()
    }

    fn poke(&self) -> ubinder::Result<()> {
        self.0.poke()
    }
}

struct TestService {
    s: String,
    pokes: Arc<AtomicUsize>,
}

impl Interface for TestService {}

impl ITest for TestService {
    fn test(&self) -> ubinder::Result<String> {
        Ok(self.s.clone())
    }

    fn poke(&self) -> ubinder::Result<()> {
        self.pokes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn new_test_service() -> (Binder<BnTest>, Arc<AtomicUsize>) {
    let pokes = Arc::new(AtomicUsize::new(0));
    let service = BnTest::new_binder(TestService {
        s: "testing service".to_string(),
        pokes: pokes.clone(),
    });
    (service, pokes)
}

fn start_server(root: SpIBinder) -> (Arc<RpcServer>, u16) {
    let server = RpcServer::new();
    server.set_root_object(root);
    let port = server
        .setup_inet_server("127.0.0.1", 0)
        .expect("cannot bind test server");
    server.set_max_threads(4);
    server.start();
    (server, port)
}

fn tempfile(tag: &str) -> std::fs::File {
    let mut path = std::env::temp_dir();
    path.push(format!("ubinder_it_{}_{}", tag, std::process::id()));
    let file = std::fs::File::options()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    std::fs::remove_file(&path).unwrap();
    file
}

#[test]
fn local_service_round_trip() {
    let (service, _) = new_test_service();
    ubinder::add_service("testing.local", service.as_binder()).unwrap();

    let client: Strong<dyn ITest> =
        ubinder::get_interface("testing.local").expect("did not get testing service");
    assert_eq!(client.test().unwrap(), "testing service");
}

#[test]
fn rpc_server_round_trip() {
    let (service, pokes) = new_test_service();
    let (server, port) = start_server(service.as_binder());

    let client = RpcSession::setup_inet_client("127.0.0.1", port).expect("cannot connect");
    assert!(client.is_binder_alive());
    client.ping_binder().expect("ping failed");
    assert_eq!(
        client.interface_descriptor().unwrap(),
        "android.os.ITest"
    );

    // No extension is attached; null crosses the transport inline.
    assert_eq!(client.get_extension().unwrap(), None);

    let typed: Strong<dyn ITest> = FromIBinder::try_from(client.clone()).unwrap();
    assert_eq!(typed.test().unwrap(), "testing service");

    // Oneway calls produce no reply but still dispatch, in order with
    // the following synchronous call on the same session.
    typed.poke().unwrap();
    assert_eq!(typed.test().unwrap(), "testing service");
    assert_eq!(pokes.load(Ordering::SeqCst), 1);

    let data = Parcel::new();
    let mut reply = Parcel::new();
    assert_eq!(
        client.transact(FIRST_CALL_TRANSACTION + 100, &data, Some(&mut reply), 0),
        Err(StatusCode::UNKNOWN_TRANSACTION)
    );

    assert!(server.shutdown());
}

#[test]
fn wrong_interface_is_rejected() {
    let (service, _) = new_test_service();
    let (server, port) = start_server(service.as_binder());

    let client = RpcSession::setup_inet_client("127.0.0.1", port).unwrap();
    let result: Result<Strong<dyn ubinder::IServiceManager>, _> = FromIBinder::try_from(client);
    assert_eq!(result.err(), Some(StatusCode::BAD_TYPE));

    server.shutdown();
}

#[test]
fn death_notification_fires_on_server_shutdown() {
    let (service, _) = new_test_service();
    let (server, port) = start_server(service.as_binder());
    let client = RpcSession::setup_inet_client("127.0.0.1", port).unwrap();

    let (tx, rx) = mpsc::channel();
    let recipient = DeathRecipient::new(move || {
        let _ = tx.send(());
    });
    client.link_to_death(&recipient).unwrap();

    assert!(server.shutdown());
    rx.recv_timeout(Duration::from_secs(5))
        .expect("death notification not delivered");
    assert!(!client.is_binder_alive());
    assert_eq!(client.ping_binder(), Err(StatusCode::DEAD_OBJECT));
}

#[test]
fn local_binders_refuse_death_links() {
    let (service, _) = new_test_service();
    let recipient = DeathRecipient::new(|| {});
    assert_eq!(
        service.as_binder().link_to_death(&recipient),
        Err(StatusCode::INVALID_OPERATION)
    );
}

#[test]
fn unlinked_recipient_does_not_fire() {
    let (service, _) = new_test_service();
    let (server, port) = start_server(service.as_binder());
    let client = RpcSession::setup_inet_client("127.0.0.1", port).unwrap();

    let (tx, rx) = mpsc::channel();
    let recipient = DeathRecipient::new(move || {
        let _ = tx.send(());
    });
    client.link_to_death(&recipient).unwrap();
    client.unlink_to_death(&recipient).unwrap();
    assert_eq!(
        client.unlink_to_death(&recipient),
        Err(StatusCode::NAME_NOT_FOUND)
    );

    server.shutdown();
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
}

#[test]
fn transaction_recording_round_trip() {
    // Recording is gated on the caller being root.
    let _identity = ThreadState::set_calling_identity(0, 1);
    let binder = Binder::new(());

    let mut recording = tempfile("recording");

    let mut start = Parcel::new();
    start.write_file_descriptor(recording.as_fd()).unwrap();
    binder
        .transact(START_RECORDING_TRANSACTION, &start, None, 0)
        .unwrap();

    // A second start must be rejected while one is in progress.
    let mut again = Parcel::new();
    again.write_file_descriptor(recording.as_fd()).unwrap();
    assert_eq!(
        binder.transact(START_RECORDING_TRANSACTION, &again, None, 0),
        Err(StatusCode::INVALID_OPERATION)
    );

    let data = Parcel::new();
    let mut reply = Parcel::new();
    binder
        .transact(PING_TRANSACTION, &data, Some(&mut reply), 0)
        .unwrap();

    binder
        .transact(STOP_RECORDING_TRANSACTION, &Parcel::new(), None, 0)
        .unwrap();
    assert_eq!(
        binder.transact(STOP_RECORDING_TRANSACTION, &Parcel::new(), None, 0),
        Err(StatusCode::INVALID_OPERATION)
    );

    recording.rewind().unwrap();
    let recorded = ubinder::RecordedTransaction::from_file(recording.as_fd())
        .expect("no transaction recorded");
    assert_eq!(recorded.code(), PING_TRANSACTION);
    assert_eq!(recorded.returned_status(), 0);
    assert_eq!(recorded.interface_name(), "");
}

#[test]
fn recording_requires_root() {
    let _identity = ThreadState::set_calling_identity(1000, 1);
    let binder = Binder::new(());

    let recording = tempfile("recording_denied");
    let mut start = Parcel::new();
    start.write_file_descriptor(recording.as_fd()).unwrap();
    assert_eq!(
        binder.transact(START_RECORDING_TRANSACTION, &start, None, 0),
        Err(StatusCode::PERMISSION_DENIED)
    );

    // Denied means recording never turned on: stopping has nothing to
    // stop, even for root.
    let _identity = ThreadState::set_calling_identity(0, 1);
    assert_eq!(
        binder.transact(STOP_RECORDING_TRANSACTION, &Parcel::new(), None, 0),
        Err(StatusCode::INVALID_OPERATION)
    );
}

struct DumpService;

impl Remotable for DumpService {
    fn get_descriptor() -> &'static str {
        "test.DumpService"
    }

    fn on_transact(
        &self,
        _code: TransactionCode,
        _data: &Parcel,
        _reply: Option<&mut Parcel>,
        _flags: TransactionFlags,
    ) -> ubinder::Result<()> {
        Err(StatusCode::UNKNOWN_TRANSACTION)
    }

    fn on_dump(&self, fd: std::os::unix::io::BorrowedFd<'_>, args: &[String]) -> ubinder::Result<()> {
        let mut file = std::fs::File::from(fd.try_clone_to_owned().unwrap());
        write!(file, "dumped with {} args", args.len()).unwrap();
        Ok(())
    }
}

#[test]
fn dump_decodes_fd_and_args() {
    let binder = Binder::new(DumpService);
    let mut out = tempfile("dump");

    binder.dump(out.as_fd(), &[]).unwrap();

    out.rewind().unwrap();
    let mut contents = String::new();
    out.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "dumped with 0 args");
}

#[test]
fn rpc_debug_bridge_end_to_end() {
    ProcessState::set_thread_pool_max_thread_count(4);
    let (service, _) = new_test_service();

    // Keep-alive binder must be remote for its death to be observable.
    let keep_alive_host = RpcServer::new();
    keep_alive_host.set_root_object(Binder::new(()).as_binder());
    let keep_alive_port = keep_alive_host.setup_inet_server("127.0.0.1", 0).unwrap();
    keep_alive_host.start();
    let keep_alive = RpcSession::setup_inet_client("127.0.0.1", keep_alive_port).unwrap();

    // Socket prepared by the dispatcher side.
    let listener = RpcServer::new();
    let bridge_port = listener.setup_inet_server("127.0.0.1", 0).unwrap();
    let socket = listener.release_server().unwrap();

    service
        .set_rpc_client_debug(Some(socket), Some(keep_alive))
        .expect("bridge setup failed");

    // The same object now answers over the socket transport.
    let debug_client = RpcSession::setup_inet_client("127.0.0.1", bridge_port).unwrap();
    debug_client.ping_binder().unwrap();
    let typed: Strong<dyn ITest> = FromIBinder::try_from(debug_client.clone()).unwrap();
    assert_eq!(typed.test().unwrap(), "testing service");

    // Death of the keep-alive binder tears the bridge down again.
    assert!(keep_alive_host.shutdown());
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if std::net::TcpStream::connect(("127.0.0.1", bridge_port)).is_err() {
            break;
        }
        assert!(Instant::now() < deadline, "bridge still accepting connections");
        std::thread::sleep(Duration::from_millis(20));
    }
}
