//! End-to-end tests of the broker protocol.
//!
//! Each test elects a server in its own runtime directory and drives it with
//! clients that use synthetic pids, so several logical processes share one
//! test process.

use memmap_broker::protocol::{Command, MemName, Request, ShareableHandle, StatusCode};
use memmap_broker::{Broker, BrokerConfig, Client, Error, ProcessIdentity};
use memmap_broker::device::HostDeviceConfig;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const GRANULARITY: usize = 64 * 1024;

struct Harness {
    dir: TempDir,
    broker: Broker,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig::default()
            .with_runtime_dir(dir.path())
            .with_request_timeout(Some(Duration::from_secs(5)))
            .with_device(HostDeviceConfig::default().with_granularity(GRANULARITY));
        let broker = Broker::arbitrate(config).unwrap();
        assert!(broker.is_server());
        Self { dir, broker }
    }

    fn client(&self, pid: u32) -> Client {
        self.broker
            .connect(ProcessIdentity::with_pid(pid, 0))
            .unwrap()
    }

    fn halt(&self) {
        let mut admin = self.client(1);
        admin.halt().unwrap();
        self.broker.wait().unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.broker.config().server_endpoint().exists() {
            if let Ok(mut admin) = self.broker.connect(ProcessIdentity::with_pid(1, 0)) {
                let _ = admin.halt();
            }
        }
        let _ = self.broker.wait();
    }
}

// ============================================================================
// Basic commands
// ============================================================================

#[test]
fn test_hundred_echoes_all_ack() {
    let h = Harness::start();
    let mut client = h.client(100);
    for _ in 0..100 {
        client.echo().unwrap();
    }
}

#[test]
fn test_echo_response_addressed_to_sender() {
    let h = Harness::start();
    let mut client = h.client(101);
    let identity = *client.identity();
    let exchange = client.request(&Request::new(Command::Echo, identity)).unwrap();
    assert_eq!(exchange.response.status, StatusCode::Ack);
    assert_eq!(exchange.response.destination.pid, 101);
    assert_eq!(exchange.response.handle_count, 0);
    assert!(exchange.handles.is_empty());
}

#[test]
fn test_double_register_reports_duplicate() {
    let h = Harness::start();
    let mut client = h.client(102);
    client.register().unwrap();
    assert!(matches!(
        client.register(),
        Err(Error::Rejected(StatusCode::DuplicateRegister))
    ));

    client.deregister().unwrap();
    assert!(matches!(
        client.deregister(),
        Err(Error::Rejected(StatusCode::NotFound))
    ));
    client.register().unwrap();
}

#[test]
fn test_rounding_then_allocate() {
    let h = Harness::start();
    let mut client = h.client(103);
    let size = client.rounded_allocation_size(40_000).unwrap();
    assert_eq!(size, 65_536);
    assert_eq!(client.rounded_allocation_size(0).unwrap(), 0);
    assert_eq!(client.rounded_allocation_size(size).unwrap(), size);

    let region = client.allocate(None, 0, size).unwrap();
    assert_ne!(region.address(), 0);
    assert_ne!(region.server_address(), 0);
    assert_eq!(region.len(), size);
    assert!(region.name().is_none());
}

#[test]
fn test_unrounded_allocation_is_invalid() {
    let h = Harness::start();
    let mut client = h.client(104);
    assert!(matches!(
        client.allocate(Some("odd"), 0, 40_000),
        Err(Error::Rejected(StatusCode::InvalidRequest))
    ));
    assert!(matches!(
        client.allocate(Some("odd"), 3, GRANULARITY),
        Err(Error::Rejected(StatusCode::InvalidRequest))
    ));
    // Nothing was registered under the name.
    assert!(matches!(
        client.import("odd"),
        Err(Error::Rejected(StatusCode::NotFound))
    ));
}

// ============================================================================
// Sharing
// ============================================================================

#[test]
fn test_allocate_then_import_shares_memory() {
    let h = Harness::start();
    let mut producer = h.client(200);
    let mut consumer = h.client(201);

    let region = producer.allocate(Some("frame"), 0, GRANULARITY).unwrap();
    region.copy_from_host(0, b"written by producer").unwrap();

    let shared = consumer.import("frame").unwrap();
    assert_eq!(shared.handle(), region.handle());
    assert_eq!(shared.server_address(), region.server_address());
    assert_eq!(shared.len(), region.len());
    assert_eq!(shared.name().map(MemName::as_str), Some("frame"));

    let mut buf = [0u8; 19];
    shared.copy_to_host(0, &mut buf).unwrap();
    assert_eq!(&buf, b"written by producer");

    shared.copy_from_host(4096, b"reply").unwrap();
    let mut reply = [0u8; 5];
    region.copy_to_host(4096, &mut reply).unwrap();
    assert_eq!(&reply, b"reply");
}

#[test]
fn test_import_by_handle() {
    let h = Harness::start();
    let mut owner = h.client(210);
    let mut other = h.client(211);

    let region = owner.allocate(None, 0, 2 * GRANULARITY).unwrap();
    region.copy_from_host(GRANULARITY, &[7; 16]).unwrap();

    let imported = other.import_handle(region.handle()).unwrap();
    let mut buf = [0u8; 16];
    imported.copy_to_host(GRANULARITY, &mut buf).unwrap();
    assert_eq!(buf, [7; 16]);

    assert!(matches!(
        other.import_handle(ShareableHandle(u64::MAX)),
        Err(Error::Rejected(StatusCode::NotFound))
    ));
}

#[test]
fn test_import_source_filter() {
    let h = Harness::start();
    let mut owner = h.client(220);
    let mut other = h.client(221);
    owner.allocate(Some("filtered"), 0, GRANULARITY).unwrap();

    let name = MemName::new("filtered").unwrap();
    let sender = *other.identity();

    let wrong = Request::new(Command::Import, sender)
        .with_name(name.clone())
        .with_import_source(ProcessIdentity::with_pid(999, 0));
    let exchange = other.request(&wrong).unwrap();
    assert_eq!(exchange.response.status, StatusCode::NotFound);
    assert!(exchange.handles.is_empty());

    let right = Request::new(Command::Import, sender)
        .with_name(name)
        .with_import_source(ProcessIdentity::with_pid(220, 0));
    let exchange = other.request(&right).unwrap();
    assert_eq!(exchange.response.status, StatusCode::Ack);
    assert_eq!(exchange.response.handle_count, 1);
    assert_eq!(exchange.handles.len(), 1);
}

#[test]
fn test_duplicate_name_rejected() {
    let h = Harness::start();
    let mut a = h.client(230);
    let mut b = h.client(231);
    let first = a.allocate(Some("unique"), 0, GRANULARITY).unwrap();
    assert!(matches!(
        b.allocate(Some("unique"), 0, GRANULARITY),
        Err(Error::Rejected(StatusCode::DuplicateRegister))
    ));

    // The original registration is untouched.
    let again = b.import("unique").unwrap();
    assert_eq!(again.handle(), first.handle());
}

#[test]
fn test_deallocate_keeps_existing_mappings() {
    let h = Harness::start();
    let mut owner = h.client(240);
    let mut reader = h.client(241);

    let region = owner.allocate(Some("scratch"), 0, GRANULARITY).unwrap();
    let mapped = reader.import("scratch").unwrap();
    owner.deallocate(region.handle()).unwrap();

    assert!(matches!(
        reader.import("scratch"),
        Err(Error::Rejected(StatusCode::NotFound))
    ));
    assert!(matches!(
        owner.deallocate(region.handle()),
        Err(Error::Rejected(StatusCode::NotFound))
    ));

    region.copy_from_host(0, b"still here").unwrap();
    let mut buf = [0u8; 10];
    mapped.copy_to_host(0, &mut buf).unwrap();
    assert_eq!(&buf, b"still here");

    // The name is free for reuse.
    owner.allocate(Some("scratch"), 0, GRANULARITY).unwrap();
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_clients_allocate_distinct_names() {
    let h = Arc::new(Harness::start());
    let num_clients = 8u32;

    let handles: Vec<_> = (0..num_clients)
        .map(|i| {
            let h = Arc::clone(&h);
            thread::spawn(move || {
                let pid = 1000 + i;
                let mut client = h.client(pid);
                client.register().unwrap();
                let region = client
                    .allocate(Some(&format!("region-{i}")), 0, GRANULARITY)
                    .unwrap();
                region.copy_from_host(0, &pid.to_le_bytes()).unwrap();
                for _ in 0..10 {
                    client.echo().unwrap();
                }
                region.handle()
            })
        })
        .collect();

    let mut handles_seen: Vec<ShareableHandle> =
        handles.into_iter().map(|t| t.join().unwrap()).collect();
    handles_seen.sort_by_key(|handle| handle.0);
    handles_seen.dedup();
    assert_eq!(handles_seen.len(), num_clients as usize);

    // Every region is reachable by name and holds its owner's pid.
    let mut checker = h.client(2000);
    for i in 0..num_clients {
        let region = checker.import(&format!("region-{i}")).unwrap();
        let mut buf = [0u8; 4];
        region.copy_to_host(0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 1000 + i);
    }
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_halt_unlinks_server_endpoint() {
    let h = Harness::start();
    let endpoint = h.broker.config().server_endpoint();
    let mut client = h.client(300);
    client.echo().unwrap();

    h.halt();
    assert!(!endpoint.exists());

    let err = client.echo().unwrap_err();
    assert!(err.is_transport(), "{err:?}");
    assert_eq!(err.status_code(), StatusCode::SockErr);
    assert!(h.dir.path().exists());
}

#[test]
fn test_client_endpoints_are_cleaned_up() {
    let h = Harness::start();
    let path = {
        let client = h.client(310);
        client.endpoint_path().to_path_buf()
    };
    assert!(!path.exists());
}
