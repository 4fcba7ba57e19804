//! Server election under contention.
//!
//! Threads stand in for processes: each runs its own election against a
//! shared runtime directory.

use memmap_broker::device::HostDeviceConfig;
use memmap_broker::{Broker, BrokerConfig, ProcessIdentity};
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn config(dir: &Path) -> BrokerConfig {
    BrokerConfig::default()
        .with_runtime_dir(dir)
        .with_request_timeout(Some(Duration::from_secs(5)))
        .with_device(HostDeviceConfig::default().with_granularity(64 * 1024))
}

fn race(dir: &Path, contenders: usize) -> Vec<Broker> {
    let barrier = Arc::new(Barrier::new(contenders));
    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let config = config(dir);
            thread::spawn(move || {
                barrier.wait();
                Broker::arbitrate(config).unwrap()
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn halt(brokers: &[Broker]) {
    let mut admin = brokers[0]
        .connect(ProcessIdentity::with_pid(1, 0))
        .unwrap();
    admin.halt().unwrap();
    for broker in brokers {
        broker.wait().unwrap();
    }
}

#[test]
fn test_two_racing_arbiters_elect_one_server() {
    let dir = tempfile::tempdir().unwrap();
    let brokers = race(dir.path(), 2);
    assert_eq!(brokers.iter().filter(|b| b.is_server()).count(), 1);

    let loser = brokers.iter().find(|b| !b.is_server()).unwrap();
    let mut client = loser.connect(ProcessIdentity::with_pid(50, 0)).unwrap();
    client.register().unwrap();
    client.echo().unwrap();
    let size = client.rounded_allocation_size(1).unwrap();
    assert_eq!(size, 64 * 1024);

    halt(&brokers);
}

#[test]
fn test_many_racing_arbiters_elect_one_server() {
    let dir = tempfile::tempdir().unwrap();
    let brokers = race(dir.path(), 8);
    assert_eq!(brokers.iter().filter(|b| b.is_server()).count(), 1);

    for (i, broker) in brokers.iter().enumerate() {
        let mut client = broker
            .connect(ProcessIdentity::with_pid(100 + i as u32, 0))
            .unwrap();
        client.echo().unwrap();
    }
    halt(&brokers);
}

#[test]
fn test_reelection_after_halt() {
    let dir = tempfile::tempdir().unwrap();
    let first = Broker::arbitrate(config(dir.path())).unwrap();
    assert!(first.is_server());
    halt(std::slice::from_ref(&first));

    let second = Broker::arbitrate(config(dir.path())).unwrap();
    assert!(second.is_server());
    let mut client = second.connect(ProcessIdentity::with_pid(60, 0)).unwrap();
    client.echo().unwrap();
    halt(std::slice::from_ref(&second));
}

#[test]
fn test_instance_is_process_wide() {
    let dir = tempfile::tempdir().unwrap();
    let a = Broker::instance(config(dir.path())).unwrap();
    let b = Broker::instance(config(Path::new("/nonexistent/ignored"))).unwrap();
    assert!(std::ptr::eq(a, b));
    assert!(a.is_server());

    let mut client = a.connect(ProcessIdentity::with_pid(70, 0)).unwrap();
    client.echo().unwrap();
    client.halt().unwrap();
    a.wait().unwrap();
}
