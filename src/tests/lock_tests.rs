use crate::bus::RegisterAddress;
use crate::lock::{LockError, LockRegistry};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const SHORT: Duration = Duration::from_millis(50);

fn address(chip: u8) -> RegisterAddress {
    RegisterAddress::new(1, chip).unwrap()
}

#[test]
fn registry_hands_out_one_lock_per_chip() {
    let dir = tempdir().unwrap();
    let locks = LockRegistry::new(dir.path());

    let a = locks.get(&address(0x20));
    let b = locks.get(&address(0x20));
    let c = locks.get(&address(0x21));

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(locks.len(), 2);
    assert_eq!(a.path(), dir.path().join("pcf8574_1_0x20.lock"));
}

#[test]
fn held_lock_times_out_other_threads() {
    let dir = tempdir().unwrap();
    let locks = LockRegistry::new(dir.path());
    let lock = locks.get(&address(0x20));
    let guard = lock.acquire(SHORT).unwrap();

    let other = locks.get(&address(0x20));
    let started = Instant::now();
    let result = thread::spawn(move || other.acquire(SHORT).map(|_| ())).join().unwrap();

    assert_eq!(result, Err(LockError::Timeout(address(0x20), SHORT)));
    assert!(started.elapsed() >= SHORT);
    drop(guard);
}

#[test]
fn file_lock_excludes_independent_registries() {
    // two registries over one directory behave like two processes
    let dir = tempdir().unwrap();
    let first = LockRegistry::new(dir.path());
    let second = LockRegistry::new(dir.path());
    let first_lock = first.get(&address(0x20));
    let second_lock = second.get(&address(0x20));

    let guard = first_lock.acquire(SHORT).unwrap();
    assert!(matches!(second_lock.acquire(SHORT), Err(LockError::Timeout(..))));

    drop(guard);
    assert!(second_lock.acquire(SHORT).is_ok());
}

#[test]
fn waiter_gets_lock_once_released() {
    let dir = tempdir().unwrap();
    let first = LockRegistry::new(dir.path());
    let second = LockRegistry::new(dir.path());
    let first_lock = first.get(&address(0x20));
    let second_lock = second.get(&address(0x20));

    let (tx, rx) = mpsc::channel();
    let guard = first_lock.acquire(SHORT).unwrap();
    let waiter = thread::spawn(move || {
        tx.send(()).unwrap();
        second_lock.acquire(Duration::from_secs(5)).map(|_| ())
    });

    rx.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    drop(guard);

    assert_eq!(waiter.join().unwrap(), Ok(()));
}

#[test]
fn different_chips_do_not_contend() {
    let dir = tempdir().unwrap();
    let locks = LockRegistry::new(dir.path());
    let a = locks.get(&address(0x20));
    let b = locks.get(&address(0x38));

    let _a_guard = a.acquire(SHORT).unwrap();
    assert!(b.acquire(SHORT).is_ok());
}

#[test]
fn lock_is_reusable_after_release() {
    let dir = tempdir().unwrap();
    let locks = LockRegistry::new(dir.path().join("locks"));
    let lock = locks.get(&address(0x20));

    for _ in 0..3 {
        let guard = lock.acquire(SHORT).unwrap();
        drop(guard);
    }

    assert!(lock.path().exists());
}

#[test]
fn unbounded_timeout_waits_instead_of_overflowing() {
    let dir = tempdir().unwrap();
    let first = LockRegistry::new(dir.path());
    let second = LockRegistry::new(dir.path());
    let first_lock = first.get(&address(0x20));
    let second_lock = second.get(&address(0x20));

    assert!(first_lock.acquire(Duration::MAX).is_ok());

    let guard = first_lock.acquire(SHORT).unwrap();
    let waiter = thread::spawn(move || second_lock.acquire(Duration::MAX).map(|_| ()));
    thread::sleep(Duration::from_millis(100));
    drop(guard);

    assert_eq!(waiter.join().unwrap(), Ok(()));
}
