mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use durabus::{RetryScheduler, Transaction};
use support::{fixture, soon, wait_until, Fixture};

fn scheduler(f: &Fixture) -> RetryScheduler {
    RetryScheduler::new(
        Arc::new(f.store.clone()),
        Arc::clone(&f.registry),
        Arc::clone(&f.local),
    )
    .with_staleness(Duration::from_secs(60))
}

#[test]
fn failed_consumption_is_redelivered_until_it_succeeds() {
    let f = fixture();
    let attempts = Arc::new(AtomicUsize::new(0));

    let a = attempts.clone();
    f.bus
        .subscribe("run/new", "alerting", move |_: String| {
            // Fail the first delivery, succeed on the retry.
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("transient".into())
            } else {
                Ok(())
            }
        })
        .unwrap();

    let tx = Transaction::begin();
    f.bus
        .publish(&tx, "run/new", &"build-17".to_string())
        .unwrap();
    tx.commit();

    assert!(wait_until(soon(), || attempts.load(Ordering::SeqCst) == 1));
    // The failed attempt left the bit set.
    assert_eq!(f.store.message(1).unwrap().pending_mask, 0b1);

    // Age the row past the staleness window, then scan.
    f.store.backdate(1, Duration::from_secs(600)).unwrap();
    let stats = scheduler(&f).scan_once();
    assert_eq!(stats.republished, 1);
    assert_eq!(stats.skipped, 0);

    assert!(wait_until(soon(), || attempts.load(Ordering::SeqCst) == 2));
    assert!(wait_until(soon(), || {
        f.store.message(1).map(|m| m.pending_mask) == Some(0)
    }));
}

#[test]
fn redelivery_skips_components_that_already_consumed() {
    let f = fixture();
    let steady_calls = Arc::new(AtomicUsize::new(0));
    let flaky_calls = Arc::new(AtomicUsize::new(0));

    let s = steady_calls.clone();
    f.bus
        .subscribe("run/new", "steady", move |_: String| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    let fl = flaky_calls.clone();
    f.bus
        .subscribe("run/new", "flaky", move |_: String| {
            if fl.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("transient".into())
            } else {
                Ok(())
            }
        })
        .unwrap();

    let tx = Transaction::begin();
    f.bus
        .publish(&tx, "run/new", &"build-17".to_string())
        .unwrap();
    tx.commit();

    // Only the flaky component's bit survives the first round.
    assert!(wait_until(soon(), || {
        f.store.message(1).map(|m| m.pending_mask) == Some(0b10)
    }));

    f.store.backdate(1, Duration::from_secs(600)).unwrap();
    assert_eq!(scheduler(&f).scan_once().republished, 1);

    assert!(wait_until(soon(), || {
        f.store.message(1).map(|m| m.pending_mask) == Some(0)
    }));
    assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
    // The republished envelope carried only the flaky bit, so the steady
    // component never saw a duplicate.
    assert_eq!(steady_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn background_scheduler_drives_redelivery() {
    let f = fixture();
    let attempts = Arc::new(AtomicUsize::new(0));

    let a = attempts.clone();
    f.bus
        .subscribe("run/new", "alerting", move |_: String| {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("transient".into())
            } else {
                Ok(())
            }
        })
        .unwrap();

    let tx = Transaction::begin();
    f.bus
        .publish(&tx, "run/new", &"build-17".to_string())
        .unwrap();
    tx.commit();

    assert!(wait_until(soon(), || attempts.load(Ordering::SeqCst) == 1));
    f.store.backdate(1, Duration::from_secs(600)).unwrap();

    let handle = RetryScheduler::new(
        Arc::new(f.store.clone()),
        Arc::clone(&f.registry),
        Arc::clone(&f.local),
    )
    .with_interval(Duration::from_millis(10))
    .with_staleness(Duration::from_secs(60))
    .spawn();

    assert!(wait_until(soon(), || {
        f.store.message(1).map(|m| m.pending_mask) == Some(0)
    }));

    let stats = handle.stop();
    assert!(stats.scans >= 1);
    assert!(stats.republished >= 1);
}
