//! Safepoint Tests - The Protocol with Real OS Threads
//!
//! Mutators run on their own threads and only pause at poll points or
//! inside blocking operations. Collections and stack captures are driven
//! from the test thread.

mod common;

use common::{list_payloads, RuntimeFixture, PAYLOAD};
use sgc::{SafepointReason, ThreadControl, ThreadState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn spin_until(mut done: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(std::time::Instant::now() < deadline, "timed out");
        thread::yield_now();
    }
}

// ============================================================================
// COLLECTION
// ============================================================================

#[test]
fn test_collection_stops_every_mutator() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let mutators = 4;
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(mutators + 1));

    let handles: Vec<_> = (0..mutators)
        .map(|i| {
            let runtime = fixture.runtime.clone();
            let stop = stop.clone();
            let ready = ready.clone();
            thread::spawn(move || -> sgc::Result<Vec<u64>> {
                let thread = runtime.register_thread(Some(&format!("mutator-{}", i)))?;
                let node = runtime.define_class(
                    &sgc::ClassLayout::instance(32).with_references(&[common::NEXT]),
                )?;
                let frame = thread.push_frame(1)?;
                for payload in 0..50u64 {
                    let head = runtime.new_object(node)?;
                    head.set_word(PAYLOAD, payload)?;
                    head.set_ref(common::NEXT, frame.get(0)?)?;
                    frame.set(0, Some(head))?;
                }
                ready.wait();
                while !stop.load(Ordering::Acquire) {
                    // Garbage, so some collections are triggered from here.
                    runtime.new_object(node)?;
                    runtime.poll_safepoint()?;
                }
                let payloads = list_payloads(frame.get(0)?);
                drop(frame);
                runtime.deregister_thread()?;
                Ok(payloads)
            })
        })
        .collect();

    ready.wait();
    for _ in 0..10 {
        fixture.collect();
    }
    stop.store(true, Ordering::Release);

    let expected: Vec<u64> = (0..50).rev().collect();
    for handle in handles {
        let payloads = handle.join().expect("mutator panicked")?;
        assert_eq!(payloads, expected);
    }
    assert!(fixture.runtime.cycles() >= 10);
    assert_eq!(fixture.runtime.thread_count(), 0);
    Ok(())
}

#[test]
fn test_parked_thread_does_not_stall_collection() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let (tx, rx) = crossbeam::channel::bounded::<Arc<ThreadControl>>(1);
    let runtime = fixture.runtime.clone();

    let handle = thread::spawn(move || -> sgc::Result<u64> {
        let thread = runtime.register_thread(Some("parked"))?;
        let node = runtime.define_class(&sgc::ClassLayout::instance(32))?;
        let frame = thread.push_frame(1)?;
        let object = runtime.new_object(node)?;
        object.set_word(PAYLOAD, 5)?;
        frame.set(0, Some(object))?;

        tx.send(thread.clone()).expect("test thread listening");
        while !thread.park(None) {}

        let moved = frame.get(0)?.expect("rooted");
        assert_ne!(moved, object, "object should have been relocated while parked");
        let payload = moved.get_word(PAYLOAD)?;
        drop(frame);
        runtime.deregister_thread()?;
        Ok(payload)
    });

    let parked = rx.recv()?;
    spin_until(|| parked.state().contains(ThreadState::PARKED));
    fixture.collect();
    fixture.collect();
    parked.unpark();

    assert_eq!(handle.join().expect("parked thread panicked")?, 5);
    Ok(())
}

#[test]
fn test_back_to_back_collections_with_parked_threads() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let stop = Arc::new(AtomicBool::new(false));
    let parked = 32;
    let ready = Arc::new(Barrier::new(parked + 1));

    let sleepers: Vec<_> = (0..parked)
        .map(|_| {
            let runtime = fixture.runtime.clone();
            let stop = stop.clone();
            let ready = ready.clone();
            thread::spawn(move || -> sgc::Result<()> {
                let thread = runtime.register_thread(None)?;
                ready.wait();
                while !stop.load(Ordering::Acquire) {
                    thread.park(Some(Duration::from_millis(5)));
                }
                runtime.deregister_thread()
            })
        })
        .collect();
    ready.wait();

    // Requests land in every window of a running cycle, including after
    // completion but before the collector goes idle.
    let rounds: u64 = 500;
    let (done_tx, done_rx) = crossbeam::channel::unbounded();
    let driver = {
        let runtime = fixture.runtime.clone();
        thread::spawn(move || -> sgc::Result<()> {
            for round in 0..rounds {
                runtime.collect()?;
                let _ = done_tx.send(round);
            }
            Ok(())
        })
    };

    for round in 0..rounds {
        match done_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(_) => {}
            Err(_) => panic!(
                "collect() stalled after {} calls (cycles {}, state {:?})",
                round,
                fixture.runtime.cycles(),
                fixture.runtime.gc_state()
            ),
        }
    }
    driver.join().expect("collect driver panicked")?;
    assert!(fixture.runtime.cycles() >= rounds);

    stop.store(true, Ordering::Release);
    for sleeper in sleepers {
        sleeper.join().expect("parked thread panicked")?;
    }
    Ok(())
}

#[test]
fn test_registration_churn_during_collections() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let stop = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let runtime = fixture.runtime.clone();
            let stop = stop.clone();
            thread::spawn(move || -> sgc::Result<usize> {
                let mut rounds = 0;
                while !stop.load(Ordering::Acquire) {
                    runtime.register_thread(None)?;
                    runtime.poll_safepoint()?;
                    runtime.deregister_thread()?;
                    rounds += 1;
                }
                Ok(rounds)
            })
        })
        .collect();

    for _ in 0..20 {
        fixture.collect();
    }
    stop.store(true, Ordering::Release);
    for handle in handles {
        handle.join().expect("churn thread panicked")?;
    }
    assert_eq!(fixture.runtime.thread_count(), 0);
    Ok(())
}

// ============================================================================
// STACK CAPTURE
// ============================================================================

/// Registered thread holding a frame of `live` references, polling until
/// `stop` is set
fn spawn_poller(
    fixture: &RuntimeFixture,
    live: usize,
    stop: Arc<AtomicBool>,
) -> (Arc<ThreadControl>, thread::JoinHandle<sgc::Result<()>>) {
    let runtime = fixture.runtime.clone();
    let (tx, rx) = crossbeam::channel::bounded(1);
    let handle = thread::spawn(move || -> sgc::Result<()> {
        let thread = runtime.register_thread(Some("poller"))?;
        let node = runtime.define_class(&sgc::ClassLayout::instance(32))?;
        let frame = thread.push_frame(live + 1)?;
        for slot in 0..live {
            frame.set(slot, Some(runtime.new_object(node)?))?;
        }
        tx.send(thread.clone()).expect("test thread listening");
        while !stop.load(Ordering::Acquire) {
            thread.poll_safepoint();
            std::hint::spin_loop();
        }
        drop(frame);
        runtime.deregister_thread()
    });
    let control = rx.recv().expect("poller started");
    (control, handle)
}

#[test]
fn test_capture_stack_of_other_thread() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let stop = Arc::new(AtomicBool::new(false));
    let (poller, handle) = spawn_poller(&fixture, 3, stop.clone());

    let frames = fixture.runtime.capture_stack(&poller)?;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].live_references, 3);
    assert!(!poller.state().safepoint_requested());

    // A registered caller waits in a safepoint of its own.
    fixture.attach("main");
    let frames = fixture.runtime.capture_stack(&poller)?;
    assert_eq!(frames[0].live_references, 3);

    stop.store(true, Ordering::Release);
    handle.join().expect("poller panicked")?;
    assert!(fixture.runtime.capture_stack(&poller).is_err());
    Ok(())
}

#[test]
fn test_overlapping_requests_keep_thread_paused() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let stop = Arc::new(AtomicBool::new(false));
    let (poller, handle) = spawn_poller(&fixture, 1, stop.clone());

    assert!(poller.request_safepoint(SafepointReason::StackTrace));
    assert!(poller.await_safepoint());

    // The collection requests, uses and releases its own reason.
    fixture.collect();
    thread::sleep(Duration::from_millis(20));
    let state = poller.state();
    assert!(state.in_safepoint(), "released too early: {:?}", state);
    assert_eq!(state.pending_reasons(), ThreadState::SAFEPOINT_REQUEST_STACK);
    assert!(state.is_consistent());

    assert!(poller.release_safepoint(SafepointReason::StackTrace));
    spin_until(|| !poller.state().in_safepoint());

    stop.store(true, Ordering::Release);
    handle.join().expect("poller panicked")?;
    Ok(())
}
