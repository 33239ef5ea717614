//! GC Stress Tests - Randomized Mutators Against a Model
//!
//! Each mutator thread keeps a frame of 16 root slots and a model of the
//! list every slot should hold. Random allocation, linking and dropping
//! forces frequent collections; after each step that may have moved
//! objects the heap must still agree with the model.
//!
//! The long variant is ignored by default:
//! `cargo test --test gc_stress -- --ignored`

mod common;

use common::{list_payloads, RuntimeFixture, NEXT, PAYLOAD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sgc::{ClassLayout, Runtime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const SLOTS: usize = 16;
/// Lists never grow past this, so live data stays bounded
const MAX_LIST: usize = 48;

fn mutator_count() -> usize {
    num_cpus::get().clamp(2, 8)
}

/// Run `steps` random operations on a registered thread
fn run_mutator(runtime: &Runtime, seed: u64, steps: usize) -> sgc::Result<usize> {
    let thread = runtime.register_thread(Some(&format!("stress-{}", seed)))?;
    let node = runtime.define_class(&ClassLayout::instance(32).with_references(&[NEXT]))?;
    let bytes = runtime.define_class(&ClassLayout::primitive_array(1))?;
    let frame = thread.push_frame(SLOTS)?;
    let mut model: Vec<Vec<u64>> = vec![Vec::new(); SLOTS];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut next_payload = seed << 32;
    let mut checks = 0;

    for _ in 0..steps {
        let slot = rng.gen_range(0..SLOTS);
        match rng.gen_range(0..10) {
            // Prepend a fresh node to another slot's list.
            0..=3 => {
                let tail = rng.gen_range(0..SLOTS);
                let object = runtime.new_object(node)?;
                object.set_word(PAYLOAD, next_payload)?;
                let mut list = vec![next_payload];
                if model[tail].len() < MAX_LIST {
                    object.set_ref(NEXT, frame.get(tail)?)?;
                    list.extend_from_slice(&model[tail]);
                }
                frame.set(slot, Some(object))?;
                model[slot] = list;
                next_payload += 1;
            }
            4 => {
                frame.set(slot, None)?;
                model[slot].clear();
            }
            5 => {
                let source = rng.gen_range(0..SLOTS);
                frame.set(slot, frame.get(source)?)?;
                model[slot] = model[source].clone();
            }
            // Unrooted garbage of varying size.
            6..=8 => {
                let len = rng.gen_range(1..2048);
                runtime.new_array(bytes, len)?;
            }
            _ => {
                runtime.poll_safepoint()?;
            }
        }

        if rng.gen_ratio(1, 64) {
            for (index, expected) in model.iter().enumerate() {
                assert_eq!(&list_payloads(frame.get(index)?), expected, "slot {}", index);
            }
            checks += 1;
        }
    }

    for (index, expected) in model.iter().enumerate() {
        assert_eq!(&list_payloads(frame.get(index)?), expected, "slot {}", index);
    }
    drop(frame);
    runtime.deregister_thread()?;
    Ok(checks + 1)
}

fn stress(steps: usize, explicit_collections: bool) -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let stop = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..mutator_count() as u64)
        .map(|seed| {
            let runtime = fixture.runtime.clone();
            thread::spawn(move || run_mutator(&runtime, seed + 1, steps))
        })
        .collect();

    let collector = explicit_collections.then(|| {
        let runtime = fixture.runtime.clone();
        let stop = stop.clone();
        thread::spawn(move || -> sgc::Result<()> {
            while !stop.load(Ordering::Acquire) {
                runtime.collect()?;
                thread::sleep(std::time::Duration::from_millis(1));
            }
            Ok(())
        })
    });

    for handle in handles {
        let checks = handle.join().expect("mutator panicked")?;
        assert!(checks > 0);
    }
    stop.store(true, Ordering::Release);
    if let Some(collector) = collector {
        collector.join().expect("collector driver panicked")?;
    }

    assert!(fixture.runtime.cycles() > 0, "stress run never collected");
    assert_eq!(fixture.runtime.thread_count(), 0);
    let summary = fixture.runtime.stats();
    println!(
        "stress: {} cycles, {} bytes copied, max pause {:.3}ms",
        summary.cycles, summary.bytes_copied, summary.max_pause_ms
    );
    Ok(())
}

// ============================================================================
// RANDOMIZED MUTATORS
// ============================================================================

#[test]
fn test_random_mutators_match_model() -> anyhow::Result<()> {
    stress(20_000, false)
}

#[test]
fn test_random_mutators_with_external_collections() -> anyhow::Result<()> {
    stress(10_000, true)
}

#[test]
#[ignore = "Stress test - run explicitly"]
fn test_random_mutators_long_run() -> anyhow::Result<()> {
    stress(500_000, true)
}
