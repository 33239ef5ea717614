//! Allocation Tests - Bump Allocation, Slow Path and Heap Sizing
//!
//! Covers the allocation slow path end to end: collection on exhaustion,
//! soft-limit growth on the retry, out-of-memory after a full collection
//! and the limit chosen after each cycle.

mod common;

use common::{assert_all_addresses_unique, list_payloads, RuntimeFixture, KB, MB};
use sgc::{ClassLayout, GcEvent, SgcError};
use std::sync::{Arc, Barrier};
use std::thread;

// ============================================================================
// FAST PATH
// ============================================================================

#[test]
fn test_concurrent_allocations_disjoint() -> anyhow::Result<()> {
    // Big enough that no collection runs: addresses are never reused.
    let fixture = RuntimeFixture::with_heap(16 * MB, 32 * MB);
    let threads = 8;
    let per_thread = 2_000;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let runtime = fixture.runtime.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> sgc::Result<Vec<usize>> {
                runtime.register_thread(Some(&format!("alloc-{}", i)))?;
                let class = runtime.define_class(&ClassLayout::instance(32))?;
                barrier.wait();
                let addrs = (0..per_thread)
                    .map(|_| runtime.new_object(class).map(|o| o.addr()))
                    .collect::<sgc::Result<Vec<_>>>()?;
                runtime.deregister_thread()?;
                Ok(addrs)
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        let addrs = handle.join().expect("allocating thread panicked")?;
        for addr in &addrs {
            assert_eq!(addr % 8, 0, "{:#x} is misaligned", addr);
        }
        all.extend(addrs);
    }

    assert_eq!(fixture.runtime.cycles(), 0);
    assert_eq!(all.len(), threads * per_thread);
    assert_all_addresses_unique(&all, "concurrent new_object");
    Ok(())
}

#[test]
fn test_zero_sized_allocation_rejected() {
    let fixture = RuntimeFixture::with_defaults();
    fixture.attach("main");
    assert!(matches!(
        fixture.runtime.allocate(0),
        Err(SgcError::InvalidArgument(_))
    ));
}

// ============================================================================
// SLOW PATH
// ============================================================================

#[test]
fn test_exhaustion_triggers_collection() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let node = fixture.node_class();

    let frame = thread.push_frame(1)?;
    frame.set(0, fixture.list(node, 100))?;

    // ~3MB of garbage against a 512KB soft limit.
    for i in 0..100_000u64 {
        fixture.node(node, i);
    }

    assert!(fixture.runtime.cycles() >= 1, "no collection was triggered");
    assert_eq!(list_payloads(frame.get(0)?), (0..100).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_retry_grows_soft_limit() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let bytes = fixture
        .runtime
        .define_class(&ClassLayout::primitive_array(1))?;
    let initial_limit = fixture.runtime.heap_usage().limit;
    assert_eq!(initial_limit, 512 * KB);

    let frame = thread.push_frame(1)?;
    let big = fixture.runtime.new_array(bytes, 600 * KB)?;
    frame.set(0, Some(big))?;

    let usage = fixture.runtime.heap_usage();
    assert!(usage.limit > initial_limit);
    assert!(usage.used <= usage.limit);
    assert_eq!(fixture.runtime.cycles(), 1);
    assert_eq!(big.array_length(), 600 * KB);
    Ok(())
}

#[test]
fn test_out_of_memory_after_collection() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let bytes = fixture
        .runtime
        .define_class(&ClassLayout::primitive_array(1))?;

    let frame = thread.push_frame(1)?;
    frame.set(0, Some(fixture.runtime.new_array(bytes, 600 * KB)?))?;

    // Live set plus request exceeds the 2MB semispace even after a cycle.
    let cycles = fixture.runtime.cycles();
    let err = fixture.runtime.new_array(bytes, 1536 * KB).unwrap_err();
    assert!(matches!(err, SgcError::OutOfMemory { .. }), "{:?}", err);
    assert!(err.is_recoverable());
    assert!(fixture.runtime.cycles() > cycles);

    let failures = fixture
        .runtime
        .logger()
        .events()
        .into_iter()
        .filter(|e| matches!(e.event, GcEvent::AllocationFailure { .. }))
        .count();
    assert_eq!(failures, 1);

    // The rooted array is intact and the heap still usable.
    assert_eq!(frame.get(0)?.map(|a| a.array_length()), Some(600 * KB));
    assert!(fixture.runtime.new_array(bytes, 16).is_ok());
    Ok(())
}

#[test]
fn test_request_larger_than_semispace() {
    let fixture = RuntimeFixture::with_defaults();
    fixture.attach("main");
    let err = fixture.runtime.allocate(3 * MB).unwrap_err();
    assert!(matches!(err, SgcError::OutOfMemory { requested, .. } if requested == 3 * MB));
    assert_eq!(fixture.runtime.cycles(), 0);
}

// ============================================================================
// HEAP SIZING
// ============================================================================

#[test]
fn test_soft_limit_tracks_live_set() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let node = fixture.node_class();

    // Small live set: the limit falls back to min_heap_size / 2.
    fixture.collect();
    assert_eq!(fixture.runtime.heap_usage().limit, 512 * KB);

    // 16,000 nodes of 32 bytes stay live: the limit doubles the live set.
    let frame = thread.push_frame(1)?;
    frame.set(0, fixture.list(node, 16_000))?;
    fixture.collect();

    let usage = fixture.runtime.heap_usage();
    assert_eq!(usage.used, 16_000 * 32);
    assert_eq!(usage.limit, 2 * usage.used);

    frame.set(0, None)?;
    fixture.collect();
    let usage = fixture.runtime.heap_usage();
    assert_eq!(usage.used, 0);
    assert_eq!(usage.limit, 512 * KB);
    Ok(())
}

#[test]
fn test_heap_resized_events() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let node = fixture.node_class();

    let frame = thread.push_frame(1)?;
    frame.set(0, fixture.list(node, 16_000))?;
    fixture.collect();

    let resized: Vec<_> = fixture
        .runtime
        .logger()
        .events()
        .into_iter()
        .filter_map(|e| match e.event {
            GcEvent::HeapResized { old_limit, new_limit } => Some((old_limit, new_limit)),
            _ => None,
        })
        .collect();
    assert_eq!(resized, vec![(512 * KB, 16_000 * 32 * 2)]);
    Ok(())
}
