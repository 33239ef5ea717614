//! Correctness Tests - Object Graphs Survive Collections Intact
//!
//! Every test builds a graph reachable from one kind of root, collects,
//! and checks that each reachable object is still reachable at its new
//! address with its fields rewritten and its payload unchanged.

mod common;

use common::{assert_in_active_space, list_payloads, RuntimeFixture, NEXT, OTHER, PAYLOAD};
use sgc::object::StackObject;
use sgc::{ClassLayout, GcEvent};
use std::sync::atomic::{AtomicUsize, Ordering};

// ============================================================================
// STACK ROOTS
// ============================================================================

#[test]
fn test_list_survives_repeated_collections() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let node = fixture.node_class();

    let frame = thread.push_frame(1)?;
    frame.set(0, fixture.list(node, 1_000))?;
    let expected: Vec<u64> = (0..1_000).collect();

    for _ in 0..5 {
        let before = frame.get(0)?.map(|o| o.addr());
        fixture.collect();
        let head = frame.get(0)?;
        assert_ne!(head.map(|o| o.addr()), before, "head was not relocated");
        assert_in_active_space(&fixture.runtime, head.expect("rooted"), "list head");
        assert_eq!(list_payloads(head), expected);
    }
    assert_eq!(fixture.runtime.heap_usage().used, 1_000 * 32);
    Ok(())
}

#[test]
fn test_shared_and_cyclic_references() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let node = fixture.node_class();

    // a ─▶ b ─▶ d ─▶ a
    // a ─▶ c ─▶ d
    let frame = thread.push_frame(1)?;
    let a = fixture.node(node, 1);
    frame.set(0, Some(a))?;
    let b = fixture.node(node, 2);
    let c = fixture.node(node, 3);
    let d = fixture.node(node, 4);
    a.set_ref(NEXT, Some(b))?;
    a.set_ref(OTHER, Some(c))?;
    b.set_ref(NEXT, Some(d))?;
    c.set_ref(NEXT, Some(d))?;
    d.set_ref(NEXT, Some(a))?;

    fixture.collect();

    let a = frame.get(0)?.expect("rooted");
    let b = a.get_ref(NEXT)?.expect("a.next");
    let c = a.get_ref(OTHER)?.expect("a.other");
    let d = b.get_ref(NEXT)?.expect("b.next");
    assert_eq!(c.get_ref(NEXT)?, Some(d), "shared target was copied twice");
    assert_eq!(d.get_ref(NEXT)?, Some(a), "cycle not closed");
    let payloads = [a, b, c, d]
        .iter()
        .map(|o| o.get_word(PAYLOAD))
        .collect::<sgc::Result<Vec<_>>>()?;
    assert_eq!(payloads, vec![1, 2, 3, 4]);
    assert_eq!(fixture.runtime.heap_usage().used, 4 * 32);
    Ok(())
}

#[test]
fn test_unreachable_objects_reclaimed() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let node = fixture.node_class();

    let frame = thread.push_frame(1)?;
    frame.set(0, fixture.list(node, 10))?;
    for i in 0..1_000 {
        fixture.node(node, i);
    }
    let used_before = fixture.runtime.heap_usage().used;

    fixture.collect();
    let stats = fixture.runtime.stats();
    assert_eq!(stats.live_bytes, 10 * 32);
    assert_eq!(stats.objects_relocated, 10);
    assert_eq!(fixture.runtime.heap_usage().used, 10 * 32);

    let reclaimed = fixture
        .runtime
        .logger()
        .events()
        .into_iter()
        .find_map(|e| match e.event {
            GcEvent::CycleEnd { reclaimed_bytes, .. } => Some(reclaimed_bytes),
            _ => None,
        });
    assert_eq!(reclaimed, Some(used_before - 10 * 32));
    Ok(())
}

#[test]
fn test_arrays_survive() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let node = fixture.node_class();
    let array_class = fixture.array_class();
    let bytes_class = fixture
        .runtime
        .define_class(&ClassLayout::primitive_array(1))?;

    let frame = thread.push_frame(2)?;
    let array = fixture.runtime.new_array(array_class, 8)?;
    frame.set(0, Some(array))?;
    for i in (0..8).step_by(2) {
        array.set_element(i, Some(fixture.node(node, i as u64)))?;
    }
    let bytes = fixture.runtime.new_array(bytes_class, 13)?;
    bytes.write_primitive_bytes(b"hello, world!")?;
    frame.set(1, Some(bytes))?;

    fixture.collect();

    let array = frame.get(0)?.expect("rooted");
    assert_eq!(array.array_length(), 8);
    for i in 0..8 {
        let element = array.element(i)?;
        if i % 2 == 0 {
            assert_eq!(element.map(|e| e.get_word(PAYLOAD)).transpose()?, Some(i as u64));
        } else {
            assert!(element.is_none());
        }
    }
    let bytes = frame.get(1)?.expect("rooted");
    assert_eq!(bytes.primitive_bytes()?, b"hello, world!");
    Ok(())
}

#[test]
fn test_stack_allocated_objects_fixed_in_place() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let node = fixture.node_class();

    let local = StackObject::new(node)?;
    let frame = thread.push_frame(1)?;
    frame.set(0, Some(local.object()))?;
    local.object().set_ref(NEXT, Some(fixture.node(node, 42)))?;

    fixture.collect();

    let held = frame.get(0)?.expect("rooted");
    assert_eq!(held, local.object(), "stack object must not move");
    let target = held.get_ref(NEXT)?.expect("field kept");
    assert_in_active_space(&fixture.runtime, target, "stack object field");
    assert_eq!(target.get_word(PAYLOAD)?, 42);
    Ok(())
}

// ============================================================================
// OTHER ROOTS
// ============================================================================

#[test]
fn test_global_roots_updated() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    fixture.attach("main");
    let node = fixture.node_class();

    let globals: [AtomicUsize; 3] = Default::default();
    let base = globals.as_ptr() as *mut usize;
    unsafe { fixture.runtime.register_global_roots(base, globals.len())? };
    let before = fixture.node(node, 7).addr();
    globals[1].store(before, Ordering::Release);

    fixture.collect();
    let after = globals[1].load(Ordering::Acquire);
    assert_ne!(after, before);
    assert_eq!(globals[0].load(Ordering::Acquire), 0);
    let object = fixture.runtime.heap().resolve(after)?;
    assert_eq!(object.get_word(PAYLOAD)?, 7);

    fixture.runtime.unregister_global_roots(base)?;
    fixture.collect();
    assert_eq!(fixture.runtime.heap_usage().used, 0);
    Ok(())
}

#[test]
fn test_permanent_regions_hold_heap_objects() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    fixture.attach("main");
    let holder = fixture.runtime.define_class(
        &ClassLayout::instance(24)
            .with_references(&[NEXT])
            .with_statics(1),
    )?;
    let node = fixture.node_class();

    holder.set_static(0, Some(fixture.node(node, 1)))?;
    let image = fixture.runtime.new_image_object(holder, 0)?;
    image.set_ref(NEXT, Some(fixture.node(node, 2)))?;
    let greeting = fixture.runtime.intern_string("hello")?;

    fixture.collect();
    fixture.collect();

    let from_static = holder.get_static(0)?.expect("static kept");
    assert_in_active_space(&fixture.runtime, from_static, "static");
    assert_eq!(from_static.get_word(PAYLOAD)?, 1);
    let from_image = image.get_ref(NEXT)?.expect("image field kept");
    assert_in_active_space(&fixture.runtime, from_image, "image field");
    assert_eq!(from_image.get_word(PAYLOAD)?, 2);

    assert_eq!(fixture.runtime.intern_string("hello")?, greeting);
    assert_eq!(greeting.primitive_bytes()?, b"hello");
    Ok(())
}

#[test]
fn test_managed_thread_object_updated() -> anyhow::Result<()> {
    let fixture = RuntimeFixture::with_defaults();
    let thread = fixture.attach("main");
    let node = fixture.node_class();

    let object = fixture.node(node, 99);
    thread.set_managed_object(Some(object));
    fixture.collect();

    let moved = thread.managed_object().expect("thread object kept");
    assert_ne!(moved, object);
    assert_eq!(moved.get_word(PAYLOAD)?, 99);
    Ok(())
}
