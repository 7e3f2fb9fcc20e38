use super::*;

#[test]
fn freeing_a_container_releases_children() {
    let mut heap = Heap::new();
    let a = heap.alloc(Object::Int(1));
    let b = heap.alloc(Object::Int(2));
    let t = heap.alloc(Object::Tuple(vec![a, b]));
    assert_eq!(heap.live_count(), 3);
    heap.decref(t);
    assert_eq!(heap.live_count(), 0);
    assert!(!heap.is_live(a));
}

#[test]
fn immortals_ignore_refcounting() {
    let mut heap = Heap::new();
    let none = heap.alloc_immortal(Object::None);
    heap.decref(none);
    heap.decref(none);
    assert!(heap.is_live(none));
    assert_eq!(heap.refcount(none), 1);
}

#[test]
fn slots_are_reused_after_free() {
    let mut heap = Heap::new();
    let a = heap.alloc(Object::Int(1));
    heap.decref(a);
    let b = heap.alloc(Object::Int(2));
    assert_eq!(a, b);
    assert_eq!(heap.get(b).kind(), ObjKind::Int);
}

#[test]
fn null_is_ignored() {
    let mut heap = Heap::new();
    heap.incref(ObjRef::NULL);
    heap.decref(ObjRef::NULL);
    assert_eq!(heap.live_count(), 0);
}

#[test]
fn kind_bits_are_distinct() {
    let mut seen = 0u32;
    for kind in ObjKind::ALL {
        assert_eq!(seen & kind.bit(), 0);
        seen |= kind.bit();
    }
    assert_eq!(seen, 0xFFFF);
}
