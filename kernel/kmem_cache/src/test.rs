//! Slab cache tests running the whole stack (base arena, kpages arena,
//! seed caches) over a leaked host allocation.

extern crate std;

use self::std::alloc::{alloc as host_alloc, Layout};
use self::std::collections::HashSet;
use self::std::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Once;

use super::*;

static TEST_INIT: Once<()> = Once::new();

fn ensure_init() {
    TEST_INIT.call_once(|| {
        let pages = 4096;
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let region = unsafe { host_alloc(layout) };
        assert!(!region.is_null());
        unsafe {
            vmem::init(region as usize, pages * PAGE_SIZE).expect("vmem init failed");
        }
        kmem_cache_init();
    });
}

#[test]
fn small_slab_lifecycle() {
    ensure_init();
    let cache = kmem_cache_create("lifecycle-64", 64, 8, 0, None, None).unwrap();
    let per_slab = (PAGE_SIZE - size_of::<KmemSlab>()) / cache.stride();
    let mut objs = Vec::new();
    let mut seen = HashSet::new();
    for _ in 0..per_slab - 1 {
        let obj = cache.alloc(MemFlags::WAIT).unwrap();
        assert!(seen.insert(obj as usize), "object handed out twice");
        objs.push(obj);
    }
    {
        let inner = cache.inner.lock();
        assert_eq!(inner.partial.iter().count(), 1);
        assert!(inner.full.is_empty());
    }
    // The last object moves the slab to the full list.
    objs.push(cache.alloc(MemFlags::WAIT).unwrap());
    {
        let inner = cache.inner.lock();
        assert!(inner.partial.is_empty());
        assert_eq!(inner.full.iter().count(), 1);
    }
    assert_eq!(cache.nr_cur_alloc(), per_slab);
    // Freeing any one object demotes it back to partial.
    unsafe { cache.free(objs.pop().unwrap()) };
    {
        let inner = cache.inner.lock();
        assert_eq!(inner.partial.iter().count(), 1);
        assert!(inner.full.is_empty());
    }
    // Freeing the rest leaves one empty slab.
    for obj in objs.drain(..) {
        unsafe { cache.free(obj) };
    }
    assert_eq!(cache.nr_cur_alloc(), 0);
    {
        let inner = cache.inner.lock();
        assert!(inner.partial.is_empty());
        assert_eq!(inner.empty.iter().count(), 1);
    }
    cache.reap();
    {
        let inner = cache.inner.lock();
        assert!(inner.empty.is_empty());
    }
    // A second reap with no allocations in between has nothing to do.
    cache.reap();
    unsafe { kmem_cache_destroy(cache) };
}

static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

fn pattern_ctor(obj: *mut u8, size: usize) {
    unsafe { core::ptr::write_bytes(obj, 0xAB, size) };
    CTOR_RUNS.fetch_add(1, Ordering::SeqCst);
}

fn counting_dtor(_obj: *mut u8, _size: usize) {
    DTOR_RUNS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn ctor_runs_at_slab_build_and_dtor_at_teardown() {
    ensure_init();
    let cache =
        kmem_cache_create("ctor-32", 32, 8, 0, Some(pattern_ctor), Some(counting_dtor)).unwrap();
    let per_slab = (PAGE_SIZE - size_of::<KmemSlab>()) / cache.stride();
    let obj = cache.alloc(MemFlags::WAIT).unwrap();
    // Construction happened for the whole slab, not just this object.
    assert_eq!(CTOR_RUNS.load(Ordering::SeqCst), per_slab);
    for i in 0..32 {
        assert_eq!(unsafe { *obj.add(i) }, 0xAB);
    }
    unsafe { cache.free(obj) };
    unsafe { kmem_cache_destroy(cache) };
    assert_eq!(DTOR_RUNS.load(Ordering::SeqCst), per_slab);
}

#[test]
fn large_slab_uses_bufctls() {
    ensure_init();
    let cache = kmem_cache_create("large-1k", 1024, 16, 0, None, None).unwrap();
    assert!(cache.is_large());
    let a = cache.alloc(MemFlags::WAIT).unwrap();
    let b = cache.alloc(MemFlags::WAIT).unwrap();
    assert_ne!(a, b);
    assert_eq!(a as usize % 16, 0);
    // The objects are real, writable memory.
    unsafe { core::ptr::write_bytes(a, 0x5A, 1024) };
    unsafe { core::ptr::write_bytes(b, 0xA5, 1024) };
    assert_eq!(unsafe { *a.add(1023) }, 0x5A);
    assert_eq!(cache.nr_cur_alloc(), 2);
    unsafe {
        cache.free(a);
        cache.free(b);
    }
    assert_eq!(cache.nr_cur_alloc(), 0);
    cache.reap();
    unsafe { kmem_cache_destroy(cache) };
}

#[test]
fn large_slab_full_and_refill() {
    ensure_init();
    let cache = kmem_cache_create("large-fill", 2048, 8, 0, None, None).unwrap();
    let per_slab = {
        let order = log2_up((NUM_BUF_PER_SLAB * cache.stride() + PAGE_SIZE - 1) / PAGE_SIZE);
        ((1 << order) * PAGE_SIZE) / cache.stride()
    };
    let mut objs = Vec::new();
    // Two slabs' worth forces a second grow.
    for _ in 0..per_slab + 1 {
        objs.push(cache.alloc(MemFlags::WAIT).unwrap());
    }
    {
        let inner = cache.inner.lock();
        assert_eq!(inner.full.iter().count(), 1);
        assert_eq!(inner.partial.iter().count(), 1);
    }
    for obj in objs.drain(..) {
        unsafe { cache.free(obj) };
    }
    assert_eq!(cache.nr_cur_alloc(), 0);
    cache.reap();
    unsafe { kmem_cache_destroy(cache) };
}

#[test]
fn registry_stays_sorted_by_object_size() {
    ensure_init();
    let small = kmem_cache_create("registry-small", 16, 8, 0, None, None).unwrap();
    let large = kmem_cache_create("registry-large", 3000, 8, 0, None, None).unwrap();
    {
        let list = cache_registry().lock();
        let mut last = 0;
        for cache in list.iter() {
            assert!(
                cache.obj_size() >= last,
                "registry out of order at {}",
                cache.name()
            );
            last = cache.obj_size();
        }
    }
    unsafe {
        kmem_cache_destroy(small);
        kmem_cache_destroy(large);
    }
}

#[test]
#[should_panic(expected = "live objects")]
fn destroy_with_live_objects_panics() {
    ensure_init();
    let cache = kmem_cache_create("leaky", 64, 8, 0, None, None).unwrap();
    let _obj = cache.alloc(MemFlags::WAIT).unwrap();
    unsafe { kmem_cache_destroy(cache) };
}
