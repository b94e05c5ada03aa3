//! End-to-end bootstrap test: base arena, kpages arena, seed caches, then
//! a dynamic cache and a dynamic arena on top, all over one leaked host
//! allocation.

extern crate std;

use self::std::alloc::{alloc as host_alloc, Layout};
use core::ptr;
use kernel_config::memory::PAGE_SIZE;
use spin::Once;
use vmem::{ArenaSource, MemFlags};

use super::*;

static TEST_INIT: Once<()> = Once::new();

fn ensure_init() {
    TEST_INIT.call_once(|| {
        let pages = 4096;
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let region = unsafe { host_alloc(layout) };
        assert!(!region.is_null());
        unsafe {
            init(region as usize, pages * PAGE_SIZE).expect("bootstrap failed");
        }
    });
}

#[test]
fn full_stack_bootstrap() {
    ensure_init();
    // Pages from kpages are real, writable memory imported from base.
    let page = vmem::kpages_arena().alloc(PAGE_SIZE, MemFlags::WAIT).unwrap();
    unsafe { ptr::write_bytes(page as *mut u8, 0x11, PAGE_SIZE) };
    assert_eq!(unsafe { *((page + PAGE_SIZE - 1) as *const u8) }, 0x11);
    vmem::kpages_arena().free(page, PAGE_SIZE);
    vmem::base_arena().assert_consistency();
    vmem::kpages_arena().assert_consistency();

    // A dynamic cache allocates its header from the cache-of-caches.
    let cache = kmem_cache::kmem_cache_create("boot-objs", 128, 8, 0, None, None).unwrap();
    let obj = cache.alloc(MemFlags::WAIT).unwrap();
    unsafe { ptr::write_bytes(obj, 0x22, 128) };
    unsafe { cache.free(obj) };
    assert_eq!(cache.nr_cur_alloc(), 0);
    unsafe { kmem_cache::kmem_cache_destroy(cache) };

    // A dynamic arena imports pages from kpages and returns them on free.
    let child = vmem::arena_create(
        "boot-child",
        None,
        PAGE_SIZE,
        Some(ArenaSource {
            arena: vmem::kpages_arena(),
            import: vmem::import_alloc,
            release: vmem::import_free,
        }),
        0,
        MemFlags::WAIT,
    )
    .unwrap();
    let p = child.alloc(PAGE_SIZE, MemFlags::WAIT).unwrap();
    unsafe { ptr::write_bytes(p as *mut u8, 0x33, PAGE_SIZE) };
    child.free(p, PAGE_SIZE);
    assert_eq!(child.amt_total(), 0);
    child.assert_consistency();
    unsafe { vmem::arena_destroy(child) };

    vmem::base_arena().assert_consistency();
    vmem::kpages_arena().assert_consistency();
}

#[test]
fn init_twice_is_an_error() {
    ensure_init();
    let err = unsafe { init(0, PAGE_SIZE) };
    assert!(err.is_err());
}
