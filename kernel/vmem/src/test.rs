//! Arena tests driven with literal addresses. The shared base arena sits on
//! a leaked, page-aligned host allocation; each test works in its own child
//! arena so accounting assertions stay isolated.

extern crate std;

use self::std::alloc::{alloc as host_alloc, Layout};
use self::std::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use spin::Once;

use super::*;

static TEST_INIT: Once<()> = Once::new();

fn ensure_init() {
    TEST_INIT.call_once(|| {
        let pages = 1024;
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let region = unsafe { host_alloc(layout) };
        assert!(!region.is_null());
        unsafe {
            init(region as usize, pages * PAGE_SIZE).expect("vmem init failed");
        }
    });
}

#[test]
fn simple_bestfit_round_trip() {
    ensure_init();
    let arena = arena_create("bestfit-test", Some((0x1000, 0x10000)), 1, None, 0, MemFlags::WAIT)
        .unwrap();
    let addr = arena.alloc(0x200, MemFlags::BESTFIT).unwrap();
    assert_eq!(addr, 0x1000);
    assert_eq!(arena.amt_total(), 0x10000);
    assert_eq!(arena.amt_total() - arena.amt_free(), 0x200);
    assert_eq!(arena.nr_allocs(), 1);
    arena.assert_consistency();
    arena.free(addr, 0x200);
    assert_eq!(arena.amt_free(), 0x10000);
    assert_eq!(arena.nr_allocs(), 0);
    arena.assert_consistency();
    unsafe { arena_destroy(arena) };
}

#[test]
fn bestfit_prefers_smallest_candidate() {
    ensure_init();
    let arena = arena_create("bestfit-holes", Some((0x0, 0x2000)), 1, None, 0, MemFlags::WAIT)
        .unwrap();
    let a = arena.alloc(0x400, MemFlags::WAIT).unwrap();
    let b = arena.alloc(0x200, MemFlags::WAIT).unwrap();
    let c = arena.alloc(0x600, MemFlags::WAIT).unwrap();
    let d = arena.alloc(0x400, MemFlags::WAIT).unwrap();
    assert_eq!((a, b, c, d), (0x0, 0x400, 0x600, 0xc00));
    // Two holes in the same power-of-two bucket: [0x0, 0x400) and
    // [0x600, 0xc00). Best fit must take the tight one.
    arena.free(a, 0x400);
    arena.free(c, 0x600);
    assert_eq!(arena.alloc(0x400, MemFlags::BESTFIT).unwrap(), 0x0);
    arena.assert_consistency();
    arena.free(0x0, 0x400);
    arena.free(b, 0x200);
    arena.free(d, 0x400);
    assert_eq!(arena.amt_free(), 0x2000);
    arena.assert_consistency();
    unsafe { arena_destroy(arena) };
}

#[test]
fn nextfit_advances_and_wraps() {
    ensure_init();
    let arena = arena_create("nextfit-test", Some((0x0, 0x1000)), 0x100, None, 0, MemFlags::WAIT)
        .unwrap();
    assert_eq!(arena.alloc(0x100, MemFlags::NEXTFIT).unwrap(), 0x0);
    assert_eq!(arena.alloc(0x100, MemFlags::NEXTFIT).unwrap(), 0x100);
    arena.free(0x0, 0x100);
    // The rotor keeps advancing past the hole at 0x0.
    assert_eq!(arena.alloc(0x100, MemFlags::NEXTFIT).unwrap(), 0x200);
    for expected in (0x300..0x1000).step_by(0x100) {
        assert_eq!(arena.alloc(0x100, MemFlags::NEXTFIT).unwrap(), expected);
    }
    // Only once the tail is exhausted does the search wrap and find 0x0.
    assert_eq!(arena.alloc(0x100, MemFlags::NEXTFIT).unwrap(), 0x0);
    arena.assert_consistency();
    for addr in (0x0..0x1000).step_by(0x100) {
        arena.free(addr, 0x100);
    }
    assert_eq!(arena.amt_free(), 0x1000);
    arena.assert_consistency();
    unsafe { arena_destroy(arena) };
}

#[test]
fn xalloc_align_phase() {
    ensure_init();
    let arena = arena_create("xalloc-test", Some((0x1000, 0x4000)), 1, None, 0, MemFlags::WAIT)
        .unwrap();
    let addr = arena.xalloc(0x100, 0x1000, 0x40, 0, 0, 0, MemFlags::WAIT).unwrap();
    assert_eq!(addr, 0x1040);
    assert_eq!(arena.amt_total() - arena.amt_free(), 0x100);
    arena.assert_consistency();
    // The head [0x1000, 0x1040) must have stayed free.
    assert_eq!(arena.xalloc(0x40, 0x40, 0, 0, 0, 0x1040, MemFlags::WAIT).unwrap(), 0x1000);
    arena.xfree(addr, 0x100);
    arena.xfree(0x1000, 0x40);
    assert_eq!(arena.amt_free(), 0x4000);
    arena.assert_consistency();
    unsafe { arena_destroy(arena) };
}

#[test]
fn xalloc_nocross() {
    ensure_init();
    let arena = arena_create("nocross-test", Some((0x0, 0x3000)), 1, None, 0, MemFlags::WAIT)
        .unwrap();
    let addr = arena.xalloc(0x800, 0x100, 0, 0x1000, 0, 0, MemFlags::WAIT).unwrap();
    assert!(addr == 0x0 || addr == 0x1000 || addr == 0x2000, "got {:#x}", addr);
    // Two more fit; each placement must respect the boundary.
    let b = arena.xalloc(0x800, 0x100, 0, 0x1000, 0, 0, MemFlags::WAIT).unwrap();
    let c = arena.xalloc(0x800, 0x100, 0, 0x1000, 0, 0, MemFlags::WAIT).unwrap();
    for &p in &[addr, b, c] {
        assert_eq!(p % 0x100, 0);
        assert_eq!(p / 0x1000, (p + 0x800 - 1) / 0x1000, "{:#x} crosses a boundary", p);
    }
    arena.assert_consistency();
    arena.xfree(addr, 0x800);
    arena.xfree(b, 0x800);
    arena.xfree(c, 0x800);
    assert_eq!(arena.amt_free(), 0x3000);
    unsafe { arena_destroy(arena) };
}

#[test]
fn xalloc_satisfies_constraints() {
    ensure_init();
    let arena = arena_create("xalloc-sweep", Some((0x20000, 0x4000)), 1, None, 0, MemFlags::WAIT)
        .unwrap();
    let combos: [(usize, usize, usize); 4] =
        [(0x20, 0, 0), (0x40, 0x10, 0), (0x100, 0, 0x400), (0x80, 0x20, 0x800)];
    for &(align, phase, nocross) in combos.iter() {
        let addr = arena.xalloc(0x60, align, phase, nocross, 0, 0, MemFlags::WAIT).unwrap();
        assert_eq!(addr % align, phase, "align {:#x} phase {:#x}", align, phase);
        if nocross != 0 {
            assert_eq!(addr / nocross, (addr + 0x60 - 1) / nocross);
        }
        arena.xfree(addr, 0x60);
        arena.assert_consistency();
    }
    assert_eq!(arena.amt_free(), 0x4000);
    unsafe { arena_destroy(arena) };
}

static IMPORTS: AtomicUsize = AtomicUsize::new(0);
static RELEASES: AtomicUsize = AtomicUsize::new(0);
static LAST_RELEASE_SIZE: AtomicUsize = AtomicUsize::new(0);

fn counting_import(source: &'static Arena, size: usize, flags: MemFlags) -> Result<usize, &'static str> {
    IMPORTS.fetch_add(1, AtomicOrdering::SeqCst);
    source.alloc(size, flags)
}

fn counting_release(source: &'static Arena, base: usize, size: usize) {
    RELEASES.fetch_add(1, AtomicOrdering::SeqCst);
    LAST_RELEASE_SIZE.store(size, AtomicOrdering::SeqCst);
    source.free(base, size);
}

#[test]
fn span_import_and_reclaim() {
    ensure_init();
    let source = arena_create(
        "reclaim-source",
        Some((0x100000, 0x10000)),
        0x1000,
        None,
        0,
        MemFlags::WAIT,
    )
    .unwrap();
    let child = arena_create(
        "reclaim-child",
        None,
        0x1000,
        Some(ArenaSource {
            arena: source,
            import: counting_import,
            release: counting_release,
        }),
        0,
        MemFlags::WAIT,
    )
    .unwrap();
    let addr = child.alloc(0x800, MemFlags::WAIT).unwrap();
    assert_eq!(IMPORTS.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(child.amt_total(), 0x1000);
    child.assert_consistency();
    // Freeing the lone allocation empties the imported span, which must go
    // back to the source exactly once, at its full extent.
    child.free(addr, 0x800);
    assert_eq!(RELEASES.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(LAST_RELEASE_SIZE.load(AtomicOrdering::SeqCst), 0x1000);
    assert_eq!(child.amt_total(), 0);
    child.assert_consistency();
    source.assert_consistency();
    assert_eq!(source.amt_free(), 0x10000);
    unsafe {
        arena_destroy(child);
        arena_destroy(source);
    }
}

#[test]
fn import_scale_inflates_span_requests() {
    ensure_init();
    let source = arena_create(
        "scale-source",
        Some((0x300000, 0x10000)),
        0x1000,
        None,
        0,
        MemFlags::WAIT,
    )
    .unwrap();
    let child = arena_create(
        "scale-child",
        None,
        0x1000,
        Some(ArenaSource {
            arena: source,
            import: import_alloc,
            release: import_free,
        }),
        0,
        MemFlags::WAIT,
    )
    .unwrap();
    child.set_import_scale(1);
    let addr = child.alloc(0x1000, MemFlags::WAIT).unwrap();
    // The span brought in twice the request.
    assert_eq!(child.amt_total(), 0x2000);
    assert_eq!(child.amt_free(), 0x1000);
    child.free(addr, 0x1000);
    assert_eq!(child.amt_total(), 0);
    assert_eq!(source.amt_free(), 0x10000);
    unsafe {
        arena_destroy(child);
        arena_destroy(source);
    }
}

#[test]
fn xalloc_imports_with_bestfit_retry() {
    ensure_init();
    let source = arena_create(
        "xalloc-import-source",
        Some((0x200000, 0x10000)),
        0x1000,
        None,
        0,
        MemFlags::WAIT,
    )
    .unwrap();
    let child = arena_create(
        "xalloc-import-child",
        None,
        0x1000,
        Some(ArenaSource {
            arena: source,
            import: import_alloc,
            release: import_free,
        }),
        0,
        MemFlags::WAIT,
    )
    .unwrap();
    let addr = child.xalloc(0x1000, 0x2000, 0, 0, 0, 0, MemFlags::WAIT).unwrap();
    assert_eq!(addr % 0x2000, 0);
    child.assert_consistency();
    child.xfree(addr, 0x1000);
    // The whole imported span drains back to the source.
    assert_eq!(child.amt_total(), 0);
    assert_eq!(source.amt_free(), 0x10000);
    unsafe {
        arena_destroy(child);
        arena_destroy(source);
    }
}

#[test]
fn atomic_alloc_fails_cleanly_when_exhausted() {
    ensure_init();
    let arena = arena_create("atomic-test", Some((0x2000, 0x1000)), 0x100, None, 0, MemFlags::WAIT)
        .unwrap();
    let a = arena.alloc(0x1000, MemFlags::ATOMIC | MemFlags::INSTANTFIT).unwrap();
    assert_eq!(a, 0x2000);
    assert!(arena.alloc(0x100, MemFlags::ATOMIC).is_err());
    arena.free(a, 0x1000);
    arena.assert_consistency();
    unsafe { arena_destroy(arena) };
}

#[test]
fn oom_policy_error_returns_instead_of_panicking() {
    ensure_init();
    let arena = arena_create("oom-error-test", Some((0x4000, 0x1000)), 0x100, None, 0, MemFlags::WAIT)
        .unwrap();
    arena.set_oom_policy(OomPolicy::Error);
    let a = arena.alloc(0x1000, MemFlags::WAIT).unwrap();
    assert!(arena.alloc(0x100, MemFlags::WAIT).is_err());
    arena.free(a, 0x1000);
    unsafe { arena_destroy(arena) };
}

#[test]
fn btag_store_grows_past_the_seeds() {
    ensure_init();
    let arena = arena_create("growth-test", Some((0x40000, 0x4000)), 0x10, None, 0, MemFlags::WAIT)
        .unwrap();
    let mut addrs = Vec::new();
    for _ in 0..256 {
        addrs.push(arena.alloc(0x10, MemFlags::WAIT).unwrap());
    }
    assert_eq!(arena.nr_allocs(), 256);
    arena.assert_consistency();
    for &addr in addrs.iter() {
        arena.free(addr, 0x10);
    }
    assert_eq!(arena.amt_free(), 0x4000);
    assert_eq!(arena.nr_allocs(), 0);
    arena.assert_consistency();
    unsafe { arena_destroy(arena) };
}

#[test]
#[should_panic(expected = "free of unallocated addr")]
fn free_of_unknown_address_panics() {
    ensure_init();
    let arena = arena_create("bad-free-test", Some((0x8000, 0x1000)), 1, None, 0, MemFlags::WAIT)
        .unwrap();
    arena.free(0x8400, 0x100);
}

#[test]
#[should_panic(expected = "wrong size")]
fn free_with_wrong_size_panics() {
    ensure_init();
    let arena = arena_create("bad-size-test", Some((0xa000, 0x1000)), 1, None, 0, MemFlags::WAIT)
        .unwrap();
    let addr = arena.alloc(0x100, MemFlags::WAIT).unwrap();
    arena.free(addr, 0x80);
}
