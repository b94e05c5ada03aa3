//! Arena resource allocator, based on Bonwick and Adams's "Magazines and
//! Vmem: Extending the Slab Allocator to Many CPUs and Arbitrary Resources".
//!
//! An [`Arena`] manages an integer resource namespace in units of its
//! `quantum`, tracking every segment with a boundary tag. Tags for all
//! segments live on one address-ordered tree; free segments also sit on
//! power-of-two free lists and allocated segments on a fixed-width hash of
//! their start address. Arenas can be layered: a child arena imports spans
//! from its source on demand and returns a span once every allocation
//! inside it has been freed.
//!
//! There are two well-known arenas. The **base** arena is entirely
//! self-sufficient: the pages holding its own boundary tags are carved out
//! of the resource it manages, which therefore must be directly addressable
//! memory. The **kpages** arena imports from base and is what most callers
//! (including the slab layer) should allocate pages from.
//!
//! Allocation styles and memory disciplines are or'd together in
//! [`MemFlags`]; the style bits and memory bits occupy disjoint ranges,
//! checked at compile time.

#![no_std]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
#[macro_use] extern crate intrusive_collections;
extern crate kernel_config;
extern crate spin;

#[cfg(test)]
mod test;

mod btag;

use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicU8, Ordering};
use intrusive_collections::{Bound, LinkedList, LinkedListLink, RBTree, SinglyLinkedList, UnsafeRef};
use kernel_config::memory::{BYTES_PER_ADDR, PAGE_SIZE};
use spin::{Mutex, MutexGuard, Once};

use crate::btag::{span_polarity, AllSegsAdapter, BtStatus, Btag, HashAdapter, MiscAdapter, BTS_PER_PAGE};

/// One free list per power of two expressible in an address.
pub const ARENA_NR_FREE_LISTS: usize = BYTES_PER_ADDR * 8;
/// A reasonable prime for the fixed-width hash of allocated tags.
pub const ARENA_NR_HASH_LISTS: usize = 193;

const MEM_FLAGS_MASK: u32 = 0x00ff;
const ARENA_STYLE_MASK: u32 = 0x0f00;

bitflags! {
    /// Allocation flags: one allocation style or'd with a memory discipline.
    pub struct MemFlags: u32 {
        /// Must not block or reclaim; failure returns an error.
        const ATOMIC = 0x0001;
        /// Willing to wait for memory (the default discipline).
        const WAIT = 0x0002;
        /// Return an error instead of panicking on out-of-memory.
        const ERROR = 0x0004;
        /// Smallest free segment that satisfies the request.
        const BESTFIT = 0x0100;
        /// First segment guaranteed big enough (the default style).
        const INSTANTFIT = 0x0200;
        /// Rotor search starting past the previous allocation.
        const NEXTFIT = 0x0400;
        /// All style bits.
        const ALLOC_STYLES = Self::BESTFIT.bits | Self::INSTANTFIT.bits | Self::NEXTFIT.bits;
    }
}

// Style bits and memory-discipline bits must never collide.
const_assert_eq!(ARENA_STYLE_MASK & MEM_FLAGS_MASK, 0);
const_assert_eq!(
    MemFlags::all().bits() & !(ARENA_STYLE_MASK | MEM_FLAGS_MASK),
    0
);

impl MemFlags {
    /// Just the memory-discipline bits, with any style bits dropped.
    pub fn mem_flags(self) -> MemFlags {
        MemFlags::from_bits_truncate(self.bits() & MEM_FLAGS_MASK)
    }
}

/// What a non-atomic allocation does when the arena and its source are
/// exhausted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OomPolicy {
    /// Panic (the kernel default).
    Panic,
    /// Return an error to the caller.
    Error,
}

/// Allocation hook used to import a span from a source arena.
pub type ImportFn = fn(&'static Arena, usize, MemFlags) -> Result<usize, &'static str>;
/// Release hook used to return a span to a source arena.
pub type ReleaseFn = fn(&'static Arena, usize, usize);

/// A source arena plus the hooks used to import and return spans.
#[derive(Clone, Copy)]
pub struct ArenaSource {
    pub arena: &'static Arena,
    pub import: ImportFn,
    pub release: ReleaseFn,
}

/// `ImportFn` that allocates straight from the source arena.
pub fn import_alloc(source: &'static Arena, size: usize, flags: MemFlags) -> Result<usize, &'static str> {
    source.alloc(size, flags)
}

/// `ReleaseFn` that frees straight back to the source arena.
pub fn import_free(source: &'static Arena, base: usize, size: usize) {
    source.free(base, size);
}

/// A manager of one integer resource namespace.
///
/// All bookkeeping lives behind a spinlock, which is dropped in exactly two
/// situations: while a non-base arena asks the base arena for a page of
/// boundary tags, and while a fully free span is handed back to the source.
pub struct Arena {
    name: &'static str,
    quantum: usize,
    qcache_max: usize,
    import_scale: AtomicU8,
    is_base: bool,
    oom_policy: AtomicU8,
    source: Option<ArenaSource>,
    /// Page holding this arena's header, returned to the base at destroy
    /// time for arenas made by [`arena_create`].
    header_page: Option<usize>,
    registry_link: LinkedListLink,
    inner: Mutex<ArenaInner>,
}

// All mutable state is inside `inner` or atomic; `registry_link` is only
// touched under the global registry lock.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

struct ArenaInner {
    all_segs: RBTree<AllSegsAdapter>,
    free_segs: [LinkedList<MiscAdapter>; ARENA_NR_FREE_LISTS],
    alloc_hash: [SinglyLinkedList<HashAdapter>; ARENA_NR_HASH_LISTS],
    unused_btags: LinkedList<MiscAdapter>,
    /// Resource under management; does not count what a qcache would hold.
    amt_total_segs: usize,
    amt_alloc_segs: usize,
    nr_allocs: usize,
    last_nextfit_alloc: usize,
}

// The builder lays an arena header plus two seed tags into one page.
const_assert!(size_of::<Arena>() + 2 * size_of::<Btag>() <= PAGE_SIZE);

type Guard<'a> = MutexGuard<'a, ArenaInner>;

fn log2_down(v: usize) -> usize {
    usize::BITS as usize - 1 - v.leading_zeros() as usize
}

fn log2_up(v: usize) -> usize {
    if v.is_power_of_two() {
        log2_down(v)
    } else {
        log2_down(v) + 1
    }
}

fn checked_round_up(v: usize, mult: usize) -> Option<usize> {
    v.checked_add(mult - 1).map(|sum| sum / mult * mult)
}

/// Rounds `v` up to a multiple of `mult`, panicking on overflow.
fn round_up(v: usize, mult: usize) -> usize {
    match checked_round_up(v, mult) {
        Some(rounded) => rounded,
        None => panic!("overflow rounding {:#x} up to a multiple of {:#x}", v, mult),
    }
}

/// Multiplicative hash of a segment start into the alloc-hash space.
fn hash_addr(addr: usize) -> usize {
    ((addr as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) % ARENA_NR_HASH_LISTS as u64) as usize
}

/// Lowest address within the free segment `[bt_start, bt_start + bt_size)`
/// satisfying size/align/phase/nocross, if any.
///
/// Round the segment start up to the alignment, add the phase, and check
/// the result still fits. A `nocross` boundary complicates things: if
/// rounding the candidate up to the boundary clears the candidate's end, no
/// boundary is crossed; otherwise retry once from the next boundary inside
/// the segment.
fn find_sufficient(
    bt_start: usize,
    bt_size: usize,
    size: usize,
    align: usize,
    phase: usize,
    nocross: usize,
) -> Option<usize> {
    let try_addr = checked_round_up(bt_start, align)?.checked_add(phase)?;
    let try_end = try_addr.checked_add(size)?;
    if try_end > bt_start + bt_size {
        return None;
    }
    if nocross == 0 {
        return Some(try_addr);
    }
    match checked_round_up(try_addr, nocross) {
        Some(boundary) if boundary >= try_end => return Some(try_addr),
        // No boundary above the candidate at all.
        None => return Some(try_addr),
        Some(_) => {}
    }
    // The segment may still have room past its next boundary.
    let bounded = checked_round_up(bt_start, nocross)?;
    let bounded_size = bt_size.checked_sub(bounded.checked_sub(bt_start)?)?;
    find_sufficient(bounded, bounded_size, size, align, phase, 0)
}

impl ArenaInner {
    fn new() -> ArenaInner {
        ArenaInner {
            all_segs: RBTree::new(AllSegsAdapter::new()),
            free_segs: core::array::from_fn(|_| LinkedList::new(MiscAdapter::new())),
            alloc_hash: core::array::from_fn(|_| SinglyLinkedList::new(HashAdapter::new())),
            unused_btags: LinkedList::new(MiscAdapter::new()),
            amt_total_segs: 0,
            amt_alloc_segs: 0,
            nr_allocs: 0,
            last_nextfit_alloc: 0,
        }
    }

    fn insert_btag(&mut self, bt: UnsafeRef<Btag>) {
        debug_assert!(
            self.all_segs
                .find(&(bt.start.get(), span_polarity(bt.status.get())))
                .is_null(),
            "segment tag {:#x} already in the tree",
            bt.start.get()
        );
        self.all_segs.insert(bt);
    }

    /// Tracks `bt` as allocated, assuming it is already off any free list.
    fn track_alloc_seg(&mut self, bt: UnsafeRef<Btag>) {
        bt.status.set(BtStatus::Alloc);
        self.alloc_hash[hash_addr(bt.start.get())].push_front(bt);
    }

    /// Removes and returns the ALLOC tag with the given start, if any.
    fn untrack_alloc_seg(&mut self, start: usize) -> Option<UnsafeRef<Btag>> {
        let chain = &mut self.alloc_hash[hash_addr(start)];
        let mut cursor = chain.cursor_mut();
        loop {
            let found = match cursor.peek_next().get() {
                Some(bt_i) => bt_i.start.get() == start,
                None => return None,
            };
            if found {
                let bt = cursor
                    .remove_next()
                    .expect("alloc hash chain changed underfoot");
                debug_assert_eq!(bt.status.get(), BtStatus::Alloc);
                return Some(bt);
            }
            cursor.move_next();
        }
    }

    /// Puts `bt` on the free list for its size class.
    fn track_free_seg(&mut self, bt: UnsafeRef<Btag>) {
        bt.status.set(BtStatus::Free);
        self.free_segs[log2_down(bt.size.get())].push_front(bt);
    }

    /// Takes `bt` off the free list for its size class.
    fn untrack_free_seg(&mut self, bt: &Btag) {
        let list = &mut self.free_segs[log2_down(bt.size.get())];
        let mut cursor = unsafe { list.cursor_mut_from_ptr(bt as *const Btag) };
        cursor.remove();
    }

    fn get_btag(&mut self) -> UnsafeRef<Btag> {
        // All paths pre-fill the unused list; see Arena::get_enough_btags.
        self.unused_btags
            .pop_front()
            .expect("arena ran out of boundary tags")
    }

    fn free_btag(&mut self, bt: UnsafeRef<Btag>) {
        self.unused_btags.push_front(bt);
    }

    /// Typically this is just checking for one or two tags on the list.
    fn has_enough_btags(&self, nr_needed: usize) -> bool {
        self.unused_btags.iter().take(nr_needed).count() == nr_needed
    }

    /// Tracks `size` units at the front of the FREE tag `bt` (already off
    /// any free list) as allocated, splitting the remainder into a new FREE
    /// tag. When `new` is supplied it is used for the remainder; the base
    /// arena's tag growth passes the first tag of a freshly carved page.
    /// Returns true when `new` was consumed.
    fn account_alloc(&mut self, bt: UnsafeRef<Btag>, size: usize, new: Option<UnsafeRef<Btag>>) -> bool {
        debug_assert_eq!(bt.status.get(), BtStatus::Free);
        let mut used_new = false;
        if bt.size.get() != size {
            debug_assert!(bt.size.get() > size);
            let rem = match new {
                Some(tag) => {
                    used_new = true;
                    tag
                }
                None => self.get_btag(),
            };
            rem.start.set(bt.start.get() + size);
            rem.size.set(bt.size.get() - size);
            bt.size.set(size);
            self.track_free_seg(rem.clone());
            self.insert_btag(rem);
        }
        self.track_alloc_seg(bt);
        self.amt_alloc_segs += size;
        self.nr_allocs += 1;
        used_new
    }

    /// First tag from the smallest populated free list at or above
    /// `list_idx`, removed from that list.
    fn get_from_freelists(&mut self, list_idx: usize) -> Option<UnsafeRef<Btag>> {
        for i in list_idx..ARENA_NR_FREE_LISTS {
            if let Some(bt) = self.free_segs[i].pop_front() {
                return Some(bt);
            }
        }
        None
    }

    /// Best fit: scan the request's own size-class list for the tightest
    /// candidate; any segment from a larger list also suffices.
    fn alloc_bestfit(&mut self, size: usize) -> Option<usize> {
        let list_idx = log2_down(size);
        let best = {
            let mut best: Option<UnsafeRef<Btag>> = None;
            let mut cursor = self.free_segs[list_idx].front();
            while let Some(bt_i) = cursor.get() {
                if bt_i.size.get() >= size
                    && best.as_ref().map_or(true, |b| b.size.get() > bt_i.size.get())
                {
                    best = cursor.clone_pointer();
                }
                cursor.move_next();
            }
            best
        };
        let best = match best {
            Some(bt) => {
                self.untrack_free_seg(&bt);
                bt
            }
            None => self.get_from_freelists(list_idx + 1)?,
        };
        let start = best.start.get();
        self.account_alloc(best, size, None);
        Some(start)
    }

    /// Instant fit: rounding the list index up guarantees the first
    /// candidate is big enough, with no scanning.
    fn alloc_instantfit(&mut self, size: usize) -> Option<usize> {
        let bt = self.get_from_freelists(log2_up(size))?;
        let start = bt.start.get();
        self.account_alloc(bt, size, None);
        Some(start)
    }

    fn alloc_nextfit(&mut self, quantum: usize, size: usize) -> Option<usize> {
        self.xalloc_nextfit(quantum, size, quantum, 0, 0)
    }

    /// Splits the front off `bt` (not currently on a free list) at `at`,
    /// tracking the front part as a new FREE segment. Raising `bt`'s start
    /// cannot disturb its tree position: no tag can exist between the old
    /// and new starts, and that gap is exactly where the front tag lands.
    fn split_bt_at(&mut self, bt: &UnsafeRef<Btag>, at: usize) {
        let front = self.get_btag();
        front.status.set(BtStatus::Free);
        front.start.set(bt.start.get());
        front.size.set(at - bt.start.get());
        bt.start.set(at);
        bt.size.set(bt.size.get() - front.size.get());
        self.track_free_seg(front.clone());
        self.insert_btag(front);
    }

    /// Walks the segment tree from the first tag at or above `min_addr`,
    /// testing each FREE segment against the constraints. A `max_addr` of 0
    /// means unbounded above.
    fn xalloc_min_max(
        &mut self,
        size: usize,
        align: usize,
        phase: usize,
        nocross: usize,
        min_addr: usize,
        max_addr: usize,
    ) -> Option<usize> {
        let mut found: Option<(UnsafeRef<Btag>, usize)> = None;
        {
            let mut cursor = self.all_segs.lower_bound(Bound::Included(&(min_addr, 0u8)));
            while let Some(bt) = cursor.get() {
                if bt.status.get() == BtStatus::Free {
                    if let Some(try_addr) =
                        find_sufficient(bt.start.get(), bt.size.get(), size, align, phase, nocross)
                    {
                        if max_addr != 0 && try_addr + size > max_addr {
                            return None;
                        }
                        found = Some((
                            cursor.clone_pointer().expect("cursor lost its element"),
                            try_addr,
                        ));
                        break;
                    }
                }
                cursor.move_next();
            }
        }
        let (bt, try_addr) = found?;
        self.untrack_free_seg(&bt);
        if try_addr != bt.start.get() {
            self.split_bt_at(&bt, try_addr);
        }
        self.account_alloc(bt, size, None);
        Some(try_addr)
    }

    /// Constrained search over the free-list buckets. There is no true
    /// instant fit under these constraints; starting one order up is the
    /// next best thing.
    fn xalloc_from_freelists(
        &mut self,
        size: usize,
        align: usize,
        phase: usize,
        nocross: usize,
        try_instant_fit: bool,
    ) -> Option<usize> {
        let min_span = checked_round_up(size, align)?.checked_add(phase)?;
        let mut list_idx = log2_down(min_span);
        if try_instant_fit {
            list_idx += 1;
        }
        let mut found: Option<(UnsafeRef<Btag>, usize)> = None;
        'outer: for i in list_idx..ARENA_NR_FREE_LISTS {
            let mut cursor = self.free_segs[i].front();
            while let Some(bt_i) = cursor.get() {
                if let Some(try_addr) =
                    find_sufficient(bt_i.start.get(), bt_i.size.get(), size, align, phase, nocross)
                {
                    found = Some((
                        cursor.clone_pointer().expect("cursor lost its element"),
                        try_addr,
                    ));
                    break 'outer;
                }
                cursor.move_next();
            }
        }
        let (bt, try_addr) = found?;
        self.untrack_free_seg(&bt);
        if try_addr != bt.start.get() {
            self.split_bt_at(&bt, try_addr);
        }
        self.account_alloc(bt, size, None);
        Some(try_addr)
    }

    /// Rotor allocation: search past the previous next-fit address first,
    /// wrapping around to the lowest segment on failure.
    fn xalloc_nextfit(
        &mut self,
        quantum: usize,
        size: usize,
        align: usize,
        phase: usize,
        nocross: usize,
    ) -> Option<usize> {
        let first = match self.last_nextfit_alloc.checked_add(quantum) {
            Some(min_addr) => self.xalloc_min_max(size, align, phase, nocross, min_addr, 0),
            None => None,
        };
        let ret = match first {
            Some(addr) => addr,
            None => self.xalloc_min_max(size, align, phase, nocross, 0, 0)?,
        };
        self.last_nextfit_alloc = ret;
        Some(ret)
    }

    /// Neighbor of `bt` in the segment tree.
    fn tree_neighbor(&self, bt: &Btag, prev: bool) -> Option<UnsafeRef<Btag>> {
        let cursor = unsafe { self.all_segs.cursor_from_ptr(bt as *const Btag) };
        let neighbor = if prev { cursor.peek_prev() } else { cursor.peek_next() };
        neighbor.clone_pointer()
    }

    /// Merges `right` into `left` when both are FREE and adjacent; the
    /// status checks also guarantee SPAN tags never merge. The right tag is
    /// erased from the tree and recycled.
    fn merge_right_to_left(&mut self, left: UnsafeRef<Btag>, right: UnsafeRef<Btag>) -> bool {
        if left.status.get() != BtStatus::Free || right.status.get() != BtStatus::Free {
            return false;
        }
        if left.start.get() + left.size.get() != right.start.get() {
            return false;
        }
        self.untrack_free_seg(&left);
        self.untrack_free_seg(&right);
        left.size.set(left.size.get() + right.size.get());
        self.track_free_seg(left);
        let mut cursor = unsafe { self.all_segs.cursor_mut_from_ptr(&*right as *const Btag) };
        let removed = cursor
            .remove()
            .expect("right neighbor vanished from the segment tree");
        self.free_btag(removed);
        true
    }

    /// Merges `bt` with its FREE neighbors. If the result exactly covers
    /// the SPAN tag preceding it, both tags are retired and the span's
    /// extent is returned for the caller to hand back to the source once
    /// the lock is dropped.
    fn coalesce_free_seg(&mut self, bt: UnsafeRef<Btag>) -> Option<(usize, usize)> {
        if let Some(next) = self.tree_neighbor(&bt, false) {
            self.merge_right_to_left(bt.clone(), next);
        }
        let mut bt = bt;
        if let Some(prev) = self.tree_neighbor(&bt, true) {
            if self.merge_right_to_left(prev.clone(), bt.clone()) {
                bt = prev;
            }
        }
        if let Some(prev) = self.tree_neighbor(&bt, true) {
            if prev.status.get() == BtStatus::Span
                && prev.start.get() == bt.start.get()
                && prev.size.get() == bt.size.get()
            {
                let extent = (prev.start.get(), prev.size.get());
                // The span itself was never on a free list.
                self.untrack_free_seg(&bt);
                let mut cursor =
                    unsafe { self.all_segs.cursor_mut_from_ptr(&*prev as *const Btag) };
                let span = cursor.remove().expect("span tag vanished from the segment tree");
                self.free_btag(span);
                let mut cursor = unsafe { self.all_segs.cursor_mut_from_ptr(&*bt as *const Btag) };
                let seg = cursor.remove().expect("segment tag vanished from the segment tree");
                self.free_btag(seg);
                return Some(extent);
            }
        }
        None
    }

    /// Adds `[base, base + size)`, with a covering SPAN tag when the
    /// segment was imported from a source.
    fn add_span(&mut self, base: usize, size: usize, is_import: bool) {
        let bt = self.get_btag();
        if is_import {
            let span_bt = self.get_btag();
            span_bt.start.set(base);
            span_bt.size.set(size);
            span_bt.status.set(BtStatus::Span);
            // Span tags live on the tree only.
            self.insert_btag(span_bt);
        }
        bt.start.set(base);
        bt.size.set(size);
        self.amt_total_segs += size;
        self.track_free_seg(bt.clone());
        self.insert_btag(bt);
    }

    /// Checks every bookkeeping invariant. Call under the arena lock.
    fn assert_consistency(&self) {
        for (i, list) in self.free_segs.iter().enumerate() {
            for bt_i in list.iter() {
                assert_eq!(bt_i.status.get(), BtStatus::Free);
                assert!(bt_i.size.get() >= 1 << i);
                assert!(i == ARENA_NR_FREE_LISTS - 1 || bt_i.size.get() < 1 << (i + 1));
            }
        }
        for chain in self.alloc_hash.iter() {
            for bt_i in chain.iter() {
                assert_eq!(bt_i.status.get(), BtStatus::Alloc);
            }
        }
        let mut amt_free = 0;
        let mut amt_alloc = 0;
        let mut nr_allocs = 0;
        let mut prev: Option<(BtStatus, usize, usize)> = None;
        for bt_i in self.all_segs.iter() {
            let key = (bt_i.start.get(), span_polarity(bt_i.status.get()));
            if let Some((pstatus, pstart, pend)) = prev {
                assert!(
                    (pstart, span_polarity(pstatus)) < key,
                    "segment tree out of order at {:#x}",
                    bt_i.start.get()
                );
                if pstatus == BtStatus::Free && bt_i.status.get() == BtStatus::Free {
                    assert_ne!(pend, bt_i.start.get(), "two adjacent FREE tags");
                }
            }
            prev = Some((bt_i.status.get(), bt_i.start.get(), bt_i.end()));
            match bt_i.status.get() {
                BtStatus::Free => amt_free += bt_i.size.get(),
                BtStatus::Alloc => {
                    amt_alloc += bt_i.size.get();
                    nr_allocs += 1;
                }
                BtStatus::Span => {}
            }
        }
        assert_eq!(self.amt_total_segs, amt_free + amt_alloc);
        assert_eq!(self.amt_alloc_segs, amt_alloc);
        assert_eq!(self.nr_allocs, nr_allocs);
    }
}

impl Arena {
    fn new_unregistered(
        name: &'static str,
        quantum: usize,
        source: Option<ArenaSource>,
        qcache_max: usize,
        is_base: bool,
        header_page: Option<usize>,
    ) -> Arena {
        assert!(quantum > 0, "arena {} needs a non-zero quantum", name);
        Arena {
            name,
            quantum,
            qcache_max,
            import_scale: AtomicU8::new(0),
            is_base,
            oom_policy: AtomicU8::new(OomPolicy::Panic as u8),
            source,
            header_page,
            registry_link: LinkedListLink::new(),
            inner: Mutex::new(ArenaInner::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    /// Resource under management that is not currently allocated.
    pub fn amt_free(&self) -> usize {
        let inner = self.inner.lock();
        inner.amt_total_segs - inner.amt_alloc_segs
    }

    /// All resource under management, allocated or not.
    pub fn amt_total(&self) -> usize {
        self.inner.lock().amt_total_segs
    }

    pub fn nr_allocs(&self) -> usize {
        self.inner.lock().nr_allocs
    }

    /// Import requests are inflated to `size << scale`, so a child arena
    /// amortizes trips to its source instead of holding one span per
    /// allocation.
    pub fn set_import_scale(&self, scale: u8) {
        self.import_scale.store(scale, Ordering::Relaxed);
    }

    /// Chooses between panicking and returning an error when a non-atomic
    /// allocation finds the arena and its source exhausted.
    pub fn set_oom_policy(&self, policy: OomPolicy) {
        self.oom_policy.store(policy as u8, Ordering::Relaxed);
    }

    fn oom_policy(&self) -> OomPolicy {
        if self.oom_policy.load(Ordering::Relaxed) == OomPolicy::Error as u8 {
            OomPolicy::Error
        } else {
            OomPolicy::Panic
        }
    }

    /// Out-of-memory escape hatch: panics unless the call's flags or the
    /// arena's policy select the error path.
    fn oom(&self, flags: MemFlags, msg: &'static str) -> &'static str {
        if flags.contains(MemFlags::ERROR) || self.oom_policy() == OomPolicy::Error {
            error!("arena {}: {}", self.name, msg);
            return msg;
        }
        panic!("arena {}: {}", self.name, msg);
    }

    fn assert_quantum_alignment(&self, base: usize, size: usize) {
        if base % self.quantum != 0 {
            panic!(
                "unaligned base {:#x} for arena {}, quantum {:#x}",
                base, self.name, self.quantum
            );
        }
        if size % self.quantum != 0 {
            panic!(
                "unaligned size {:#x} for arena {}, quantum {:#x}",
                size, self.name, self.quantum
            );
        }
    }

    /// Ensures at least `nr_needed` tags sit on the unused list, growing
    /// the store by one page of tags if necessary. May drop and retake the
    /// arena lock; fails only when `ATOMIC` is set and no page could be
    /// obtained.
    ///
    /// This dance exists so that no arena operation past this point can
    /// fail for lack of a tag: `get_btag` never fails, which keeps the
    /// split and coalesce paths straight-line.
    fn get_enough_btags<'a>(
        &'a self,
        guard: Guard<'a>,
        nr_needed: usize,
        flags: MemFlags,
    ) -> Result<Guard<'a>, &'static str> {
        debug_assert!(nr_needed < BTS_PER_PAGE);
        if guard.has_enough_btags(nr_needed) {
            return Ok(guard);
        }
        let guard = self.add_more_btags(guard, flags)?;
        // The new tags were threaded on under the lock we now hold, so no
        // one has been able to drain them.
        debug_assert!(guard.has_enough_btags(nr_needed));
        Ok(guard)
    }

    /// Adds one page worth of tags to the unused list. The base arena
    /// carves the page from its own free lists under its already-held lock;
    /// everyone else drops the lock and pulls a page from the base arena.
    ///
    /// Tags are only freed when the arena is destroyed; the first tag of
    /// each page sits at the page start, which is how destruction finds the
    /// pages to return.
    fn add_more_btags<'a>(&'a self, mut guard: Guard<'a>, flags: MemFlags) -> Result<Guard<'a>, &'static str> {
        let mem_flags = flags.mem_flags();
        let page;
        let mut skip_first = false;
        if self.is_base {
            let bt = match guard.get_from_freelists(log2_up(PAGE_SIZE)) {
                Some(bt) => bt,
                None => {
                    if mem_flags.contains(MemFlags::ATOMIC) {
                        return Err("out of memory for boundary tags");
                    }
                    return Err(self.oom(mem_flags, "base arena failed to grow its boundary tags"));
                }
            };
            page = bt.start.get();
            let tags = page as *mut Btag;
            unsafe {
                for i in 0..BTS_PER_PAGE {
                    ptr::write(tags.add(i), Btag::new());
                }
            }
            // Accounting the carved page often needs a tag for the
            // remainder; with none spare, the first tag of the fresh page
            // serves.
            let first = unsafe { UnsafeRef::from_raw(tags) };
            skip_first = guard.account_alloc(bt, PAGE_SIZE, Some(first));
        } else {
            // Drop the lock around the possibly blocking call into the base
            // arena; callers re-check tag availability afterwards.
            drop(guard);
            let base = find_my_base(self);
            page = base.alloc(PAGE_SIZE, mem_flags | MemFlags::INSTANTFIT)?;
            guard = self.inner.lock();
            let tags = page as *mut Btag;
            unsafe {
                for i in 0..BTS_PER_PAGE {
                    ptr::write(tags.add(i), Btag::new());
                }
            }
        }
        trace!("arena {}: grew boundary tags from page {:#x}", self.name, page);
        let tags = page as *mut Btag;
        let start_idx = if skip_first { 1 } else { 0 };
        for i in start_idx..BTS_PER_PAGE {
            guard.free_btag(unsafe { UnsafeRef::from_raw(tags.add(i)) });
        }
        Ok(guard)
    }

    /// One locked attempt against the free lists. `Ok(None)` means no
    /// segment fit and the caller should try importing.
    fn alloc_from_arena(&self, size: usize, flags: MemFlags) -> Result<Option<usize>, &'static str> {
        let guard = self.inner.lock();
        let mut guard = self.get_enough_btags(guard, 1, flags)?;
        let ret = if flags.contains(MemFlags::BESTFIT) {
            guard.alloc_bestfit(size)
        } else if flags.contains(MemFlags::NEXTFIT) {
            guard.alloc_nextfit(self.quantum, size)
        } else {
            guard.alloc_instantfit(size)
        };
        Ok(ret)
    }

    fn add_span_locked(&self, base: usize, size: usize, flags: MemFlags) -> Result<(), &'static str> {
        self.assert_quantum_alignment(base, size);
        assert!(
            size > 0 && base.checked_add(size).is_some(),
            "bad span {:#x} + {:#x} for arena {}",
            base,
            size,
            self.name
        );
        let guard = self.inner.lock();
        // Two tags: the segment, and possibly its span umbrella.
        let mut guard = self.get_enough_btags(guard, 2, flags)?;
        guard.add_span(base, size, self.source.is_some());
        Ok(())
    }

    /// Adds the segment `[base, base + size)` to this arena. Only
    /// sourceless arenas may be handed spans manually; mixing imported and
    /// manual spans would confuse coalescing and span return.
    pub fn add(&self, base: usize, size: usize, flags: MemFlags) -> Result<(), &'static str> {
        if self.source.is_some() {
            panic!("arena {}: arenas with sources must not manually add resources", self.name);
        }
        self.add_span_locked(base, size, flags)
    }

    /// Imports a span from the source, or reports OOM for sourceless
    /// arenas. Runs unlocked; a span that cannot be registered (atomic tag
    /// failure) goes straight back to the source.
    fn get_more_resources(&self, size: usize, flags: MemFlags) -> Result<(), &'static str> {
        match self.source {
            Some(src) => {
                let scale = self.import_scale.load(Ordering::Relaxed) as u32;
                let import_size = size
                    .checked_shl(scale)
                    .filter(|scaled| scaled >> scale == size)
                    .unwrap_or(size);
                let span = (src.import)(src.arena, import_size, flags)?;
                trace!(
                    "arena {}: imported span {:#x} + {:#x} from {}",
                    self.name,
                    span,
                    import_size,
                    src.arena.name
                );
                if let Err(e) = self.add_span_locked(span, import_size, flags) {
                    warn!(
                        "arena {}: returning span {:#x} after failed import registration",
                        self.name, span
                    );
                    (src.release)(src.arena, span, import_size);
                    return Err(e);
                }
                Ok(())
            }
            None => {
                if flags.mem_flags().contains(MemFlags::ATOMIC) {
                    return Err("out of memory");
                }
                Err(self.oom(flags, "out of memory"))
            }
        }
    }

    /// Allocates `size` units of resource, rounded up to the quantum.
    ///
    /// The style bits of `flags` choose the fit policy (instant fit when
    /// unspecified); the memory bits choose what happens when the arena and
    /// its source are exhausted.
    pub fn alloc(&self, size: usize, flags: MemFlags) -> Result<usize, &'static str> {
        let size = round_up(size, self.quantum);
        assert!(size != 0, "arena {}: request for zero", self.name);
        loop {
            if let Some(addr) = self.alloc_from_arena(size, flags)? {
                return Ok(addr);
            }
            self.get_more_resources(size, flags)?;
        }
    }

    /// Frees the `size`-unit allocation at `addr`. Panics if `addr` is not
    /// an allocation of this arena or if `size` disagrees with the recorded
    /// segment; the size is part of the contract (it would also route
    /// quantum-cached frees, once that layer exists).
    pub fn free(&self, addr: usize, size: usize) {
        let size = round_up(size, self.quantum);
        self.free_from_arena(addr, size);
    }

    fn free_from_arena(&self, addr: usize, size: usize) {
        let to_release;
        {
            let mut guard = self.inner.lock();
            let bt = match guard.untrack_alloc_seg(addr) {
                Some(bt) => bt,
                None => panic!("free of unallocated addr {:#x} from arena {}", addr, self.name),
            };
            if bt.size.get() != size {
                panic!(
                    "free of {:#x} with wrong size {:#x} (recorded {:#x}) from arena {}",
                    addr,
                    size,
                    bt.size.get(),
                    self.name
                );
            }
            guard.amt_alloc_segs -= size;
            guard.nr_allocs -= 1;
            guard.track_free_seg(bt.clone());
            to_release = guard.coalesce_free_seg(bt);
            if let Some((_, span_size)) = to_release {
                guard.amt_total_segs -= span_size;
            }
        }
        // A whole span goes back to the source outside our lock.
        if let Some((span_base, span_size)) = to_release {
            let src = self.source.expect("span return from a sourceless arena");
            trace!(
                "arena {}: returning span {:#x} + {:#x} to {}",
                self.name,
                span_base,
                span_size,
                src.arena.name
            );
            (src.release)(src.arena, span_base, span_size);
        }
    }

    fn xalloc_from_arena(
        &self,
        size: usize,
        align: usize,
        phase: usize,
        nocross: usize,
        min_addr: usize,
        max_addr: usize,
        flags: MemFlags,
    ) -> Result<Option<usize>, &'static str> {
        let guard = self.inner.lock();
        // A constrained split can break one tag into three.
        let mut guard = self.get_enough_btags(guard, 2, flags)?;
        let ret = if min_addr != 0 || max_addr != 0 {
            guard.xalloc_min_max(size, align, phase, nocross, min_addr, max_addr)
        } else if flags.contains(MemFlags::BESTFIT) {
            guard.xalloc_from_freelists(size, align, phase, nocross, false)
        } else if flags.contains(MemFlags::NEXTFIT) {
            guard.xalloc_nextfit(self.quantum, size, align, phase, nocross)
        } else {
            guard.xalloc_from_freelists(size, align, phase, nocross, true)
        };
        Ok(ret)
    }

    /// Constrained allocation: the returned address `p` satisfies
    /// `p == phase (mod align)`, lies at or above `min_addr` and ends at or
    /// below `max_addr` when those are non-zero, and `[p, p + size)` does
    /// not cross a `nocross` boundary.
    ///
    /// `align` must be a power of two and `nocross` a power of two or zero;
    /// all three of `align`, `phase`, and `nocross` must be multiples of
    /// the quantum.
    ///
    /// Sourced arenas cannot combine importing with `nocross`, `min_addr`,
    /// or `max_addr`: a blind import cannot be steered to satisfy those, and
    /// failed attempts would strand fragmented spans here, so the call
    /// fails instead.
    pub fn xalloc(
        &self,
        size: usize,
        align: usize,
        phase: usize,
        nocross: usize,
        min_addr: usize,
        max_addr: usize,
        mut flags: MemFlags,
    ) -> Result<usize, &'static str> {
        let size = round_up(size, self.quantum);
        assert!(size != 0, "arena {}: request for zero", self.name);
        assert!(
            align.is_power_of_two(),
            "arena {}: non-power-of-two align {:#x}",
            self.name,
            align
        );
        assert!(
            nocross == 0 || nocross.is_power_of_two(),
            "arena {}: non-power-of-two nocross {:#x}",
            self.name,
            nocross
        );
        assert!(
            align % self.quantum == 0,
            "arena {}: non-quantum-aligned align {:#x}",
            self.name,
            align
        );
        assert!(
            nocross % self.quantum == 0,
            "arena {}: non-quantum-aligned nocross {:#x}",
            self.name,
            nocross
        );
        assert!(
            phase % self.quantum == 0,
            "arena {}: non-quantum-aligned phase {:#x}",
            self.name,
            phase
        );
        assert!(
            size.checked_add(align).is_some(),
            "arena {}: size {:#x} + align {:#x} overflow",
            self.name,
            size,
            align
        );
        assert!(
            size.checked_add(phase).is_some(),
            "arena {}: size {:#x} + phase {:#x} overflow",
            self.name,
            size,
            phase
        );
        assert!(
            align.checked_add(phase).is_some(),
            "arena {}: align {:#x} + phase {:#x} overflow",
            self.name,
            align,
            phase
        );
        if self.source.is_some() && (nocross != 0 || min_addr != 0 || max_addr != 0) {
            panic!(
                "arena {}: has a source, cannot xalloc with nocross {:#x}, min {:#x}, or max {:#x}",
                self.name, nocross, min_addr, max_addr
            );
        }
        loop {
            if let Some(addr) =
                self.xalloc_from_arena(size, align, phase, nocross, min_addr, max_addr, flags)?
            {
                return Ok(addr);
            }
            let req_size = size
                .checked_add(align)
                .and_then(|s| s.checked_add(phase))
                .unwrap_or_else(|| {
                    panic!("arena {}: size + align + phase overflow", self.name)
                });
            self.get_more_resources(req_size, flags)?;
            // The source may have handed back a best-fit sized span; a
            // repeat instant-fit pass could miss it.
            flags.remove(MemFlags::ALLOC_STYLES);
            flags.insert(MemFlags::BESTFIT);
        }
    }

    /// Frees a constrained allocation; sizes round exactly as `xalloc`
    /// rounded them.
    pub fn xfree(&self, addr: usize, size: usize) {
        let size = round_up(size, self.quantum);
        self.free_from_arena(addr, size);
    }

    /// Runs the internal invariant checker under the arena lock.
    pub fn assert_consistency(&self) {
        self.inner.lock().assert_consistency();
    }

    /// Dumps this arena's free lists, hash occupancy, and segment map via
    /// the `log` facade, then re-checks every bookkeeping invariant.
    pub fn dump_stats(&self, verbose: bool) {
        debug!("arena: {}", self.name);
        debug!(
            "\tquantum: {:#x}, qcache_max: {:#x}, source: {}",
            self.quantum,
            self.qcache_max,
            self.source.map_or("none", |src| src.arena.name)
        );
        let inner = self.inner.lock();
        for (i, list) in inner.free_segs.iter().enumerate() {
            if list.is_empty() {
                continue;
            }
            debug!("\tfree list [2^{} - 2^{}):", i, i + 1);
            for (j, bt_i) in list.iter().enumerate() {
                debug!("\t\t{}: start {:#x}, size {:#x}", j, bt_i.start.get(), bt_i.size.get());
            }
        }
        let mut empty_hash_chains = 0;
        let mut longest_hash_chain = 0;
        for chain in inner.alloc_hash.iter() {
            let len = chain.iter().count();
            if len == 0 {
                empty_hash_chains += 1;
            }
            longest_hash_chain = longest_hash_chain.max(len);
        }
        let mut nr_imports = 0;
        let mut amt_imported = 0;
        for bt_i in inner.all_segs.iter() {
            match bt_i.status.get() {
                BtStatus::Span => {
                    if verbose {
                        debug!("\tspan: start {:#x} + {:#x}", bt_i.start.get(), bt_i.size.get());
                    }
                    nr_imports += 1;
                    amt_imported += bt_i.size.get();
                }
                BtStatus::Free => {
                    if verbose {
                        debug!("\t\tfree: start {:#x} + {:#x}", bt_i.start.get(), bt_i.size.get());
                    }
                }
                BtStatus::Alloc => {
                    if verbose {
                        debug!("\t\talloc: start {:#x} + {:#x}", bt_i.start.get(), bt_i.size.get());
                    }
                }
            }
        }
        debug!(
            "\tamt total segs: {:#x}, amt alloc segs: {:#x}, nr allocs: {}",
            inner.amt_total_segs, inner.amt_alloc_segs, inner.nr_allocs
        );
        debug!(
            "\tamt imported: {:#x}, nr imports: {}, empty hash chains: {}, longest: {}",
            amt_imported, nr_imports, empty_hash_chains, longest_hash_chain
        );
        inner.assert_consistency();
    }
}

intrusive_collections::intrusive_adapter!(ArenaRegAdapter = UnsafeRef<Arena>: Arena { registry_link: LinkedListLink });

static ALL_ARENAS: Once<Mutex<LinkedList<ArenaRegAdapter>>> = Once::new();

fn all_arenas() -> &'static Mutex<LinkedList<ArenaRegAdapter>> {
    ALL_ARENAS.call_once(|| Mutex::new(LinkedList::new(ArenaRegAdapter::new())))
}

fn register_arena(arena: &'static Arena) {
    all_arenas().lock().push_back(unsafe { UnsafeRef::from_raw(arena) });
}

fn unregister_arena(arena: &'static Arena) {
    let mut list = all_arenas().lock();
    let mut cursor = unsafe { list.cursor_mut_from_ptr(arena as *const Arena) };
    cursor.remove();
}

static BASE_ARENA: Once<&'static Arena> = Once::new();
static KPAGES_ARENA: Once<&'static Arena> = Once::new();

/// The self-sufficient arena backing all boundary-tag and header pages.
pub fn base_arena() -> &'static Arena {
    BASE_ARENA.get().expect("vmem not initialized: no base arena")
}

/// The page-quantum arena most allocations should pull from.
pub fn kpages_arena() -> &'static Arena {
    KPAGES_ARENA.get().expect("vmem not initialized: no kpages arena")
}

/// Some base arena suitable for `arena`'s tag pages. With a single memory
/// domain there is only one candidate.
fn find_my_base(_arena: &Arena) -> &'static Arena {
    base_arena()
}

/// Lays out an arena plus two seed boundary tags in the page at `page_addr`
/// and registers it. Used wherever an arena must exist without any
/// allocator running: the base arena, the kpages arena, and (indirectly)
/// every arena made by [`arena_create`].
unsafe fn build_in_page(
    page_addr: usize,
    name: &'static str,
    quantum: usize,
    source: Option<ArenaSource>,
    qcache_max: usize,
    is_base: bool,
    header_page: Option<usize>,
) -> &'static Arena {
    assert!(page_addr % PAGE_SIZE == 0, "arena {}: builder page {:#x} not page aligned", name, page_addr);
    // Base arenas carve whole pages out of themselves for boundary tags.
    assert!(!is_base || quantum == PAGE_SIZE, "base arena {} needs a page-sized quantum", name);
    let arena_ptr = page_addr as *mut Arena;
    ptr::write(
        arena_ptr,
        Arena::new_unregistered(name, quantum, source, qcache_max, is_base, header_page),
    );
    let arena = &*arena_ptr;
    let tags = (page_addr + size_of::<Arena>()) as *mut Btag;
    {
        let mut inner = arena.inner.lock();
        for i in 0..2 {
            let tag = tags.add(i);
            ptr::write(tag, Btag::new());
            inner.free_btag(UnsafeRef::from_raw(tag));
        }
    }
    register_arena(arena);
    arena
}

/// Builds an arena in the caller-provided page at `page_addr`. An arena
/// built this way with no `source` is a **base** arena: self-sufficient,
/// feeding its own boundary-tag pages from the resource it manages, which
/// therefore must be directly addressable memory.
///
/// # Safety
///
/// `page_addr` must point to a whole page of writable memory that outlives
/// the arena and is used for nothing else.
pub unsafe fn arena_builder(
    page_addr: usize,
    name: &'static str,
    quantum: usize,
    source: Option<ArenaSource>,
    qcache_max: usize,
) -> &'static Arena {
    let is_base = source.is_none();
    build_in_page(page_addr, name, quantum, source, qcache_max, is_base, None)
}

/// Creates an arena. With `init_span`, the arena starts out owning
/// `[base, base + size)`; with `source`, it imports spans on demand. The
/// two are mutually exclusive. The header page comes from the base arena
/// and is returned at destroy time.
pub fn arena_create(
    name: &'static str,
    init_span: Option<(usize, usize)>,
    quantum: usize,
    source: Option<ArenaSource>,
    qcache_max: usize,
    flags: MemFlags,
) -> Result<&'static Arena, &'static str> {
    if init_span.is_some() && source.is_some() {
        panic!("arena {} cannot have both a source and an initial span", name);
    }
    let page = base_arena().alloc(PAGE_SIZE, flags.mem_flags() | MemFlags::INSTANTFIT)?;
    let arena = unsafe { build_in_page(page, name, quantum, source, qcache_max, false, Some(page)) };
    if let Some((base, size)) = init_span {
        if let Err(e) = arena.add(base, size, flags) {
            warn!("failed to add the initial span to arena {}, aborting create", name);
            unsafe { arena_destroy(arena) };
            return Err(e);
        }
    }
    Ok(arena)
}

/// Destroys `arena`, returning its boundary-tag pages (and, for arenas made
/// by [`arena_create`], its header page) to the base arena. The arena must
/// have no outstanding allocations, and a sourced arena must have returned
/// every span.
///
/// Base arenas cannot be destroyed: their header and tag pages live inside
/// the very resource being torn down.
///
/// # Safety
///
/// No reference to `arena` may be used after this call; lifecycle control
/// is the caller's responsibility.
pub unsafe fn arena_destroy(arena: &'static Arena) {
    assert!(!arena.is_base, "cannot destroy base arena {}", arena.name);
    unregister_arena(arena);
    let header_page = arena.header_page;
    {
        let mut inner = arena.inner.lock();
        for chain in inner.alloc_hash.iter() {
            assert!(
                chain.is_empty(),
                "destroying arena {} with outstanding allocations",
                arena.name
            );
        }
        for i in 0..ARENA_NR_FREE_LISTS {
            // A sourced arena with free segments left never returned a span.
            if arena.source.is_some() {
                assert!(
                    inner.free_segs[i].is_empty(),
                    "destroying arena {} with unreturned spans",
                    arena.name
                );
            }
            loop {
                let bt = match inner.free_segs[i].pop_front() {
                    Some(bt) => bt,
                    None => break,
                };
                inner.unused_btags.push_front(bt);
            }
        }
        // Keep only the tags leading a tag page; the rest (including the
        // builder's seed tags) just stay in whatever page holds them.
        let mut cursor = inner.unused_btags.front_mut();
        while let Some(bt) = cursor.get() {
            if (bt as *const Btag as usize) % PAGE_SIZE != 0 {
                cursor.remove();
            } else {
                cursor.move_next();
            }
        }
    }
    // Each remaining tag's own address is the start of a whole page of tags
    // from the base arena; give those pages back, then the header.
    let base = find_my_base(arena);
    loop {
        let page = {
            let mut inner = arena.inner.lock();
            match inner.unused_btags.pop_front() {
                Some(bt) => &*bt as *const Btag as usize,
                None => break,
            }
        };
        base.free(page, PAGE_SIZE);
    }
    if let Some(page) = header_page {
        base.free(page, PAGE_SIZE);
    }
}

/// Bootstraps the arena layer over `[region_base, region_base +
/// region_size)`: the first two pages become the base and kpages arena
/// headers, and the remainder becomes the base arena's initial span.
///
/// # Safety
///
/// The region must be page-aligned, writable, directly addressable memory
/// owned by the caller for the lifetime of the system.
pub unsafe fn init(region_base: usize, region_size: usize) -> Result<(), &'static str> {
    if BASE_ARENA.get().is_some() {
        return Err("vmem was already initialized");
    }
    if region_base % PAGE_SIZE != 0 || region_size % PAGE_SIZE != 0 {
        return Err("vmem init region must be whole pages");
    }
    if region_size < 3 * PAGE_SIZE {
        return Err("vmem init region too small");
    }
    let base = arena_builder(region_base, "base", PAGE_SIZE, None, 0);
    BASE_ARENA.call_once(|| base);
    base.add(region_base + 2 * PAGE_SIZE, region_size - 2 * PAGE_SIZE, MemFlags::WAIT)?;
    let kpages = arena_builder(
        region_base + PAGE_SIZE,
        "kpages",
        PAGE_SIZE,
        Some(ArenaSource {
            arena: base,
            import: import_alloc,
            release: import_free,
        }),
        0,
    );
    KPAGES_ARENA.call_once(|| kpages);
    debug!(
        "vmem: base arena manages {:#x}..{:#x}",
        region_base + 2 * PAGE_SIZE,
        region_base + region_size
    );
    Ok(())
}
