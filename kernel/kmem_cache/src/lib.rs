//! Slab caches of fixed-size kernel objects, after the SunOS 5.4 slab
//! allocator.
//!
//! A [`KmemCache`] hands out objects of one size, carved from slabs it
//! grows on demand out of the `vmem` kpages arena. Objects at or below
//! [`SLAB_LARGE_CUTOFF`] use the small layout: one page per slab, the slab
//! header at the top of the page, and the free list threaded through the
//! unused trailing word of each free object. Larger objects use the large
//! layout: the header comes from a seed cache, the backing is a
//! power-of-two run of pages, and each object is tracked by a bufctl
//! record.
//!
//! Three seed caches created at [`kmem_cache_init`] time make the layer
//! self-hosting: caches of cache headers, slab headers, and bufctls. All
//! caches sit on a global registry sorted by object size.

#![no_std]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate intrusive_collections;
extern crate kernel_config;
extern crate spin;
extern crate vmem;

#[cfg(test)]
mod test;

mod slab;

use core::mem::{align_of, size_of};
use core::ptr;
use intrusive_collections::{
    intrusive_adapter, LinkedList, SinglyLinkedList, SinglyLinkedListLink, UnsafeRef,
};
use kernel_config::memory::{BYTES_PER_ADDR, PAGE_SIZE};
use spin::{Mutex, Once};
use vmem::{Arena, MemFlags};

use crate::slab::{Bufctl, KmemSlab, SlabAdapter};

/// Objects above this size get large-slab treatment.
pub const SLAB_LARGE_CUTOFF: usize = PAGE_SIZE / 8;
/// Large slabs are sized to hold at least this many objects.
const NUM_BUF_PER_SLAB: usize = 8;

/// Object constructor hook, run once per object when its slab is built.
pub type ObjCtor = fn(*mut u8, usize);
/// Object destructor hook, run once per object when its slab is torn down.
pub type ObjDtor = fn(*mut u8, usize);

fn log2_up(v: usize) -> usize {
    let down = usize::BITS as usize - 1 - v.leading_zeros() as usize;
    if v.is_power_of_two() {
        down
    } else {
        down + 1
    }
}

fn round_up(v: usize, mult: usize) -> usize {
    (v + mult - 1) / mult * mult
}

/// A cache of equally sized objects.
pub struct KmemCache {
    name: &'static str,
    obj_size: usize,
    align: usize,
    /// Reserved behavior flags; none are defined yet.
    flags: u32,
    ctor: Option<ObjCtor>,
    dtor: Option<ObjDtor>,
    /// Arena backing slab pages.
    source: &'static Arena,
    /// Whether the header came from the cache-of-caches (and returns there
    /// at destroy time).
    dynamic: bool,
    registry_link: SinglyLinkedListLink,
    inner: Mutex<KmemCacheInner>,
}

// All mutable state is inside `inner`; `registry_link` is only touched
// under the global registry lock.
unsafe impl Send for KmemCache {}
unsafe impl Sync for KmemCache {}

struct KmemCacheInner {
    full: LinkedList<SlabAdapter>,
    partial: LinkedList<SlabAdapter>,
    empty: LinkedList<SlabAdapter>,
    nr_cur_alloc: usize,
}

// The seed caches must themselves be small-object caches, and a small
// slab's page must fit its header plus at least one object.
const_assert!(size_of::<KmemCache>() <= SLAB_LARGE_CUTOFF);
const_assert!(size_of::<KmemSlab>() <= SLAB_LARGE_CUTOFF);
const_assert!(size_of::<Bufctl>() <= SLAB_LARGE_CUTOFF);

impl KmemCache {
    fn new_unregistered(
        name: &'static str,
        obj_size: usize,
        align: usize,
        flags: u32,
        ctor: Option<ObjCtor>,
        dtor: Option<ObjDtor>,
        source: &'static Arena,
        dynamic: bool,
    ) -> KmemCache {
        assert!(obj_size > 0, "cache {} needs a non-zero object size", name);
        assert!(
            align > 0 && align.is_power_of_two(),
            "cache {}: bad alignment {:#x}",
            name,
            align
        );
        KmemCache {
            name,
            obj_size,
            align,
            flags,
            ctor,
            dtor,
            source,
            dynamic,
            registry_link: SinglyLinkedListLink::new(),
            inner: Mutex::new(KmemCacheInner {
                full: LinkedList::new(SlabAdapter::new()),
                partial: LinkedList::new(SlabAdapter::new()),
                empty: LinkedList::new(SlabAdapter::new()),
                nr_cur_alloc: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    pub fn nr_cur_alloc(&self) -> usize {
        self.inner.lock().nr_cur_alloc
    }

    /// Object stride within a slab: the object plus its trailing tracking
    /// word (free-list link or bufctl back-pointer), rounded to the cache
    /// alignment.
    fn stride(&self) -> usize {
        round_up(self.obj_size + BYTES_PER_ADDR, self.align)
    }

    fn is_large(&self) -> bool {
        self.obj_size > SLAB_LARGE_CUTOFF
    }

    /// Takes one object from the first partial slab, growing the cache by
    /// one slab when none is available.
    pub fn alloc(&self, flags: MemFlags) -> Result<*mut u8, &'static str> {
        let mut inner = self.inner.lock();
        if inner.partial.is_empty() {
            if inner.empty.is_empty() {
                if let Err(e) = self.grow(&mut inner, flags) {
                    drop(inner);
                    if flags.contains(MemFlags::ERROR) || flags.contains(MemFlags::ATOMIC) {
                        return Err(e);
                    }
                    panic!("cache {}: out of memory growing a slab", self.name);
                }
            }
            let slab = inner.empty.pop_front().expect("grow left no empty slab");
            inner.partial.push_front(slab);
        }
        let slab_ref = inner
            .partial
            .front()
            .clone_pointer()
            .expect("partial list empty after refill");
        let obj = if self.is_large() {
            let bufctl = slab_ref.free_bufctls.get();
            debug_assert!(!bufctl.is_null());
            let bufctl_ref = unsafe { &*bufctl };
            slab_ref.free_bufctls.set(bufctl_ref.next.get());
            bufctl_ref.buf_addr.get() as *mut u8
        } else {
            let obj_addr = slab_ref.free_small.get();
            debug_assert_ne!(obj_addr, 0);
            let next = unsafe { ptr::read_unaligned((obj_addr + self.obj_size) as *const usize) };
            slab_ref.free_small.set(next);
            obj_addr as *mut u8
        };
        slab_ref.num_busy.set(slab_ref.num_busy.get() + 1);
        if slab_ref.num_busy.get() == slab_ref.num_total.get() {
            let mut cursor =
                unsafe { inner.partial.cursor_mut_from_ptr(&*slab_ref as *const KmemSlab) };
            let slab = cursor.remove().expect("full slab left its list");
            inner.full.push_front(slab);
        }
        inner.nr_cur_alloc += 1;
        Ok(obj)
    }

    /// Returns `obj` to its slab, demoting the slab full→partial or
    /// partial→empty as its busy count falls.
    ///
    /// # Safety
    ///
    /// `obj` must be an object handed out by this cache and not already
    /// freed.
    pub unsafe fn free(&self, obj: *mut u8) {
        let mut inner = self.inner.lock();
        let slab_ptr: *const KmemSlab;
        if self.is_large() {
            // The trailing word leads back to the bufctl.
            let bufctl = ptr::read_unaligned((obj as usize + self.obj_size) as *const *mut Bufctl);
            let bufctl_ref = &*bufctl;
            slab_ptr = bufctl_ref.my_slab.get();
            let slab = &*slab_ptr;
            bufctl_ref.next.set(slab.free_bufctls.get());
            slab.free_bufctls.set(bufctl);
        } else {
            // The slab header sits at the top of the object's page.
            slab_ptr = (((obj as usize) & !(PAGE_SIZE - 1)) + PAGE_SIZE - size_of::<KmemSlab>())
                as *const KmemSlab;
            let slab = &*slab_ptr;
            ptr::write_unaligned((obj as usize + self.obj_size) as *mut usize, slab.free_small.get());
            slab.free_small.set(obj as usize);
        }
        let slab = &*slab_ptr;
        slab.num_busy.set(slab.num_busy.get() - 1);
        inner.nr_cur_alloc -= 1;
        if slab.num_busy.get() + 1 == slab.num_total.get() {
            // It was full; it can take allocations again.
            let mut cursor = inner.full.cursor_mut_from_ptr(slab_ptr);
            let s = cursor.remove().expect("slab missing from the full list");
            inner.partial.push_front(s);
        } else if slab.num_busy.get() == 0 {
            let mut cursor = inner.partial.cursor_mut_from_ptr(slab_ptr);
            let s = cursor.remove().expect("slab missing from the partial list");
            inner.empty.push_front(s);
        }
    }

    /// Builds one slab and installs it on the empty list. Constructors run
    /// here, once per object, not per allocation.
    fn grow(&self, inner: &mut KmemCacheInner, flags: MemFlags) -> Result<(), &'static str> {
        let stride = self.stride();
        let slab_ref: UnsafeRef<KmemSlab>;
        if !self.is_large() {
            let page = self.source.alloc(PAGE_SIZE, flags.mem_flags() | MemFlags::INSTANTFIT)?;
            // The header claims the top of the page; objects fill the rest.
            let slab_ptr = (page + PAGE_SIZE - size_of::<KmemSlab>()) as *mut KmemSlab;
            unsafe { ptr::write(slab_ptr, KmemSlab::new()) };
            slab_ref = unsafe { UnsafeRef::from_raw(slab_ptr) };
            slab_ref.obj_size.set(stride);
            let num_total = (PAGE_SIZE - size_of::<KmemSlab>()) / stride;
            assert!(num_total > 0, "cache {}: objects do not fit a small slab", self.name);
            slab_ref.num_total.set(num_total);
            slab_ref.free_small.set(page);
            // Thread the free list through each object's trailing word.
            let mut buf = page;
            for i in 0..num_total {
                if let Some(ctor) = self.ctor {
                    ctor(buf as *mut u8, self.obj_size);
                }
                let next = if i == num_total - 1 { 0 } else { buf + stride };
                unsafe { ptr::write_unaligned((buf + self.obj_size) as *mut usize, next) };
                buf += stride;
            }
        } else {
            let slab_obj = kmem_slab_cache().alloc(MemFlags::empty())?;
            let slab_ptr = slab_obj as *mut KmemSlab;
            unsafe { ptr::write(slab_ptr, KmemSlab::new()) };
            slab_ref = unsafe { UnsafeRef::from_raw(slab_ptr) };
            slab_ref.obj_size.set(stride);
            // At least min_pgs of backing, rounded up to a power of two.
            let min_pgs = (NUM_BUF_PER_SLAB * stride + PAGE_SIZE - 1) / PAGE_SIZE;
            let order = log2_up(min_pgs);
            let backing_size = (1 << order) * PAGE_SIZE;
            let buf_base = match self
                .source
                .alloc(backing_size, flags.mem_flags() | MemFlags::INSTANTFIT)
            {
                Ok(base) => base,
                Err(e) => {
                    unsafe { kmem_slab_cache().free(slab_obj) };
                    return Err(e);
                }
            };
            slab_ref.num_total.set(backing_size / stride);
            // A bufctl per object, each chained onto the slab and pointed
            // to by the object's trailing word.
            let mut buf = buf_base;
            for _ in 0..slab_ref.num_total.get() {
                if let Some(ctor) = self.ctor {
                    ctor(buf as *mut u8, self.obj_size);
                }
                let bufctl_obj = kmem_bufctl_cache().alloc(MemFlags::empty())?;
                let bufctl_ptr = bufctl_obj as *mut Bufctl;
                unsafe { ptr::write(bufctl_ptr, Bufctl::new()) };
                let bufctl = unsafe { &*bufctl_ptr };
                bufctl.buf_addr.set(buf);
                bufctl.my_slab.set(&*slab_ref as *const KmemSlab);
                bufctl.next.set(slab_ref.free_bufctls.get());
                slab_ref.free_bufctls.set(bufctl_ptr);
                unsafe {
                    ptr::write_unaligned((buf + self.obj_size) as *mut *mut Bufctl, bufctl_ptr)
                };
                buf += stride;
            }
        }
        trace!("cache {}: grew a slab of {} objects", self.name, slab_ref.num_total.get());
        inner.empty.push_front(slab_ref);
        Ok(())
    }

    /// Tears down one (empty) slab: destructors run, bufctls and the
    /// header go back to their seed caches, and the backing returns to the
    /// arena.
    fn slab_destroy(&self, slab: UnsafeRef<KmemSlab>) {
        if !self.is_large() {
            let page = (&*slab as *const KmemSlab as usize) & !(PAGE_SIZE - 1);
            if let Some(dtor) = self.dtor {
                let stride = slab.obj_size.get();
                let mut buf = page;
                for _ in 0..slab.num_total.get() {
                    dtor(buf as *mut u8, self.obj_size);
                    buf += stride;
                }
            }
            self.source.free(page, PAGE_SIZE);
        } else {
            let stride = slab.obj_size.get();
            let min_pgs = (NUM_BUF_PER_SLAB * stride + PAGE_SIZE - 1) / PAGE_SIZE;
            let order = log2_up(min_pgs);
            // Every bufctl is on the free list; the lowest object address
            // is the start of the backing run.
            let mut backing_start = usize::MAX;
            let mut bufctl = slab.free_bufctls.get();
            while !bufctl.is_null() {
                let b = unsafe { &*bufctl };
                let next = b.next.get();
                backing_start = backing_start.min(b.buf_addr.get());
                if let Some(dtor) = self.dtor {
                    dtor(b.buf_addr.get() as *mut u8, self.obj_size);
                }
                unsafe { kmem_bufctl_cache().free(bufctl as *mut u8) };
                bufctl = next;
            }
            self.source.free(backing_start, (1 << order) * PAGE_SIZE);
            unsafe { kmem_slab_cache().free(&*slab as *const KmemSlab as *mut u8) };
        }
    }

    /// Destroys every slab on the empty list. Repeating this with no
    /// intervening allocations is a no-op.
    pub fn reap(&self) {
        let mut inner = self.inner.lock();
        loop {
            let slab = match inner.empty.pop_front() {
                Some(slab) => slab,
                None => break,
            };
            self.slab_destroy(slab);
        }
    }

    /// Logs this cache's configuration and slab occupancy.
    pub fn dump_stats(&self) {
        let inner = self.inner.lock();
        debug!("cache: {}", self.name);
        debug!(
            "\tobj size: {}, align: {}, flags: {:#x}, backing arena: {}",
            self.obj_size,
            self.align,
            self.flags,
            self.source.name()
        );
        debug!(
            "\tslabs: {} full, {} partial, {} empty; current allocations: {}",
            inner.full.iter().count(),
            inner.partial.iter().count(),
            inner.empty.iter().count(),
            inner.nr_cur_alloc
        );
    }
}

intrusive_adapter!(CacheRegAdapter = UnsafeRef<KmemCache>: KmemCache { registry_link: SinglyLinkedListLink });

static KMEM_CACHES: Once<Mutex<SinglyLinkedList<CacheRegAdapter>>> = Once::new();

fn cache_registry() -> &'static Mutex<SinglyLinkedList<CacheRegAdapter>> {
    KMEM_CACHES.call_once(|| Mutex::new(SinglyLinkedList::new(CacheRegAdapter::new())))
}

/// Links `cache` into the global registry, keeping it sorted by object
/// size.
fn register_cache(cache: &'static KmemCache) {
    let mut list = cache_registry().lock();
    let mut cursor = list.cursor_mut();
    loop {
        let smaller = match cursor.peek_next().get() {
            Some(next) => next.obj_size < cache.obj_size,
            None => false,
        };
        if !smaller {
            break;
        }
        cursor.move_next();
    }
    cursor.insert_after(unsafe { UnsafeRef::from_raw(cache) });
}

fn unregister_cache(cache: &KmemCache) {
    let mut list = cache_registry().lock();
    let mut cursor = list.cursor_mut();
    loop {
        let found = match cursor.peek_next().get() {
            Some(next) => ptr::eq(next, cache),
            None => panic!("cache {} missing from the registry", cache.name),
        };
        if found {
            cursor.remove_next();
            return;
        }
        cursor.move_next();
    }
}

static KMEM_CACHE_CACHE: Once<KmemCache> = Once::new();
static KMEM_SLAB_CACHE: Once<KmemCache> = Once::new();
static KMEM_BUFCTL_CACHE: Once<KmemCache> = Once::new();

/// The cache that cache headers themselves come from.
pub fn kmem_cache_cache() -> &'static KmemCache {
    KMEM_CACHE_CACHE.get().expect("kmem_cache not initialized")
}

/// The cache of large-slab headers.
pub fn kmem_slab_cache() -> &'static KmemCache {
    KMEM_SLAB_CACHE.get().expect("kmem_cache not initialized")
}

/// The cache of bufctl records.
pub fn kmem_bufctl_cache() -> &'static KmemCache {
    KMEM_BUFCTL_CACHE.get().expect("kmem_cache not initialized")
}

/// Creates the three seed caches so dynamic cache creation has somewhere to
/// allocate headers from. Call once, after `vmem::init`.
pub fn kmem_cache_init() {
    let source = vmem::kpages_arena();
    let cache_cache = KMEM_CACHE_CACHE.call_once(|| {
        KmemCache::new_unregistered(
            "kmem_cache",
            size_of::<KmemCache>(),
            align_of::<KmemCache>(),
            0,
            None,
            None,
            source,
            false,
        )
    });
    register_cache(cache_cache);
    let slab_cache = KMEM_SLAB_CACHE.call_once(|| {
        KmemCache::new_unregistered(
            "kmem_slab",
            size_of::<KmemSlab>(),
            align_of::<KmemSlab>(),
            0,
            None,
            None,
            source,
            false,
        )
    });
    register_cache(slab_cache);
    let bufctl_cache = KMEM_BUFCTL_CACHE.call_once(|| {
        KmemCache::new_unregistered(
            "kmem_bufctl",
            size_of::<Bufctl>(),
            align_of::<Bufctl>(),
            0,
            None,
            None,
            source,
            false,
        )
    });
    register_cache(bufctl_cache);
    debug!("kmem_cache: seed caches ready");
}

/// Creates a cache of `obj_size`-byte objects, allocating the cache header
/// from the cache-of-caches. Slab pages come from the kpages arena.
pub fn kmem_cache_create(
    name: &'static str,
    obj_size: usize,
    align: usize,
    flags: u32,
    ctor: Option<ObjCtor>,
    dtor: Option<ObjDtor>,
) -> Result<&'static KmemCache, &'static str> {
    let obj = kmem_cache_cache().alloc(MemFlags::empty())?;
    let cache_ptr = obj as *mut KmemCache;
    unsafe {
        ptr::write(
            cache_ptr,
            KmemCache::new_unregistered(
                name,
                obj_size,
                align,
                flags,
                ctor,
                dtor,
                vmem::kpages_arena(),
                true,
            ),
        );
    }
    let cache = unsafe { &*cache_ptr };
    register_cache(cache);
    Ok(cache)
}

/// Destroys a cache. Every object must have been returned; only the empty
/// list may be populated.
///
/// # Safety
///
/// The cache must not be used again, by anyone.
pub unsafe fn kmem_cache_destroy(cache: &'static KmemCache) {
    {
        let mut inner = cache.inner.lock();
        assert!(inner.full.is_empty(), "destroying cache {} with full slabs", cache.name);
        assert!(
            inner.partial.is_empty(),
            "destroying cache {} with live objects",
            cache.name
        );
        loop {
            let slab = match inner.empty.pop_front() {
                Some(slab) => slab,
                None => break,
            };
            cache.slab_destroy(slab);
        }
    }
    unregister_cache(cache);
    if cache.dynamic {
        kmem_cache_cache().free(cache as *const KmemCache as *mut u8);
    }
}

/// Logs every cache in the system, smallest object size first.
pub fn dump_kmem_caches() {
    for cache in cache_registry().lock().iter() {
        cache.dump_stats();
    }
}
