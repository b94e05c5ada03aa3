//! Slab and bufctl records.

use core::cell::Cell;
use core::ptr;
use intrusive_collections::{intrusive_adapter, LinkedListLink, UnsafeRef};

/// Header of one slab.
///
/// For small-object caches this lives at the top of the slab's single page,
/// so an object's slab is found by masking its address. For large-object
/// caches it is allocated from the slab seed cache and objects lead back to
/// it through their bufctls.
///
/// Fields are `Cell`s because slabs are reached through the shared
/// references the cache's intrusive lists hand out; all mutation happens
/// under the owning cache's lock.
pub(crate) struct KmemSlab {
    pub(crate) link: LinkedListLink,
    /// Object stride: object size plus the trailing tracking word, aligned.
    pub(crate) obj_size: Cell<usize>,
    pub(crate) num_busy: Cell<usize>,
    pub(crate) num_total: Cell<usize>,
    /// Small slabs: address of the first free object, 0 when none.
    pub(crate) free_small: Cell<usize>,
    /// Large slabs: head of the free bufctl list.
    pub(crate) free_bufctls: Cell<*mut Bufctl>,
}

// Slabs are only ever reached and mutated under their owning cache's lock.
unsafe impl Send for KmemSlab {}
unsafe impl Sync for KmemSlab {}

impl KmemSlab {
    pub(crate) fn new() -> KmemSlab {
        KmemSlab {
            link: LinkedListLink::new(),
            obj_size: Cell::new(0),
            num_busy: Cell::new(0),
            num_total: Cell::new(0),
            free_small: Cell::new(0),
            free_bufctls: Cell::new(ptr::null_mut()),
        }
    }
}

intrusive_adapter!(pub(crate) SlabAdapter = UnsafeRef<KmemSlab>: KmemSlab { link: LinkedListLink });

/// Per-object record for large slabs: the object's address and owning slab.
/// Free bufctls chain onto their slab's free list.
pub(crate) struct Bufctl {
    pub(crate) next: Cell<*mut Bufctl>,
    pub(crate) buf_addr: Cell<usize>,
    pub(crate) my_slab: Cell<*const KmemSlab>,
}

// Bufctls are only ever reached and mutated under their owning cache's lock.
unsafe impl Send for Bufctl {}
unsafe impl Sync for Bufctl {}

impl Bufctl {
    pub(crate) fn new() -> Bufctl {
        Bufctl {
            next: Cell::new(ptr::null_mut()),
            buf_addr: Cell::new(0),
            my_slab: Cell::new(ptr::null()),
        }
    }
}
