//! One-call bootstrap of the kernel allocation stack: the self-sufficient
//! base arena, the kpages arena layered on it, and the three seed slab
//! caches. After [`init`] returns, every allocation interface in `vmem` and
//! `kmem_cache` is usable.

#![no_std]

#[macro_use] extern crate log;
extern crate kernel_config;
extern crate kmem_cache;
extern crate vmem;

#[cfg(test)]
mod test;

/// Bootstraps arenas and seed slab caches over one contiguous region.
///
/// # Safety
///
/// As for `vmem::init`: the region must be page-aligned, writable, directly
/// addressable memory owned by the caller for the lifetime of the system.
pub unsafe fn init(region_base: usize, region_size: usize) -> Result<(), &'static str> {
    vmem::init(region_base, region_size)?;
    kmem_cache::kmem_cache_init();
    info!(
        "memory allocation stack ready, {:#x} bytes under management",
        vmem::base_arena().amt_total()
    );
    Ok(())
}
