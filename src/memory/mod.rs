//! Memory management entry point: bring up the frame allocator, page
//! tables, and heap in that order, the same sequence the teacher's
//! `memory::init` uses.

pub mod heap;
pub mod layout;
pub mod paging;
pub mod pfa;

use pfa::{MemoryRegion, RegionKind};

pub fn init(regions: &[MemoryRegion], hhdm_offset: u64, bitmap_storage: &'static mut [u64]) {
    pfa::init(regions, bitmap_storage);
    paging::init(hhdm_offset);
    paging::enable_global_pages();
    heap::init();

    let stats = pfa::stats();
    log::info!(
        target: "memory",
        "memory init complete: {} frames total, {} free",
        stats.total_frames,
        stats.free_frames
    );
}

pub fn debug_memory_info() {
    let f = pfa::stats();
    let h = heap::stats();
    log::info!(
        target: "memory",
        "frames: {}/{} used, heap: {} allocated / {} free, {} live allocs",
        f.used_frames,
        f.total_frames,
        h.allocated,
        h.free,
        h.live_allocs
    );
}

pub use pfa::FrameStats;
pub type Region = MemoryRegion;
pub type RegionTag = RegionKind;
