//! Consumes the firmware-provided `bootloader_api::BootInfo` and converts it
//! into this kernel's own memory-region/HHDM representation. The boot
//! protocol handshake itself (the `entry_point!` macro, the bootloader's own
//! request/response negotiation) is the external collaborator; this module
//! only reads the struct it produces.

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};

use crate::memory::pfa::{MemoryRegion, RegionKind};

pub const MAX_REGIONS: usize = 64;

/// Converts the firmware memory map into this kernel's region list. Returns
/// the number of regions written into `out`.
pub fn convert_regions(regions: &MemoryRegions, out: &mut [MemoryRegion; MAX_REGIONS]) -> usize {
    let mut n = 0;
    for r in regions.iter().take(MAX_REGIONS) {
        let kind = match r.kind {
            MemoryRegionKind::Usable => RegionKind::Usable,
            _ => RegionKind::Reserved,
        };
        out[n] = MemoryRegion {
            start: r.start,
            end: r.end,
            kind,
        };
        n += 1;
    }
    n
}
