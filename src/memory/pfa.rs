//! Bitmap physical frame allocator, one bit per 4 KiB frame.
//!
//! Grounded on the region-table/`Mutex`-guarded-state idiom of the upstream
//! bump allocator this replaces, but the allocation strategy itself is a
//! bitmap scan as required: a clear bit means free.

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};

pub const FRAME_SIZE: u64 = 4096;
const MAX_REGIONS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub kind: RegionKind,
}

#[derive(Clone, Copy, Debug)]
pub struct FrameStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
}

struct Bitmap<'a> {
    /// One bit per frame within [base_frame, base_frame + bit_count).
    words: &'a mut [u64],
    base_frame: u64,
    bit_count: usize,
    used: usize,
}

impl<'a> Bitmap<'a> {
    fn is_free(&self, frame: u64) -> bool {
        let idx = (frame - self.base_frame) as usize;
        (self.words[idx / 64] >> (idx % 64)) & 1 == 0
    }

    fn set_used(&mut self, frame: u64) {
        let idx = (frame - self.base_frame) as usize;
        let was_free = self.words[idx / 64] & (1 << (idx % 64)) == 0;
        self.words[idx / 64] |= 1 << (idx % 64);
        if was_free {
            self.used += 1;
        }
    }

    fn set_free(&mut self, frame: u64) {
        let idx = (frame - self.base_frame) as usize;
        let was_used = self.words[idx / 64] & (1 << (idx % 64)) != 0;
        self.words[idx / 64] &= !(1 << (idx % 64));
        if was_used {
            self.used -= 1;
        }
    }

    fn find_free_run(&self, n: usize) -> Option<u64> {
        let mut run_start = None;
        let mut run_len = 0usize;
        for i in 0..self.bit_count {
            let frame = self.base_frame + i as u64;
            if self.is_free(frame) {
                if run_start.is_none() {
                    run_start = Some(frame);
                }
                run_len += 1;
                if run_len == n {
                    return run_start;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }
}

/// A frame allocator over one bitmap. Owns its backing storage so it can be
/// instantiated standalone in tests, without touching the global singleton.
struct Pfa<'a> {
    bitmap: Bitmap<'a>,
    regions: [Option<MemoryRegion>; MAX_REGIONS],
    region_count: usize,
}

impl<'a> Pfa<'a> {
    fn new(regions_in: &[MemoryRegion], storage: &'a mut [u64]) -> Self {
        let mut regions = [None; MAX_REGIONS];
        let mut region_count = 0;
        let mut highest = 0u64;
        let mut lowest_usable = u64::MAX;

        for r in regions_in.iter().take(MAX_REGIONS) {
            regions[region_count] = Some(*r);
            region_count += 1;
            if r.kind == RegionKind::Usable {
                highest = highest.max(r.end);
                lowest_usable = lowest_usable.min(r.start);
            }
        }

        let base_frame = lowest_usable / FRAME_SIZE;
        let bit_count = ((highest / FRAME_SIZE) - base_frame) as usize;

        for w in storage.iter_mut() {
            *w = !0u64; // start fully used; usable regions are cleared below
        }

        let mut bitmap = Bitmap {
            words: storage,
            base_frame,
            bit_count,
            used: bit_count,
        };

        for r in regions_in.iter() {
            if r.kind == RegionKind::Usable {
                let mut frame = r.start / FRAME_SIZE;
                let end_frame = r.end / FRAME_SIZE;
                while frame < end_frame {
                    if frame >= base_frame && (frame - base_frame) < bit_count as u64 {
                        bitmap.set_free(frame);
                    }
                    frame += 1;
                }
            }
        }

        log::info!(
            target: "pfa",
            "bitmap allocator: {} frames tracked, {} free",
            bit_count,
            bit_count - bitmap.used
        );

        Pfa {
            bitmap,
            regions,
            region_count,
        }
    }

    fn alloc_contiguous(&mut self, n: usize) -> KernelResult<u64> {
        let start = self
            .bitmap
            .find_free_run(n)
            .ok_or(KernelError::OutOfMemory)?;
        for i in 0..n as u64 {
            self.bitmap.set_used(start + i);
        }
        Ok(start * FRAME_SIZE)
    }

    fn free_contiguous(&mut self, phys_addr: u64, n: usize) {
        let start = phys_addr / FRAME_SIZE;
        for i in 0..n as u64 {
            self.bitmap.set_free(start + i);
        }
    }

    fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.bitmap.bit_count,
            used_frames: self.bitmap.used,
            free_frames: self.bitmap.bit_count - self.bitmap.used,
        }
    }
}

static PFA: OnceCell<Mutex<Pfa<'static>>> = OnceCell::uninit();

/// `storage` is a pre-zeroed, statically or heap-allocated bitmap buffer
/// large enough for `(highest_frame + 63) / 64` u64 words; callers size it
/// from the memory map before calling `init`.
pub fn init(regions_in: &[MemoryRegion], storage: &'static mut [u64]) {
    PFA.init_once(|| Mutex::new(Pfa::new(regions_in, storage)));
}

pub fn alloc() -> KernelResult<u64> {
    alloc_contiguous(1)
}

pub fn alloc_contiguous(n: usize) -> KernelResult<u64> {
    PFA.get().expect("pfa not initialized").lock().alloc_contiguous(n)
}

pub fn free(phys_addr: u64) {
    free_contiguous(phys_addr, 1);
}

pub fn free_contiguous(phys_addr: u64, n: usize) {
    PFA.get()
        .expect("pfa not initialized")
        .lock()
        .free_contiguous(phys_addr, n);
}

pub fn stats() -> FrameStats {
    PFA.get().expect("pfa not initialized").lock().stats()
}

#[allow(dead_code)]
pub fn region_count() -> usize {
    PFA.get().expect("pfa not initialized").lock().region_count
}

#[cfg(test)]
mod pfa_tests {
    use super::*;

    #[test_case]
    fn alloc_free_bitmap_reuses_freed_frame() {
        let regions = [MemoryRegion {
            start: 0x100000,
            end: 0x100000 + 256 * FRAME_SIZE,
            kind: RegionKind::Usable,
        }];
        let mut storage = [0u64; 4];
        let mut pfa = Pfa::new(&regions, &mut storage);

        let f1 = pfa.alloc_contiguous(1).unwrap();
        let f2 = pfa.alloc_contiguous(1).unwrap();
        let f3 = pfa.alloc_contiguous(1).unwrap();
        assert_eq!(pfa.stats().used_frames, 3);

        pfa.free_contiguous(f2, 1);
        let f4 = pfa.alloc_contiguous(1).unwrap();
        assert_eq!(f4, f2);
        assert_eq!(pfa.stats().used_frames, 3);
        let _ = (f1, f3);
    }

    #[test_case]
    fn contiguous_alloc_finds_a_run() {
        let regions = [MemoryRegion {
            start: 0x200000,
            end: 0x200000 + 64 * FRAME_SIZE,
            kind: RegionKind::Usable,
        }];
        let mut storage = [0u64; 2];
        let mut pfa = Pfa::new(&regions, &mut storage);

        let base = pfa.alloc_contiguous(4).unwrap();
        for i in 0..4 {
            assert!(!pfa.bitmap.is_free(base / FRAME_SIZE + i));
        }
    }

    #[test_case]
    fn reserved_region_never_allocated() {
        let regions = [
            MemoryRegion {
                start: 0x0,
                end: 0x10_0000,
                kind: RegionKind::Reserved,
            },
            MemoryRegion {
                start: 0x10_0000,
                end: 0x10_0000 + 16 * FRAME_SIZE,
                kind: RegionKind::Usable,
            },
        ];
        let mut storage = [0u64; 1];
        let mut pfa = Pfa::new(&regions, &mut storage);

        for _ in 0..16 {
            let f = pfa.alloc_contiguous(1).unwrap();
            assert!(f >= 0x10_0000);
        }
        assert!(pfa.alloc_contiguous(1).is_err());
    }

    #[test_case]
    fn out_of_memory_when_no_run_fits() {
        let regions = [MemoryRegion {
            start: 0x100000,
            end: 0x100000 + 2 * FRAME_SIZE,
            kind: RegionKind::Usable,
        }];
        let mut storage = [0u64; 1];
        let mut pfa = Pfa::new(&regions, &mut storage);
        assert!(pfa.alloc_contiguous(3).is_err());
        assert!(pfa.alloc_contiguous(2).is_ok());
    }
}
