#![no_std]
#![no_main]

extern crate alloc;

use bootloader_api::BootInfo;
use kernel::{block, boot, hlt_loop, interrupts, logger, memory, serial, task};

bootloader_api::entry_point!(kernel_main);

/// Backing storage for the frame bitmap. One bit per 4 KiB frame; this many
/// words covers up to 4 GiB of physical memory, comfortably past what a
/// typical boot environment for this core reports.
const BITMAP_WORDS: usize = 16384;
static mut BITMAP_STORAGE: [u64; BITMAP_WORDS] = [0; BITMAP_WORDS];

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial::init();
    logger::init();
    log::info!(target: "boot", "serial and logger online");

    interrupts::init();

    let hhdm_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not provide a physical memory offset");

    let mut regions = [memory::pfa::MemoryRegion {
        start: 0,
        end: 0,
        kind: memory::pfa::RegionKind::Reserved,
    }; boot::MAX_REGIONS];
    let region_count = boot::convert_regions(&boot_info.memory_regions, &mut regions);

    let bitmap_storage: &'static mut [u64] = unsafe { &mut BITMAP_STORAGE };
    memory::init(&regions[..region_count], hhdm_offset, bitmap_storage);
    memory::debug_memory_info();

    task::scheduler::init();

    match block::init() {
        Ok(()) => {
            log::info!(target: "boot", "AHCI disk online");
            let whole = block::BlockDevice::whole_disk();
            let table = block::partition::scan(&whole, "disk0");
            log::info!(target: "boot", "{} partition(s) found", table.len());

            let mut cache = block::cache::BufferCache::new();
            if let Ok(buf) = cache.get(whole, 0) {
                log::info!(target: "boot", "block 0 read through cache ok");
                cache.put(buf);
            }
        }
        Err(e) => {
            log::warn!(target: "boot", "no AHCI disk available: {}", e);
        }
    }

    log::info!(target: "boot", "boot sequence complete");
    hlt_loop();
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial::emergency_print(format_args!("kernel panic: {}\n", info));
    serial::flush_serial();
    hlt_loop();
}

