// kernel/src/main.rs
//
// parcel-os: ベアメタル起動エントリ（feature = "boot_entry"）。
//
// 役割:
// - bootloader から BootInfo を受け取り、memory map をダンプする。
// - 最大の Usable 領域から BootHandoff を組み立てて本体へ渡す。
// - ロジックは全部ライブラリ側（kernel::kernel::entry）にある。

#![no_std]
#![no_main]

mod panic;

use bootloader::bootinfo::MemoryRegionType as BootRegionType;
use bootloader::{entry_point, BootInfo};

use kernel::logging;
use kernel::mem::addr::{PhysAddr, PAGE_SIZE};
use kernel::types::{BootHandoff, MemoryRegion, MemoryRegionType};

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    logging::init();
    logging::info("parcel-os: boot");

    kernel::arch::paging::set_physical_memory_offset(boot_info.physical_memory_offset);

    logging::info("boot: memory map dump start");

    // ダンプしながら最大の Usable 領域を選ぶ
    let mut best: Option<MemoryRegion> = None;

    for (i, region) in boot_info.memory_map.iter().enumerate() {
        let region_type = match region.region_type {
            BootRegionType::Usable => MemoryRegionType::Usable,
            BootRegionType::Reserved => MemoryRegionType::Reserved,
            _ => MemoryRegionType::Other,
        };

        let info = MemoryRegion {
            index: i,
            start_phys: region.range.start_frame_number * PAGE_SIZE,
            end_phys: region.range.end_frame_number * PAGE_SIZE,
            region_type,
        };

        logging::info(" mem_region:");
        logging::info_u64("  index", info.index as u64);
        logging::info_u64("  start_phys", info.start_phys);
        logging::info_u64("  end_phys", info.end_phys);
        logging::info_u64("  pages", info.page_count());
        match info.region_type {
            MemoryRegionType::Usable => logging::info("  type = Usable"),
            MemoryRegionType::Reserved => logging::info("  type = Reserved"),
            MemoryRegionType::Other => logging::info("  type = Other"),
        }

        if info.region_type == MemoryRegionType::Usable {
            let is_better = match best {
                Some(ref b) => info.page_count() > b.page_count(),
                None => true,
            };
            if is_better {
                best = Some(info);
            }
        }
    }

    logging::info("boot: memory map dump end");

    let region = match best {
        Some(region) if region.page_count() > 0 => region,
        _ => {
            logging::error("boot: no usable memory region; halting");
            kernel::arch::halt_loop();
        }
    };

    let handoff = BootHandoff::new(PhysAddr(region.start_phys), region.page_count());
    logging::info_u64("boot: first_free_address", handoff.first_free_address.0);
    logging::info_u64("boot: total_free_pages", handoff.total_free_pages);

    kernel::kernel::entry::start(handoff)
}
