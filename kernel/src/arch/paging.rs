// kernel/src/arch/paging.rs
//
// 役割:
// - x86_64 向けのページング処理をまとめる場所。
// - 実ページテーブルの操作（unsafe）はここに集約する。
// - AddressSpace（論理）と同じ MemAction 語彙で駆動される:
//   論理側の map/unmap が成功した後、同じ action をここへ流す。
//
// 物理メモリ窓:
// - bootloader の map_physical_memory 機能で物理メモリ全域が
//   高位アドレスへマップされている前提。
// - offset は起動時に set_physical_memory_offset() で一度だけ記録し、
//   すべての物理メモリアクセスは phys_to_virt() を経由する。

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{
    registers::control::Cr3,
    structures::paging::mapper::{MapToError, UnmapError},
    structures::paging::{
        FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
        Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::logging;
use crate::mem::paging::{MemAction, PageFlags};
use crate::mm::PhysicalPageAllocator;

static PHYSICAL_MEMORY_OFFSET: AtomicU64 = AtomicU64::new(0);

/// 起動時に一度だけ呼ぶ。bootloader が報告した物理メモリ窓の offset を記録する。
pub fn set_physical_memory_offset(offset: u64) {
    PHYSICAL_MEMORY_OFFSET.store(offset, Ordering::Release);
    logging::info_u64("arch::paging: physical_memory_offset", offset);
}

fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    let offset = PHYSICAL_MEMORY_OFFSET.load(Ordering::Acquire);
    VirtAddr::new(offset + phys.as_u64())
}

/// 抽象 PageFlags → x86_64 の PageTableFlags への変換。
fn to_x86_flags(flags: PageFlags) -> PageTableFlags {
    let mut res = PageTableFlags::empty();

    if flags.contains(PageFlags::PRESENT) {
        res |= PageTableFlags::PRESENT;
    }
    if flags.contains(PageFlags::WRITABLE) {
        res |= PageTableFlags::WRITABLE;
    }
    if flags.contains(PageFlags::USER) {
        res |= PageTableFlags::USER_ACCESSIBLE;
    }
    if flags.contains(PageFlags::NO_EXEC) {
        res |= PageTableFlags::NO_EXECUTE;
    }

    res
}

/// 現在アクティブな L4 ページテーブルへの &mut PageTable を得る。
unsafe fn active_level_4_table() -> &'static mut PageTable {
    let (level_4_frame, _) = Cr3::read();
    let phys = level_4_frame.start_address();
    let virt = phys_to_virt(phys);
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();
    &mut *page_table_ptr
}

unsafe fn init_offset_page_table() -> OffsetPageTable<'static> {
    let level_4_table = active_level_4_table();
    let offset = VirtAddr::new(PHYSICAL_MEMORY_OFFSET.load(Ordering::Acquire));
    OffsetPageTable::new(level_4_table, offset)
}

/// PhysicalPageAllocator を x86_64 の FrameAllocator として使う薄いラッパ。
/// map_to が中間テーブル用のフレームを要求したときに使われる。
pub struct KernelFrameAllocator<'a> {
    inner: &'a mut PhysicalPageAllocator,
}

impl<'a> KernelFrameAllocator<'a> {
    pub fn new(inner: &'a mut PhysicalPageAllocator) -> Self {
        KernelFrameAllocator { inner }
    }
}

unsafe impl<'a> FrameAllocator<Size4KiB> for KernelFrameAllocator<'a> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.inner.allocate_frame().ok()?;
        Some(PhysFrame::containing_address(PhysAddr::new(
            frame.start_address().0,
        )))
    }
}

/// MemAction を実ページテーブルへ適用する。
///
/// 論理側（AddressSpace::apply）が受理した action だけをここへ流すこと。
/// ここでの失敗はログに残して戻る（fail-safe）。論理と実テーブルが
/// ずれた状態になるため、呼び出し側は続行前にログを確認すること。
///
/// # Safety
/// - set_physical_memory_offset() 済みであること。
/// - action の仮想範囲が他のコードと競合しないこと。
pub unsafe fn apply_mem_action(action: MemAction, phys: &mut PhysicalPageAllocator) {
    match action {
        MemAction::Map { page, frame, flags } => {
            let virt_addr = page.start_address().0;
            let phys_addr = frame.start_address().0;
            let x86_page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(virt_addr));
            let x86_frame: PhysFrame<Size4KiB> =
                PhysFrame::containing_address(PhysAddr::new(phys_addr));

            let mut mapper = init_offset_page_table();
            let mut frame_alloc = KernelFrameAllocator::new(phys);

            match mapper.map_to(x86_page, x86_frame, to_x86_flags(flags), &mut frame_alloc) {
                Ok(flush) => flush.flush(),
                Err(err) => {
                    logging::error("arch::paging: map_to failed");
                    logging::error_kv(" virt_addr", virt_addr);
                    log_map_to_error(err);
                }
            }
        }

        MemAction::Unmap { page } => {
            let virt_addr = page.start_address().0;
            let x86_page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(virt_addr));

            let mut mapper = init_offset_page_table();

            match mapper.unmap(x86_page) {
                Ok((_frame, flush)) => flush.flush(),
                Err(err) => {
                    logging::error("arch::paging: unmap failed");
                    logging::error_kv(" virt_addr", virt_addr);
                    log_unmap_error(err);
                }
            }
        }
    }
}

fn log_map_to_error(err: MapToError<Size4KiB>) {
    match err {
        MapToError::FrameAllocationFailed => {
            logging::error("  MapToError::FrameAllocationFailed");
        }
        MapToError::ParentEntryHugePage => {
            logging::error("  MapToError::ParentEntryHugePage");
        }
        MapToError::PageAlreadyMapped(old_frame) => {
            logging::error("  MapToError::PageAlreadyMapped");
            logging::error_kv("   already_mapped_phys_addr", old_frame.start_address().as_u64());
        }
    }
}

fn log_unmap_error(err: UnmapError) {
    match err {
        UnmapError::ParentEntryHugePage => {
            logging::error("  UnmapError::ParentEntryHugePage");
        }
        UnmapError::PageNotMapped => {
            logging::error("  UnmapError::PageNotMapped");
        }
        UnmapError::InvalidFrameAddress(addr) => {
            logging::error("  UnmapError::InvalidFrameAddress");
            logging::error_kv("   frame_addr", addr.as_u64());
        }
    }
}
