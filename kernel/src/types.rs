/*!
 * types
 *
 * 役割:
 *   - カーネル全体で共有する素朴な型・定数を集約する。
 *
 * やること:
 *   - ブートローダから受け取る一次情報（BootHandoff）の型定義。
 *   - メモリマップ観察用の MemoryRegion 型。
 *
 * やらないこと:
 *   - ページングや CR3 などの arch 依存処理。
 */

use core::fmt;

use crate::mem::addr::{PhysAddr, PAGE_SIZE};

/// ブートローダ → カーネルの一次引き渡し情報。
///
/// - first_free_address: カーネルが自由に使ってよい物理領域の先頭
/// - total_free_pages:   その領域に含まれる 4KiB フレーム数
///
/// Physical Page Allocator はこの 2 値だけから一度だけ初期化され、
/// 以後リサイズされない。
#[derive(Clone, Copy, Debug)]
pub struct BootHandoff {
    pub first_free_address: PhysAddr,
    pub total_free_pages: u64,
}

impl BootHandoff {
    pub const fn new(first_free_address: PhysAddr, total_free_pages: u64) -> Self {
        BootHandoff {
            first_free_address,
            total_free_pages,
        }
    }

    /// 管理対象の末尾物理アドレス（exclusive）。
    pub fn end_address(&self) -> PhysAddr {
        PhysAddr(self.first_free_address.0 + self.total_free_pages * PAGE_SIZE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryRegionType {
    Usable,
    Reserved,
    Other,
}

impl fmt::Display for MemoryRegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryRegionType::Usable => write!(f, "Usable"),
            MemoryRegionType::Reserved => write!(f, "Reserved"),
            MemoryRegionType::Other => write!(f, "Other"),
        }
    }
}

/// メモリマップ観察用の汎用領域記述（main.rs のダンプで使う）。
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
    pub index: usize,
    pub start_phys: u64,
    pub end_phys: u64,
    pub region_type: MemoryRegionType,
}

impl MemoryRegion {
    pub fn size_bytes(&self) -> u64 {
        self.end_phys.saturating_sub(self.start_phys)
    }

    pub fn page_count(&self) -> u64 {
        self.size_bytes() / PAGE_SIZE
    }
}
