// kernel/src/mem/address_space.rs
//
// 役割:
// - 1 つのマッピングドメイン（論理アドレス空間）を表現する。
// - どの仮想ページがどの物理フレームにどの権限でマップされているかを保持する。
// - domain タグで「汎用か、カーネルスタック専用か」を明示する。
//
// 設計方針（プロトタイプ）:
// - base / size で自分が管轄する仮想範囲を持ち、範囲外は OutOfRange で拒否する。
// - 物理フレームの確保はしない。呼び出し側が Physical Page Allocator から
//   フレームを得てから map する（関心の分離、単体テスト可能性のため）。
// - unmap は外した frame を返す。フレームを自分で確保した呼び出し側は
//   それをアロケータへ返却できる。
//
// やらないこと（今は）:
// - demand paging / VMA 管理
// - 実ページテーブルの書き換え（arch::paging の責務）

use crate::mem::addr::{PhysFrame, VirtAddr, VirtPage, PAGE_SIZE};
use crate::mem::paging::{MemAction, PageFlags};

/// マッピングドメインのタグ。
///
/// - Default: 汎用（ヒープ窓・マップ要求など）
/// - KernelStacks: タスクごとのカーネルスタック専用（高位固定オフセット）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceDomain {
    Default,
    KernelStacks,
}

pub const DOMAIN_COUNT: usize = 2;

impl AddressSpaceDomain {
    /// CoreLocal の配列 index。
    pub const fn index(self) -> usize {
        match self {
            AddressSpaceDomain::Default => 0,
            AddressSpaceDomain::KernelStacks => 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Mapping {
    pub page: VirtPage,
    pub frame: PhysFrame,
    pub flags: PageFlags,
}

const MAX_MAPPINGS: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    AlreadyMapped,
    NotMapped,
    OutOfRange,
    CapacityExceeded,
}

/// 論理アドレス空間。
///
/// 不変条件:
/// - 生きている mapping の仮想ページは互いに重複しない。
/// - マップ済みページの backing frame はちょうど 1 つ。
pub struct AddressSpace {
    pub domain: AddressSpaceDomain,
    base: VirtAddr,
    size: u64,
    mappings: [Option<Mapping>; MAX_MAPPINGS],
}

impl AddressSpace {
    pub const fn new(domain: AddressSpaceDomain, base: VirtAddr, size: u64) -> Self {
        AddressSpace {
            domain,
            base,
            size,
            mappings: [None; MAX_MAPPINGS],
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// この空間が管轄する範囲に page が含まれるか。
    fn contains(&self, page: VirtPage) -> bool {
        let start = self.base.page().number;
        let end = start + self.size / PAGE_SIZE;
        page.number >= start && page.number < end
    }

    /// 仮想ページを物理フレームへマップする。
    ///
    /// - すでにマップ済み: Err(AlreadyMapped)
    /// - 管轄範囲外:       Err(OutOfRange)
    /// - テーブル満杯:     Err(CapacityExceeded)
    pub fn map(
        &mut self,
        page: VirtPage,
        frame: PhysFrame,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        if !self.contains(page) {
            return Err(AddressSpaceError::OutOfRange);
        }

        if self.lookup(page).is_some() {
            return Err(AddressSpaceError::AlreadyMapped);
        }

        for entry in self.mappings.iter_mut() {
            if entry.is_none() {
                *entry = Some(Mapping { page, frame, flags });
                return Ok(());
            }
        }

        Err(AddressSpaceError::CapacityExceeded)
    }

    /// 仮想ページのマッピングを解除し、backing frame を返す。
    ///
    /// - マップされていない: Err(NotMapped)
    pub fn unmap(&mut self, page: VirtPage) -> Result<PhysFrame, AddressSpaceError> {
        if !self.contains(page) {
            return Err(AddressSpaceError::OutOfRange);
        }

        for entry in self.mappings.iter_mut() {
            if let Some(m) = entry {
                if m.page == page {
                    let frame = m.frame;
                    *entry = None;
                    return Ok(frame);
                }
            }
        }

        Err(AddressSpaceError::NotMapped)
    }

    /// MemAction（Map/Unmap）をこの空間へ適用する。
    ///
    /// イベントログや arch::paging と同じ語彙で空間を駆動するための入口。
    pub fn apply(&mut self, action: MemAction) -> Result<(), AddressSpaceError> {
        match action {
            MemAction::Map { page, frame, flags } => self.map(page, frame, flags),
            MemAction::Unmap { page } => self.unmap(page).map(|_| ()),
        }
    }

    pub fn lookup(&self, page: VirtPage) -> Option<Mapping> {
        for entry in self.mappings.iter() {
            if let Some(m) = entry {
                if m.page == page {
                    return Some(*m);
                }
            }
        }
        None
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.iter().filter(|m| m.is_some()).count()
    }

    pub fn for_each_mapping<F>(&self, mut f: F)
    where
        F: FnMut(&Mapping),
    {
        for entry in self.mappings.iter() {
            if let Some(ref m) = entry {
                f(m);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::layout;

    fn default_space() -> AddressSpace {
        AddressSpace::new(
            AddressSpaceDomain::Default,
            layout::DEFAULT_SPACE_BASE,
            layout::DEFAULT_SPACE_SIZE,
        )
    }

    fn page_at(offset_pages: u64) -> VirtPage {
        layout::DEFAULT_SPACE_BASE.page().offset_pages(offset_pages)
    }

    #[test]
    fn map_then_unmap_restores_previous_state() {
        let mut space = default_space();
        let page = page_at(3);
        let frame = PhysFrame::from_index(0x200);

        assert_eq!(space.mapping_count(), 0);

        space.map(page, frame, PageFlags::kernel_data()).unwrap();
        assert_eq!(space.mapping_count(), 1);
        assert_eq!(space.lookup(page).unwrap().frame, frame);

        let released = space.unmap(page).unwrap();
        assert_eq!(released, frame);
        assert_eq!(space.mapping_count(), 0);
        assert!(space.lookup(page).is_none());
    }

    #[test]
    fn double_map_is_rejected() {
        let mut space = default_space();
        let page = page_at(1);

        space
            .map(page, PhysFrame::from_index(10), PageFlags::kernel_data())
            .unwrap();

        let err = space
            .map(page, PhysFrame::from_index(11), PageFlags::kernel_data())
            .unwrap_err();
        assert_eq!(err, AddressSpaceError::AlreadyMapped);

        // 元のマッピングは壊れていない
        assert_eq!(space.lookup(page).unwrap().frame, PhysFrame::from_index(10));
    }

    #[test]
    fn unmap_of_unmapped_page_is_rejected() {
        let mut space = default_space();
        let err = space.unmap(page_at(7)).unwrap_err();
        assert_eq!(err, AddressSpaceError::NotMapped);
    }

    #[test]
    fn out_of_range_pages_are_rejected() {
        let mut space = default_space();

        // Default ドメインの外（KernelStacks 側）のページ
        let foreign = layout::KERNEL_STACKS_BASE.page();
        let err = space
            .map(foreign, PhysFrame::from_index(1), PageFlags::kernel_data())
            .unwrap_err();
        assert_eq!(err, AddressSpaceError::OutOfRange);
    }

    #[test]
    fn apply_drives_map_and_unmap() {
        let mut space = default_space();
        let page = page_at(9);
        let frame = PhysFrame::from_index(0x33);

        space
            .apply(MemAction::Map {
                page,
                frame,
                flags: PageFlags::kernel_data(),
            })
            .unwrap();
        assert!(space.lookup(page).is_some());

        space.apply(MemAction::Unmap { page }).unwrap();
        assert!(space.lookup(page).is_none());
    }
}
