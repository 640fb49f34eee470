// kernel/src/mem/paging.rs

use crate::mem::addr::{PhysFrame, VirtPage};

bitflags::bitflags! {
    /// ページ属性（まだ最低限）
    ///
    /// - PRESENT: ページが有効
    /// - WRITABLE: 書き込み可能
    /// - USER: ユーザ空間からアクセス可能
    /// - NO_EXEC: 実行禁止（NX bit 相当）
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const NO_EXEC = 1 << 63;
    }
}

impl PageFlags {
    /// カーネル内部データ用の標準属性。
    pub fn kernel_data() -> Self {
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXEC
    }
}

/// ページ単位のメモリ操作を表現する抽象イベント。
///
/// - Map: 「この仮想ページを、この物理フレームに、この属性でマップしたい」
/// - Unmap: 「この仮想ページのマッピングを解除したい」
///
/// AddressSpace（論理）と arch::paging（実ページテーブル）の両方が
/// 同じ語彙で駆動されるよう、操作をデータとして持つ。
#[derive(Clone, Copy, Debug)]
pub enum MemAction {
    Map {
        page: VirtPage,
        frame: PhysFrame,
        flags: PageFlags,
    },
    Unmap {
        page: VirtPage,
    },
}
