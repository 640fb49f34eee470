// kernel/src/mem/layout.rs
//
// parcel-os: カーネル仮想アドレスレイアウト（仕様レベル）
//
// 目的:
// - 「汎用（Default）ドメイン」と「カーネルスタック（KernelStacks）ドメイン」の
//   境界を定数として固定しておく。
// - スタックドメインを高位の固定オフセットに置くことで、スタックオーバーフローが
//   汎用領域と衝突せず guard page で検出できる配置にする。
// - 実装が変わっても、ここの定数を変えるだけで「OSが守るべきアドレス空間の型」を
//   更新できる。
//
// 想定レイアウト（high half）:
//
//   0xffff_8800_0000_0000 ..+ 1GiB   : Default ドメイン
//     - カーネルヒープ窓（KERNEL_HEAP_BASE）やマップ要求がここに入る
//
//   0xffff_c000_0000_0000 ..+ 1GiB   : KernelStacks ドメイン
//     - タスクごとのカーネルスタックスロット
//     - スロット間に guard gap（未マップページ）を必ず挟む

use crate::mem::addr::{VirtAddr, PAGE_SIZE};

/// Default ドメインの開始仮想アドレス。
pub const DEFAULT_SPACE_BASE: VirtAddr = VirtAddr(0xffff_8800_0000_0000);

/// Default ドメインの大きさ（1GiB）。
pub const DEFAULT_SPACE_SIZE: u64 = 1 << 30;

/// KernelStacks ドメインの開始仮想アドレス（高位固定オフセット）。
pub const KERNEL_STACKS_BASE: VirtAddr = VirtAddr(0xffff_c000_0000_0000);

/// KernelStacks ドメインの大きさ（1GiB）。
pub const KERNEL_STACKS_SIZE: u64 = 1 << 30;

/// カーネルヒープ窓の開始仮想アドレス（Default ドメイン内、core 0 の窓）。
/// core n の窓は CORE_HEAP_STRIDE_PAGES だけずれる（コア間で窓は重ならない）。
pub const KERNEL_HEAP_BASE: VirtAddr = VirtAddr(DEFAULT_SPACE_BASE.0);

/// コアごとのヒープ窓ストライド（ページ数、16MiB）。
/// 複数コアが同じハードウェアテーブルを共有しても窓が衝突しない間隔。
pub const CORE_HEAP_STRIDE_PAGES: u64 = 4096;

/// コアごとのカーネルスタック領域ストライド（ページ数、16MiB）。
/// スロット番号はこの領域の内側でだけ進む。
pub const CORE_STACK_REGION_PAGES: u64 = 4096;

/// カーネルヒープに充てるページ数（64 ページ = 256KiB）。
pub const KERNEL_HEAP_PAGES: u64 = 64;

/// カーネルヒープ窓のバイト数。
pub const KERNEL_HEAP_SIZE: usize = (KERNEL_HEAP_PAGES * PAGE_SIZE) as usize;

/// スタックスロット 1 つが占める仮想範囲（スタック本体 + guard gap）。
pub const STACK_SLOT_PAGES: u64 = 8;

/// スロット末尾に置く guard gap のページ数（未マップのまま残す）。
pub const STACK_GUARD_PAGES: u64 = 1;

/// スロットあたりの実際にマップしてよい最大ページ数。
pub const STACK_USABLE_PAGES: u64 = STACK_SLOT_PAGES - STACK_GUARD_PAGES;
