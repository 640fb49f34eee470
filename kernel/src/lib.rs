// kernel/src/lib.rs
//
// parcel-os: マイクロカーネル核（メモリ管理スタック + IPC 基盤）
//
// 役割:
// - カーネル核の全ロジックをライブラリとして公開する。
// - ベアメタル起動（src/main.rs, feature = "boot_entry"）と
//   ホスト上の unit test の両方から同じコードを使う。
//
// 設計方針:
// - ロジックは KernelState / CoreLocal / KernelContext に閉じた
//   明示的な状態機械として書き、unit test で決定的に駆動できるようにする。
// - ハードウェア依存（GS base / ページテーブル / VGA / COM1）は
//   arch と logging に閉じ込め、cfg(test) ではホスト側の代替に差し替える。

#![cfg_attr(not(test), no_std)]

pub mod types;
pub mod logging;
pub mod arch;
pub mod mem;
pub mod mm;
pub mod kernel;
