// kernel/src/arch/mod.rs
//
// アーキ依存部。unsafe をできるだけここに閉じ込める方針。
// - cpu:    hlt ループとコアローカルベースポインタ（GS base）
// - paging: CR3 / 実ページテーブル操作（MemAction を受けて map_to/unmap）

pub mod cpu;
#[cfg(not(test))]
pub mod paging;

/// CPU を停止させるループ。
#[cfg(not(test))]
pub fn halt_loop() -> ! {
    cpu::halt_loop()
}
