// kernel/src/mem/mod.rs
//
// 役割:
// - メモリ関連のサブモジュールをまとめる中継点。
// - addr / paging / layout / address_space / heap を公開する。

pub mod addr;
pub mod paging;
pub mod layout;
pub mod address_space;
pub mod heap;
