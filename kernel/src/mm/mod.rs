// kernel/src/mm/mod.rs
//
// 物理メモリ管理の入り口。
//
// 役割:
// - ブートローダから渡された BootHandoff（first_free_address, total_free_pages）を
//   もとに、4KiB フレームの確保・返却を行う Physical Page Allocator を提供する。
// - アロケータを包む KernelContext を提供する。KernelContext は起動時に一度だけ
//   構築され、各コアの CoreLocal が &'static 参照で保持する
//   （隠れたグローバルではなく、明示的な所有チェーンにする）。
//
// 設計方針:
// - 表現は「相対フレーム index の arena + free-list スタック」。
//   物理メモリ上をポインタで辿る構造は持たない（状態が構造体に閉じ、検証しやすい）。
// - allocate / free は O(1)。
// - 二重 free・範囲外 free はプログラミングエラー:
//   debug ビルドでは debug_assert で止め、release ではログ + return（fail-safe）。
// - 複数コアから共有されるため、KernelContext 内では spin::Mutex で包む。

use crate::logging;
use crate::mem::addr::{PhysAddr, PhysFrame, PAGE_SIZE};
use crate::types::BootHandoff;

/// 管理できる最大フレーム数（128MiB / 4KiB）。
/// BootHandoff がこれより大きい場合、先頭から MAX_MANAGED_FRAMES 分だけ管理する。
pub const MAX_MANAGED_FRAMES: usize = 32768;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    OutOfMemory,
}

/// 物理ページアロケータ。
///
/// 不変条件（quiescent 時）:
/// - free_pages() + 呼び出し側が保持中のフレーム数 == total_pages()
pub struct PhysicalPageAllocator {
    /// 管理範囲の先頭フレーム番号。
    base_frame: u64,
    /// 管理フレーム総数。
    total_frames: usize,
    /// 未使用フレームの相対 index を積むスタック。
    free_stack: [u32; MAX_MANAGED_FRAMES],
    free_count: usize,
    /// 確保状態 bitmap（二重 free 検出用）。bit=1 なら確保中。
    allocated: [u64; MAX_MANAGED_FRAMES / 64],
    /// 起動時に記録した handoff（レポート系の基準値）。
    handoff: BootHandoff,
}

impl PhysicalPageAllocator {
    /// フレームを 1 つも管理しない空のアロケータ。
    ///
    /// 静的領域に const 構築しておき、起動時に reset() で中身を据える。
    /// reset() 前の allocate_frame() は常に OutOfMemory。
    pub const fn empty() -> Self {
        PhysicalPageAllocator {
            base_frame: 0,
            total_frames: 0,
            free_stack: [0; MAX_MANAGED_FRAMES],
            free_count: 0,
            allocated: [0; MAX_MANAGED_FRAMES / 64],
            handoff: BootHandoff::new(PhysAddr(0), 0),
        }
    }

    /// BootHandoff の内容で in place に初期化する。
    ///
    /// 大きな free_stack / bitmap をスタック上に作らない
    /// （静的領域の self へ直接書く）。起動時に一度だけ呼ぶこと。
    ///
    /// # 設計上の前提
    /// - カーネル全体で PhysicalPageAllocator は 1 インスタンスのみ保持すること
    ///   （KernelContext 経由で共有する）。
    /// - 他のコードが同じ物理範囲を直接触らないこと（ダブルアロケーション防止）。
    pub fn reset(&mut self, handoff: BootHandoff) {
        let first = handoff.first_free_address.align_up();
        self.base_frame = first.frame().number;
        self.handoff = handoff;

        let mut total = handoff.total_free_pages as usize;
        if total > MAX_MANAGED_FRAMES {
            logging::error("mm: boot handoff exceeds MAX_MANAGED_FRAMES; truncating");
            logging::info_u64(" requested_pages", handoff.total_free_pages);
            logging::info_u64(" managed_pages", MAX_MANAGED_FRAMES as u64);
            total = MAX_MANAGED_FRAMES;
        }
        self.total_frames = total;

        for word in self.allocated.iter_mut() {
            *word = 0;
        }

        // pop が昇順になるよう、逆順に積む。
        self.free_count = 0;
        for i in (0..total).rev() {
            self.free_stack[self.free_count] = i as u32;
            self.free_count += 1;
        }
    }

    /// BootHandoff から値として構築する（ホストテスト用の近道）。
    pub fn new(handoff: BootHandoff) -> Self {
        let mut alloc = PhysicalPageAllocator::empty();
        alloc.reset(handoff);
        alloc
    }

    /// 起動時に記録した handoff。
    pub fn boot_handoff(&self) -> BootHandoff {
        self.handoff
    }

    fn mark_allocated(&mut self, rel: usize) {
        self.allocated[rel / 64] |= 1u64 << (rel % 64);
    }

    fn mark_free(&mut self, rel: usize) {
        self.allocated[rel / 64] &= !(1u64 << (rel % 64));
    }

    fn is_allocated(&self, rel: usize) -> bool {
        (self.allocated[rel / 64] >> (rel % 64)) & 1 == 1
    }

    /// 未使用フレームを 1 つ確保する。
    pub fn allocate_frame(&mut self) -> Result<PhysFrame, AllocError> {
        if self.free_count == 0 {
            return Err(AllocError::OutOfMemory);
        }

        self.free_count -= 1;
        let rel = self.free_stack[self.free_count] as usize;
        self.mark_allocated(rel);

        Ok(PhysFrame::from_index(self.base_frame + rel as u64))
    }

    /// 複数フレームをまとめて確保する（all-or-nothing）。
    ///
    /// 途中で枯渇した場合、確保済み分を返却してから Err を返す。
    pub fn allocate_frames(&mut self, out: &mut [PhysFrame]) -> Result<(), AllocError> {
        for i in 0..out.len() {
            match self.allocate_frame() {
                Ok(frame) => out[i] = frame,
                Err(e) => {
                    // 部分確保はロールバックする
                    for taken in out.iter().take(i) {
                        self.free_frame(*taken);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// フレームを返却する。
    ///
    /// 範囲外・二重 free はプログラミングエラー:
    /// debug では debug_assert、release ではログ + return（状態は壊さない）。
    pub fn free_frame(&mut self, frame: PhysFrame) {
        if frame.number < self.base_frame {
            debug_assert!(false, "mm: free of frame below managed range");
            logging::error("mm: free_frame below managed range; ignored");
            logging::error_kv(" frame_index", frame.number);
            return;
        }

        let rel = (frame.number - self.base_frame) as usize;
        if rel >= self.total_frames {
            debug_assert!(false, "mm: free of frame above managed range");
            logging::error("mm: free_frame above managed range; ignored");
            logging::error_kv(" frame_index", frame.number);
            return;
        }

        if !self.is_allocated(rel) {
            debug_assert!(false, "mm: double free of physical frame");
            logging::error("mm: double free detected; ignored");
            logging::error_kv(" frame_index", frame.number);
            return;
        }

        self.mark_free(rel);
        self.free_stack[self.free_count] = rel as u32;
        self.free_count += 1;
    }

    pub fn free_pages(&self) -> u64 {
        self.free_count as u64
    }

    pub fn total_pages(&self) -> u64 {
        self.total_frames as u64
    }

    /// 管理範囲の先頭物理アドレス。
    pub fn base_address(&self) -> PhysAddr {
        PhysAddr(self.base_frame * PAGE_SIZE)
    }
}

/// プロセス全体で一度だけ構築されるコンテキスト。
///
/// - phys: 全コアが共有する物理ページアロケータ（排他は spin::Mutex）。
/// - 各コアの CoreLocal は &'static KernelContext を保持し、
///   「自分のコアのメモリマネージャ」は必ずここを経由して解決する。
pub struct KernelContext {
    pub phys: spin::Mutex<PhysicalPageAllocator>,
}

impl KernelContext {
    /// 静的領域に const 構築するための空コンテキスト。
    /// 使う前に phys.lock().reset(handoff) で一度だけ中身を据えること
    /// （アロケータ状態は大きいので、値としてスタック上に作らない）。
    pub const fn empty() -> Self {
        KernelContext {
            phys: spin::Mutex::new(PhysicalPageAllocator::empty()),
        }
    }

    /// 値として構築する（ホストテスト用の近道）。
    pub fn new(handoff: BootHandoff) -> Self {
        let ctx = KernelContext::empty();
        ctx.phys.lock().reset(handoff);
        ctx
    }

    /// 起動時に記録した handoff（レポート系の基準値）。
    pub fn boot_handoff(&self) -> BootHandoff {
        self.phys.lock().boot_handoff()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handoff(pages: u64) -> BootHandoff {
        BootHandoff::new(PhysAddr(0x10_0000), pages)
    }

    #[test]
    fn conservation_across_allocate_free_sequences() {
        let mut alloc = PhysicalPageAllocator::new(test_handoff(64));
        let total = alloc.total_pages();
        assert_eq!(total, 64);

        let mut held = [PhysFrame::from_index(0); 16];
        alloc.allocate_frames(&mut held).unwrap();
        assert_eq!(alloc.free_pages() + 16, total);

        // 半分返す
        for frame in held.iter().take(8) {
            alloc.free_frame(*frame);
        }
        assert_eq!(alloc.free_pages() + 8, total);

        // 残りも返す
        for frame in held.iter().skip(8) {
            alloc.free_frame(*frame);
        }
        assert_eq!(alloc.free_pages(), total);
    }

    #[test]
    fn allocate_returns_distinct_frames_in_managed_range() {
        let mut alloc = PhysicalPageAllocator::new(test_handoff(8));
        let base = alloc.base_address().frame().number;

        let a = alloc.allocate_frame().unwrap();
        let b = alloc.allocate_frame().unwrap();
        assert_ne!(a, b);
        assert!(a.number >= base && a.number < base + 8);
        assert!(b.number >= base && b.number < base + 8);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut alloc = PhysicalPageAllocator::new(test_handoff(2));
        alloc.allocate_frame().unwrap();
        alloc.allocate_frame().unwrap();
        assert_eq!(alloc.allocate_frame(), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn failed_batch_rolls_back_partial_allocation() {
        let mut alloc = PhysicalPageAllocator::new(test_handoff(4));
        let mut out = [PhysFrame::from_index(0); 8];

        assert_eq!(alloc.allocate_frames(&mut out), Err(AllocError::OutOfMemory));
        // 部分確保が返却されている
        assert_eq!(alloc.free_pages(), alloc.total_pages());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal_in_debug_builds() {
        let mut alloc = PhysicalPageAllocator::new(test_handoff(4));
        let frame = alloc.allocate_frame().unwrap();
        alloc.free_frame(frame);
        alloc.free_frame(frame);
    }

    #[test]
    #[should_panic(expected = "managed range")]
    fn free_outside_managed_range_is_fatal_in_debug_builds() {
        let mut alloc = PhysicalPageAllocator::new(test_handoff(4));
        alloc.free_frame(PhysFrame::from_index(1));
    }

    #[test]
    fn context_records_boot_handoff() {
        let ctx = KernelContext::new(test_handoff(16));
        assert_eq!(ctx.boot_handoff().total_free_pages, 16);
        assert_eq!(ctx.phys.lock().total_pages(), 16);
    }

    #[test]
    fn static_context_is_seeded_in_place() {
        // 起動時と同じ形: const 構築した静的領域へ reset で中身を据える
        static CTX: KernelContext = KernelContext::empty();

        assert_eq!(
            CTX.phys.lock().allocate_frame(),
            Err(AllocError::OutOfMemory)
        );

        CTX.phys.lock().reset(test_handoff(32));
        assert_eq!(CTX.phys.lock().total_pages(), 32);
        assert_eq!(CTX.boot_handoff().total_free_pages, 32);

        let frame = CTX.phys.lock().allocate_frame().unwrap();
        assert_eq!(CTX.phys.lock().free_pages(), 31);
        CTX.phys.lock().free_frame(frame);
        assert_eq!(CTX.phys.lock().free_pages(), 32);
    }
}
