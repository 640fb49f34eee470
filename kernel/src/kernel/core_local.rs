// kernel/src/kernel/core_local.rs
//
// コアローカルメタデータ（CoreLocal）。
//
// 役割:
// - コアごとの AddressSpace（Default / KernelStacks）とカーネルヒープを束ね、
//   「このコアのメモリマネージャはどこか」を 1 回のポインタ参照で解決する。
// - CoreLocal のアドレスは GS base に入れる（テストでは thread_local に差し替え、
//   テストスレッド = 1 コアの見立てで同じコードを駆動する）。
//
// 設計方針:
// - 隠れたグローバルを持たない。CoreLocal は &'static KernelContext を明示的に
//   保持し、物理フレームは必ずそこを経由して確保・返却する。
// - ブートコアの CoreLocal は静的領域に置く（ヒープがまだ無い段階で必要になるため）。
//   2 コア目以降は「すでに動いているコアのヒープ」から確保する。
// - with_current_core は確保を一切しない。登録前に呼ばれたらログ + None。
// - ヒープ窓は初回利用時に遅延で作る（フレーム確保 + Default ドメインへのマップ）。
//   窓とスタック領域はコアごとに固定ストライドでずらし、複数コアが同じ
//   ハードウェアテーブルを共有していても仮想範囲が衝突しないようにする。
// - カーネルスタックは KernelStacks ドメインのスロットに置き、スロット下端の
//   guard ページは未マップのまま残す（下向きに溢れたら fault で捕まえる）。

use crate::logging;
use crate::mem::addr::{PhysFrame, VirtAddr, VirtPage, PAGE_SIZE};
use crate::mem::address_space::{
    AddressSpace, AddressSpaceDomain, AddressSpaceError, DOMAIN_COUNT,
};
use crate::mem::heap::{HeapError, KernelHeap};
use crate::mem::layout;
use crate::mem::paging::{MemAction, PageFlags};
use crate::mm::{AllocError, KernelContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreError {
    OutOfMemory,
    AddressSpace(AddressSpaceError),
    Heap(HeapError),
    /// まだこのコアに CoreLocal が登録されていない。
    NoCurrentCore,
}

impl From<AllocError> for CoreError {
    fn from(_: AllocError) -> Self {
        CoreError::OutOfMemory
    }
}

impl From<AddressSpaceError> for CoreError {
    fn from(err: AddressSpaceError) -> Self {
        CoreError::AddressSpace(err)
    }
}

impl From<HeapError> for CoreError {
    fn from(err: HeapError) -> Self {
        CoreError::Heap(err)
    }
}

pub struct CoreLocal {
    core_id: u32,
    ctx: &'static KernelContext,
    spaces: [AddressSpace; DOMAIN_COUNT],
    heap: Option<KernelHeap>,
    next_stack_slot: u64,
}

impl CoreLocal {
    pub fn new(core_id: u32, ctx: &'static KernelContext) -> Self {
        CoreLocal {
            core_id,
            ctx,
            spaces: [
                AddressSpace::new(
                    AddressSpaceDomain::Default,
                    layout::DEFAULT_SPACE_BASE,
                    layout::DEFAULT_SPACE_SIZE,
                ),
                AddressSpace::new(
                    AddressSpaceDomain::KernelStacks,
                    layout::KERNEL_STACKS_BASE,
                    layout::KERNEL_STACKS_SIZE,
                ),
            ],
            heap: None,
            next_stack_slot: 0,
        }
    }

    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    pub fn context(&self) -> &'static KernelContext {
        self.ctx
    }

    pub fn space(&self, domain: AddressSpaceDomain) -> &AddressSpace {
        &self.spaces[domain.index()]
    }

    /// この CPU のコアローカルポインタとして自分を登録する。
    pub fn install(&mut self) {
        crate::arch::cpu::install_core_base(self as *mut CoreLocal as u64);
    }

    //
    // ヒープ
    //

    /// ヒープ窓を必要なら作ってから返す（遅延初期化）。
    fn ensure_heap(&mut self) -> Result<&mut KernelHeap, CoreError> {
        if self.heap.is_none() {
            self.create_heap()?;
        }
        self.heap.as_mut().ok_or(CoreError::OutOfMemory)
    }

    /// このコアのヒープ窓の先頭ページ。コアごとに固定ストライドでずれる。
    fn heap_window_first_page(&self) -> VirtPage {
        layout::KERNEL_HEAP_BASE
            .page()
            .offset_pages(self.core_id as u64 * layout::CORE_HEAP_STRIDE_PAGES)
    }

    /// KERNEL_HEAP_PAGES 分のフレームを確保し、Default ドメイン内の
    /// このコア専用の窓へマップしてヒープを構築する。
    /// フレームが物理的に連続である必要はない。
    fn create_heap(&mut self) -> Result<(), CoreError> {
        let mut frames =
            [PhysFrame::from_index(0); layout::KERNEL_HEAP_PAGES as usize];
        self.ctx.phys.lock().allocate_frames(&mut frames)?;

        let base_page = self.heap_window_first_page();
        let flags = PageFlags::kernel_data();

        for (i, frame) in frames.iter().enumerate() {
            let page = base_page.offset_pages(i as u64);
            let action = MemAction::Map {
                page,
                frame: *frame,
                flags,
            };

            if let Err(err) = self.spaces[AddressSpaceDomain::Default.index()].apply(action) {
                logging::error("core_local: heap window mapping failed");
                logging::error_kv(" page_index", page.number);

                // ここまでのマップを戻し、残りのフレームも返却する
                self.unmap_range(AddressSpaceDomain::Default, base_page, i as u64);
                let mut phys = self.ctx.phys.lock();
                for frame in frames.iter().skip(i) {
                    phys.free_frame(*frame);
                }
                return Err(err.into());
            }

            self.apply_to_hardware(action);
        }

        let base = self.heap_window_base();
        // base..+KERNEL_HEAP_SIZE は直前のループでマップ済み・このコア専有
        self.heap = Some(unsafe { KernelHeap::create(base, layout::KERNEL_HEAP_SIZE) });
        logging::info_u64("core_local: heap window ready, pages", layout::KERNEL_HEAP_PAGES);
        Ok(())
    }

    pub fn heap_allocate(&mut self, size: usize) -> Result<*mut u8, CoreError> {
        let heap = self.ensure_heap()?;
        Ok(heap.allocate(size)?)
    }

    pub fn heap_aligned_allocate(
        &mut self,
        align: usize,
        size: usize,
    ) -> Result<*mut u8, CoreError> {
        let heap = self.ensure_heap()?;
        Ok(heap.aligned_allocate(align, size)?)
    }

    pub fn heap_reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<*mut u8, CoreError> {
        let heap = self.ensure_heap()?;
        Ok(heap.reallocate(ptr, new_size)?)
    }

    pub fn heap_free(&mut self, ptr: *mut u8) {
        match self.heap.as_mut() {
            Some(heap) => heap.free(ptr),
            None => {
                logging::error("core_local: free before heap creation; ignored");
            }
        }
    }

    //
    // Default ドメインへの範囲マップ（MapRequest の実体）
    //

    /// base から pages 分を、新規確保したフレームで Default ドメインへマップする。
    /// 途中で失敗したら全て巻き戻す（all-or-nothing）。
    pub fn map_default_range(
        &mut self,
        base: VirtAddr,
        pages: u64,
        flags: PageFlags,
    ) -> Result<(), CoreError> {
        let first_page = base.page();

        for i in 0..pages {
            // ロックガードを match に持ち込まない（Err 側で unmap_range が再ロックする）
            let allocated = self.ctx.phys.lock().allocate_frame();
            let frame = match allocated {
                Ok(frame) => frame,
                Err(err) => {
                    self.unmap_range(AddressSpaceDomain::Default, first_page, i);
                    return Err(err.into());
                }
            };

            let page = first_page.offset_pages(i);
            let action = MemAction::Map { page, frame, flags };

            if let Err(err) = self.spaces[AddressSpaceDomain::Default.index()].apply(action) {
                self.ctx.phys.lock().free_frame(frame);
                self.unmap_range(AddressSpaceDomain::Default, first_page, i);
                return Err(err.into());
            }

            self.apply_to_hardware(action);
        }

        Ok(())
    }

    //
    // カーネルスタック
    //

    /// 新しいカーネルスタックスロットを確保し、スタックトップ（排他的上端）を返す。
    ///
    /// スロット下端 STACK_GUARD_PAGES は未マップのまま残す。
    pub fn allocate_kernel_stack(&mut self) -> Result<VirtAddr, CoreError> {
        let slot = self.next_stack_slot;
        let slot_first_page = layout::KERNEL_STACKS_BASE.page().offset_pages(
            self.core_id as u64 * layout::CORE_STACK_REGION_PAGES
                + slot * layout::STACK_SLOT_PAGES,
        );
        let first_mapped = slot_first_page.offset_pages(layout::STACK_GUARD_PAGES);

        let mut frames =
            [PhysFrame::from_index(0); layout::STACK_USABLE_PAGES as usize];
        self.ctx.phys.lock().allocate_frames(&mut frames)?;

        for (i, frame) in frames.iter().enumerate() {
            let page = first_mapped.offset_pages(i as u64);
            let action = MemAction::Map {
                page,
                frame: *frame,
                flags: PageFlags::kernel_data(),
            };

            if let Err(err) =
                self.spaces[AddressSpaceDomain::KernelStacks.index()].apply(action)
            {
                logging::error("core_local: stack slot mapping failed");
                logging::error_kv(" slot", slot);

                self.unmap_range(AddressSpaceDomain::KernelStacks, first_mapped, i as u64);
                let mut phys = self.ctx.phys.lock();
                for frame in frames.iter().skip(i) {
                    phys.free_frame(*frame);
                }
                return Err(err.into());
            }

            self.apply_to_hardware(action);
        }

        self.next_stack_slot += 1;

        let top = VirtAddr(
            slot_first_page.start_address().0 + layout::STACK_SLOT_PAGES * PAGE_SIZE,
        );
        logging::info_u64("core_local: kernel stack ready, top", top.0);
        Ok(top)
    }

    //
    // 後始末・実テーブル反映
    //

    /// first_page から count ページ分のマッピングを外し、フレームを返却する。
    fn unmap_range(&mut self, domain: AddressSpaceDomain, first_page: VirtPage, count: u64) {
        for i in 0..count {
            let page = first_page.offset_pages(i);
            match self.spaces[domain.index()].unmap(page) {
                Ok(frame) => {
                    self.apply_to_hardware(MemAction::Unmap { page });
                    self.ctx.phys.lock().free_frame(frame);
                }
                Err(_) => {
                    logging::error("core_local: rollback unmap failed");
                    logging::error_kv(" page_index", page.number);
                }
            }
        }
    }

    /// 論理側で受理済みの action を実ページテーブルへ流す。
    /// ホストテストでは実テーブルが無いので何もしない。
    #[cfg(not(test))]
    fn apply_to_hardware(&self, action: MemAction) {
        let mut phys = self.ctx.phys.lock();
        unsafe {
            crate::arch::paging::apply_mem_action(action, &mut phys);
        }
    }

    #[cfg(test)]
    fn apply_to_hardware(&self, _action: MemAction) {}

    #[cfg(not(test))]
    fn heap_window_base(&self) -> *mut u8 {
        self.heap_window_first_page().start_address().0 as *mut u8
    }

    /// ホストテスト用のヒープ窓。実アドレス空間の代わりに leak したバッファを使う。
    #[cfg(test)]
    fn heap_window_base(&self) -> *mut u8 {
        let words = layout::KERNEL_HEAP_SIZE / 16;
        vec![0u128; words].leak().as_mut_ptr() as *mut u8
    }
}

//
// ──────────────────────────────────────────────
// コアのセットアップと現在コアの解決
// ──────────────────────────────────────────────
//

/// ブートコア（core 0）の CoreLocal を静的領域に構築して登録する。
/// 一度しか呼べない。二度目はログを残して halt する。
#[cfg(not(test))]
pub fn setup_initial_core(ctx: &'static KernelContext) -> &'static mut CoreLocal {
    use core::mem::MaybeUninit;
    use core::sync::atomic::{AtomicBool, Ordering};

    static CLAIMED: AtomicBool = AtomicBool::new(false);
    static mut STORAGE: MaybeUninit<CoreLocal> = MaybeUninit::uninit();

    if CLAIMED.swap(true, Ordering::SeqCst) {
        logging::error("core_local: setup_initial_core called twice; halting");
        crate::arch::halt_loop();
    }

    // CLAIMED によりこの領域に触るのは最初の呼び出しだけ
    let core = unsafe { (*core::ptr::addr_of_mut!(STORAGE)).write(CoreLocal::new(0, ctx)) };
    core.install();
    logging::info("core_local: boot core installed");
    core
}

/// 2 コア目以降の CoreLocal を、現在コアのヒープから構築する。
///
/// 返った CoreLocal はそのコアの CPU 上で install() すること
/// （ここでは登録しない。呼び出しコアの GS base を壊さないため）。
pub fn setup_core(
    core_id: u32,
    ctx: &'static KernelContext,
) -> Result<&'static mut CoreLocal, CoreError> {
    let ptr = with_current_core(|core| {
        core.heap_aligned_allocate(
            core::mem::align_of::<CoreLocal>(),
            core::mem::size_of::<CoreLocal>(),
        )
    })
    .ok_or(CoreError::NoCurrentCore)??;

    let cell = ptr as *mut CoreLocal;
    // ヒープから出たばかりの専有領域への書き込み
    unsafe {
        cell.write(CoreLocal::new(core_id, ctx));
        Ok(&mut *cell)
    }
}

/// 現在コアの CoreLocal を借りて処理する。確保は一切しない。
/// 未登録（ブート極初期・テストで install 前）ならログ + None。
pub fn with_current_core<R>(f: impl FnOnce(&mut CoreLocal) -> R) -> Option<R> {
    let addr = crate::arch::cpu::core_base();
    if addr == 0 {
        logging::error("core_local: no CoreLocal installed on this core");
        return None;
    }

    let p = addr as *mut CoreLocal;

    // Safety:
    // - install() は CoreLocal の生存期間中のみ呼ばれる前提
    // - コアローカルなので同じポインタを複数コアが触ることはない
    Some(unsafe { f(&mut *p) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::addr::PhysAddr;
    use crate::types::BootHandoff;

    fn test_context(pages: u64) -> &'static KernelContext {
        Box::leak(Box::new(KernelContext::new(BootHandoff::new(
            PhysAddr(0x10_0000),
            pages,
        ))))
    }

    #[test]
    fn heap_window_is_created_lazily_and_only_once() {
        let ctx = test_context(256);
        let mut core = CoreLocal::new(0, ctx);

        let total = ctx.phys.lock().total_pages();
        assert_eq!(ctx.phys.lock().free_pages(), total);
        assert_eq!(core.space(AddressSpaceDomain::Default).mapping_count(), 0);

        let p = core.heap_allocate(64).unwrap();
        assert!(!p.is_null());

        let heap_pages = layout::KERNEL_HEAP_PAGES;
        assert_eq!(
            core.space(AddressSpaceDomain::Default).mapping_count(),
            heap_pages as usize
        );
        assert_eq!(ctx.phys.lock().free_pages(), total - heap_pages);

        // 2 回目の確保で窓が増えないこと
        let q = core.heap_allocate(64).unwrap();
        assert_ne!(p, q);
        assert_eq!(ctx.phys.lock().free_pages(), total - heap_pages);
    }

    #[test]
    fn heap_wrappers_roundtrip_through_the_window() {
        let mut core = CoreLocal::new(0, test_context(256));

        let n = 200;
        let p = core.heap_allocate(n).unwrap();
        unsafe {
            for i in 0..n {
                *p.add(i) = (i % 256) as u8;
            }
        }

        let q = core.heap_reallocate(p, 1024).unwrap();
        unsafe {
            for i in 0..n {
                assert_eq!(*q.add(i), (i % 256) as u8);
            }
        }
        core.heap_free(q);
    }

    #[test]
    fn heap_creation_fails_cleanly_when_frames_run_out() {
        // KERNEL_HEAP_PAGES 未満しか管理していない文脈
        let ctx = test_context(16);
        let mut core = CoreLocal::new(0, ctx);

        let err = core.heap_allocate(64).unwrap_err();
        assert_eq!(err, CoreError::OutOfMemory);

        // 何も漏れていない
        assert_eq!(ctx.phys.lock().free_pages(), 16);
        assert_eq!(core.space(AddressSpaceDomain::Default).mapping_count(), 0);
    }

    #[test]
    fn kernel_stacks_get_distinct_slots_with_guard_gaps() {
        let ctx = test_context(256);
        let mut core = CoreLocal::new(0, ctx);
        let total = ctx.phys.lock().total_pages();

        let top_a = core.allocate_kernel_stack().unwrap();
        let top_b = core.allocate_kernel_stack().unwrap();

        // スロットは固定ストライドで離れる
        assert_eq!(
            top_b.0 - top_a.0,
            layout::STACK_SLOT_PAGES * PAGE_SIZE
        );

        // スロット下端の guard ページは未マップ
        let slot_a_first = layout::KERNEL_STACKS_BASE.page();
        assert!(core
            .space(AddressSpaceDomain::KernelStacks)
            .lookup(slot_a_first)
            .is_none());
        assert!(core
            .space(AddressSpaceDomain::KernelStacks)
            .lookup(slot_a_first.offset_pages(layout::STACK_GUARD_PAGES))
            .is_some());

        // 消費フレームは usable 分だけ
        assert_eq!(
            ctx.phys.lock().free_pages(),
            total - 2 * layout::STACK_USABLE_PAGES
        );
    }

    #[test]
    fn cores_get_disjoint_heap_and_stack_windows() {
        let ctx = test_context(512);
        let mut core0 = CoreLocal::new(0, ctx);
        let mut core1 = CoreLocal::new(1, ctx);

        core0.heap_allocate(64).unwrap();
        core1.heap_allocate(64).unwrap();

        // ヒープ窓は Default ドメイン内でコアごとにずれ、互いの窓には触れない
        let window0 = layout::KERNEL_HEAP_BASE.page();
        let window1 = window0.offset_pages(layout::CORE_HEAP_STRIDE_PAGES);
        assert!(core0
            .space(AddressSpaceDomain::Default)
            .lookup(window0)
            .is_some());
        assert!(core0
            .space(AddressSpaceDomain::Default)
            .lookup(window1)
            .is_none());
        assert!(core1
            .space(AddressSpaceDomain::Default)
            .lookup(window1)
            .is_some());
        assert!(core1
            .space(AddressSpaceDomain::Default)
            .lookup(window0)
            .is_none());

        // スタック領域もコアごとの固定ストライドで離れる
        let top0 = core0.allocate_kernel_stack().unwrap();
        let top1 = core1.allocate_kernel_stack().unwrap();
        assert_eq!(
            top1.0 - top0.0,
            layout::CORE_STACK_REGION_PAGES * PAGE_SIZE
        );
    }

    #[test]
    fn map_default_range_rolls_back_on_failure() {
        // ヒープ分 + 2 ページしか無い文脈で 4 ページ要求する
        let ctx = test_context(2);
        let mut core = CoreLocal::new(0, ctx);

        let base = layout::DEFAULT_SPACE_BASE;
        let err = core
            .map_default_range(base, 4, PageFlags::kernel_data())
            .unwrap_err();
        assert_eq!(err, CoreError::OutOfMemory);

        assert_eq!(ctx.phys.lock().free_pages(), 2);
        assert_eq!(core.space(AddressSpaceDomain::Default).mapping_count(), 0);
    }

    #[test]
    fn map_request_is_served_against_default_domain() {
        use crate::kernel::registry::{
            handle_map_request, MapRequest, MAP_STATUS_FAILED, MAP_STATUS_OK,
        };

        let ctx = test_context(256);
        let mut core = CoreLocal::new(0, ctx);

        let addr = layout::DEFAULT_SPACE_BASE.0 + 0x10_0000;
        let reply = handle_map_request(&mut core, MapRequest {
            address: addr,
            size: 3 * PAGE_SIZE,
            flags: PageFlags::kernel_data().bits(),
        });
        assert_eq!(reply.status, MAP_STATUS_OK);
        assert_eq!(reply.address, addr);
        assert_eq!(core.space(AddressSpaceDomain::Default).mapping_count(), 3);

        // ページ境界に乗っていない要求は拒否
        let reply = handle_map_request(&mut core, MapRequest {
            address: addr + 7,
            size: PAGE_SIZE,
            flags: PageFlags::kernel_data().bits(),
        });
        assert_eq!(reply.status, MAP_STATUS_FAILED);
    }

    #[test]
    fn with_current_core_resolves_installed_core() {
        let core: &'static mut CoreLocal = Box::leak(Box::new(CoreLocal::new(3, test_context(64))));
        core.install();

        let id = with_current_core(|c| c.core_id());
        assert_eq!(id, Some(3));
    }

    #[test]
    fn with_current_core_before_install_is_none() {
        // このテストスレッドでは何も install していない
        assert!(with_current_core(|c| c.core_id()).is_none());
    }

    #[test]
    fn secondary_core_is_allocated_from_current_cores_heap() {
        let ctx = test_context(256);
        let boot: &'static mut CoreLocal = Box::leak(Box::new(CoreLocal::new(0, ctx)));
        boot.install();

        let secondary = setup_core(1, ctx).unwrap();
        assert_eq!(secondary.core_id(), 1);

        // ブートコアのヒープ窓が作られている（= そこから切り出された）
        let mapped = with_current_core(|c| {
            c.space(AddressSpaceDomain::Default).mapping_count()
        })
        .unwrap();
        assert_eq!(mapped, layout::KERNEL_HEAP_PAGES as usize);
    }

    #[test]
    fn setup_core_without_current_core_fails() {
        let ctx = test_context(64);
        let err = setup_core(1, ctx).err();
        assert_eq!(err, Some(CoreError::NoCurrentCore));
    }
}
