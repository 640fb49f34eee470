// kernel/src/mem/heap.rs
//
// カーネルヒープ（汎用アロケータ）。
//
// 役割:
// - ひと続きの仮想窓（ヒープ窓）の内側で allocate / aligned_allocate /
//   free / reallocate を提供する。
// - 窓の用意（フレーム確保 + Default ドメインへのマップ）は kernel::core_local の
//   責務。ここは「窓の中の切り盛り」だけを行う。
//
// 設計方針:
// - first-fit の free list。free ブロック自身に FreeBlock ノードを埋め込む。
// - ユーザブロックの直前に 16 バイトのヘッダを置き、
//   usable_size（ユーザが使える長さ）と block_back（生ブロック先頭までの距離）を
//   記録する。free / reallocate は外部テーブルなしでこのヘッダだけから動く。
// - ヘッダはユーザへ公開しない。オーバーフローでの破壊は未定義（検出しない）。
// - このアロケータは単一コア・非リエントラント前提。ロックは持たない。
//   （CoreLocal が 1 インスタンスを占有する。割り込みネスト中の呼び出しは禁止。）
//
// TODO: 隣接 free ブロックの coalesce（現状は first-fit の再利用のみ）

use core::ptr::NonNull;

use crate::logging;

/// 最小アラインメント（ヘッダもこの単位で揃える）。
pub const HEAP_ALIGN: usize = 16;

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// これ未満の端数は分割せず、ブロックに含めたまま渡す。
const MIN_SPLIT: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory,
    BadAlignment,
}

/// ユーザポインタの直前に置くヘッダ。
///
/// - usable_size: ユーザが使える長さ（バイト）
/// - block_back:  ユーザポインタから生ブロック先頭まで戻る距離（バイト）
///
/// 生ブロック全体の長さは block_back + usable_size。
#[repr(C)]
struct BlockHeader {
    usable_size: u64,
    block_back: u64,
}

/// free ブロックに埋め込むノード。
#[repr(C)]
struct FreeBlock {
    size: u64,
    next: Option<NonNull<FreeBlock>>,
}

pub struct KernelHeap {
    base: *mut u8,
    size: usize,
    free_list: Option<NonNull<FreeBlock>>,
}

// KernelHeap は CoreLocal が占有する（共有しない）ため Send だけ許す。
unsafe impl Send for KernelHeap {}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl KernelHeap {
    /// マップ済みのヒープ窓からヒープを構築する。
    ///
    /// # Safety
    /// - base..base+size が呼び出し側の責任で有効（マップ済み・専有）であること。
    /// - base は HEAP_ALIGN に揃っていること。
    pub unsafe fn create(base: *mut u8, size: usize) -> Self {
        debug_assert!(base as usize % HEAP_ALIGN == 0);
        debug_assert!(size >= MIN_SPLIT);

        let node = base as *mut FreeBlock;
        node.write(FreeBlock {
            size: size as u64,
            next: None,
        });

        KernelHeap {
            base,
            size,
            free_list: NonNull::new(node),
        }
    }

    /// size バイトを確保する（アラインメントは HEAP_ALIGN）。
    pub fn allocate(&mut self, size: usize) -> Result<*mut u8, HeapError> {
        self.aligned_allocate(HEAP_ALIGN, size)
    }

    /// align に揃えて size バイトを確保する。
    ///
    /// - align は 2 の冪であること（それ以外は BadAlignment）。
    /// - HEAP_ALIGN 未満の align は HEAP_ALIGN に引き上げる。
    pub fn aligned_allocate(&mut self, align: usize, size: usize) -> Result<*mut u8, HeapError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(HeapError::BadAlignment);
        }
        let align = align.max(HEAP_ALIGN);

        // 0 バイト要求にも有効なポインタを返す（最小 1 単位）
        let want = align_up(size.max(1), HEAP_ALIGN);

        let mut prev: Option<NonNull<FreeBlock>> = None;
        let mut cur = self.free_list;

        while let Some(node) = cur {
            let block_start = node.as_ptr() as usize;
            let block_size = unsafe { node.as_ref().size } as usize;
            let block_end = block_start + block_size;

            let user_addr = align_up(block_start + HEADER_SIZE, align);
            let needed_end = user_addr + want;

            if needed_end <= block_end {
                let next = unsafe { node.as_ref().next };

                // 末尾の余りが十分大きければ分割して free list に残す
                let (taken_end, tail) = if block_end - needed_end >= MIN_SPLIT {
                    let tail_ptr = needed_end as *mut FreeBlock;
                    unsafe {
                        tail_ptr.write(FreeBlock {
                            size: (block_end - needed_end) as u64,
                            next,
                        });
                    }
                    (needed_end, NonNull::new(tail_ptr))
                } else {
                    (block_end, next)
                };

                // cur を list から外し、tail（あれば）を継ぐ
                match prev {
                    Some(mut p) => unsafe { p.as_mut().next = tail },
                    None => self.free_list = tail,
                }

                // ヘッダを書いてユーザポインタを返す
                let header = (user_addr - HEADER_SIZE) as *mut BlockHeader;
                unsafe {
                    header.write(BlockHeader {
                        usable_size: (taken_end - user_addr) as u64,
                        block_back: (user_addr - block_start) as u64,
                    });
                }

                return Ok(user_addr as *mut u8);
            }

            prev = cur;
            cur = unsafe { node.as_ref().next };
        }

        Err(HeapError::OutOfMemory)
    }

    /// ブロックを返却する。
    ///
    /// ptr はこのヒープの allocate / aligned_allocate が返したものであること。
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            logging::error("heap: free(null); ignored");
            return;
        }
        if !self.owns(ptr) {
            debug_assert!(false, "heap: free of pointer outside heap window");
            logging::error("heap: free outside heap window; ignored");
            return;
        }

        let (block_start, block_size) = unsafe {
            let header = (ptr as usize - HEADER_SIZE) as *const BlockHeader;
            let usable = (*header).usable_size as usize;
            let back = (*header).block_back as usize;
            (ptr as usize - back, back + usable)
        };

        let node = block_start as *mut FreeBlock;
        unsafe {
            node.write(FreeBlock {
                size: block_size as u64,
                next: self.free_list,
            });
        }
        self.free_list = NonNull::new(node);
    }

    /// サイズ変更。
    ///
    /// - new_size が記録済みサイズ以下: 同じポインタをそのまま返す（縮小もコピーもしない）。
    /// - それ以外: 新規確保 → 旧サイズ分コピー → 旧ブロック返却。
    pub fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> Result<*mut u8, HeapError> {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if !self.owns(ptr) {
            debug_assert!(false, "heap: reallocate of pointer outside heap window");
            logging::error("heap: reallocate outside heap window");
            return Err(HeapError::OutOfMemory);
        }

        let old_size = unsafe {
            let header = (ptr as usize - HEADER_SIZE) as *const BlockHeader;
            (*header).usable_size as usize
        };

        if new_size <= old_size {
            return Ok(ptr);
        }

        let new_ptr = self.allocate(new_size)?;
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size);
        }
        self.free(ptr);
        Ok(new_ptr)
    }

    /// ptr がこのヒープ窓の中か（ヘッダ分の余白も確認する）。
    fn owns(&self, ptr: *mut u8) -> bool {
        let addr = ptr as usize;
        let base = self.base as usize;
        addr >= base + HEADER_SIZE && addr < base + self.size
    }

    /// free list 上の合計バイト数（観察・テスト用）。
    pub fn free_bytes(&self) -> usize {
        let mut total = 0usize;
        let mut cur = self.free_list;
        while let Some(node) = cur {
            unsafe {
                total += node.as_ref().size as usize;
                cur = node.as_ref().next;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 16 バイト境界に揃ったテスト用ヒープ窓。
    fn test_heap(size: usize) -> KernelHeap {
        let words = size / 16;
        let buf: &'static mut [u128] = vec![0u128; words].leak();
        let base = buf.as_mut_ptr() as *mut u8;
        unsafe { KernelHeap::create(base, size) }
    }

    #[test]
    fn roundtrip_preserves_written_bytes() {
        let mut heap = test_heap(4096);
        assert_eq!(heap.free_bytes(), 4096);

        let n = 100;
        let p = heap.allocate(n).unwrap();
        assert!(heap.free_bytes() < 4096);
        unsafe {
            for i in 0..n {
                *p.add(i) = (i % 251) as u8;
            }
            for i in 0..n {
                assert_eq!(*p.add(i), (i % 251) as u8);
            }
        }
        heap.free(p);
    }

    #[test]
    fn free_does_not_corrupt_unrelated_allocations() {
        let mut heap = test_heap(4096);

        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        unsafe {
            core::ptr::write_bytes(a, 0xAA, 64);
            core::ptr::write_bytes(b, 0xBB, 64);
        }

        heap.free(a);

        // a の返却後も b は無傷
        unsafe {
            for i in 0..64 {
                assert_eq!(*b.add(i), 0xBB);
            }
        }

        // 返却された領域は再利用される
        let c = heap.allocate(64).unwrap();
        unsafe {
            core::ptr::write_bytes(c, 0xCC, 64);
            for i in 0..64 {
                assert_eq!(*b.add(i), 0xBB);
            }
        }
    }

    #[test]
    fn aligned_allocate_honors_alignment() {
        let mut heap = test_heap(8192);

        for &align in &[16usize, 64, 256, 1024] {
            let p = heap.aligned_allocate(align, 48).unwrap();
            assert_eq!(p as usize % align, 0, "align={}", align);
        }

        assert_eq!(heap.aligned_allocate(24, 8), Err(HeapError::BadAlignment));
    }

    #[test]
    fn reallocate_shrink_or_equal_returns_same_pointer() {
        let mut heap = test_heap(4096);

        let p = heap.allocate(128).unwrap();
        let same = heap.reallocate(p, 128).unwrap();
        assert_eq!(same, p);

        let same = heap.reallocate(p, 16).unwrap();
        assert_eq!(same, p);
    }

    #[test]
    fn reallocate_growth_preserves_old_contents() {
        let mut heap = test_heap(4096);

        let old_size = 96;
        let p = heap.allocate(old_size).unwrap();
        unsafe {
            for i in 0..old_size {
                *p.add(i) = (i * 3 % 256) as u8;
            }
        }

        let q = heap.reallocate(p, 512).unwrap();
        assert_ne!(q, p);
        unsafe {
            for i in 0..old_size {
                assert_eq!(*q.add(i), (i * 3 % 256) as u8);
            }
        }
        heap.free(q);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut heap = test_heap(1024);
        assert_eq!(heap.allocate(4096), Err(HeapError::OutOfMemory));

        // 小さい確保を繰り返せばいずれ尽きる
        let mut last_err = None;
        for _ in 0..64 {
            if let Err(e) = heap.allocate(64) {
                last_err = Some(e);
                break;
            }
        }
        assert_eq!(last_err, Some(HeapError::OutOfMemory));
    }
}
