// kernel/src/kernel/trace.rs
//
// 低コスト trace（観測性）を 1 箇所に集約する。
// - syscall 境界（Send/Receive/FilteredReceive/WaitService の入口）を trace できる
// - IPC 内部の “経路”（即時配達 / queue / block / discard）を trace できる
//
// 設計方針:
// - logging 側に新 API を要求しない（info / info_u64 のみで完結）
// - TaskId の実体型に依存しない（newtype でもOK）
// - no_std 前提で heap 確保なし（固定文字列 + u64）
// - unsafe はここだけに閉じ込める
//
// feature:
// - ipc_trace_syscall: syscall 境界 trace を有効化
// - ipc_trace_paths:   経路 trace を有効化（ipc_trace_syscall を内包）

use super::TaskId;

#[cfg(feature = "ipc_trace_syscall")]
#[derive(Clone, Copy)]
pub enum IpcSyscallKind {
    Send,
    Receive,
    FilteredReceive,
    WaitService,
}

// IpcPathEvent は feature off でも常に存在させる（呼び出し側を汚さない）。
#[derive(Clone, Copy)]
pub enum IpcPathEvent {
    DeliverImmediate,
    SendQueued,
    RecvImmediate,
    RecvBlocked,
    FilteredDiscard,
    RegistryHandled,
}

/// syscall 境界 trace（入口）: send
#[inline(always)]
pub fn trace_syscall_send(tid: &TaskId) {
    #[cfg(feature = "ipc_trace_syscall")]
    trace_syscall(IpcSyscallKind::Send, tid);
    #[cfg(not(feature = "ipc_trace_syscall"))]
    {
        let _ = tid;
    }
}

/// syscall 境界 trace（入口）: receive
#[inline(always)]
pub fn trace_syscall_receive(tid: &TaskId) {
    #[cfg(feature = "ipc_trace_syscall")]
    trace_syscall(IpcSyscallKind::Receive, tid);
    #[cfg(not(feature = "ipc_trace_syscall"))]
    {
        let _ = tid;
    }
}

/// syscall 境界 trace（入口）: filtered receive
#[inline(always)]
pub fn trace_syscall_filtered_receive(tid: &TaskId) {
    #[cfg(feature = "ipc_trace_syscall")]
    trace_syscall(IpcSyscallKind::FilteredReceive, tid);
    #[cfg(not(feature = "ipc_trace_syscall"))]
    {
        let _ = tid;
    }
}

/// syscall 境界 trace（入口）: wait service
#[inline(always)]
pub fn trace_syscall_wait_service(tid: &TaskId) {
    #[cfg(feature = "ipc_trace_syscall")]
    trace_syscall(IpcSyscallKind::WaitService, tid);
    #[cfg(not(feature = "ipc_trace_syscall"))]
    {
        let _ = tid;
    }
}

/// IPC 内部の経路 trace（出口）
/// - ipc_trace_paths feature の時だけ 1 行を必ず出す
#[inline(always)]
pub fn trace_ipc_path(ev: IpcPathEvent) {
    #[cfg(feature = "ipc_trace_paths")]
    {
        match ev {
            IpcPathEvent::DeliverImmediate => {
                crate::logging::info("ipc_trace_paths deliver=immediate")
            }
            IpcPathEvent::SendQueued => crate::logging::info("ipc_trace_paths send=queued"),
            IpcPathEvent::RecvImmediate => crate::logging::info("ipc_trace_paths recv=immediate"),
            IpcPathEvent::RecvBlocked => crate::logging::info("ipc_trace_paths recv=blocked"),
            IpcPathEvent::FilteredDiscard => {
                crate::logging::info("ipc_trace_paths filtered=discard")
            }
            IpcPathEvent::RegistryHandled => {
                crate::logging::info("ipc_trace_paths registry=handled")
            }
        }
    }
    #[cfg(not(feature = "ipc_trace_paths"))]
    {
        let _ = ev;
    }
}

#[cfg(feature = "ipc_trace_syscall")]
fn trace_syscall(kind: IpcSyscallKind, tid: &TaskId) {
    match kind {
        IpcSyscallKind::Send => crate::logging::info("ipc_trace kind=send"),
        IpcSyscallKind::Receive => crate::logging::info("ipc_trace kind=receive"),
        IpcSyscallKind::FilteredReceive => crate::logging::info("ipc_trace kind=filtered_receive"),
        IpcSyscallKind::WaitService => crate::logging::info("ipc_trace kind=wait_service"),
    }

    crate::logging::info_u64("task_id_hash", stable_hash64_of_bytes(tid));
}

/// 値のメモリ表現（raw bytes）を FNV-1a 64bit でハッシュする。
///
/// NOTE:
/// - これは “識別用のデバッグハッシュ” であり、永続IDではない。
/// - unsafe はこの関数に閉じ込める。
#[cfg(feature = "ipc_trace_syscall")]
fn stable_hash64_of_bytes<T>(v: &T) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut h = FNV_OFFSET;
    let p = (v as *const T) as *const u8;
    let n = core::mem::size_of::<T>();

    // 生バイト列を読む（デバッグ用途のハッシュなのでこれで十分）
    let bytes = unsafe { core::slice::from_raw_parts(p, n) };
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}
