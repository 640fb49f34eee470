// kernel/src/kernel/entry.rs
//
// parcel-os: kernel entry glue
//
// 役割:
// - KernelContext を一度だけ構築し、ブートコアの CoreLocal を据える。
// - ヒープ・カーネルスタック・IPC（発見 → 要求 → 応答）の起動時シナリオを
//   1 本走らせ、イベントログをダンプして停止する。
//
// やらないこと:
// - IPC / レジストリ / メモリ管理の中身（それは KernelState / CoreLocal の責務）

use core::sync::atomic::{AtomicBool, Ordering};

use crate::mem::addr::PAGE_SIZE;
use crate::mem::layout;
use crate::mem::paging::PageFlags;
use crate::mm::KernelContext;
use crate::types::BootHandoff;
use crate::{arch, logging};

use super::core_local::{self, with_current_core, CoreLocal};
use super::ipc::Recipient;
use super::message::{
    extract_message, pack_message, GetPhysicalReport, MessageBody, MessageNamespace,
    PhysicalReport,
};
use super::registry::{
    handle_map_request, MapReply, MapRequest, NotifyServiceRegistered, RegisterService,
    ServiceKind,
};
use super::syscall::Syscall;
use super::{KernelState, TaskId, KERNEL_TASK_ID};

// アロケータ状態が大きいので、静的領域（.bss）に const 構築しておき
// ブートスタック上に値を作らない。中身は start() が reset で据える。
static CONTEXT: KernelContext = KernelContext::empty();
static CONTEXT_SEEDED: AtomicBool = AtomicBool::new(false);

/// ブートコアでの本体エントリ。main.rs が handoff を組み立てて呼ぶ。
pub fn start(handoff: BootHandoff) -> ! {
    logging::info("kernel::entry::start()");

    if CONTEXT_SEEDED.swap(true, Ordering::SeqCst) {
        logging::error("kernel::entry: start() called twice; halting");
        arch::halt_loop();
    }
    CONTEXT.phys.lock().reset(handoff);

    let ctx = &CONTEXT;
    let core = core_local::setup_initial_core(ctx);

    heap_smoke_test(core);
    stack_smoke_test(core);

    // task0 = init（クライアント）、task1 = Memory サービス
    let mut ks = KernelState::new(2);
    run_boot_scenario(&mut ks, ctx);

    ks.dump_events();
    ks.debug_check_invariants();

    logging::info("kernel::entry: scenario done; halting");
    arch::halt_loop();
}

/// ヒープ窓の遅延生成と allocate / reallocate / free の動作確認。
fn heap_smoke_test(core: &mut CoreLocal) {
    logging::info("entry: heap smoke test");

    let p = match core.heap_allocate(128) {
        Ok(p) => p,
        Err(_) => {
            logging::error("entry: heap allocate failed");
            return;
        }
    };
    logging::info_u64(" allocated", p as u64);

    let q = match core.heap_reallocate(p, 1024) {
        Ok(q) => q,
        Err(_) => {
            logging::error("entry: heap reallocate failed");
            core.heap_free(p);
            return;
        }
    };
    logging::info_u64(" reallocated", q as u64);

    core.heap_free(q);
    logging::info(" heap smoke test done");
}

/// カーネルスタックスロットを 2 本切って guard 越しの配置を観察する。
fn stack_smoke_test(core: &mut CoreLocal) {
    logging::info("entry: kernel stack smoke test");

    for _ in 0..2 {
        match core.allocate_kernel_stack() {
            Ok(top) => logging::info_u64(" stack_top", top.0),
            Err(_) => {
                logging::error("entry: kernel stack allocation failed");
                return;
            }
        }
    }
}

fn run_steps(ks: &mut KernelState, n: usize) {
    for _ in 0..n {
        ks.step();
    }
}

/// 発見 → レポート要求 → マップ要求 の起動時シナリオ。
fn run_boot_scenario(ks: &mut KernelState, ctx: &'static KernelContext) {
    let client = TaskId(1);

    //
    // 1. 発見: クライアントは登録より先に待ち始める
    //
    logging::info("entry: scenario 1 (discovery)");

    ks.set_pending_syscall(0, Syscall::WaitService {
        kind: ServiceKind::Memory,
    });
    ks.set_pending_syscall(1, Syscall::Send {
        recipient: Recipient::ServiceRegistryMailbox,
        msg: pack_message(KERNEL_TASK_ID, &RegisterService {
            kind: ServiceKind::Memory,
        }),
    });
    run_steps(ks, 2);

    match ks.task(0).last_received {
        Some(msg) => match extract_message::<NotifyServiceRegistered>(&msg) {
            Ok(notify) => logging::info_u64(" notified_kind", notify.kind as u64),
            Err(_) => logging::error("entry: unexpected discovery reply"),
        },
        None => logging::error("entry: discovery did not complete"),
    }

    //
    // 2. レポート: クライアントが要求し、サービスが実測値で応える
    //
    logging::info("entry: scenario 2 (physical report)");

    ks.set_pending_syscall(0, Syscall::Send {
        recipient: Recipient::Service(ServiceKind::Memory),
        msg: pack_message(KERNEL_TASK_ID, &GetPhysicalReport),
    });
    ks.set_pending_syscall(1, Syscall::Receive);
    run_steps(ks, 4);

    let report = {
        let phys = ctx.phys.lock();
        PhysicalReport {
            free_pages: phys.free_pages(),
            total_pages: phys.total_pages(),
        }
    };
    ks.set_pending_syscall(1, Syscall::Send {
        recipient: Recipient::Task(client),
        msg: pack_message(KERNEL_TASK_ID, &report),
    });
    ks.set_pending_syscall(0, Syscall::FilteredReceive {
        namespace: MessageNamespace::Memory,
        message_id: PhysicalReport::MESSAGE_ID,
    });
    run_steps(ks, 4);

    match ks.task(0).last_received {
        Some(msg) => match extract_message::<PhysicalReport>(&msg) {
            Ok(report) => {
                logging::info_u64(" free_pages", report.free_pages);
                logging::info_u64(" total_pages", report.total_pages);
            }
            Err(_) => logging::error("entry: malformed physical report"),
        },
        None => logging::error("entry: physical report did not arrive"),
    }

    //
    // 3. マップ要求: サービスが現在コアの Default ドメインへ実行する
    //
    logging::info("entry: scenario 3 (map request)");

    let request = MapRequest {
        address: layout::DEFAULT_SPACE_BASE.0 + 0x20_0000,
        size: 2 * PAGE_SIZE,
        flags: PageFlags::kernel_data().bits(),
    };
    ks.set_pending_syscall(0, Syscall::Send {
        recipient: Recipient::Service(ServiceKind::Memory),
        msg: pack_message(KERNEL_TASK_ID, &request),
    });
    ks.set_pending_syscall(1, Syscall::Receive);
    run_steps(ks, 4);

    let reply = match ks.task(1).last_received {
        Some(msg) => match extract_message::<MapRequest>(&msg) {
            Ok(req) => with_current_core(|core| handle_map_request(core, req)),
            Err(_) => {
                logging::error("entry: memory service got unexpected message");
                None
            }
        },
        None => None,
    };

    if let Some(reply) = reply {
        ks.set_pending_syscall(1, Syscall::Send {
            recipient: Recipient::Task(client),
            msg: pack_message(KERNEL_TASK_ID, &reply),
        });
        ks.set_pending_syscall(0, Syscall::FilteredReceive {
            namespace: MessageNamespace::Memory,
            message_id: MapReply::MESSAGE_ID,
        });
        run_steps(ks, 4);

        match ks.task(0).last_received {
            Some(msg) => match extract_message::<MapReply>(&msg) {
                Ok(reply) => {
                    logging::info_u64(" map_reply_address", reply.address);
                    logging::info_u64(" map_reply_status", reply.status as u64);
                }
                Err(_) => logging::error("entry: malformed map reply"),
            },
            None => logging::error("entry: map reply did not arrive"),
        }
    } else {
        logging::error("entry: map request was not served");
    }
}
