// kernel/src/kernel/ipc.rs
//
// IPC（非同期 send / ブロッキング receive / フィルタ付き receive）
// - 宛先は TaskId 直指定、ServiceKind 経由、またはカーネル内レジストリ mailbox。
// - KernelState の ipc_* は、syscall 経由または起動時の段取りコードから呼ばれる。
//
// 設計メモ:
// - 「前提崩れ」は panic せず、ログ＋return（fail-safe）で状態破壊を避ける。
// - フィルタ付き receive は lossy（仕様）: フィルタに一致しない着信・滞留分は
//   破棄する。ただし破棄は必ず counters.messages_discarded と
//   MessageDiscarded イベントに残す（静かに消さない）。
// - 同一送信者からのメッセージ順序は mailbox（FIFO リング）が保証する。
//
// ★fastpath/slowpath 分離 + counters:
// - 即時配達 / queue / block / discard でカウンタを増やす（ログ量は増やさない）

use super::message::{IpcError, Message, MessageNamespace};
use super::registry::ServiceKind;
use super::trace::{self, IpcPathEvent};
use super::{BlockedReason, KernelState, LogEvent, TaskId, TaskState};
use crate::logging;

/// send の宛先。
#[derive(Clone, Copy, Debug)]
pub enum Recipient {
    /// TaskId 直指定。
    Task(TaskId),
    /// レジストリで解決されるサービス宛て。
    Service(ServiceKind),
    /// カーネル内で処理されるサービスレジストリの mailbox。
    ServiceRegistryMailbox,
}

impl KernelState {
    /// sender_idx のタスクとして recipient へ msg を送る。
    ///
    /// - 受信側がこのメッセージを待ってブロック中なら即時配達して起こす。
    /// - それ以外は受信側 mailbox に積む（満杯なら Err(MailboxFull)）。
    /// - ServiceRegistryMailbox 宛ては配達時点でカーネルが処理する。
    pub fn ipc_send(
        &mut self,
        sender_idx: usize,
        recipient: Recipient,
        mut msg: Message,
    ) -> Result<(), IpcError> {
        if sender_idx >= self.num_tasks {
            logging::error("ipc: send from missing task; dropped");
            return Err(IpcError::NoSuchTask);
        }

        // 送信者はカーネルが決める（ヘッダの詐称を許さない）
        msg.header.sender = self.tasks[sender_idx].id;

        let receiver_idx = match recipient {
            Recipient::Task(id) => match self.task_index_of(id) {
                Some(idx) => idx,
                None => {
                    logging::error("ipc: send to missing task");
                    logging::error_kv(" task_id", id.0 as u64);
                    return Err(IpcError::NoSuchTask);
                }
            },
            Recipient::Service(kind) => match self.lookup_service(kind) {
                Some(id) => match self.task_index_of(id) {
                    Some(idx) => idx,
                    None => {
                        logging::error("ipc: registry points at missing task");
                        logging::error_kv(" task_id", id.0 as u64);
                        return Err(IpcError::NoSuchTask);
                    }
                },
                None => {
                    logging::error("ipc: send to unregistered service");
                    logging::error_kv(" service_kind", kind as u64);
                    return Err(IpcError::ServiceNotRegistered);
                }
            },
            Recipient::ServiceRegistryMailbox => {
                trace::trace_ipc_path(IpcPathEvent::RegistryHandled);
                self.handle_registry_message(msg);
                return Ok(());
            }
        };

        self.deliver_message(receiver_idx, msg)
    }

    /// 受信側タスクへの配達の一本道。カーネル発の通知もここを通る。
    pub(super) fn deliver_message(
        &mut self,
        receiver_idx: usize,
        msg: Message,
    ) -> Result<(), IpcError> {
        let receiver_id = self.tasks[receiver_idx].id;
        let namespace = msg.header.namespace;
        let message_id = msg.header.message_id;

        self.counters.messages_sent += 1;
        self.push_event(LogEvent::MessageQueued {
            sender: msg.header.sender,
            receiver: receiver_id,
            namespace,
            message_id,
        });

        if self.tasks[receiver_idx].state == TaskState::Blocked {
            match self.tasks[receiver_idx].blocked_reason {
                Some(BlockedReason::Receive) => {
                    return self.deliver_and_wake(receiver_idx, msg);
                }
                Some(BlockedReason::FilteredReceive {
                    namespace: want_ns,
                    message_id: want_id,
                }) => {
                    if want_ns == namespace && want_id == message_id {
                        return self.deliver_and_wake(receiver_idx, msg);
                    }

                    // フィルタ不一致: lossy 仕様により破棄（必ず痕跡を残す）
                    trace::trace_ipc_path(IpcPathEvent::FilteredDiscard);
                    self.counters.messages_discarded += 1;
                    self.push_event(LogEvent::MessageDiscarded {
                        receiver: receiver_id,
                        namespace,
                        message_id,
                    });
                    logging::error("ipc: filtered receiver discarded message");
                    logging::error_kv(" receiver", receiver_id.0 as u64);
                    logging::error_kv(" namespace", namespace as u64);
                    logging::error_kv(" message_id", message_id as u64);
                    return Ok(());
                }
                None => {
                    logging::error("ipc: blocked task without reason; queueing anyway");
                }
            }
        }

        trace::trace_ipc_path(IpcPathEvent::SendQueued);
        if self.tasks[receiver_idx].mailbox.push(msg) {
            Ok(())
        } else {
            logging::error("ipc: receiver mailbox full");
            logging::error_kv(" receiver", receiver_id.0 as u64);
            Err(IpcError::MailboxFull)
        }
    }

    fn deliver_and_wake(&mut self, receiver_idx: usize, msg: Message) -> Result<(), IpcError> {
        trace::trace_ipc_path(IpcPathEvent::DeliverImmediate);

        self.counters.messages_delivered += 1;
        self.push_event(LogEvent::MessageDelivered {
            receiver: self.tasks[receiver_idx].id,
            namespace: msg.header.namespace,
            message_id: msg.header.message_id,
        });

        self.wake_task(receiver_idx, Some(msg));
        Ok(())
    }

    /// 無条件 receive。
    ///
    /// - mailbox にあれば先頭を返す（fastpath）。
    /// - なければ呼び出しタスクを Blocked(Receive) にして None を返す。
    ///   配達は wake 時に last_received へ置かれる。
    pub fn ipc_receive(&mut self, caller_idx: usize) -> Option<Message> {
        if caller_idx != self.current_task {
            logging::error("ipc: receive from non-running task; ignored");
            logging::error_kv(" task_index", caller_idx as u64);
            return None;
        }

        if let Some(msg) = self.tasks[caller_idx].mailbox.pop() {
            trace::trace_ipc_path(IpcPathEvent::RecvImmediate);
            self.counters.recv_immediate += 1;
            self.counters.messages_delivered += 1;
            self.push_event(LogEvent::MessageDelivered {
                receiver: self.tasks[caller_idx].id,
                namespace: msg.header.namespace,
                message_id: msg.header.message_id,
            });
            self.tasks[caller_idx].last_received = Some(msg);
            return Some(msg);
        }

        trace::trace_ipc_path(IpcPathEvent::RecvBlocked);
        self.counters.recv_blocked += 1;
        self.block_current(BlockedReason::Receive);
        None
    }

    /// フィルタ付き receive。
    ///
    /// - mailbox を先頭から見て、一致するものが出るまでの滞留分は破棄する
    ///   （lossy、仕様。破棄はカウンタとイベントに残る）。
    /// - 一致が無ければ Blocked(FilteredReceive) になり、以後の着信も
    ///   フィルタ不一致なら破棄される。
    pub fn ipc_receive_filtered(
        &mut self,
        caller_idx: usize,
        namespace: MessageNamespace,
        message_id: u32,
    ) -> Option<Message> {
        if caller_idx != self.current_task {
            logging::error("ipc: filtered receive from non-running task; ignored");
            logging::error_kv(" task_index", caller_idx as u64);
            return None;
        }

        let caller_id = self.tasks[caller_idx].id;

        while let Some(msg) = self.tasks[caller_idx].mailbox.pop() {
            if msg.header.namespace == namespace && msg.header.message_id == message_id {
                trace::trace_ipc_path(IpcPathEvent::RecvImmediate);
                self.counters.recv_immediate += 1;
                self.counters.messages_delivered += 1;
                self.push_event(LogEvent::MessageDelivered {
                    receiver: caller_id,
                    namespace,
                    message_id,
                });
                self.tasks[caller_idx].last_received = Some(msg);
                return Some(msg);
            }

            trace::trace_ipc_path(IpcPathEvent::FilteredDiscard);
            self.counters.messages_discarded += 1;
            self.push_event(LogEvent::MessageDiscarded {
                receiver: caller_id,
                namespace: msg.header.namespace,
                message_id: msg.header.message_id,
            });
            logging::error("ipc: filtered receive discarded queued message");
            logging::error_kv(" receiver", caller_id.0 as u64);
            logging::error_kv(" namespace", msg.header.namespace as u64);
            logging::error_kv(" message_id", msg.header.message_id as u64);
        }

        trace::trace_ipc_path(IpcPathEvent::RecvBlocked);
        self.counters.recv_blocked += 1;
        self.block_current(BlockedReason::FilteredReceive {
            namespace,
            message_id,
        });
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::message::{
        extract_message, pack_message, GetPhysicalReport, KeyEvent, MessageBody, PhysicalReport,
        ReadResult,
    };
    use super::*;
    use crate::kernel::MAILBOX_CAP;

    fn key_msg(code: u32) -> Message {
        pack_message(TaskId(0), &KeyEvent { code })
    }

    #[test]
    fn send_to_ready_task_queues_and_receive_pops_in_order() {
        let mut ks = KernelState::new(2);

        ks.ipc_send(1, Recipient::Task(TaskId(1)), key_msg(10)).unwrap();
        ks.ipc_send(1, Recipient::Task(TaskId(1)), key_msg(11)).unwrap();

        let first = ks.ipc_receive(0).unwrap();
        let second = ks.ipc_receive(0).unwrap();
        assert_eq!(extract_message::<KeyEvent>(&first).unwrap().code, 10);
        assert_eq!(extract_message::<KeyEvent>(&second).unwrap().code, 11);

        // 送信者はカーネルが上書きする
        assert_eq!(first.header.sender, TaskId(2));
    }

    #[test]
    fn receive_on_empty_mailbox_blocks_and_send_wakes() {
        let mut ks = KernelState::new(2);

        // task1 (index 1) を走らせてから receive でブロックさせる
        ks.schedule_next_task();
        assert_eq!(ks.current_task_index(), 1);
        assert!(ks.ipc_receive(1).is_none());
        assert_eq!(ks.task(1).state, TaskState::Blocked);

        ks.schedule_next_task();
        assert_eq!(ks.current_task_index(), 0);

        // 送信で即時配達・wake される
        ks.ipc_send(0, Recipient::Task(TaskId(2)), key_msg(5)).unwrap();
        assert_eq!(ks.task(1).state, TaskState::Ready);
        let msg = ks.task(1).last_received.unwrap();
        assert_eq!(extract_message::<KeyEvent>(&msg).unwrap().code, 5);
        assert_eq!(ks.counters().messages_delivered, 1);
    }

    #[test]
    fn filtered_receiver_discards_mismatched_arrivals() {
        let mut ks = KernelState::new(2);

        ks.schedule_next_task();
        assert!(ks
            .ipc_receive_filtered(1, MessageNamespace::Memory, PhysicalReport::MESSAGE_ID)
            .is_none());
        ks.schedule_next_task();

        // フィルタ不一致の着信は破棄され、受信側はブロックのまま
        ks.ipc_send(0, Recipient::Task(TaskId(2)), key_msg(1)).unwrap();
        assert_eq!(ks.task(1).state, TaskState::Blocked);
        assert_eq!(ks.counters().messages_discarded, 1);

        let mut discard_events = 0;
        ks.for_each_event(|ev| {
            if let LogEvent::MessageDiscarded { .. } = ev {
                discard_events += 1;
            }
        });
        assert_eq!(discard_events, 1);

        // 一致する着信で起きる
        let report = pack_message(
            TaskId(0),
            &PhysicalReport {
                free_pages: 3,
                total_pages: 4,
            },
        );
        ks.ipc_send(0, Recipient::Task(TaskId(2)), report).unwrap();
        assert_eq!(ks.task(1).state, TaskState::Ready);
        let msg = ks.task(1).last_received.unwrap();
        let decoded: PhysicalReport = extract_message(&msg).unwrap();
        assert_eq!(decoded.free_pages, 3);
    }

    #[test]
    fn filtered_receive_drains_mismatched_backlog() {
        let mut ks = KernelState::new(2);

        // 滞留: 不一致 2 通 + 一致 1 通
        ks.ipc_send(1, Recipient::Task(TaskId(1)), key_msg(1)).unwrap();
        ks.ipc_send(
            1,
            Recipient::Task(TaskId(1)),
            pack_message(TaskId(0), &ReadResult { len: 8 }),
        )
        .unwrap();
        ks.ipc_send(
            1,
            Recipient::Task(TaskId(1)),
            pack_message(TaskId(0), &GetPhysicalReport),
        )
        .unwrap();

        let msg = ks
            .ipc_receive_filtered(0, MessageNamespace::Memory, GetPhysicalReport::MESSAGE_ID)
            .unwrap();
        assert!(extract_message::<GetPhysicalReport>(&msg).is_ok());

        assert_eq!(ks.counters().messages_discarded, 2);
        assert!(ks.task(0).mailbox.is_empty());
    }

    #[test]
    fn mailbox_overflow_is_reported() {
        let mut ks = KernelState::new(2);

        for i in 0..MAILBOX_CAP {
            ks.ipc_send(1, Recipient::Task(TaskId(1)), key_msg(i as u32))
                .unwrap();
        }

        let err = ks
            .ipc_send(1, Recipient::Task(TaskId(1)), key_msg(99))
            .unwrap_err();
        assert_eq!(err, IpcError::MailboxFull);
    }

    #[test]
    fn send_to_missing_targets_is_rejected() {
        let mut ks = KernelState::new(2);

        let err = ks
            .ipc_send(0, Recipient::Task(TaskId(42)), key_msg(0))
            .unwrap_err();
        assert_eq!(err, IpcError::NoSuchTask);

        let err = ks
            .ipc_send(0, Recipient::Service(ServiceKind::Vfs), key_msg(0))
            .unwrap_err();
        assert_eq!(err, IpcError::ServiceNotRegistered);
    }
}
