// kernel/src/kernel/registry.rs
//
// サービスレジストリ + 発見プロトコル。
//
// 役割:
// - ServiceKind → 提供タスク（TaskId）の対応表を持つ。
// - RegisterService / SubscribeService を ServiceRegistryMailbox 宛ての
//   通常メッセージとして受け、配達時点でカーネルが処理する
//   （レジストリ専用の syscall は持たない）。
// - 未登録サービスを待つタスクには、登録時に NotifyServiceRegistered を配る。
//
// 設計メモ:
// - 再登録は last-write-wins。ただし必ず [ERROR] ログに残す
//   （提供者の交代は観測できるべき異常系）。
// - 壊れたレジストリメッセージで halt しない。ログ＋無視（fail-safe）。

use crate::logging;
use crate::mem::addr::{VirtAddr, PAGE_SIZE};
use crate::mem::paging::PageFlags;

use super::core_local::CoreLocal;
use super::message::{
    extract_message, get_u32, get_u64, pack_message, put_u32, put_u64, Message, MessageBody,
    MessageNamespace,
};
use super::{KernelState, LogEvent, TaskId, KERNEL_TASK_ID};

/// 発見プロトコルで扱えるサービス種別。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ServiceKind {
    Memory = 1,
    Vfs = 2,
    Keyboard = 3,
    Storage = 4,
    Log = 5,
}

pub const SERVICE_KIND_COUNT: usize = 5;

/// kind ごとに保持できる登録待ち購読者の数。
pub const MAX_SUBSCRIBERS: usize = 4;

impl ServiceKind {
    pub const fn index(self) -> usize {
        (self as u32 as usize) - 1
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(ServiceKind::Memory),
            2 => Some(ServiceKind::Vfs),
            3 => Some(ServiceKind::Keyboard),
            4 => Some(ServiceKind::Storage),
            5 => Some(ServiceKind::Log),
            _ => None,
        }
    }
}

//
// ──────────────────────────────────────────────
// Registry プロトコルの本体型
// ──────────────────────────────────────────────
//

/// 「送信者がこの kind のサービスを提供する」宣言。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterService {
    pub kind: ServiceKind,
}

impl MessageBody for RegisterService {
    const NAMESPACE: MessageNamespace = MessageNamespace::Registry;
    const MESSAGE_ID: u32 = 1;

    fn encode_payload(&self, out: &mut [u8]) -> usize {
        put_u32(out, 0, self.kind as u32);
        4
    }

    fn decode_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != 4 {
            return None;
        }
        let kind = ServiceKind::from_u32(get_u32(payload, 0)?)?;
        Some(RegisterService { kind })
    }
}

/// 「この kind が登録されたら通知してほしい」購読。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscribeService {
    pub kind: ServiceKind,
}

impl MessageBody for SubscribeService {
    const NAMESPACE: MessageNamespace = MessageNamespace::Registry;
    const MESSAGE_ID: u32 = 2;

    fn encode_payload(&self, out: &mut [u8]) -> usize {
        put_u32(out, 0, self.kind as u32);
        4
    }

    fn decode_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != 4 {
            return None;
        }
        let kind = ServiceKind::from_u32(get_u32(payload, 0)?)?;
        Some(SubscribeService { kind })
    }
}

/// 登録完了の通知（カーネル発、sender = KERNEL_TASK_ID）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotifyServiceRegistered {
    pub kind: ServiceKind,
}

impl MessageBody for NotifyServiceRegistered {
    const NAMESPACE: MessageNamespace = MessageNamespace::Registry;
    const MESSAGE_ID: u32 = 3;

    fn encode_payload(&self, out: &mut [u8]) -> usize {
        put_u32(out, 0, self.kind as u32);
        4
    }

    fn decode_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != 4 {
            return None;
        }
        let kind = ServiceKind::from_u32(get_u32(payload, 0)?)?;
        Some(NotifyServiceRegistered { kind })
    }
}

//
// ──────────────────────────────────────────────
// Memory プロトコル: マップ要求（Memory サービス宛て）
// ──────────────────────────────────────────────
//

pub const MAP_STATUS_OK: u32 = 0;
pub const MAP_STATUS_FAILED: u32 = 1;

/// Default ドメインへの「このアドレスに size 分をマップしてほしい」要求。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapRequest {
    pub address: u64,
    pub size: u64,
    /// PageFlags の生ビット。
    pub flags: u64,
}

impl MessageBody for MapRequest {
    const NAMESPACE: MessageNamespace = MessageNamespace::Memory;
    const MESSAGE_ID: u32 = 3;

    fn encode_payload(&self, out: &mut [u8]) -> usize {
        put_u64(out, 0, self.address);
        put_u64(out, 8, self.size);
        put_u64(out, 16, self.flags);
        24
    }

    fn decode_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != 24 {
            return None;
        }
        Some(MapRequest {
            address: get_u64(payload, 0)?,
            size: get_u64(payload, 8)?,
            flags: get_u64(payload, 16)?,
        })
    }
}

/// MapRequest への応答。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapReply {
    pub address: u64,
    pub status: u32,
}

impl MessageBody for MapReply {
    const NAMESPACE: MessageNamespace = MessageNamespace::Memory;
    const MESSAGE_ID: u32 = 4;

    fn encode_payload(&self, out: &mut [u8]) -> usize {
        put_u64(out, 0, self.address);
        put_u32(out, 8, self.status);
        12
    }

    fn decode_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != 12 {
            return None;
        }
        Some(MapReply {
            address: get_u64(payload, 0)?,
            status: get_u32(payload, 8)?,
        })
    }
}

//
// ──────────────────────────────────────────────
// KernelState 側: レジストリ操作
// ──────────────────────────────────────────────
//

impl KernelState {
    pub fn lookup_service(&self, kind: ServiceKind) -> Option<TaskId> {
        self.services[kind.index()]
    }

    /// ServiceRegistryMailbox 宛てメッセージの処理（配達時点で呼ばれる）。
    pub(super) fn handle_registry_message(&mut self, msg: Message) {
        if msg.header.namespace != MessageNamespace::Registry {
            logging::error("registry: message outside Registry namespace; dropped");
            logging::error_kv(" namespace", msg.header.namespace as u64);
            return;
        }

        match msg.header.message_id {
            RegisterService::MESSAGE_ID => match extract_message::<RegisterService>(&msg) {
                Ok(body) => self.handle_register(msg.header.sender, body.kind),
                Err(_) => {
                    logging::error("registry: malformed RegisterService; dropped");
                }
            },
            SubscribeService::MESSAGE_ID => match extract_message::<SubscribeService>(&msg) {
                Ok(body) => self.handle_subscribe(msg.header.sender, body.kind),
                Err(_) => {
                    logging::error("registry: malformed SubscribeService; dropped");
                }
            },
            other => {
                logging::error("registry: unexpected message_id; dropped");
                logging::error_kv(" message_id", other as u64);
            }
        }
    }

    fn handle_register(&mut self, provider: TaskId, kind: ServiceKind) {
        if let Some(prev) = self.services[kind.index()] {
            if prev != provider {
                // 再登録は last-write-wins（ただし必ず痕跡を残す）
                logging::error("registry: service re-registered; last write wins");
                logging::error_kv(" service_kind", kind as u64);
                logging::error_kv(" previous_provider", prev.0 as u64);
                logging::error_kv(" new_provider", provider.0 as u64);
            }
        }

        self.services[kind.index()] = Some(provider);
        self.push_event(LogEvent::ServiceRegistered { kind, provider });

        // 登録待ちの購読者全員へ通知を配る
        for slot in 0..MAX_SUBSCRIBERS {
            if let Some(subscriber) = self.subscribers[kind.index()][slot].take() {
                self.notify_subscriber(kind, subscriber);
            }
        }
    }

    fn handle_subscribe(&mut self, subscriber: TaskId, kind: ServiceKind) {
        if self.services[kind.index()].is_some() {
            // すでに登録済みなら即時通知
            self.notify_subscriber(kind, subscriber);
            return;
        }

        for slot in self.subscribers[kind.index()].iter_mut() {
            if slot.is_none() {
                *slot = Some(subscriber);
                return;
            }
        }

        logging::error("registry: subscriber table full; subscription dropped");
        logging::error_kv(" service_kind", kind as u64);
        logging::error_kv(" subscriber", subscriber.0 as u64);
    }

    fn notify_subscriber(&mut self, kind: ServiceKind, subscriber: TaskId) {
        let idx = match self.task_index_of(subscriber) {
            Some(idx) => idx,
            None => {
                logging::error("registry: subscriber task is missing; notify dropped");
                logging::error_kv(" subscriber", subscriber.0 as u64);
                return;
            }
        };

        let notify = pack_message(KERNEL_TASK_ID, &NotifyServiceRegistered { kind });
        self.push_event(LogEvent::ServiceNotified { kind, subscriber });

        if self.deliver_message(idx, notify).is_err() {
            logging::error("registry: notify delivery failed");
            logging::error_kv(" subscriber", subscriber.0 as u64);
        }
    }

    /// サービス登録を待つ（発見プロトコルのクライアント側）。
    ///
    /// SubscribeService を送ってから Registry/Notify のフィルタ付き receive に
    /// 入る。すでに登録済みなら通知は mailbox に積まれており即時に返る。
    pub fn ipc_wait_service(&mut self, caller_idx: usize, kind: ServiceKind) -> Option<Message> {
        let caller_id = self.tasks[caller_idx].id;
        let subscribe = pack_message(caller_id, &SubscribeService { kind });
        self.handle_registry_message(subscribe);

        self.ipc_receive_filtered(
            caller_idx,
            MessageNamespace::Registry,
            NotifyServiceRegistered::MESSAGE_ID,
        )
    }
}

//
// ──────────────────────────────────────────────
// Memory サービス側: マップ要求の実行
// ──────────────────────────────────────────────
//

/// MapRequest を現在コアの Default ドメインに対して実行する。
///
/// 失敗はすべて MapReply { status: MAP_STATUS_FAILED } に落とす
/// （要求側にはエラーの種類まで見せない。詳細はログに残る）。
pub fn handle_map_request(core: &mut CoreLocal, req: MapRequest) -> MapReply {
    let failed = MapReply {
        address: req.address,
        status: MAP_STATUS_FAILED,
    };

    let base = VirtAddr(req.address);
    if !base.is_page_aligned() || req.size == 0 {
        logging::error("registry: map request rejected (alignment/size)");
        logging::error_kv(" address", req.address);
        logging::error_kv(" size", req.size);
        return failed;
    }

    let pages = req.size.div_ceil(PAGE_SIZE);
    let flags = PageFlags::from_bits_truncate(req.flags) | PageFlags::PRESENT;

    match core.map_default_range(base, pages, flags) {
        Ok(()) => MapReply {
            address: req.address,
            status: MAP_STATUS_OK,
        },
        Err(_) => {
            logging::error("registry: map request failed");
            logging::error_kv(" address", req.address);
            logging::error_kv(" pages", pages);
            failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ipc::Recipient;
    use super::super::message::extract_message;
    use super::super::{BlockedReason, TaskState};
    use super::*;

    fn register(ks: &mut KernelState, provider_idx: usize, kind: ServiceKind) {
        let id = ks.task(provider_idx).id;
        let msg = pack_message(id, &RegisterService { kind });
        ks.ipc_send(provider_idx, Recipient::ServiceRegistryMailbox, msg)
            .unwrap();
    }

    #[test]
    fn register_then_lookup_returns_provider() {
        let mut ks = KernelState::new(2);
        assert_eq!(ks.lookup_service(ServiceKind::Memory), None);

        register(&mut ks, 1, ServiceKind::Memory);
        assert_eq!(ks.lookup_service(ServiceKind::Memory), Some(TaskId(2)));
        assert!(ks.debug_check_invariants());
    }

    #[test]
    fn re_registration_is_last_write_wins() {
        let mut ks = KernelState::new(3);

        register(&mut ks, 1, ServiceKind::Vfs);
        register(&mut ks, 2, ServiceKind::Vfs);

        assert_eq!(ks.lookup_service(ServiceKind::Vfs), Some(TaskId(3)));
        assert!(ks.debug_check_invariants());
    }

    #[test]
    fn subscribe_after_registration_notifies_immediately() {
        let mut ks = KernelState::new(2);
        register(&mut ks, 1, ServiceKind::Keyboard);

        // task0（実行中）が購読すると通知が mailbox に積まれる
        let msg = ks.ipc_wait_service(0, ServiceKind::Keyboard).unwrap();
        let notify: NotifyServiceRegistered = extract_message(&msg).unwrap();
        assert_eq!(notify.kind, ServiceKind::Keyboard);
        assert_eq!(msg.header.sender, KERNEL_TASK_ID);
        assert_eq!(ks.task(0).state, TaskState::Running);
    }

    #[test]
    fn subscribe_before_registration_blocks_until_registered() {
        let mut ks = KernelState::new(2);

        // 登録前に待つ → ブロック
        assert!(ks.ipc_wait_service(0, ServiceKind::Storage).is_none());
        assert_eq!(ks.task(0).state, TaskState::Blocked);
        assert_eq!(
            ks.task(0).blocked_reason,
            Some(BlockedReason::FilteredReceive {
                namespace: MessageNamespace::Registry,
                message_id: NotifyServiceRegistered::MESSAGE_ID,
            })
        );

        // 登録が届いた時点で通知が配達されて起きる
        register(&mut ks, 1, ServiceKind::Storage);
        assert_eq!(ks.task(0).state, TaskState::Ready);

        let msg = ks.task(0).last_received.unwrap();
        let notify: NotifyServiceRegistered = extract_message(&msg).unwrap();
        assert_eq!(notify.kind, ServiceKind::Storage);
        assert!(ks.debug_check_invariants());
    }

    #[test]
    fn all_pending_subscribers_are_notified_on_registration() {
        let mut ks = KernelState::new(3);

        // task1 と task2 が購読（どちらも mailbox 受け）
        for idx in [1usize, 2] {
            let id = ks.task(idx).id;
            let msg = pack_message(id, &SubscribeService {
                kind: ServiceKind::Log,
            });
            ks.ipc_send(idx, Recipient::ServiceRegistryMailbox, msg)
                .unwrap();
        }

        register(&mut ks, 0, ServiceKind::Log);

        for idx in [1usize, 2] {
            assert_eq!(ks.task(idx).mailbox.len(), 1);
        }
    }

    #[test]
    fn malformed_registry_messages_are_dropped_without_state_change() {
        let mut ks = KernelState::new(2);

        // Registry 名前空間だが未知の message_id
        let mut msg = pack_message(TaskId(1), &RegisterService {
            kind: ServiceKind::Memory,
        });
        msg.header.message_id = 77;
        ks.handle_registry_message(msg);
        assert_eq!(ks.lookup_service(ServiceKind::Memory), None);

        // 長さの壊れた RegisterService
        let mut msg = pack_message(TaskId(1), &RegisterService {
            kind: ServiceKind::Memory,
        });
        msg.header.length = 2;
        ks.handle_registry_message(msg);
        assert_eq!(ks.lookup_service(ServiceKind::Memory), None);

        assert!(ks.debug_check_invariants());
    }

    #[test]
    fn registry_codec_roundtrip() {
        let msg = pack_message(TaskId(4), &MapRequest {
            address: 0xffff_8800_0010_0000,
            size: 2 * PAGE_SIZE,
            flags: PageFlags::kernel_data().bits(),
        });
        let req: MapRequest = extract_message(&msg).unwrap();
        assert_eq!(req.size, 2 * PAGE_SIZE);

        let msg = pack_message(KERNEL_TASK_ID, &MapReply {
            address: req.address,
            status: MAP_STATUS_OK,
        });
        let reply: MapReply = extract_message(&msg).unwrap();
        assert_eq!(reply.status, MAP_STATUS_OK);
    }
}
