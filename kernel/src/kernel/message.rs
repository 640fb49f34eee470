// kernel/src/kernel/message.rs
//
// IPC メッセージ封筒と typed codec。
//
// 役割:
// - 固定長 256 バイトのメッセージ封筒（ヘッダ 16B + ペイロード 240B）を定義する。
// - MessageBody trait で「namespace + message_id + ペイロード codec」を型ごとに
//   宣言し、pack_message / extract_message で封筒との相互変換を行う。
//
// 設計方針:
// - ワイヤ表現は little-endian の生バイト列。serde は持ち込まない
//   （no_std・固定長・ゼロアロケーションのまま検証しやすくする）。
// - extract_message は halt しない。種別不一致は UnexpectedMessage、
//   壊れたペイロードは DecodeFailed を返し、呼び出し側が方針を決める。

use super::TaskId;

/// メッセージ封筒の全長（ヘッダ込み）。
pub const MAX_MESSAGE_SIZE: usize = 256;

/// ヘッダ長（namespace / message_id / length / sender で 16 バイト）。
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// ペイロードに使える最大長。
pub const MAX_MESSAGE_PAYLOAD: usize = MAX_MESSAGE_SIZE - MESSAGE_HEADER_SIZE;

/// プロトコル名前空間。ヘッダ上は u32。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageNamespace {
    Registry = 1,
    Memory = 2,
    Vfs = 3,
    Keyboard = 4,
}

impl MessageNamespace {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(MessageNamespace::Registry),
            2 => Some(MessageNamespace::Memory),
            3 => Some(MessageNamespace::Vfs),
            4 => Some(MessageNamespace::Keyboard),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MessageHeader {
    pub namespace: MessageNamespace,
    pub message_id: u32,
    /// ペイロードの有効長（<= MAX_MESSAGE_PAYLOAD）。
    pub length: u32,
    pub sender: TaskId,
}

/// 固定長メッセージ封筒。mailbox にはこれが値で入る。
#[derive(Clone, Copy, Debug)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: [u8; MAX_MESSAGE_PAYLOAD],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcError {
    /// namespace / message_id が期待と違う。
    UnexpectedMessage,
    /// 種別は合っているがペイロードが壊れている（長さ・値域）。
    DecodeFailed,
    /// 受信側 mailbox が満杯。
    MailboxFull,
    /// 宛先 TaskId が存在しない。
    NoSuchTask,
    /// 宛先サービスが未登録。
    ServiceNotRegistered,
}

/// 型付きメッセージ本体。
///
/// 実装側は「自分がどの namespace / message_id か」と
/// 「ペイロードとの相互変換」だけを書く。封筒の組み立て・検証は共通コード。
pub trait MessageBody: Sized {
    const NAMESPACE: MessageNamespace;
    const MESSAGE_ID: u32;

    /// out にペイロードを書き、使ったバイト数を返す。
    /// out は MAX_MESSAGE_PAYLOAD バイトあることが保証される。
    fn encode_payload(&self, out: &mut [u8]) -> usize;

    /// 有効長ぴったりに切られたペイロードから復元する。
    fn decode_payload(payload: &[u8]) -> Option<Self>;
}

/// 型付き本体を封筒へ詰める。
pub fn pack_message<T: MessageBody>(sender: TaskId, body: &T) -> Message {
    let mut payload = [0u8; MAX_MESSAGE_PAYLOAD];
    let length = body.encode_payload(&mut payload);
    debug_assert!(length <= MAX_MESSAGE_PAYLOAD);

    Message {
        header: MessageHeader {
            namespace: T::NAMESPACE,
            message_id: T::MESSAGE_ID,
            length: length as u32,
            sender,
        },
        payload,
    }
}

/// 封筒から型付き本体を取り出す。
///
/// - namespace / message_id 不一致: Err(UnexpectedMessage)
/// - length 異常・decode 失敗:      Err(DecodeFailed)
pub fn extract_message<T: MessageBody>(msg: &Message) -> Result<T, IpcError> {
    if msg.header.namespace != T::NAMESPACE || msg.header.message_id != T::MESSAGE_ID {
        return Err(IpcError::UnexpectedMessage);
    }

    let length = msg.header.length as usize;
    if length > MAX_MESSAGE_PAYLOAD {
        return Err(IpcError::DecodeFailed);
    }

    T::decode_payload(&msg.payload[..length]).ok_or(IpcError::DecodeFailed)
}

//
// ──────────────────────────────────────────────
// little-endian ペイロード補助
// ──────────────────────────────────────────────
//

pub(super) fn put_u32(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(super) fn get_u32(payload: &[u8], offset: usize) -> Option<u32> {
    let bytes = payload.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(super) fn put_u64(out: &mut [u8], offset: usize, value: u64) {
    out[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub(super) fn get_u64(payload: &[u8], offset: usize) -> Option<u64> {
    let bytes = payload.get(offset..offset + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

//
// ──────────────────────────────────────────────
// Memory / Vfs / Keyboard プロトコルの本体型
// （Registry プロトコルは registry.rs 側）
// ──────────────────────────────────────────────
//

/// Memory サービスへの残量レポート要求（ペイロードなし）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetPhysicalReport;

impl MessageBody for GetPhysicalReport {
    const NAMESPACE: MessageNamespace = MessageNamespace::Memory;
    const MESSAGE_ID: u32 = 1;

    fn encode_payload(&self, _out: &mut [u8]) -> usize {
        0
    }

    fn decode_payload(payload: &[u8]) -> Option<Self> {
        if payload.is_empty() {
            Some(GetPhysicalReport)
        } else {
            None
        }
    }
}

/// GetPhysicalReport への応答。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalReport {
    pub free_pages: u64,
    pub total_pages: u64,
}

impl MessageBody for PhysicalReport {
    const NAMESPACE: MessageNamespace = MessageNamespace::Memory;
    const MESSAGE_ID: u32 = 2;

    fn encode_payload(&self, out: &mut [u8]) -> usize {
        put_u64(out, 0, self.free_pages);
        put_u64(out, 8, self.total_pages);
        16
    }

    fn decode_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != 16 {
            return None;
        }
        Some(PhysicalReport {
            free_pages: get_u64(payload, 0)?,
            total_pages: get_u64(payload, 8)?,
        })
    }
}

/// Keyboard サービスが配るキーイベント。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: u32,
}

impl MessageBody for KeyEvent {
    const NAMESPACE: MessageNamespace = MessageNamespace::Keyboard;
    const MESSAGE_ID: u32 = 1;

    fn encode_payload(&self, out: &mut [u8]) -> usize {
        put_u32(out, 0, self.code);
        4
    }

    fn decode_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != 4 {
            return None;
        }
        Some(KeyEvent {
            code: get_u32(payload, 0)?,
        })
    }
}

/// Vfs サービスの読み取り応答（長さだけのプロトタイプ）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadResult {
    pub len: u32,
}

impl MessageBody for ReadResult {
    const NAMESPACE: MessageNamespace = MessageNamespace::Vfs;
    const MESSAGE_ID: u32 = 2;

    fn encode_payload(&self, out: &mut [u8]) -> usize {
        put_u32(out, 0, self.len);
        4
    }

    fn decode_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != 4 {
            return None;
        }
        Some(ReadResult {
            len: get_u32(payload, 0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENDER: TaskId = TaskId(7);

    #[test]
    fn pack_then_extract_recovers_typed_body() {
        let report = PhysicalReport {
            free_pages: 123,
            total_pages: 456,
        };

        let msg = pack_message(SENDER, &report);
        assert_eq!(msg.header.namespace, MessageNamespace::Memory);
        assert_eq!(msg.header.message_id, 2);
        assert_eq!(msg.header.length, 16);
        assert_eq!(msg.header.sender, SENDER);

        let decoded: PhysicalReport = extract_message(&msg).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn extract_of_wrong_type_is_unexpected_message() {
        let msg = pack_message(SENDER, &KeyEvent { code: 42 });

        // 名前空間違い
        let err = extract_message::<PhysicalReport>(&msg).unwrap_err();
        assert_eq!(err, IpcError::UnexpectedMessage);

        // 同じ名前空間で message_id 違い
        let msg = pack_message(SENDER, &GetPhysicalReport);
        let err = extract_message::<PhysicalReport>(&msg).unwrap_err();
        assert_eq!(err, IpcError::UnexpectedMessage);
    }

    #[test]
    fn truncated_payload_is_decode_failed() {
        let mut msg = pack_message(SENDER, &PhysicalReport {
            free_pages: 1,
            total_pages: 2,
        });
        msg.header.length = 8;

        let err = extract_message::<PhysicalReport>(&msg).unwrap_err();
        assert_eq!(err, IpcError::DecodeFailed);
    }

    #[test]
    fn oversized_length_field_is_decode_failed() {
        let mut msg = pack_message(SENDER, &GetPhysicalReport);
        msg.header.length = (MAX_MESSAGE_PAYLOAD as u32) + 1;

        let err = extract_message::<GetPhysicalReport>(&msg).unwrap_err();
        assert_eq!(err, IpcError::DecodeFailed);
    }

    #[test]
    fn empty_body_roundtrip() {
        let msg = pack_message(SENDER, &GetPhysicalReport);
        assert_eq!(msg.header.length, 0);
        assert!(extract_message::<GetPhysicalReport>(&msg).is_ok());
    }

    #[test]
    fn unknown_namespace_value_is_rejected() {
        assert_eq!(MessageNamespace::from_u32(0), None);
        assert_eq!(MessageNamespace::from_u32(99), None);
        assert_eq!(MessageNamespace::from_u32(2), Some(MessageNamespace::Memory));
    }
}
