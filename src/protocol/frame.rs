//! 受信バイナリフレームのコーデック
//!
//! レイアウト: `[ u32 big-endian sequence_id | payload ]`
//! ペイロードは1バイト以上の不透明な音声データ。UTF-8である必要はない。
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame shorter than the sequence header: {len} bytes")]
    TooShort { len: usize },
    #[error("frame carries no payload")]
    EmptyPayload,
}

/// デコード済みの受信フレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub sequence_id: u32,
    pub payload: Bytes,
}

pub fn decode_frame(data: Bytes) -> Result<InboundFrame, FrameError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(FrameError::TooShort { len: data.len() });
    }

    let sequence_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let payload = data.slice(FRAME_HEADER_LEN..);
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }

    Ok(InboundFrame {
        sequence_id,
        payload,
    })
}

/// クライアント側のエンコード（テストやRustクライアントで使用）
pub fn encode_frame(sequence_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(sequence_id);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_sequence_id_and_payload() {
        let encoded = encode_frame(0x0102_0304, b"audio");
        let frame = decode_frame(encoded).expect("decode");
        assert_eq!(frame.sequence_id, 0x0102_0304);
        assert_eq!(frame.payload.as_ref(), b"audio");
    }

    #[test]
    fn rejects_frame_shorter_than_header() {
        let err = decode_frame(Bytes::from_static(&[0, 0, 1])).unwrap_err();
        assert_eq!(err, FrameError::TooShort { len: 3 });
    }

    #[test]
    fn rejects_header_only_frame() {
        let err = decode_frame(Bytes::from_static(&[0, 0, 0, 7])).unwrap_err();
        assert_eq!(err, FrameError::EmptyPayload);
    }

    #[test]
    fn payload_does_not_need_to_be_utf8() {
        let encoded = encode_frame(9, &[0xff, 0xfe, 0x00, 0x80]);
        let frame = decode_frame(encoded).expect("decode");
        assert_eq!(frame.sequence_id, 9);
        assert_eq!(frame.payload.len(), 4);
    }
}
