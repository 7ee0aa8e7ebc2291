//! ワイヤプロトコル
//!
//! - `frame` は受信バイナリフレーム（シーケンスIDタグ付き音声パケット）のコーデック
//! - `message` は送信テキストフレーム（JSON）の型
//! - `close` はクローズコードと構造化クローズ理由の対応表
mod close;
mod frame;
mod message;

pub use close::{ws_close_code, CloseReason, ReasonCode};
pub use frame::{decode_frame, encode_frame, FrameError, InboundFrame, FRAME_HEADER_LEN};
pub use message::ServerMessage;
