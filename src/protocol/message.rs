//! 送信テキストフレーム（JSON）の型
use serde::Serialize;

use crate::transcriber::Transcription;

/// サーバーからクライアントへのメッセージ
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// 入場許可後の準備完了通知: `{"event":"ready"}`
    Ready { event: &'static str },
    /// 1パケット分の文字起こし結果。`id` はリクエストの sequence_id を返送する。
    #[serde(rename_all = "camelCase")]
    Reply {
        id: u32,
        transcript: String,
        confidence: f32,
        usage_used_ms: u64,
        usage_remaining_ms: u64,
    },
}

impl ServerMessage {
    pub fn ready() -> Self {
        Self::Ready { event: "ready" }
    }

    pub fn reply(sequence_id: u32, transcription: &Transcription, remaining_ms: u64) -> Self {
        Self::Reply {
            id: sequence_id,
            transcript: transcription.transcript.clone(),
            confidence: transcription.confidence,
            usage_used_ms: transcription.usage_used_ms,
            usage_remaining_ms: remaining_ms,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
