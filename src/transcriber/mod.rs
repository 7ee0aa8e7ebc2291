//! 文字起こしワーカー
//!
//! `Transcriber` は音声ペイロードとキャンセルハンドルを受け取り、
//! 結果と消費ミリ秒を返す最小インタフェース。`SimulatedTranscriber` は
//! ペイロード長から決定的にコストを導出し、その分だけ処理時間を消費します。
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::TranscriberConfig;

/// 1パケット分の文字起こし結果
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub transcript: String,
    pub confidence: f32,
    pub usage_used_ms: u64,
}

#[derive(Debug, Error)]
pub enum TranscriberError {
    #[error("transcription cancelled")]
    Cancelled,
    #[error("transcription failed: {message}")]
    Engine { message: String },
}

impl TranscriberError {
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// キャンセルは全ての中断点で観測されなければならない
    async fn transcribe(
        &self,
        payload: &[u8],
        cancel: CancellationToken,
    ) -> Result<Transcription, TranscriberError>;
}

/// ペイロード長に比例したコストを消費する決定的なエンジン
#[derive(Debug, Clone)]
pub struct SimulatedTranscriber {
    bytes_per_word: usize,
    ms_per_word: u64,
}

impl SimulatedTranscriber {
    pub fn new(config: &TranscriberConfig) -> Self {
        Self {
            bytes_per_word: config.bytes_per_word.max(1),
            ms_per_word: config.ms_per_word,
        }
    }

    fn word_count(&self, payload_len: usize) -> u64 {
        payload_len.div_ceil(self.bytes_per_word) as u64
    }

    /// `ceil(len / bytes_per_word) * ms_per_word`
    pub fn cost_ms(&self, payload_len: usize) -> u64 {
        self.word_count(payload_len) * self.ms_per_word
    }
}

#[async_trait]
impl Transcriber for SimulatedTranscriber {
    async fn transcribe(
        &self,
        payload: &[u8],
        cancel: CancellationToken,
    ) -> Result<Transcription, TranscriberError> {
        let words = self.word_count(payload.len());
        let cost_ms = self.cost_ms(payload.len());

        tokio::select! {
            _ = cancel.cancelled() => Err(TranscriberError::Cancelled),
            _ = tokio::time::sleep(std::time::Duration::from_millis(cost_ms)) => {
                Ok(Transcription {
                    transcript: format!("transcribed {} bytes as {} words", payload.len(), words),
                    confidence: 0.9,
                    usage_used_ms: cost_ms,
                })
            }
        }
    }
}
