//! クローズプロトコル
//!
//! すべての異常系はWebSocketクローズフレームで通知する。`code` はクローズコード、
//! 理由ペイロードは `{"error":<説明>,"code":<内部コード>}` のコンパクトなJSON。
use serde_json::json;

/// クローズフレームで使用するWebSocketクローズコード
pub mod ws_close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const INVALID_DATA: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const UNEXPECTED_ERROR: u16 = 1011;
    pub const TIMEOUT: u16 = 3008;
}

/// 理由ペイロードに載せる内部エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReasonCode {
    ExceededAllocatedUsage = 0,
    Timeout = 1,
    Aborted = 2,
    ConnectionReplaced = 3,
    Unauthorized = 4,
    ShuttingDown = 5,
    NotReady = 6,
    InvalidData = 7,
    ServerError = 99,
}

/// 構造化されたクローズ理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: ReasonCode,
    pub message: String,
}

impl CloseReason {
    fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn exceeded_allocated_usage() -> Self {
        Self::new(ReasonCode::ExceededAllocatedUsage, "exceeded allocated usage")
    }

    pub fn timeout() -> Self {
        Self::new(ReasonCode::Timeout, "transcription timed out")
    }

    pub fn aborted() -> Self {
        Self::new(ReasonCode::Aborted, "transcription aborted")
    }

    pub fn connection_replaced() -> Self {
        Self::new(
            ReasonCode::ConnectionReplaced,
            "connection replaced by a newer session",
        )
    }

    pub fn unauthorized() -> Self {
        Self::new(ReasonCode::Unauthorized, "unauthorized")
    }

    pub fn shutting_down() -> Self {
        Self::new(ReasonCode::ShuttingDown, "server shutting down")
    }

    pub fn not_ready() -> Self {
        Self::new(ReasonCode::NotReady, "session not ready")
    }

    pub fn invalid_data() -> Self {
        Self::new(ReasonCode::InvalidData, "invalid frame")
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::ServerError, message)
    }

    /// この理由に対応するWebSocketクローズコード
    pub fn ws_code(&self) -> u16 {
        match self.code {
            ReasonCode::ExceededAllocatedUsage
            | ReasonCode::ConnectionReplaced
            | ReasonCode::Unauthorized
            | ReasonCode::NotReady => ws_close_code::POLICY_VIOLATION,
            ReasonCode::Timeout => ws_close_code::TIMEOUT,
            ReasonCode::Aborted | ReasonCode::ShuttingDown => ws_close_code::GOING_AWAY,
            ReasonCode::InvalidData => ws_close_code::INVALID_DATA,
            ReasonCode::ServerError => ws_close_code::UNEXPECTED_ERROR,
        }
    }

    /// クローズフレームの理由ペイロード
    pub fn to_reason_json(&self) -> String {
        json!({ "error": self.message, "code": self.code as u16 }).to_string()
    }
}
