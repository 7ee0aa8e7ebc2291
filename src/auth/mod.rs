//! Bearerトークン認証
//!
//! `TokenResolver` は `Authorization` ヘッダの値をユーザーIDへ解決する
//! 最小インタフェース。`StaticTokenResolver` は設定の静的マッピングを参照します。
use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// 認証済みユーザーの不透明な識別子
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication failed: {reason}")]
    Unauthorized { reason: String },
}

impl AuthError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve(&self, authorization: Option<&str>) -> Result<UserId, AuthError>;
}

/// 設定ファイル由来の静的なトークンマッピング
#[derive(Debug, Clone, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, String>,
}

impl StaticTokenResolver {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TokenResolver for StaticTokenResolver {
    async fn resolve(&self, authorization: Option<&str>) -> Result<UserId, AuthError> {
        let header =
            authorization.ok_or_else(|| AuthError::unauthorized("missing authorization header"))?;

        // `Bearer ` 以外のスキームは受け付けない。空トークンは未知トークンと同じ扱い。
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AuthError::unauthorized("malformed authorization header"))?;

        self.tokens
            .get(token)
            .map(|user| UserId::new(user.clone()))
            .ok_or_else(|| AuthError::unauthorized("unknown token"))
    }
}
