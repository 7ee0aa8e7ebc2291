//! 利用量ストア
//!
//! `UsageStore` はユーザーごとの残予算と累積利用量を非同期に提供する
//! 最小インタフェース。`InMemoryUsageStore` は `RwLock<HashMap<..>>` による
//! プロセス内実装で、既知ユーザーを初期予算でシードします。
use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::auth::UserId;

/// ユーザーごとの利用記録
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub remaining_ms: u64,
    pub total_used_ms: u64,
}

impl UsageRecord {
    pub fn with_budget(budget_ms: u64) -> Self {
        Self {
            remaining_ms: budget_ms,
            total_used_ms: 0,
        }
    }

    /// 利用分を計上する。残量は0で打ち止め、累積は単調増加。
    pub fn charge(&mut self, used_ms: u64) {
        self.total_used_ms += used_ms;
        self.remaining_ms = self.remaining_ms.saturating_sub(used_ms);
    }
}

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("usage backend unavailable: {message}")]
    Backend { message: String },
}

impl UsageError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// 未知ユーザーは `{0, 0}` を返す
    async fn get_usage(&self, user: &UserId) -> Result<UsageRecord, UsageError>;

    /// 利用分を計上し、計上後の記録を返す
    async fn update_usage(&self, user: &UserId, used_ms: u64) -> Result<UsageRecord, UsageError>;

    /// 既知ユーザーを `{limit, 0}` で上書きする（テスト用途）
    async fn reset_storage(&self, limit_ms: u64);
}

pub struct InMemoryUsageStore {
    records: RwLock<HashMap<UserId, UsageRecord>>,
}

impl InMemoryUsageStore {
    pub fn new(users: impl IntoIterator<Item = UserId>, initial_budget_ms: u64) -> Self {
        let records = users
            .into_iter()
            .map(|user| (user, UsageRecord::with_budget(initial_budget_ms)))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn get_usage(&self, user: &UserId) -> Result<UsageRecord, UsageError> {
        let guard = self.records.read().await;
        Ok(guard.get(user).copied().unwrap_or_default())
    }

    async fn update_usage(&self, user: &UserId, used_ms: u64) -> Result<UsageRecord, UsageError> {
        let mut guard = self.records.write().await;
        let record = guard.entry(user.clone()).or_default();
        record.charge(used_ms);
        Ok(*record)
    }

    async fn reset_storage(&self, limit_ms: u64) {
        let mut guard = self.records.write().await;
        for record in guard.values_mut() {
            *record = UsageRecord::with_budget(limit_ms);
        }
    }
}
