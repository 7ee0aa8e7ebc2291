//! プロセス全体のセッション対応表
//!
//! UserIdごとに高々1本のセッションしか登録されない。`register` は
//! 置き換え前のセッションを返し、呼び出し側がそれをクローズする。
//! `unregister` はインスタンス識別子が一致するときだけ削除する。
//! 置き換え済みの旧セッションの遅延クリーンアップが後継の登録を
//! 取り消してしまわないための比較削除。
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::auth::UserId;

use super::SessionHandle;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<UserId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新しいセッションを登録し、追い出された先行セッションを返す
    pub async fn register(&self, session: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        let mut guard = self.sessions.write().await;
        guard.insert(session.user_id().clone(), session)
    }

    /// 登録中のセッションが同一インスタンスのときだけ削除する
    pub async fn unregister(&self, session: &SessionHandle) {
        let mut guard = self.sessions.write().await;
        if let Some(current) = guard.get(session.user_id()) {
            if current.instance() == session.instance() {
                guard.remove(session.user_id());
            }
        }
    }

    pub async fn lookup(&self, user: &UserId) -> Option<Arc<SessionHandle>> {
        let guard = self.sessions.read().await;
        guard.get(user).cloned()
    }

    /// ディスパッチャのスキャン対象（準備完了かつ未クローズ）のスナップショット
    pub async fn ready_sessions(&self) -> Vec<Arc<SessionHandle>> {
        let guard = self.sessions.read().await;
        guard
            .values()
            .filter(|session| session.is_ready() && session.is_open())
            .cloned()
            .collect()
    }

    /// 全セッションを取り外して返す（シャットダウン時）
    pub async fn drain(&self) -> Vec<Arc<SessionHandle>> {
        let mut guard = self.sessions.write().await;
        guard.drain().map(|(_, session)| session).collect()
    }

    pub async fn active_sessions(&self) -> usize {
        let guard = self.sessions.read().await;
        guard.len()
    }
}
