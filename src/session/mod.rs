//! セッション管理
//!
//! - `SessionHandle` はアップグレード済み接続1本の共有状態
//! - `WorkQueue` はユーザー単位のFIFOと実行中フラグ
//! - `SessionRegistry` はプロセス全体の UserId → セッション対応表
mod queue;
mod registry;

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::UserId;
use crate::protocol::{CloseReason, ServerMessage};

pub use queue::{WorkItem, WorkQueue};
pub use registry::SessionRegistry;

/// 送信タスクへ渡すキューアイテム。クローズフレームは常に最後の1枚。
#[derive(Debug)]
pub enum Outbound {
    Message(String),
    Close(CloseReason),
}

/// アップグレード済み接続1本の共有ハンドル
///
/// 送信側チャネルは `Mutex<Option<..>>` に保持し、クローズ時に取り外す。
/// 取り外し後の `send` は何もしないため、クローズフレーム以降に
/// フレームが書かれることはない。
pub struct SessionHandle {
    user_id: UserId,
    instance: Uuid,
    ready: AtomicBool,
    close_token: CancellationToken,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    queue: WorkQueue,
}

impl SessionHandle {
    pub fn new(user_id: UserId, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            user_id,
            instance: Uuid::new_v4(),
            ready: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            outbound: parking_lot::Mutex::new(Some(outbound)),
            queue: WorkQueue::new(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// レジストリの compare-and-remove が参照するインスタンス識別子
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// クローズフレームがまだ送られていない（送信側が生きている）か
    pub fn is_open(&self) -> bool {
        self.outbound.lock().is_some()
    }

    pub fn close_token(&self) -> &CancellationToken {
        &self.close_token
    }

    pub async fn closed(&self) {
        self.close_token.cancelled().await
    }

    /// テキストフレームを送信キューへ積む。クローズ後は無視される。
    pub fn send(&self, message: ServerMessage) -> bool {
        let guard = self.outbound.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(Outbound::Message(message.to_json())).is_ok(),
            None => false,
        }
    }

    /// クローズフレームを積み、以降の送信を遮断して実行中の処理を取り消す。
    /// 2回目以降の呼び出しは何もしない。
    pub fn close(&self, reason: CloseReason) {
        let taken = self.outbound.lock().take();
        if let Some(tx) = taken {
            let _ = tx.send(Outbound::Close(reason));
        }
        self.close_token.cancel();
    }

    /// 相手側が切断済みのとき用。フレームは送らず送信側だけ畳む。
    pub fn abandon(&self) {
        self.outbound.lock().take();
        self.close_token.cancel();
    }
}
