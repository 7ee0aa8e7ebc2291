//! ユーザー横断のディスパッチループ
//!
//! `Dispatcher` はレジストリ上の準備完了セッションを走査し、ユーザーごとの
//! 実行中フラグと全体の同時実行上限の範囲でタスクを起動する。走査は
//! ポーリングではなくイベント駆動で、enqueue とタスク完了が `Notify` で
//! スキャナを起こす。
//!
//! - ユーザー内はFIFO: フラグが直列化するため次の項目は前の完了後に始まる
//! - ユーザー間の順序は保証しない
//! - 各タスクの取り消しは (シャットダウン | セッションクローズ | 期限) のOR
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::protocol::{CloseReason, ServerMessage};
use crate::session::{SessionHandle, SessionRegistry, WorkItem};
use crate::transcriber::{Transcriber, TranscriberError};
use crate::usage::UsageStore;

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    usage: Arc<dyn UsageStore>,
    transcriber: Arc<dyn Transcriber>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    max_concurrent: usize,
    task_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        usage: Arc<dyn UsageStore>,
        transcriber: Arc<dyn Transcriber>,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            registry,
            usage,
            transcriber,
            wake,
            shutdown,
            max_concurrent: config.max_concurrent.max(1),
            task_timeout: Duration::from_millis(config.task_timeout_ms),
        }
    }

    /// スケジューリングループ本体。シャットダウン後、実行中タスクの排水を
    /// 待ってから戻る。
    pub async fn run(self: Arc<Self>) {
        let mut in_flight: FuturesUnordered<JoinHandle<()>> = FuturesUnordered::new();
        info!(max_concurrent = self.max_concurrent, "dispatcher started");

        loop {
            if !self.shutdown.is_cancelled() {
                for session in self.registry.ready_sessions().await {
                    if in_flight.len() >= self.max_concurrent {
                        break;
                    }
                    if session.queue().is_empty() || !session.queue().try_acquire() {
                        continue;
                    }
                    let Some(item) = session.queue().dequeue() else {
                        session.queue().release();
                        continue;
                    };

                    let dispatcher = Arc::clone(&self);
                    in_flight.push(tokio::spawn(async move {
                        dispatcher.run_item(session, item).await;
                    }));
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                Some(_) = in_flight.next() => {}
            }
        }

        // 実行中タスクはシャットダウントークンを観測して速やかに戻る
        while in_flight.next().await.is_some() {}
        info!("dispatcher stopped");
    }

    async fn run_item(&self, session: Arc<SessionHandle>, item: WorkItem) {
        self.process_item(&session, &item).await;
        session.queue().release();
        self.wake.notify_one();
    }

    async fn process_item(&self, session: &SessionHandle, item: &WorkItem) {
        if !session.is_open() {
            // デキュー後にセッションが消えた項目は黙って捨てる
            return;
        }

        let task_cancel = CancellationToken::new();
        let _abort_guard = task_cancel.clone().drop_guard();

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = session.closed() => return,
            _ = tokio::time::sleep(self.task_timeout) => {
                warn!(
                    user_id = %session.user_id(),
                    sequence_id = item.sequence_id,
                    "transcription deadline exceeded"
                );
                session.close(CloseReason::timeout());
                return;
            }
            result = self.transcriber.transcribe(&item.payload, task_cancel.clone()) => result,
        };

        let transcription = match result {
            Ok(transcription) => transcription,
            Err(TranscriberError::Cancelled) => {
                session.close(CloseReason::aborted());
                return;
            }
            Err(err) => {
                warn!(
                    user_id = %session.user_id(),
                    sequence_id = item.sequence_id,
                    error = %err,
                    "transcription failed"
                );
                session.close(CloseReason::server_error(err.to_string()));
                return;
            }
        };

        // 完了した処理は計上する。セッションが閉じていても返金はしない。
        let record = match self
            .usage
            .update_usage(session.user_id(), transcription.usage_used_ms)
            .await
        {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(user_id = %session.user_id(), error = %err, "usage update failed");
                None
            }
        };

        if !session.is_open() {
            // 完了時点で相手が居なければ結果は黙って捨てる
            return;
        }

        let remaining_ms = match record {
            Some(record) => record.remaining_ms,
            // 計上に失敗しても応答は返す。残量は読み直しのベストエフォート。
            None => self
                .usage
                .get_usage(session.user_id())
                .await
                .map(|record| record.remaining_ms)
                .unwrap_or(0),
        };

        session.send(ServerMessage::reply(
            item.sequence_id,
            &transcription,
            remaining_ms,
        ));
        debug!(
            user_id = %session.user_id(),
            sequence_id = item.sequence_id,
            used_ms = transcription.usage_used_ms,
            remaining_ms,
            "transcription reply sent"
        );

        if record.map(|record| record.remaining_ms == 0).unwrap_or(false) {
            info!(user_id = %session.user_id(), "usage budget exhausted");
            session.close(CloseReason::exceeded_allocated_usage());
        }
    }
}
