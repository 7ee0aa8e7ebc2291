//! ユーザー単位の作業キュー
//!
//! `try_acquire` はユーザーごとの相互排他を担う唯一の入口。CASによる
//! 非再入フラグであり、スキャナを決してブロックしない。
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

/// 1パケット分の処理要求
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub sequence_id: u32,
    pub payload: Bytes,
    pub enqueued_at: Instant,
}

impl WorkItem {
    pub fn new(sequence_id: u32, payload: Bytes) -> Self {
        Self {
            sequence_id,
            payload,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    in_flight: AtomicBool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, item: WorkItem) {
        self.items.lock().push_back(item);
    }

    pub fn dequeue(&self) -> Option<WorkItem> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// 実行中フラグが空いていれば立てる。立てられたときだけ true。
    pub fn try_acquire(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}
