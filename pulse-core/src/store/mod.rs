//! 追加式事件存储（EventStore）
//!
//! 记录已入队的事件，支持确认后的“已处理”标记与按时间点重放。
//!
mod persistent;

pub use persistent::PersistentEventStore;

use crate::{error::RuntimeResult, event::Event, persist::PersistorKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use serde::Serialize;

/// 事件存储协议
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: &Event) -> RuntimeResult<()>;

    async fn mark_processed(&self, event_id: &str) -> RuntimeResult<()>;

    /// 从 `from` 开始按批重放；返回 'static 生命周期的流，便于在 tokio::spawn 中消费
    async fn replay(
        &self,
        from: DateTime<Utc>,
        options: ReplayOptions,
    ) -> BoxStream<'static, RuntimeResult<Vec<Event>>>;

    /// 最近追加的事件，新的在前
    async fn recent(&self, limit: usize) -> RuntimeResult<Vec<Event>>;

    async fn stats(&self) -> EventStoreStats;
}

/// 重放参数
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOptions {
    /// 仅重放未确认的事件
    pub only_unprocessed: bool,
    /// 每批事件数，`None` 使用存储配置
    pub batch_size: Option<usize>,
}

/// 事件存储配置
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    pub persistor_type: PersistorKind,
    pub replay_batch_size: usize,
    pub max_stored_events: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            persistor_type: PersistorKind::Memory,
            replay_batch_size: 100,
            max_stored_events: 10_000,
        }
    }
}

/// 事件存储统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStoreStats {
    pub persistor_type: String,
    pub stored: usize,
    pub appended: u64,
    pub marked_processed: u64,
    pub trimmed: u64,
}
