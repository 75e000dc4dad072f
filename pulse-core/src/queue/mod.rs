//! 持久化优先级队列（DurableQueue）协议
//!
//! 运行时把事件交给队列后，由队列负责排序与（可选的）持久化，
//! 直到 `process_all` 将其出队并交给 `EventProcessor`。
//!
mod memory;

pub use memory::InMemoryQueue;

use crate::{error::RuntimeResult, event::Event};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// 队列出队后对单个事件的处理逻辑
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: &Event) -> RuntimeResult<()>;
}

/// 持久化优先级队列
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// 入队；优先级越高越先出队，同优先级先进先出
    async fn enqueue(&self, event: Event, priority: i32) -> RuntimeResult<()>;

    /// 批量出队并处理
    ///
    /// 处理失败计入队列自身统计并终止本轮出队（剩余事件保留在队列中），
    /// 只有队列自身的故障才会返回错误。
    async fn process_all(&self, processor: &dyn EventProcessor) -> RuntimeResult<()>;

    /// 将 `from` 之后持久化但未处理、且不在队列中的事件重新入队，返回数量
    async fn replay_from(&self, from: DateTime<Utc>) -> RuntimeResult<usize>;

    /// 按出队顺序返回前 `limit` 个待处理事件的快照
    fn snapshot(&self, limit: usize) -> Vec<QueueItemSnapshot>;

    fn stats(&self) -> QueueStats;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 丢弃全部待处理事件（包括持久化副本）
    async fn clear(&self) -> RuntimeResult<()>;

    /// 关闭队列并释放内存中的事件；持久化副本保留以便重放
    async fn close(&self) -> RuntimeResult<()>;
}

/// 待处理事件快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItemSnapshot {
    pub event_id: String,
    pub event_type: String,
    pub priority: i32,
    pub correlation_id: String,
    pub tenant_id: String,
    pub enqueued_at: DateTime<Utc>,
}

/// 队列统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub persistence: bool,
    pub closed: bool,
}

/// 队列配置
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// 入队时写入持久化后端，出队时标记已处理
    pub enable_persistence: bool,
}
