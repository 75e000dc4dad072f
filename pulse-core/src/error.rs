//! 运行时统一错误定义
//!
//! 覆盖入队、持久化、事件存储、处理器调度、批量刷新与生命周期等最小必要集合。
//! 确认/否认（ack/nack）、超时清扫与统计失败只进入日志，不会出现在这里。
//!
use thiserror::Error;

/// 统一错误类型（运行时最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RuntimeError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    // --- 队列 ---
    #[error("queue is full: capacity={capacity}")]
    QueueFull { capacity: usize },
    #[error("queue is closed")]
    QueueClosed,
    #[error("enqueue failed: event_id={event_id}, reason={reason}")]
    Enqueue { event_id: String, reason: String },

    // --- 持久化/事件存储 ---
    #[error("persistence error: {reason}")]
    Persistence { reason: String },
    #[error("event store error: {reason}")]
    EventStore { reason: String },

    // --- 调度 ---
    #[error("event handler error: handler={handler}, event_type={event_type}, reason={reason}")]
    Handler {
        handler: String,
        event_type: String,
        reason: String,
    },
    #[error("event depth exceeded: event_type={event_type}, depth={depth}, max={max}")]
    EventDepthExceeded {
        event_type: String,
        depth: usize,
        max: usize,
    },
    #[error("event chain too long: event_type={event_type}, length={length}, max={max}")]
    EventChainTooLong {
        event_type: String,
        length: usize,
        max: usize,
    },

    // --- 批量 ---
    #[error("batch flush failed: {failed}/{total} events not enqueued: {}", reasons.join("; "))]
    BatchFlush {
        failed: usize,
        total: usize,
        reasons: Vec<String>,
    },

    // --- 生命周期 ---
    #[error("runtime is shut down")]
    ShuttingDown,
}

impl RuntimeError {
    pub fn persistence(reason: impl Into<String>) -> Self {
        RuntimeError::Persistence {
            reason: reason.into(),
        }
    }

    pub fn event_store(reason: impl Into<String>) -> Self {
        RuntimeError::EventStore {
            reason: reason.into(),
        }
    }

    pub fn enqueue(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RuntimeError::Enqueue {
            event_id: event_id.into(),
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type RuntimeResult<T> = Result<T, RuntimeError>;
