//! 运行时统计快照
//!
use crate::batch::BatchStats;
use crate::dispatcher::DispatcherStats;
use pulse_core::memory::MemoryStats;
use pulse_core::queue::QueueStats;
use pulse_core::store::EventStoreStats;
use pulse_core::stream::StreamStats;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeStats {
    pub runtime: RuntimeIdentity,
    pub queue: QueueStats,
    pub dispatcher: DispatcherStats,
    pub stream: StreamStats,
    /// 未启用内存监控时为 `None`
    pub memory: Option<MemoryStats>,
    pub delivery: DeliveryStats,
    /// 未启用批量时为 `None`
    pub batching: Option<BatchStats>,
    /// 未启用事件存储时为 `None`
    pub event_store: Option<EventStoreStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeIdentity {
    pub execution_id: String,
    pub tenant_id: String,
    pub workflow_name: String,
    pub persistor_type: String,
    pub shut_down: bool,
}

/// 投递与确认
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub enable_acks: bool,
    pub ack_timeout_ms: u64,
    pub pending_acks: usize,
    pub acked: u64,
    pub nacked: u64,
    pub expired: u64,
    /// 后台入队失败次数
    pub emit_failures: u64,
}

/// 单次 `process()` 的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    pub processed: u64,
    pub acked: u64,
    pub failed: u64,
}
