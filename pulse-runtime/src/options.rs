//! 发射参数与结果
//!
use bon::Builder;
use pulse_core::error::RuntimeError;
use pulse_core::event::{Event, EventLineage};
use serde::Serialize;
use std::time::Duration;

/// 发射参数
#[derive(Builder, Debug, Clone, Default)]
pub struct EmitOptions {
    /// 入队优先级，越大越先处理
    #[builder(default)]
    pub priority: i32,
    /// 关联ID，缺省时自动生成
    #[builder(into)]
    pub correlation_id: Option<String>,
    /// 覆写运行时租户
    #[builder(into)]
    pub tenant_id: Option<String>,
    /// 因果链，用于限制级联深度
    pub lineage: Option<EventLineage>,
    /// `Some(false)` 时绕过批量直接入队
    pub batch: Option<bool>,
    pub batch_size: Option<usize>,
    pub batch_timeout: Option<Duration>,
    /// 立即刷新批量缓冲；`emit_async` 会等待刷新完成
    #[builder(default)]
    pub flush_batch: bool,
}

impl EmitOptions {
    /// 由上游事件派生：继承关联ID、租户并延长因果链
    pub fn caused_by(parent: &Event) -> Self {
        Self {
            correlation_id: Some(parent.metadata().correlation_id().to_string()),
            tenant_id: Some(parent.metadata().tenant_id().to_string()),
            lineage: Some(parent.lineage()),
            ..Default::default()
        }
    }
}

/// 发射结果
///
/// `emit` 的 `queued: true` 是乐观的：入队失败只会出现在日志、统计与
/// `Runtime::emit_failures` 中；需要确定结果时使用 `emit_async`。
#[derive(Debug)]
pub struct EmitResult {
    pub success: bool,
    pub event_id: String,
    pub queued: bool,
    pub correlation_id: String,
    pub error: Option<RuntimeError>,
}

impl EmitResult {
    pub(crate) fn queued(event: &Event) -> Self {
        Self {
            success: true,
            event_id: event.id().to_string(),
            queued: true,
            correlation_id: event.metadata().correlation_id().to_string(),
            error: None,
        }
    }

    pub(crate) fn failed(event_id: &str, correlation_id: &str, error: RuntimeError) -> Self {
        Self {
            success: false,
            event_id: event_id.to_string(),
            queued: false,
            correlation_id: correlation_id.to_string(),
            error: Some(error),
        }
    }
}

/// 后台入队失败通知
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmitFailure {
    pub event_id: String,
    pub event_type: String,
    pub tenant_id: String,
    pub reason: String,
}
