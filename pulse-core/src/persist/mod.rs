//! 持久化后端（Persistor）
//!
//! 队列与事件存储共用的可插拔存储协议。本 crate 仅提供内存实现，
//! 具体后端（数据库、文件等）由上层实现 `Persistor` 后注入。
//!
mod memory;

pub use memory::InMemoryPersistor;

use crate::{error::RuntimeResult, event::Event};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: Event,
    pub stored_at: DateTime<Utc>,
    pub processed: bool,
}

/// 持久化后端协议
#[async_trait]
pub trait Persistor: Send + Sync {
    /// 后端类型名（用于统计）
    fn kind(&self) -> &str;

    async fn save(&self, event: &Event) -> RuntimeResult<()>;

    /// 标记事件已处理，返回是否存在该事件
    async fn mark_processed(&self, event_id: &str) -> RuntimeResult<bool>;

    /// 读取 `from` 之后（含）发射的事件，按发射时间升序
    async fn load_since(
        &self,
        from: DateTime<Utc>,
        only_unprocessed: bool,
    ) -> RuntimeResult<Vec<StoredEvent>>;

    /// 最近写入的 `limit` 条记录，新的在前
    async fn recent(&self, limit: usize) -> RuntimeResult<Vec<StoredEvent>>;

    /// 仅保留最新的 `max` 条，返回被裁剪的数量
    async fn trim(&self, max: usize) -> RuntimeResult<usize>;

    async fn len(&self) -> usize;

    async fn clear(&self) -> RuntimeResult<()>;
}

/// 内置后端类型，用于按需构建新的后端实例
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistorKind {
    #[default]
    Memory,
}

impl PersistorKind {
    /// 构建一个全新的后端实例（不与其他运行时共享）
    pub fn create(self) -> Arc<dyn Persistor> {
        match self {
            PersistorKind::Memory => Arc::new(InMemoryPersistor::new()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PersistorKind::Memory => "memory",
        }
    }
}
