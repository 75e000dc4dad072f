//! 事件模型（Event）与事件载荷
//!
//! 定义运行时流转的不可变事件记录 `Event`、发射时写入的元数据 `EventMetadata`、
//! 因果链 `EventLineage`，以及强类型载荷需要实现的 `EventPayload`。

mod lineage;
mod metadata;
mod payload;
mod record;

pub use lineage::EventLineage;
pub use metadata::EventMetadata;
pub use payload::EventPayload;
pub use record::Event;

/// 默认租户
pub const DEFAULT_TENANT: &str = "default";

/// 生成新的事件 ID
pub fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 生成新的关联 ID
pub fn new_correlation_id() -> String {
    format!("corr_{}", uuid::Uuid::new_v4().simple())
}
