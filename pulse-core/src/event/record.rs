use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EventLineage, EventMetadata, new_event_id};

/// 运行时事件：一经创建即不可变
///
/// 元数据的补全（关联ID、租户、因果链）只在发射时进行一次。
#[derive(Builder, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 事件唯一标识符
    #[builder(into, default = new_event_id())]
    id: String,
    /// 事件类型，用于路由到处理器
    #[builder(into)]
    event_type: String,
    /// 事件负载
    #[builder(default = Value::Null)]
    payload: Value,
    /// 元数据
    #[builder(default)]
    metadata: EventMetadata,
}

impl Event {
    /// 以默认元数据创建事件
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self::builder()
            .event_type(event_type)
            .payload(payload)
            .build()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    /// 本事件作为上游时派生的因果链
    pub fn lineage(&self) -> EventLineage {
        EventLineage::child_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DEFAULT_TENANT;
    use serde_json::json;

    #[test]
    fn new_event_has_fresh_identity_and_default_tenant() {
        let a = Event::new("job.run", json!({"n": 1}));
        let b = Event::new("job.run", json!({"n": 1}));

        assert_ne!(a.id(), b.id());
        assert_ne!(a.metadata().correlation_id(), b.metadata().correlation_id());
        assert_eq!(a.metadata().tenant_id(), DEFAULT_TENANT);
        assert_eq!(a.metadata().depth(), 0);
        assert!(a.metadata().causation_id().is_none());
    }

    #[test]
    fn lineage_accumulates_ancestor_types() {
        let root = Event::new("workflow.start", Value::Null);
        let child = Event::builder()
            .event_type("step.run")
            .metadata(EventMetadata::with_lineage("c-1", "acme", root.lineage()))
            .build();
        let grandchild_lineage = child.lineage();

        assert_eq!(child.metadata().causation_id(), Some(root.id()));
        assert_eq!(child.metadata().depth(), 1);
        assert_eq!(grandchild_lineage.depth(), 2);
        assert_eq!(
            grandchild_lineage.chain(),
            &["workflow.start".to_string(), "step.run".to_string()]
        );
    }

    #[test]
    fn serde_skips_empty_chain() {
        let ev = Event::builder().id("e-1").event_type("x").build();
        let v = serde_json::to_value(&ev).unwrap();

        assert_eq!(v["id"], "e-1");
        assert!(v["metadata"].get("chain").is_none());

        let back: Event = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }
}
