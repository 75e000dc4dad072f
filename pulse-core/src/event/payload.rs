use serde::Serialize;
use serde_json::Value;

use crate::error::RuntimeResult;

/// 强类型事件载荷
///
/// 通常通过 `#[derive(EventPayload)]` 生成实现；事件类型名应保持稳定，
/// 不随重构变化，以便路由到已注册的处理器。
pub trait EventPayload: Serialize + Send + Sync {
    /// 事件类型名（如 `job.run`）
    fn event_type(&self) -> &'static str;

    /// 建议的入队优先级，`None` 时使用发射参数中的优先级
    fn priority(&self) -> Option<i32> {
        None
    }

    /// 序列化为事件数据
    fn to_event_data(&self) -> RuntimeResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_macros::EventPayload;
    use serde::Serialize;

    #[derive(Serialize, EventPayload)]
    #[event(event_type = "review.requested", priority = 3)]
    struct ReviewRequested {
        pull_request: u64,
    }

    #[derive(Serialize, EventPayload)]
    enum AgentSignal {
        #[event(event_type = "agent.tool_called")]
        ToolCalled { tool: String },
        Heartbeat,
    }

    #[test]
    fn derived_payload_exposes_type_priority_and_data() {
        let p = ReviewRequested { pull_request: 42 };

        assert_eq!(p.event_type(), "review.requested");
        assert_eq!(p.priority(), Some(3));
        assert_eq!(p.to_event_data().unwrap(), serde_json::json!({"pull_request": 42}));
    }

    #[test]
    fn enum_variants_default_to_enum_dot_variant() {
        let called = AgentSignal::ToolCalled { tool: "grep".into() };

        assert_eq!(called.event_type(), "agent.tool_called");
        assert_eq!(AgentSignal::Heartbeat.event_type(), "AgentSignal.Heartbeat");
        assert_eq!(AgentSignal::Heartbeat.priority(), None);
    }
}
