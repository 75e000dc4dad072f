use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DEFAULT_TENANT, EventLineage, new_correlation_id};

/// 事件元数据，在发射时写入一次，此后不可变
#[derive(Builder, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// 关联ID
    #[builder(into, default = new_correlation_id())]
    correlation_id: String,
    /// 租户ID
    #[builder(into, default = DEFAULT_TENANT.to_string())]
    tenant_id: String,
    /// 发射时间
    #[builder(default = Utc::now())]
    timestamp: DateTime<Utc>,
    /// 因果ID（触发本事件的上游事件）
    causation_id: Option<String>,
    /// 祖先事件类型链
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    chain: Vec<String>,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EventMetadata {
    /// 以因果链构建元数据
    pub fn with_lineage(
        correlation_id: impl Into<String>,
        tenant_id: impl Into<String>,
        lineage: EventLineage,
    ) -> Self {
        let (causation_id, chain) = lineage.into_parts();

        Self::builder()
            .correlation_id(correlation_id)
            .tenant_id(tenant_id)
            .maybe_causation_id(causation_id)
            .chain(chain)
            .build()
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// 级联深度（根事件为 0）
    pub fn depth(&self) -> usize {
        self.chain.len()
    }
}
