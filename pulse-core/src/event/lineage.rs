use serde::{Deserialize, Serialize};

use super::Event;

/// 因果链：记录触发当前事件的上游事件，用于限制级联深度
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLineage {
    causation_id: Option<String>,
    chain: Vec<String>,
}

impl EventLineage {
    /// 由 `parent` 派生的下一级因果链
    pub fn child_of(parent: &Event) -> Self {
        let mut chain = parent.metadata().chain().to_vec();
        chain.push(parent.event_type().to_string());

        Self {
            causation_id: Some(parent.id().to_string()),
            chain,
        }
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    /// 祖先事件类型（由远及近）
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub fn depth(&self) -> usize {
        self.chain.len()
    }

    pub(crate) fn into_parts(self) -> (Option<String>, Vec<String>) {
        (self.causation_id, self.chain)
    }
}
