use chrono::{DateTime, Utc};

/// 执行上下文
///
/// 承载一次执行（工作流）的横切信息；租户派生的运行时与父运行时共享同一实例。
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    workflow_name: String,
    created_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(workflow_name: impl Into<String>) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            created_at: Utc::now(),
        }
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new("default")
    }
}
