//! 运行时配置
//!
//! 所有选项各自带默认值，构造后不再修改；租户派生时逐字段构建新配置，
//! 不复用持久化后端。
//!
use crate::middleware::Middleware;
use chrono::Utc;
use pulse_core::event::DEFAULT_TENANT;
use pulse_core::memory::MemoryMonitorConfig;
use pulse_core::persist::Persistor;
use pulse_core::queue::QueueConfig;
use pulse_core::store::EventStoreConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 运行时配置
#[derive(Clone)]
pub struct RuntimeConfig {
    /// 队列最大待处理事件数
    pub queue_size: usize,
    /// 单次 `process()` 最多出队的事件数
    pub batch_size: usize,
    /// 同一事件多个处理器的并发度
    pub handler_concurrency: usize,
    /// 调度时输出 tracing span
    pub enable_observability: bool,
    pub max_event_depth: usize,
    pub max_event_chain_length: usize,
    /// 调度历史的清理周期
    pub cleanup_interval: Duration,
    /// 调度历史的过期阈值
    pub stale_threshold: Duration,
    /// 调度历史的最大条数
    pub history_size: usize,
    /// 处理器中间件，第一个位于最外层
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub memory_monitor: MemoryMonitorConfig,
    pub enable_acks: bool,
    pub ack_timeout: Duration,
    pub tenant_id: String,
    /// 队列持久化后端；设置后即开启队列持久化
    pub persistor: Option<Arc<dyn Persistor>>,
    /// 执行ID，`None` 时自动生成
    pub execution_id: Option<String>,
    pub queue_config: QueueConfig,
    pub enable_event_store: bool,
    pub event_store_config: EventStoreConfig,
    pub batching: BatchingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            batch_size: 100,
            handler_concurrency: 8,
            enable_observability: false,
            max_event_depth: 100,
            max_event_chain_length: 1_000,
            cleanup_interval: Duration::from_secs(120),
            stale_threshold: Duration::from_secs(600),
            history_size: 1_000,
            middleware: Vec::new(),
            memory_monitor: MemoryMonitorConfig::default(),
            enable_acks: true,
            ack_timeout: Duration::from_secs(30),
            tenant_id: DEFAULT_TENANT.to_string(),
            persistor: None,
            execution_id: None,
            queue_config: QueueConfig::default(),
            enable_event_store: false,
            event_store_config: EventStoreConfig::default(),
            batching: BatchingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// 派生租户配置
    ///
    /// 逐字段复制，不复用持久化后端，执行ID形如 `tenant_<id>_<毫秒时间戳>`。
    pub fn for_tenant(&self, tenant_id: &str) -> RuntimeConfig {
        RuntimeConfig {
            queue_size: self.queue_size,
            batch_size: self.batch_size,
            handler_concurrency: self.handler_concurrency,
            enable_observability: self.enable_observability,
            max_event_depth: self.max_event_depth,
            max_event_chain_length: self.max_event_chain_length,
            cleanup_interval: self.cleanup_interval,
            stale_threshold: self.stale_threshold,
            history_size: self.history_size,
            middleware: self.middleware.clone(),
            memory_monitor: self.memory_monitor.clone(),
            enable_acks: self.enable_acks,
            ack_timeout: self.ack_timeout,
            tenant_id: tenant_id.to_string(),
            persistor: None,
            execution_id: Some(format!(
                "tenant_{}_{}",
                tenant_id,
                Utc::now().timestamp_millis()
            )),
            queue_config: QueueConfig {
                enable_persistence: self.queue_config.enable_persistence || self.persistor.is_some(),
            },
            enable_event_store: self.enable_event_store,
            event_store_config: self.event_store_config.clone(),
            batching: self.batching.clone(),
        }
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let middleware: Vec<&str> = self.middleware.iter().map(|m| m.name()).collect();
        f.debug_struct("RuntimeConfig")
            .field("queue_size", &self.queue_size)
            .field("batch_size", &self.batch_size)
            .field("handler_concurrency", &self.handler_concurrency)
            .field("enable_observability", &self.enable_observability)
            .field("max_event_depth", &self.max_event_depth)
            .field("max_event_chain_length", &self.max_event_chain_length)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("stale_threshold", &self.stale_threshold)
            .field("history_size", &self.history_size)
            .field("middleware", &middleware)
            .field("memory_monitor", &self.memory_monitor)
            .field("enable_acks", &self.enable_acks)
            .field("ack_timeout", &self.ack_timeout)
            .field("tenant_id", &self.tenant_id)
            .field("persistor", &self.persistor.as_ref().map(|p| p.kind()))
            .field("execution_id", &self.execution_id)
            .field("queue_config", &self.queue_config)
            .field("enable_event_store", &self.enable_event_store)
            .field("event_store_config", &self.event_store_config)
            .field("batching", &self.batching)
            .finish()
    }
}

/// 批量策略
#[derive(Debug, Clone)]
pub struct BatchingConfig {
    pub enabled: bool,
    pub default_batch_size: usize,
    pub default_batch_timeout: Duration,
    /// 单次发射可指定的批量上限
    pub max_batch_size: usize,
    /// 这些类型的事件到达时立即刷新
    pub flush_on_event_types: Vec<String>,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_batch_size: 50,
            default_batch_timeout: Duration::from_millis(100),
            max_batch_size: 1_000,
            flush_on_event_types: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::persist::InMemoryPersistor;

    #[test]
    fn tenant_config_is_flat_copy_without_persistor() {
        let parent = RuntimeConfig {
            queue_size: 7,
            ack_timeout: Duration::from_millis(250),
            persistor: Some(Arc::new(InMemoryPersistor::new())),
            execution_id: Some("exec-parent".into()),
            batching: BatchingConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let child = parent.for_tenant("acme");

        assert_eq!(child.tenant_id, "acme");
        assert_eq!(child.queue_size, 7);
        assert_eq!(child.ack_timeout, Duration::from_millis(250));
        assert!(child.batching.enabled);
        assert!(child.persistor.is_none());
        // 父运行时有持久化，租户使用全新的后端继续持久化
        assert!(child.queue_config.enable_persistence);
        let exec = child.execution_id.unwrap();
        assert!(exec.starts_with("tenant_acme_"), "{exec}");
    }

    #[test]
    fn deriving_twice_does_not_nest() {
        let grand = RuntimeConfig::default().for_tenant("a").for_tenant("b");
        assert_eq!(grand.tenant_id, "b");
        assert!(grand.execution_id.unwrap().starts_with("tenant_b_"));
    }
}
