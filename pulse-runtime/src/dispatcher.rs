//! 事件调度
//!
//! 按事件类型查找处理器（含通配 `*`），以有限并发执行，并保留一段
//! 有界的调度历史供诊断查询；历史由周期任务按过期阈值清理。
//!
use crate::config::RuntimeConfig;
use crate::middleware::{self, Middleware};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, stream};
use pulse_core::error::{RuntimeError, RuntimeResult};
use pulse_core::event::Event;
use pulse_core::handler::{EventHandler, same_handler};
use pulse_core::task::PeriodicTask;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 订阅全部事件类型
pub const WILDCARD: &str = "*";

/// 调度参数，取自运行时配置
#[derive(Clone)]
pub struct DispatcherSettings {
    pub handler_concurrency: usize,
    pub max_event_depth: usize,
    pub max_event_chain_length: usize,
    pub cleanup_interval: Duration,
    pub stale_threshold: Duration,
    pub history_size: usize,
    pub middleware: Vec<Arc<dyn Middleware>>,
}

impl From<&RuntimeConfig> for DispatcherSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            handler_concurrency: config.handler_concurrency,
            max_event_depth: config.max_event_depth,
            max_event_chain_length: config.max_event_chain_length,
            cleanup_interval: config.cleanup_interval,
            stale_threshold: config.stale_threshold,
            history_size: config.history_size,
            middleware: config.middleware.clone(),
        }
    }
}

/// 调度结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Handled,
    Unhandled,
    Failed(String),
    Rejected(String),
}

/// 一次调度的记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRecord {
    pub event: Event,
    pub handlers: usize,
    pub outcome: DispatchOutcome,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatcherStats {
    pub event_types: usize,
    pub handlers: usize,
    pub dispatched: u64,
    pub failed: u64,
    pub unhandled: u64,
    pub rejected: u64,
    pub history: usize,
}

#[derive(Clone)]
struct RegisteredHandler {
    original: Arc<dyn EventHandler>,
    wrapped: Arc<dyn EventHandler>,
}

pub struct Dispatcher {
    settings: DispatcherSettings,
    handlers: DashMap<String, Vec<RegisteredHandler>>,
    history: Mutex<VecDeque<(Instant, DispatchRecord)>>,
    cleanup_task: Mutex<Option<PeriodicTask>>,
    dispatched: AtomicU64,
    failed: AtomicU64,
    unhandled: AtomicU64,
    rejected: AtomicU64,
}

impl Dispatcher {
    pub fn new(settings: DispatcherSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            handlers: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            cleanup_task: Mutex::new(None),
            dispatched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            unhandled: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<(Instant, DispatchRecord)>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 启动历史清理任务
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.cleanup_task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(PeriodicTask::spawn(self.settings.cleanup_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.prune_stale();
                }
            }
        }));
    }

    /// 注册处理器；同一实例可以注册到多个事件类型
    pub fn on(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        let wrapped = middleware::apply(&self.settings.middleware, handler.clone());
        debug!(event_type = %event_type, handler = handler.handler_name(), "handler registered");
        self.handlers
            .entry(event_type)
            .or_default()
            .push(RegisteredHandler {
                original: handler,
                wrapped,
            });
    }

    /// 按实例移除处理器
    pub fn off(&self, event_type: &str, handler: &Arc<dyn EventHandler>) -> bool {
        let removed = match self.handlers.get_mut(event_type) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|h| !same_handler(&h.original, handler));
                before != list.len()
            }
            None => false,
        };
        self.handlers.remove_if(event_type, |_, list| list.is_empty());
        if removed {
            debug!(event_type, handler = handler.handler_name(), "handler removed");
        }
        removed
    }

    /// 移除某事件类型的全部处理器，返回数量
    pub fn off_all(&self, event_type: &str) -> usize {
        self.handlers
            .remove(event_type)
            .map(|(_, list)| list.len())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.handlers.clear();
        self.history().clear();
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map(|l| l.len()).unwrap_or(0)
    }

    fn matching(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut found = Vec::new();
        if let Some(list) = self.handlers.get(event_type) {
            found.extend(list.iter().map(|h| h.wrapped.clone()));
        }
        if event_type != WILDCARD {
            if let Some(list) = self.handlers.get(WILDCARD) {
                found.extend(list.iter().map(|h| h.wrapped.clone()));
            }
        }
        found
    }

    fn check_limits(&self, event: &Event) -> RuntimeResult<()> {
        let chain = event.metadata().chain().len();
        if chain > self.settings.max_event_chain_length {
            return Err(RuntimeError::EventChainTooLong {
                event_type: event.event_type().to_string(),
                length: chain,
                max: self.settings.max_event_chain_length,
            });
        }
        let depth = event.metadata().depth();
        if depth > self.settings.max_event_depth {
            return Err(RuntimeError::EventDepthExceeded {
                event_type: event.event_type().to_string(),
                depth,
                max: self.settings.max_event_depth,
            });
        }
        Ok(())
    }

    /// 将事件交给全部匹配的处理器
    ///
    /// 处理器并发执行；任一失败时返回第一个失败（按注册顺序），没有处理器视为成功。
    pub async fn dispatch(&self, event: &Event) -> RuntimeResult<()> {
        if let Err(err) = self.check_limits(event) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(event_id = event.id(), error = %err, "event rejected by dispatcher");
            self.record(event, 0, DispatchOutcome::Rejected(err.to_string()));
            return Err(err);
        }

        let handlers = self.matching(event.event_type());
        let count = handlers.len();
        if count == 0 {
            self.unhandled.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = event.id(), event_type = event.event_type(), "no handler registered");
            self.record(event, 0, DispatchOutcome::Unhandled);
            return Ok(());
        }

        // 装箱为具体类型，调用方在 Send future 中等待时无需高阶推断
        let calls: Vec<BoxFuture<'_, (String, anyhow::Result<()>)>> = handlers
            .into_iter()
            .map(|handler| {
                async move {
                    let result = handler.handle(event).await;
                    (handler.handler_name().to_string(), result)
                }
                .boxed()
            })
            .collect();
        let results: Vec<(String, anyhow::Result<()>)> = stream::iter(calls)
            .buffered(self.settings.handler_concurrency.max(1))
            .collect()
            .await;

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let mut first: Option<RuntimeError> = None;
        for (name, result) in results {
            let Err(err) = result else { continue };
            if first.is_none() {
                first = Some(RuntimeError::Handler {
                    handler: name,
                    event_type: event.event_type().to_string(),
                    reason: format!("{err:#}"),
                });
            } else {
                warn!(event_id = event.id(), handler = %name, error = %err, "additional handler failure");
            }
        }

        match first {
            None => {
                self.record(event, count, DispatchOutcome::Handled);
                Ok(())
            }
            Some(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.record(event, count, DispatchOutcome::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    fn record(&self, event: &Event, handlers: usize, outcome: DispatchOutcome) {
        let capacity = self.settings.history_size;
        if capacity == 0 {
            return;
        }
        let mut history = self.history();
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back((
            Instant::now(),
            DispatchRecord {
                event: event.clone(),
                handlers,
                outcome,
                dispatched_at: Utc::now(),
            },
        ));
    }

    /// 最近的调度记录，新的在前
    pub fn recent(&self, limit: usize) -> Vec<DispatchRecord> {
        self.history()
            .iter()
            .rev()
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// 删除超过过期阈值的历史，返回数量
    pub fn prune_stale(&self) -> usize {
        let threshold = self.settings.stale_threshold;
        let mut history = self.history();
        let mut pruned = 0;
        while history
            .front()
            .is_some_and(|(at, _)| at.elapsed() > threshold)
        {
            history.pop_front();
            pruned += 1;
        }
        if pruned > 0 {
            debug!(pruned, remaining = history.len(), "stale dispatch history pruned");
        }
        pruned
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            event_types: self.handlers.len(),
            handlers: self.handlers.iter().map(|l| l.len()).sum(),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            history: self.history().len(),
        }
    }

    /// 停止清理任务并清空历史；处理器保留
    pub async fn cleanup(&self) {
        let task = self.cleanup_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.stop().await;
        }
        self.history().clear();
        debug!("dispatcher cleaned up");
    }
}
