//! 运行时门面
//!
//! 组合确认跟踪、批量协调、单写者入队、调度器与各协作组件，负责配置默认值、
//! 租户派生与有序关闭。`Runtime` 可廉价克隆，克隆共享同一组内部状态。
//!
use crate::ack::AckTracker;
use crate::batch::{BatchCoordinator, BatchOptions};
use crate::config::RuntimeConfig;
use crate::context::ExecutionContext;
use crate::dispatcher::{DispatchRecord, Dispatcher, DispatcherSettings};
use crate::enqueue::{Enqueuer, PendingEnqueue};
use crate::options::{EmitFailure, EmitOptions, EmitResult};
use crate::stats::{DeliveryStats, ProcessStats, RuntimeIdentity, RuntimeStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use pulse_core::error::{RuntimeError, RuntimeResult};
use pulse_core::event::{
    Event, EventMetadata, EventPayload, new_correlation_id, new_event_id,
};
use pulse_core::handler::EventHandler;
use pulse_core::memory::MemoryMonitor;
use pulse_core::persist::PersistorKind;
use pulse_core::queue::{DurableQueue, EventProcessor, InMemoryQueue, QueueItemSnapshot};
use pulse_core::store::{EventStore, PersistentEventStore, ReplayOptions};
use pulse_core::stream::{EventStream, StreamManager};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{Instrument, debug, error, info, info_span, warn};

const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// 事件运行时
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    execution_id: String,
    persistor_type: String,
    context: Arc<ExecutionContext>,
    queue: Arc<dyn DurableQueue>,
    dispatcher: Arc<Dispatcher>,
    acks: Arc<AckTracker>,
    enqueuer: Arc<Enqueuer>,
    batcher: Option<Arc<BatchCoordinator>>,
    event_store: Option<Arc<dyn EventStore>>,
    streams: StreamManager,
    memory: Option<Arc<MemoryMonitor>>,
    failures: broadcast::Sender<EmitFailure>,
    emit_failures: Arc<AtomicU64>,
    shut_down: AtomicBool,
    /// 发射在读锁内登记，关闭在写锁内置位：置位后不会再有事件进入跟踪或缓冲
    emission_gate: RwLock<()>,
}

/// 发射在门内完成的同步部分
enum Admission {
    Settled(EmitResult),
    Enqueueing(EmitResult, PendingEnqueue),
    Flushing(EmitResult, Arc<BatchCoordinator>),
}

impl Runtime {
    /// 以默认执行上下文创建运行时
    ///
    /// 必须在 tokio 运行时上下文中调用：后台清扫、清理与入队任务在此启动。
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_context(config, Arc::new(ExecutionContext::default()))
    }

    /// 使用共享的执行上下文创建运行时
    pub fn with_context(config: RuntimeConfig, context: Arc<ExecutionContext>) -> Self {
        let persistor = config.persistor.clone().or_else(|| {
            config
                .queue_config
                .enable_persistence
                .then(|| PersistorKind::Memory.create())
        });
        let persistor_type = persistor
            .as_ref()
            .map(|p| p.kind().to_string())
            .unwrap_or_else(|| "none".to_string());
        let queue: Arc<dyn DurableQueue> = Arc::new(InMemoryQueue::new(
            config.queue_size,
            config.batch_size,
            persistor,
        ));
        Self::build(config, context, queue, persistor_type)
    }

    /// 使用自定义队列实现创建运行时
    pub fn with_queue(
        config: RuntimeConfig,
        context: Arc<ExecutionContext>,
        queue: Arc<dyn DurableQueue>,
    ) -> Self {
        Self::build(config, context, queue, "custom".to_string())
    }

    fn build(
        config: RuntimeConfig,
        context: Arc<ExecutionContext>,
        queue: Arc<dyn DurableQueue>,
        persistor_type: String,
    ) -> Self {
        let execution_id = config
            .execution_id
            .clone()
            .unwrap_or_else(|| format!("exec_{}", uuid::Uuid::new_v4().simple()));

        let event_store: Option<Arc<dyn EventStore>> = config
            .enable_event_store
            .then(|| Arc::new(PersistentEventStore::new(&config.event_store_config)) as _);

        let acks = AckTracker::new(config.enable_acks, config.ack_timeout, event_store.clone());
        acks.start();

        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let emit_failures = Arc::new(AtomicU64::new(0));
        let enqueuer = Arc::new(Enqueuer::spawn(
            queue.clone(),
            event_store.clone(),
            failures.clone(),
            emit_failures.clone(),
        ));

        let batcher = config
            .batching
            .enabled
            .then(|| BatchCoordinator::new(config.batching.clone(), enqueuer.clone()));

        let dispatcher = Dispatcher::new(DispatcherSettings::from(&config));
        dispatcher.start();

        let memory = config.memory_monitor.enabled.then(|| {
            let monitor = MemoryMonitor::new(config.memory_monitor.clone());
            monitor.start();
            monitor
        });

        info!(
            execution_id = %execution_id,
            tenant_id = %config.tenant_id,
            workflow = context.workflow_name(),
            persistor = %persistor_type,
            acks = config.enable_acks,
            batching = config.batching.enabled,
            "runtime created"
        );

        Self {
            inner: Arc::new(RuntimeInner {
                config,
                execution_id,
                persistor_type,
                context,
                queue,
                dispatcher,
                acks,
                enqueuer,
                batcher,
                event_store,
                streams: StreamManager::new(),
                memory,
                failures,
                emit_failures,
                shut_down: AtomicBool::new(false),
                emission_gate: RwLock::new(()),
            }),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.inner.execution_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.inner.config.tenant_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.inner.context
    }

    fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// 关闭发射门，返回是否由本次调用关闭
    fn close_emission(&self) -> bool {
        let _gate = self
            .inner
            .emission_gate
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        !self.inner.shut_down.swap(true, Ordering::AcqRel)
    }

    // ---- 处理器 ----

    pub fn on(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.inner.dispatcher.on(event_type, handler);
    }

    /// 按实例移除处理器，返回是否移除
    pub fn off(&self, event_type: &str, handler: &Arc<dyn EventHandler>) -> bool {
        self.inner.dispatcher.off(event_type, handler)
    }

    /// 移除某事件类型的全部处理器，返回数量
    pub fn off_all(&self, event_type: &str) -> usize {
        self.inner.dispatcher.off_all(event_type)
    }

    // ---- 事件构建 ----

    /// 以运行时租户和新的关联ID构建事件，不入队
    pub fn create_event(&self, event_type: impl Into<String>, data: Value) -> Event {
        Event::builder()
            .event_type(event_type)
            .payload(data)
            .metadata(
                EventMetadata::builder()
                    .correlation_id(new_correlation_id())
                    .tenant_id(self.inner.config.tenant_id.clone())
                    .build(),
            )
            .build()
    }

    fn build_event(&self, event_type: String, data: Value, options: &EmitOptions) -> Event {
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(new_correlation_id);
        let tenant_id = options
            .tenant_id
            .clone()
            .unwrap_or_else(|| self.inner.config.tenant_id.clone());
        let lineage = options.lineage.clone().unwrap_or_default();

        Event::builder()
            .event_type(event_type)
            .payload(data)
            .metadata(EventMetadata::with_lineage(correlation_id, tenant_id, lineage))
            .build()
    }

    fn batcher_for(&self, options: &EmitOptions) -> Option<&Arc<BatchCoordinator>> {
        match options.batch {
            Some(false) => None,
            _ => self.inner.batcher.as_ref(),
        }
    }

    fn rejected(&self, options: &EmitOptions) -> EmitResult {
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(new_correlation_id);
        EmitResult::failed(&new_event_id(), &correlation_id, RuntimeError::ShuttingDown)
    }

    // ---- 发射 ----

    /// 非阻塞发射
    ///
    /// 立即返回 `queued: true`；后续入队失败只进入日志、统计与
    /// [`Runtime::emit_failures`]。关闭后返回 `ShuttingDown`。
    pub fn emit(&self, event_type: impl Into<String>, data: Value, options: EmitOptions) -> EmitResult {
        if self.is_shut_down() {
            return self.rejected(&options);
        }
        let event = self.build_event(event_type.into(), data, &options);
        self.dispatch_emit(event, options.priority, &options)
    }

    fn dispatch_emit(&self, event: Event, priority: i32, options: &EmitOptions) -> EmitResult {
        match self.admit(event, priority, options, false) {
            Admission::Settled(result)
            | Admission::Enqueueing(result, _)
            | Admission::Flushing(result, _) => result,
        }
    }

    /// 在发射门内完成跟踪与缓冲或提交；关闭后一律拒绝
    ///
    /// `wait` 为真时不等待，而是把需要等待的部分交还给调用方在门外完成。
    fn admit(&self, event: Event, priority: i32, options: &EmitOptions, wait: bool) -> Admission {
        let _gate = self
            .inner
            .emission_gate
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_shut_down() {
            return Admission::Settled(self.rejected(options));
        }

        let result = EmitResult::queued(&event);
        self.inner.acks.track(&event);

        if let Some(batcher) = self.batcher_for(options) {
            let should_flush = batcher.add_to_batch(event, priority, &batch_options(options));
            if wait && options.flush_batch {
                return Admission::Flushing(result, batcher.clone());
            }
            if should_flush {
                batcher.spawn_flush();
            }
            return Admission::Settled(result);
        }

        let submitted = if wait {
            self.inner
                .enqueuer
                .submit_with_reply(vec![(event, priority)], false)
                .map(Some)
        } else {
            self.inner.enqueuer.submit(vec![(event, priority)]).map(|()| None)
        };
        match submitted {
            Ok(Some(pending)) => Admission::Enqueueing(result, pending),
            Ok(None) => Admission::Settled(result),
            Err(err) => Admission::Settled(EmitResult::failed(
                &result.event_id,
                &result.correlation_id,
                err,
            )),
        }
    }

    /// 可等待的发射：入队失败体现在结果中
    ///
    /// 启用批量且设置了 `flush_batch` 时，等到包含本事件的缓冲全部入队后才返回。
    pub async fn emit_async(
        &self,
        event_type: impl Into<String>,
        data: Value,
        options: EmitOptions,
    ) -> EmitResult {
        if self.is_shut_down() {
            return self.rejected(&options);
        }
        let event = self.build_event(event_type.into(), data, &options);
        self.dispatch_emit_async(event, options.priority, &options).await
    }

    async fn dispatch_emit_async(
        &self,
        event: Event,
        priority: i32,
        options: &EmitOptions,
    ) -> EmitResult {
        match self.admit(event, priority, options, true) {
            Admission::Settled(result) => result,
            Admission::Flushing(result, batcher) => match batcher.flush().await {
                Ok(_) => result,
                Err(err) => EmitResult::failed(&result.event_id, &result.correlation_id, err),
            },
            Admission::Enqueueing(result, pending) => match pending.wait().await {
                Ok(failures) => match failures.into_iter().next() {
                    None => result,
                    Some(failure) => {
                        EmitResult::failed(&result.event_id, &result.correlation_id, failure.error)
                    }
                },
                Err(err) => EmitResult::failed(&result.event_id, &result.correlation_id, err),
            },
        }
    }

    /// 发射类型化负载；负载自带的优先级优先于参数中的优先级
    pub fn emit_payload<P: EventPayload>(&self, payload: &P, options: EmitOptions) -> EmitResult {
        if self.is_shut_down() {
            return self.rejected(&options);
        }
        match payload.to_event_data() {
            Ok(data) => {
                let priority = payload.priority().unwrap_or(options.priority);
                let event = self.build_event(payload.event_type().to_string(), data, &options);
                self.dispatch_emit(event, priority, &options)
            }
            Err(err) => {
                warn!(event_type = payload.event_type(), error = %err, "failed to serialize event payload");
                let correlation_id = options.correlation_id.clone().unwrap_or_else(new_correlation_id);
                EmitResult::failed(&new_event_id(), &correlation_id, err)
            }
        }
    }

    pub async fn emit_payload_async<P: EventPayload>(
        &self,
        payload: &P,
        options: EmitOptions,
    ) -> EmitResult {
        if self.is_shut_down() {
            return self.rejected(&options);
        }
        match payload.to_event_data() {
            Ok(data) => {
                let priority = payload.priority().unwrap_or(options.priority);
                let event = self.build_event(payload.event_type().to_string(), data, &options);
                self.dispatch_emit_async(event, priority, &options).await
            }
            Err(err) => {
                let correlation_id = options.correlation_id.clone().unwrap_or_else(new_correlation_id);
                EmitResult::failed(&new_event_id(), &correlation_id, err)
            }
        }
    }

    /// 立即刷新批量缓冲，返回入队数量；未启用批量时为 0
    pub async fn flush_batch(&self) -> RuntimeResult<usize> {
        match &self.inner.batcher {
            Some(batcher) => batcher.flush().await,
            None => Ok(0),
        }
    }

    /// 订阅后台入队失败
    pub fn emit_failures(&self) -> broadcast::Receiver<EmitFailure> {
        self.inner.failures.subscribe()
    }

    /// 以流的形式订阅后台入队失败；落后过多时跳过丢失的通知
    pub fn emit_failure_stream(&self) -> impl Stream<Item = EmitFailure> + Send + 'static {
        BroadcastStream::new(self.inner.failures.subscribe())
            .filter_map(|item| async move { item.ok() })
    }

    // ---- 处理与确认 ----

    /// 出队一批事件并调度
    ///
    /// 成功时自动确认，失败时自动否认；失败事件计入队列统计并结束本轮出队，
    /// 剩余事件留待下次调用。只有队列自身故障才会返回错误。
    pub async fn process(&self) -> RuntimeResult<ProcessStats> {
        let processor = RuntimeProcessor {
            dispatcher: self.inner.dispatcher.clone(),
            acks: self.inner.acks.clone(),
            observability: self.inner.config.enable_observability,
            workflow: self.inner.context.workflow_name().to_string(),
            processed: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        };
        self.inner.queue.process_all(&processor).await?;

        let stats = processor.stats();
        debug!(
            processed = stats.processed,
            acked = stats.acked,
            failed = stats.failed,
            "process round finished"
        );
        Ok(stats)
    }

    pub async fn ack(&self, event_id: &str) -> bool {
        self.inner.acks.ack(event_id).await
    }

    pub fn nack(&self, event_id: &str, error: Option<&str>) -> bool {
        self.inner.acks.nack(event_id, error)
    }

    // ---- 流与租户 ----

    pub fn create_stream<S>(&self, source: S) -> EventStream<S::Item>
    where
        S: Stream + Send + 'static,
    {
        self.inner.streams.create_stream(source)
    }

    /// 派生独立的租户运行时
    ///
    /// 共享执行上下文，配置逐字段复制，不复用持久化后端；两者的队列互不影响。
    pub fn for_tenant(&self, tenant_id: &str) -> Runtime {
        Runtime::with_context(
            self.inner.config.for_tenant(tenant_id),
            self.inner.context.clone(),
        )
    }

    // ---- 查询 ----

    /// 统计快照；未启用的组件报告为 `None`
    pub async fn get_stats(&self) -> RuntimeStats {
        let acks = self.inner.acks.stats();
        let event_store = match &self.inner.event_store {
            Some(store) => Some(store.stats().await),
            None => None,
        };

        RuntimeStats {
            runtime: RuntimeIdentity {
                execution_id: self.inner.execution_id.clone(),
                tenant_id: self.inner.config.tenant_id.clone(),
                workflow_name: self.inner.context.workflow_name().to_string(),
                persistor_type: self.inner.persistor_type.clone(),
                shut_down: self.is_shut_down(),
            },
            queue: self.inner.queue.stats(),
            dispatcher: self.inner.dispatcher.stats(),
            stream: self.inner.streams.stats(),
            memory: self.inner.memory.as_ref().map(|m| m.stats()),
            delivery: DeliveryStats {
                enable_acks: self.inner.acks.is_enabled(),
                ack_timeout_ms: self.inner.acks.ack_timeout().as_millis() as u64,
                pending_acks: acks.pending,
                acked: acks.acked,
                nacked: acks.nacked,
                expired: acks.expired,
                emit_failures: self.inner.emit_failures.load(Ordering::Relaxed),
            },
            batching: self.inner.batcher.as_ref().map(|b| b.stats()),
            event_store,
        }
    }

    /// 最近的调度记录，新的在前
    pub fn get_recent_events(&self, limit: usize) -> Vec<DispatchRecord> {
        self.inner.dispatcher.recent(limit)
    }

    /// 按出队顺序返回前 `limit` 个待处理事件
    pub fn get_queue_snapshot(&self, limit: usize) -> Vec<QueueItemSnapshot> {
        self.inner.queue.snapshot(limit)
    }

    pub fn get_event_store(&self) -> Option<Arc<dyn EventStore>> {
        self.inner.event_store.clone()
    }

    /// 从事件存储按批重放；未启用事件存储时返回空流
    pub async fn replay_events(
        &self,
        from: DateTime<Utc>,
        options: ReplayOptions,
    ) -> BoxStream<'static, RuntimeResult<Vec<Event>>> {
        match &self.inner.event_store {
            Some(store) => store.replay(from, options).await,
            None => {
                warn!(execution_id = %self.inner.execution_id, "event store disabled, nothing to replay");
                futures_util::stream::empty().boxed()
            }
        }
    }

    /// 将 `from` 之后持久化但未处理的事件重新放回队列，返回数量
    pub async fn replay_queue(&self, from: DateTime<Utc>) -> RuntimeResult<usize> {
        self.inner.queue.replay_from(from).await
    }

    // ---- 生命周期 ----

    /// 清空队列、待确认条目、批量缓冲与处理器；运行时仍可继续使用
    pub async fn clear(&self) {
        let buffered = self
            .inner
            .batcher
            .as_ref()
            .map(|b| b.discard())
            .unwrap_or(0);
        let pending = self.inner.acks.clear();
        if let Err(err) = self.inner.queue.clear().await {
            error!(error = %err, "failed to clear queue");
        }
        self.inner.dispatcher.clear();
        info!(buffered, pending, "runtime cleared");
    }

    /// 有序关闭
    ///
    /// 先尽力刷新批量缓冲，再停止确认清扫与内存监控，并发清理调度器与流，
    /// 最后等待入队完成并释放队列。重复调用为空操作。
    pub async fn cleanup(&self) {
        if !self.close_emission() {
            return;
        }
        let inner = &self.inner;

        if let Some(batcher) = &inner.batcher {
            if let Err(err) = batcher.flush().await {
                error!(error = %err, "batch flush during cleanup failed");
            }
            batcher.cancel_timer();
        }

        inner.acks.stop().await;
        let dropped = inner.acks.clear();
        if dropped > 0 {
            warn!(dropped, "pending acknowledgements dropped at shutdown");
        }

        if let Some(memory) = &inner.memory {
            memory.stop().await;
        }

        tokio::join!(inner.dispatcher.cleanup(), inner.streams.cleanup());

        inner.enqueuer.shutdown().await;
        if let Err(err) = inner.queue.close().await {
            error!(error = %err, "failed to close queue");
        }
        info!(execution_id = %inner.execution_id, "runtime cleaned up");
    }
}

fn batch_options(options: &EmitOptions) -> BatchOptions {
    BatchOptions {
        batch_size: options.batch_size,
        batch_timeout: options.batch_timeout,
        flush_batch: options.flush_batch,
    }
}

/// 出队后的单事件处理：调度，然后确认或否认
struct RuntimeProcessor {
    dispatcher: Arc<Dispatcher>,
    acks: Arc<AckTracker>,
    observability: bool,
    workflow: String,
    processed: AtomicU64,
    acked: AtomicU64,
    failed: AtomicU64,
}

impl RuntimeProcessor {
    fn stats(&self) -> ProcessStats {
        ProcessStats {
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventProcessor for RuntimeProcessor {
    async fn process(&self, event: &Event) -> RuntimeResult<()> {
        self.processed.fetch_add(1, Ordering::Relaxed);

        let dispatch = self.dispatcher.dispatch(event);
        let result = if self.observability {
            let span = info_span!(
                "pulse.dispatch",
                workflow = %self.workflow,
                event_id = event.id(),
                event_type = event.event_type(),
                tenant_id = event.metadata().tenant_id(),
                correlation_id = event.metadata().correlation_id(),
            );
            dispatch.instrument(span).await
        } else {
            dispatch.await
        };

        match result {
            Ok(()) => {
                if self.acks.is_enabled() {
                    self.acks.ack(event.id()).await;
                    self.acked.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if self.acks.is_enabled() {
                    self.acks.nack(event.id(), Some(&err.to_string()));
                }
                // 交还给队列计入失败
                Err(err)
            }
        }
    }
}
