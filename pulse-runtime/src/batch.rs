//! 批量协调
//!
//! 发射的事件先进入缓冲，满足任一条件时整体入队：缓冲达到批量大小、
//! 计时器到期、显式刷新、或事件类型在立即刷新列表中。缓冲与计时器
//! 由同一把锁保护，刷新会先取消计时器再取走缓冲。
//!
use crate::config::BatchingConfig;
use crate::enqueue::Enqueuer;
use pulse_core::error::{RuntimeError, RuntimeResult};
use pulse_core::event::Event;
use serde::Serialize;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// 单次发射携带的批量参数
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    pub batch_size: Option<usize>,
    pub batch_timeout: Option<Duration>,
    pub flush_batch: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub buffered: usize,
    pub flushes: u64,
    pub flushed_events: u64,
    pub timer_armed: bool,
}

struct BatchEntry {
    event: Event,
    priority: i32,
}

#[derive(Default)]
struct BatchState {
    buffer: Vec<BatchEntry>,
    timer: Option<JoinHandle<()>>,
}

pub(crate) struct BatchCoordinator {
    config: BatchingConfig,
    enqueuer: Arc<Enqueuer>,
    state: Mutex<BatchState>,
    flushes: AtomicU64,
    flushed_events: AtomicU64,
}

impl BatchCoordinator {
    pub(crate) fn new(config: BatchingConfig, enqueuer: Arc<Enqueuer>) -> Arc<Self> {
        Arc::new(Self {
            config,
            enqueuer,
            state: Mutex::new(BatchState::default()),
            flushes: AtomicU64::new(0),
            flushed_events: AtomicU64::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn effective_size(&self, options: &BatchOptions) -> usize {
        options
            .batch_size
            .unwrap_or(self.config.default_batch_size)
            .min(self.config.max_batch_size)
            .max(1)
    }

    /// 追加到缓冲，返回是否需要立即刷新
    ///
    /// 不需要刷新且计时器未启动时按本次的超时启动计时器。
    pub(crate) fn add_to_batch(
        self: &Arc<Self>,
        event: Event,
        priority: i32,
        options: &BatchOptions,
    ) -> bool {
        let flush_on_type = self
            .config
            .flush_on_event_types
            .iter()
            .any(|t| t == event.event_type());
        let size = self.effective_size(options);

        let mut state = self.state();
        state.buffer.push(BatchEntry { event, priority });

        let should_flush = options.flush_batch || flush_on_type || state.buffer.len() >= size;
        if !should_flush && state.timer.is_none() {
            let timeout = options.batch_timeout.unwrap_or(self.config.default_batch_timeout);
            state.timer = Some(self.arm_timer(timeout));
        }
        should_flush
    }

    fn arm_timer(self: &Arc<Self>, timeout: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            // 先摘下自己的句柄，避免 flush 中止正在运行的自身
            drop(this.state().timer.take());
            if let Err(err) = this.flush().await {
                error!(error = %err, "timed batch flush failed");
            }
        })
    }

    /// 后台刷新，失败只记录日志
    pub(crate) fn spawn_flush(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.flush().await {
                error!(error = %err, "batch flush failed");
            }
        });
    }

    /// 取走整个缓冲并按顺序入队，返回成功入队的数量
    ///
    /// 取走缓冲与提交在同一把锁内完成，缓冲为空时也提交一个空请求：
    /// 返回时，此前任何一次刷新取走的事件都已写入队列。
    /// 任一事件入队失败时返回聚合错误，其余事件照常入队。
    pub(crate) async fn flush(&self) -> RuntimeResult<usize> {
        let (total, pending) = {
            let mut state = self.state();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let entries = mem::take(&mut state.buffer);
            let total = entries.len();
            let batch = entries.into_iter().map(|e| (e.event, e.priority)).collect();
            (total, self.enqueuer.submit_with_reply(batch, true))
        };

        let failures = match pending {
            Ok(pending) => pending.wait().await,
            Err(err) => Err(err),
        };
        let failures = match failures {
            Ok(failures) => failures,
            // 入口已关闭且没有自己的事件，无需等待
            Err(RuntimeError::ShuttingDown) if total == 0 => return Ok(0),
            Err(err) => return Err(err),
        };
        if total == 0 {
            return Ok(0);
        }

        let enqueued = total - failures.len();
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flushed_events.fetch_add(enqueued as u64, Ordering::Relaxed);

        if failures.is_empty() {
            debug!(events = total, "batch flushed");
            return Ok(total);
        }
        Err(RuntimeError::BatchFlush {
            failed: failures.len(),
            total,
            reasons: failures
                .into_iter()
                .map(|f| format!("{}: {}", f.event_id, f.error))
                .collect(),
        })
    }

    /// 丢弃缓冲并取消计时器，返回丢弃数量
    pub(crate) fn discard(&self) -> usize {
        let mut state = self.state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let dropped = state.buffer.len();
        state.buffer.clear();
        dropped
    }

    pub(crate) fn cancel_timer(&self) {
        if let Some(timer) = self.state().timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state().buffer.len()
    }

    pub(crate) fn stats(&self) -> BatchStats {
        let state = self.state();
        BatchStats {
            buffered: state.buffer.len(),
            flushes: self.flushes.load(Ordering::Relaxed),
            flushed_events: self.flushed_events.load(Ordering::Relaxed),
            timer_armed: state.timer.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::EmitFailure;
    use pulse_core::queue::{DurableQueue, InMemoryQueue};
    use serde_json::json;
    use tokio::sync::broadcast;

    fn coordinator(
        capacity: usize,
        config: BatchingConfig,
    ) -> (Arc<BatchCoordinator>, Arc<InMemoryQueue>, Arc<AtomicU64>) {
        let queue = Arc::new(InMemoryQueue::new(capacity, 100, None));
        let (tx, _) = broadcast::channel::<EmitFailure>(16);
        let failures = Arc::new(AtomicU64::new(0));
        let enqueuer = Arc::new(Enqueuer::spawn(queue.clone(), None, tx, failures.clone()));
        let config = BatchingConfig {
            enabled: true,
            ..config
        };
        (BatchCoordinator::new(config, enqueuer), queue, failures)
    }

    fn event(event_type: &str) -> Event {
        Event::new(event_type, json!({}))
    }

    #[tokio::test]
    async fn size_threshold_requests_flush() {
        let (batch, queue, _) = coordinator(10, BatchingConfig::default());
        let opts = BatchOptions {
            batch_size: Some(3),
            ..Default::default()
        };

        assert!(!batch.add_to_batch(event("a"), 0, &opts));
        assert!(!batch.add_to_batch(event("b"), 0, &opts));
        assert!(batch.add_to_batch(event("c"), 0, &opts));

        assert_eq!(batch.flush().await.unwrap(), 3);
        assert_eq!(queue.len(), 3);
        assert_eq!(batch.len(), 0);
        assert!(!batch.stats().timer_armed);
    }

    #[tokio::test]
    async fn requested_size_is_capped() {
        let (batch, _queue, _) = coordinator(
            10,
            BatchingConfig {
                max_batch_size: 2,
                ..Default::default()
            },
        );
        let opts = BatchOptions {
            batch_size: Some(500),
            ..Default::default()
        };

        assert!(!batch.add_to_batch(event("a"), 0, &opts));
        assert!(batch.add_to_batch(event("b"), 0, &opts));
    }

    #[tokio::test]
    async fn configured_types_flush_immediately() {
        let (batch, _queue, _) = coordinator(
            10,
            BatchingConfig {
                flush_on_event_types: vec!["workflow.finished".into()],
                ..Default::default()
            },
        );

        assert!(!batch.add_to_batch(event("step"), 0, &BatchOptions::default()));
        assert!(batch.add_to_batch(event("workflow.finished"), 0, &BatchOptions::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batch() {
        let (batch, queue, _) = coordinator(10, BatchingConfig::default());
        let opts = BatchOptions {
            batch_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };

        assert!(!batch.add_to_batch(event("a"), 0, &opts));
        assert!(batch.stats().timer_armed);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(queue.len(), 1);
        let stats = batch.stats();
        assert_eq!(stats.buffered, 0);
        assert_eq!(stats.flushes, 1);
        assert!(!stats.timer_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_cancels_timer() {
        let (batch, queue, _) = coordinator(10, BatchingConfig::default());
        batch.add_to_batch(event("a"), 0, &BatchOptions::default());
        batch.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(queue.len(), 1);
        assert_eq!(batch.stats().flushes, 1);
    }

    #[tokio::test]
    async fn partial_failure_is_aggregated() {
        let (batch, queue, failures) = coordinator(3, BatchingConfig::default());
        for n in 0..5 {
            batch.add_to_batch(event(&format!("e{n}")), 0, &BatchOptions::default());
        }

        let err = batch.flush().await.unwrap_err();
        match err {
            RuntimeError::BatchFlush {
                failed,
                total,
                reasons,
            } => {
                assert_eq!((failed, total), (2, 5));
                assert_eq!(reasons.len(), 2);
                assert!(reasons.iter().all(|r| r.contains("queue is full")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(failures.load(Ordering::Relaxed), 2);
        assert_eq!(batch.stats().flushed_events, 3);
    }

    #[tokio::test]
    async fn discard_drops_buffer() {
        let (batch, queue, _) = coordinator(10, BatchingConfig::default());
        batch.add_to_batch(event("a"), 0, &BatchOptions::default());
        batch.add_to_batch(event("b"), 0, &BatchOptions::default());

        assert_eq!(batch.discard(), 2);
        assert_eq!(batch.flush().await.unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn empty_flush_waits_for_flush_already_in_flight() {
        let (batch, queue, _) = coordinator(10, BatchingConfig::default());
        for n in 0..3 {
            batch.add_to_batch(event(&format!("e{n}")), 0, &BatchOptions::default());
        }

        let first = tokio::spawn({
            let batch = batch.clone();
            async move { batch.flush().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(batch.len(), 0);

        assert_eq!(batch.flush().await.unwrap(), 0);
        assert_eq!(queue.len(), 3);
        assert_eq!(first.await.unwrap().unwrap(), 3);
        assert_eq!(batch.stats().flushes, 1);
    }

    #[tokio::test]
    async fn empty_flush_after_shutdown_is_a_no_op() {
        let (batch, _queue, _) = coordinator(10, BatchingConfig::default());
        batch.enqueuer.shutdown().await;

        assert_eq!(batch.flush().await.unwrap(), 0);

        batch.add_to_batch(event("late"), 0, &BatchOptions::default());
        assert!(matches!(batch.flush().await, Err(RuntimeError::ShuttingDown)));
    }
}
