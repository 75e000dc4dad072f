//! 单写者入队
//!
//! 所有入队请求都经由一个后台 worker 串行写入队列，`emit` 与批量刷新
//! 因此保持提交顺序，且无需在调用方之间加锁。
//!
use crate::options::EmitFailure;
use pulse_core::error::{RuntimeError, RuntimeResult};
use pulse_core::event::Event;
use pulse_core::queue::DurableQueue;
use pulse_core::store::EventStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// 单个事件的入队失败
#[derive(Debug)]
pub(crate) struct EnqueueFailure {
    pub event_id: String,
    pub error: RuntimeError,
}

struct EnqueueRequest {
    entries: Vec<(Event, i32)>,
    /// 调用方看不到结果时，失败需要广播出去
    notify: bool,
    reply: Option<oneshot::Sender<Vec<EnqueueFailure>>>,
}

/// 已提交、尚未写入的请求
pub(crate) struct PendingEnqueue(oneshot::Receiver<Vec<EnqueueFailure>>);

impl PendingEnqueue {
    /// 等待 worker 处理完该请求，返回其中的失败项
    pub(crate) async fn wait(self) -> RuntimeResult<Vec<EnqueueFailure>> {
        self.0.await.map_err(|_| RuntimeError::ShuttingDown)
    }
}

pub(crate) struct Enqueuer {
    tx: Mutex<Option<mpsc::UnboundedSender<EnqueueRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Enqueuer {
    pub(crate) fn spawn(
        queue: Arc<dyn DurableQueue>,
        store: Option<Arc<dyn EventStore>>,
        failures: broadcast::Sender<EmitFailure>,
        failure_count: Arc<AtomicU64>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(rx, queue, store, failures, failure_count));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    fn send(&self, request: EnqueueRequest) -> RuntimeResult<()> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(request).map_err(|_| RuntimeError::ShuttingDown),
            None => Err(RuntimeError::ShuttingDown),
        }
    }

    /// 提交后立即返回；失败只进入日志与失败通道
    pub(crate) fn submit(&self, entries: Vec<(Event, i32)>) -> RuntimeResult<()> {
        self.send(EnqueueRequest {
            entries,
            notify: true,
            reply: None,
        })
    }

    /// 同步提交，返回等待结果的接收端
    ///
    /// 提交顺序在返回时即已确定，调用方可以在锁内提交、锁外等待。
    pub(crate) fn submit_with_reply(
        &self,
        entries: Vec<(Event, i32)>,
        notify: bool,
    ) -> RuntimeResult<PendingEnqueue> {
        let (reply, rx) = oneshot::channel();
        self.send(EnqueueRequest {
            entries,
            notify,
            reply: Some(reply),
        })?;
        Ok(PendingEnqueue(rx))
    }

    /// 提交并等待 worker 处理完这批事件，返回其中的失败项
    pub(crate) async fn submit_and_wait(
        &self,
        entries: Vec<(Event, i32)>,
        notify: bool,
    ) -> RuntimeResult<Vec<EnqueueFailure>> {
        self.submit_with_reply(entries, notify)?.wait().await
    }

    /// 关闭入口并等待已提交的请求全部写入
    pub(crate) async fn shutdown(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(error = %err, "enqueue worker terminated abnormally");
            }
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<EnqueueRequest>,
    queue: Arc<dyn DurableQueue>,
    store: Option<Arc<dyn EventStore>>,
    failures: broadcast::Sender<EmitFailure>,
    failure_count: Arc<AtomicU64>,
) {
    while let Some(request) = rx.recv().await {
        let mut failed = Vec::new();

        for (event, priority) in request.entries {
            let event_id = event.id().to_string();
            let event_type = event.event_type().to_string();
            let tenant_id = event.metadata().tenant_id().to_string();

            // 先归档再入队：入队后事件可能立即被处理并确认，确认时记录必须已存在
            let archived = match &store {
                Some(store) => match store.append(&event).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(event_id = %event_id, error = %err, "failed to append event to store");
                        false
                    }
                },
                None => false,
            };

            match queue.enqueue(event, priority).await {
                Ok(()) => {
                    debug!(event_id = %event_id, event_type = %event_type, priority, "event enqueued");
                }
                Err(err) => {
                    // 未入队的事件不会被处理，不应出现在未处理重放中
                    if let (Some(store), true) = (&store, archived) {
                        if let Err(err) = store.mark_processed(&event_id).await {
                            warn!(event_id = %event_id, error = %err, "failed to retire rejected event in store");
                        }
                    }
                    if request.notify {
                        error!(
                            event_id = %event_id,
                            event_type = %event_type,
                            tenant_id = %tenant_id,
                            error = %err,
                            "failed to enqueue event"
                        );
                        failure_count.fetch_add(1, Ordering::Relaxed);
                        // 没有订阅者时发送失败，忽略即可
                        let _ = failures.send(EmitFailure {
                            event_id: event_id.clone(),
                            event_type,
                            tenant_id,
                            reason: err.to_string(),
                        });
                    } else {
                        warn!(event_id = %event_id, event_type = %event_type, error = %err, "failed to enqueue event");
                    }
                    failed.push(EnqueueFailure { event_id, error: err });
                }
            }
        }

        if let Some(reply) = request.reply {
            let _ = reply.send(failed);
        }
    }
    debug!("enqueue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::queue::InMemoryQueue;

    fn enqueuer(capacity: usize) -> (Enqueuer, Arc<InMemoryQueue>, broadcast::Receiver<EmitFailure>, Arc<AtomicU64>) {
        let queue = Arc::new(InMemoryQueue::new(capacity, 100, None));
        let (tx, rx) = broadcast::channel(16);
        let count = Arc::new(AtomicU64::new(0));
        let enqueuer = Enqueuer::spawn(queue.clone(), None, tx, count.clone());
        (enqueuer, queue, rx, count)
    }

    #[tokio::test]
    async fn submissions_are_written_in_order() {
        let (enqueuer, queue, _rx, _) = enqueuer(10);
        for i in 0..3 {
            enqueuer
                .submit(vec![(Event::new(format!("e{i}"), serde_json::json!({})), 0)])
                .unwrap();
        }
        let failed = enqueuer.submit_and_wait(vec![], false).await.unwrap();
        assert!(failed.is_empty());

        let types: Vec<String> = queue.snapshot(10).into_iter().map(|s| s.event_type).collect();
        assert_eq!(types, vec!["e0", "e1", "e2"]);
    }

    #[tokio::test]
    async fn fire_and_forget_failures_are_broadcast() {
        let (enqueuer, _queue, mut rx, count) = enqueuer(1);
        let first = Event::new("a", serde_json::json!({}));
        let second = Event::new("b", serde_json::json!({}));
        let second_id = second.id().to_string();
        enqueuer.submit(vec![(first, 0), (second, 0)]).unwrap();

        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.event_id, second_id);
        assert_eq!(failure.event_type, "b");
        assert!(failure.reason.contains("queue is full"));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn awaited_failures_are_returned_not_broadcast() {
        let (enqueuer, _queue, mut rx, count) = enqueuer(0);
        let failed = enqueuer
            .submit_and_wait(vec![(Event::new("a", serde_json::json!({})), 0)], false)
            .await
            .unwrap();

        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0].error, RuntimeError::QueueFull { capacity: 0 }));
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let (enqueuer, queue, _rx, _) = enqueuer(10);
        enqueuer.submit(vec![(Event::new("a", serde_json::json!({})), 0)]).unwrap();
        enqueuer.shutdown().await;

        assert_eq!(queue.len(), 1);
        assert!(matches!(
            enqueuer.submit(vec![(Event::new("b", serde_json::json!({})), 0)]),
            Err(RuntimeError::ShuttingDown)
        ));
    }
}
