use super::{DurableQueue, EventProcessor, QueueItemSnapshot, QueueStats};
use crate::{
    error::{RuntimeError, RuntimeResult},
    event::Event,
    persist::Persistor,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// 内存优先级队列，可选挂载持久化后端
pub struct InMemoryQueue {
    capacity: usize,
    batch_size: usize,
    persistor: Option<Arc<dyn Persistor>>,
    state: Mutex<QueueState>,
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

struct Entry {
    event: Event,
    priority: i32,
    seq: u64,
    enqueued_at: DateTime<Utc>,
}

// 优先级高者先出；同优先级序号小者先出
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl InMemoryQueue {
    /// - `capacity`：最大待处理事件数
    /// - `batch_size`：单次 `process_all` 最多出队的事件数
    pub fn new(capacity: usize, batch_size: usize, persistor: Option<Arc<dyn Persistor>>) -> Self {
        Self {
            capacity,
            batch_size: batch_size.max(1),
            persistor,
            state: Mutex::new(QueueState::default()),
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open_with_room(&self, state: &QueueState) -> RuntimeResult<()> {
        if state.closed {
            return Err(RuntimeError::QueueClosed);
        }
        if state.heap.len() >= self.capacity {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RuntimeError::QueueFull {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn push(&self, state: &mut QueueState, event: Event, priority: i32) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            event,
            priority,
            seq,
            enqueued_at: Utc::now(),
        });
    }

    fn pop(&self) -> Option<Event> {
        self.state().heap.pop().map(|e| e.event)
    }

    async fn mark_processed(&self, event_id: &str) {
        if let Some(persistor) = &self.persistor {
            if let Err(err) = persistor.mark_processed(event_id).await {
                warn!(event_id, error = %err, "failed to mark persisted event as processed");
            }
        }
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self, event: Event, priority: i32) -> RuntimeResult<()> {
        self.check_open_with_room(&self.state())?;

        if let Some(persistor) = &self.persistor {
            persistor.save(&event).await?;
        }

        let event_id = event.id().to_string();
        let pushed = {
            let mut state = self.state();
            self.check_open_with_room(&state)
                .map(|()| self.push(&mut state, event, priority))
        };

        if let Err(err) = pushed {
            // 持久化之后才发现已满或已关闭：撤销持久化副本，避免被重放
            self.mark_processed(&event_id).await;
            return Err(err);
        }

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn process_all(&self, processor: &dyn EventProcessor) -> RuntimeResult<()> {
        for _ in 0..self.batch_size {
            let Some(event) = self.pop() else {
                break;
            };

            self.mark_processed(event.id()).await;

            match processor.process(&event).await {
                Ok(()) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        event_id = event.id(),
                        event_type = event.event_type(),
                        error = %err,
                        "event processing failed, stopping current drain"
                    );
                    break;
                }
            }
        }

        Ok(())
    }

    async fn replay_from(&self, from: DateTime<Utc>) -> RuntimeResult<usize> {
        let Some(persistor) = &self.persistor else {
            debug!("queue persistence disabled, nothing to replay");
            return Ok(0);
        };

        let stored = persistor.load_since(from, true).await?;

        let mut state = self.state();
        if state.closed {
            return Err(RuntimeError::QueueClosed);
        }

        let queued: HashSet<String> = state
            .heap
            .iter()
            .map(|e| e.event.id().to_string())
            .collect();

        let mut replayed = 0;
        for record in stored {
            if queued.contains(record.event.id()) {
                continue;
            }
            if state.heap.len() >= self.capacity {
                warn!(
                    capacity = self.capacity,
                    replayed, "queue full, replay stopped early"
                );
                break;
            }
            self.push(&mut state, record.event, 0);
            replayed += 1;
        }

        self.enqueued.fetch_add(replayed as u64, Ordering::Relaxed);
        Ok(replayed)
    }

    fn snapshot(&self, limit: usize) -> Vec<QueueItemSnapshot> {
        let state = self.state();
        let mut entries: Vec<&Entry> = state.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));

        entries
            .into_iter()
            .take(limit)
            .map(|e| QueueItemSnapshot {
                event_id: e.event.id().to_string(),
                event_type: e.event.event_type().to_string(),
                priority: e.priority,
                correlation_id: e.event.metadata().correlation_id().to_string(),
                tenant_id: e.event.metadata().tenant_id().to_string(),
                enqueued_at: e.enqueued_at,
            })
            .collect()
    }

    fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            size: state.heap.len(),
            capacity: self.capacity,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            persistence: self.persistor.is_some(),
            closed: state.closed,
        }
    }

    fn len(&self) -> usize {
        self.state().heap.len()
    }

    async fn clear(&self) -> RuntimeResult<()> {
        let drained: Vec<Entry> = self.state().heap.drain().collect();
        for entry in &drained {
            self.mark_processed(entry.event.id()).await;
        }
        debug!(discarded = drained.len(), "queue cleared");
        Ok(())
    }

    async fn close(&self) -> RuntimeResult<()> {
        let mut state = self.state();
        state.closed = true;
        let released = state.heap.len();
        state.heap.clear();
        debug!(released, "queue closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::InMemoryPersistor;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl EventProcessor for Recorder {
        async fn process(&self, event: &Event) -> RuntimeResult<()> {
            self.seen.lock().unwrap().push(event.event_type().to_string());
            if Some(event.event_type()) == self.fail_on {
                return Err(RuntimeError::Handler {
                    handler: "recorder".into(),
                    event_type: event.event_type().into(),
                    reason: "fail requested".into(),
                });
            }
            Ok(())
        }
    }

    fn ev(ty: &str) -> Event {
        Event::new(ty, Value::Null)
    }

    #[tokio::test]
    async fn drains_by_priority_then_fifo() {
        let q = InMemoryQueue::new(10, 10, None);
        q.enqueue(ev("low-1"), 0).await.unwrap();
        q.enqueue(ev("high"), 5).await.unwrap();
        q.enqueue(ev("low-2"), 0).await.unwrap();

        let snap: Vec<String> = q.snapshot(2).into_iter().map(|s| s.event_type).collect();
        assert_eq!(snap, vec!["high", "low-1"]);

        let rec = Recorder::default();
        q.process_all(&rec).await.unwrap();
        assert_eq!(*rec.seen.lock().unwrap(), vec!["high", "low-1", "low-2"]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn rejects_when_full() {
        let q = InMemoryQueue::new(1, 10, None);
        q.enqueue(ev("a"), 0).await.unwrap();
        let err = q.enqueue(ev("b"), 0).await.unwrap_err();

        assert!(matches!(err, RuntimeError::QueueFull { capacity: 1 }));
        assert_eq!(q.stats().rejected, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn failure_stops_current_drain_and_keeps_rest() {
        let q = InMemoryQueue::new(10, 10, None);
        q.enqueue(ev("bad"), 0).await.unwrap();
        q.enqueue(ev("good"), 0).await.unwrap();

        let rec = Recorder {
            fail_on: Some("bad"),
            ..Default::default()
        };
        q.process_all(&rec).await.unwrap();

        assert_eq!(q.len(), 1);
        let stats = q.stats();
        assert_eq!((stats.processed, stats.failed), (1, 1));
        assert!(logs_contain("event processing failed, stopping current drain"));
        assert!(logs_contain("fail requested"));
    }

    #[tokio::test]
    async fn batch_size_bounds_one_drain() {
        let q = InMemoryQueue::new(10, 2, None);
        for i in 0..5 {
            q.enqueue(ev(&format!("e{i}")), 0).await.unwrap();
        }

        q.process_all(&Recorder::default()).await.unwrap();
        assert_eq!(q.len(), 3);
    }

    #[tokio::test]
    async fn closed_queue_keeps_persisted_copies_for_replay() {
        let persistor: Arc<dyn Persistor> = Arc::new(InMemoryPersistor::new());
        let since = Utc::now() - chrono::Duration::seconds(1);

        let first = InMemoryQueue::new(10, 10, Some(persistor.clone()));
        first.enqueue(ev("a"), 0).await.unwrap();
        first.enqueue(ev("b"), 0).await.unwrap();
        first.process_all(&Recorder {
            fail_on: Some("a"),
            ..Default::default()
        })
        .await
        .unwrap();
        first.close().await.unwrap();
        assert!(matches!(
            first.enqueue(ev("c"), 0).await,
            Err(RuntimeError::QueueClosed)
        ));

        let second = InMemoryQueue::new(10, 10, Some(persistor));
        assert_eq!(second.replay_from(since).await.unwrap(), 1);
        assert_eq!(second.snapshot(1)[0].event_type, "b");
        // 已在队列中的事件不会重复入队
        assert_eq!(second.replay_from(since).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_discards_persisted_copies() {
        let persistor: Arc<dyn Persistor> = Arc::new(InMemoryPersistor::new());
        let since = Utc::now() - chrono::Duration::seconds(1);
        let q = InMemoryQueue::new(10, 10, Some(persistor.clone()));
        q.enqueue(ev("a"), 0).await.unwrap();

        q.clear().await.unwrap();

        assert!(q.is_empty());
        assert!(persistor.load_since(since, true).await.unwrap().is_empty());
    }
}
