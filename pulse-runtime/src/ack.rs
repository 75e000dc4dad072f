//! 确认跟踪
//!
//! 记录已发射但尚未确认的事件。每个条目只会被确认、否认、超时清扫三者之一移除；
//! 超时只记录告警后丢弃，不会重新投递。
//!
use dashmap::DashMap;
use pulse_core::event::Event;
use pulse_core::store::EventStore;
use pulse_core::task::PeriodicTask;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// 待确认条目
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub event: Event,
    pub enqueued_at: Instant,
}

/// 确认统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AckStats {
    pub pending: usize,
    pub acked: u64,
    pub nacked: u64,
    pub expired: u64,
}

pub struct AckTracker {
    enabled: bool,
    ack_timeout: Duration,
    pending: DashMap<String, PendingAck>,
    event_store: Option<Arc<dyn EventStore>>,
    acked: AtomicU64,
    nacked: AtomicU64,
    expired: AtomicU64,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl AckTracker {
    pub fn new(
        enabled: bool,
        ack_timeout: Duration,
        event_store: Option<Arc<dyn EventStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            ack_timeout,
            pending: DashMap::new(),
            event_store,
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        })
    }

    /// 清扫周期：超时的十分之一，限制在 [100ms, 3s]
    pub fn sweep_interval(ack_timeout: Duration) -> Duration {
        (ack_timeout / 10).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
    }

    /// 启动周期清扫（未启用或已启动时为空操作）
    pub fn start(self: &Arc<Self>) {
        if !self.enabled {
            return;
        }

        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let interval = Self::sweep_interval(self.ack_timeout);
        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(PeriodicTask::spawn(interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(tracker) = weak.upgrade() {
                    tracker.sweep();
                }
            }
        }));
        debug!(
            ack_timeout_ms = self.ack_timeout.as_millis() as u64,
            sweep_interval_ms = interval.as_millis() as u64,
            "ack sweep started"
        );
    }

    pub async fn stop(&self) {
        let task = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.stop().await;
            debug!("ack sweep stopped");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// 开始跟踪；重复的事件ID保留最早的条目
    pub fn track(&self, event: &Event) {
        if !self.enabled {
            return;
        }
        self.pending
            .entry(event.id().to_string())
            .or_insert_with(|| PendingAck {
                event: event.clone(),
                enqueued_at: Instant::now(),
            });
    }

    /// 确认事件；未知ID只记录告警
    ///
    /// 配置了事件存储时同时标记为已处理，存储失败不影响确认结果。
    pub async fn ack(&self, event_id: &str) -> bool {
        let removed = self.pending.remove(event_id).is_some();
        if removed {
            self.acked.fetch_add(1, Ordering::Relaxed);
            debug!(event_id, "event acknowledged");
        } else {
            warn!(event_id, "ack for unknown event");
        }

        if let Some(store) = &self.event_store {
            if let Err(err) = store.mark_processed(event_id).await {
                warn!(event_id, error = %err, "failed to mark event processed in store");
            }
        }
        removed
    }

    /// 否认事件：只移除并记录，不重试
    pub fn nack(&self, event_id: &str, error: Option<&str>) -> bool {
        match self.pending.remove(event_id) {
            Some((_, entry)) => {
                self.nacked.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_id,
                    event_type = entry.event.event_type(),
                    error = error.unwrap_or("unspecified"),
                    "event rejected, not retried"
                );
                true
            }
            None => {
                warn!(event_id, "nack for unknown event");
                false
            }
        }
    }

    /// 移除所有超时条目，返回数量
    pub fn sweep(&self) -> usize {
        let timeout = self.ack_timeout;
        let candidates: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.enqueued_at.elapsed() >= timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0;
        for event_id in candidates {
            // 候选收集后可能已被确认
            let removed = self
                .pending
                .remove_if(&event_id, |_, entry| entry.enqueued_at.elapsed() >= timeout);
            if let Some((_, entry)) = removed {
                expired += 1;
                warn!(
                    event_id = %event_id,
                    event_type = entry.event.event_type(),
                    age_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                    "event not acknowledged before timeout, dropped without retry"
                );
            }
        }

        if expired > 0 {
            self.expired.fetch_add(expired as u64, Ordering::Relaxed);
            info!(expired, remaining = self.pending.len(), "ack sweep finished");
        }
        expired
    }

    /// 丢弃全部待确认条目，返回数量
    pub fn clear(&self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> AckStats {
        AckStats {
            pending: self.pending.len(),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::store::{EventStoreConfig, PersistentEventStore};
    use serde_json::json;
    use tracing_test::traced_test;

    fn event(n: usize) -> Event {
        Event::new("task.created", json!({ "n": n }))
    }

    #[test]
    fn sweep_interval_is_clamped() {
        assert_eq!(AckTracker::sweep_interval(Duration::from_millis(50)), MIN_SWEEP_INTERVAL);
        assert_eq!(AckTracker::sweep_interval(Duration::from_secs(10)), Duration::from_secs(1));
        assert_eq!(AckTracker::sweep_interval(Duration::from_secs(600)), MAX_SWEEP_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_expires_unacked_events() {
        let tracker = AckTracker::new(true, Duration::from_millis(50), None);
        tracker.start();

        for n in 0..150 {
            tracker.track(&event(n));
        }
        assert_eq!(tracker.len(), 150);

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(tracker.len(), 0);
        let stats = tracker.stats();
        assert_eq!(stats.expired, 150);
        assert_eq!(stats.acked, 0);

        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn each_expired_event_is_logged_once() {
        let tracker = AckTracker::new(true, Duration::from_millis(50), None);
        for n in 0..150 {
            tracker.track(&event(n));
        }

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(tracker.sweep(), 150);
        assert_eq!(tracker.sweep(), 0);

        logs_assert(|lines: &[&str]| {
            let warned = lines
                .iter()
                .filter(|line| line.contains("not acknowledged before timeout"))
                .count();
            if warned == 150 {
                Ok(())
            } else {
                Err(format!("expected 150 expiry warnings, got {warned}"))
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_events_are_not_swept() {
        let tracker = AckTracker::new(true, Duration::from_millis(50), None);
        let first = event(1);
        let second = event(2);
        tracker.track(&first);
        tracker.track(&second);

        assert!(tracker.ack(first.id()).await);
        tokio::time::advance(Duration::from_millis(60)).await;

        assert_eq!(tracker.sweep(), 1);
        assert!(!tracker.nack(second.id(), None));
        assert_eq!(
            tracker.stats(),
            AckStats {
                pending: 0,
                acked: 1,
                nacked: 0,
                expired: 1
            }
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_ids_only_warn() {
        let tracker = AckTracker::new(true, Duration::from_secs(30), None);

        assert!(!tracker.ack("missing").await);
        assert!(!tracker.nack("missing", Some("boom")));

        assert!(logs_contain("ack for unknown event"));
        assert!(logs_contain("nack for unknown event"));
        assert_eq!(tracker.stats().acked, 0);
        assert_eq!(tracker.stats().nacked, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn nack_removes_and_logs_reason() {
        let tracker = AckTracker::new(true, Duration::from_secs(30), None);
        let e = event(1);
        tracker.track(&e);

        assert!(tracker.nack(e.id(), Some("handler exploded")));
        assert!(tracker.is_empty());
        assert!(logs_contain("handler exploded"));
    }

    #[tokio::test]
    async fn tracking_is_noop_when_disabled() {
        let tracker = AckTracker::new(false, Duration::from_secs(30), None);
        tracker.start();
        tracker.track(&event(1));
        assert!(tracker.is_empty());
        tracker.stop().await;
    }

    #[tokio::test]
    async fn duplicate_track_keeps_single_entry() {
        let tracker = AckTracker::new(true, Duration::from_secs(30), None);
        let e = event(1);
        tracker.track(&e);
        tracker.track(&e);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn ack_marks_event_processed_in_store() {
        let store: Arc<dyn EventStore> =
            Arc::new(PersistentEventStore::new(&EventStoreConfig::default()));
        let tracker = AckTracker::new(true, Duration::from_secs(30), Some(store.clone()));
        let e = event(1);
        store.append(&e).await.unwrap();
        tracker.track(&e);

        assert!(tracker.ack(e.id()).await);
        assert_eq!(store.stats().await.marked_processed, 1);
    }
}
