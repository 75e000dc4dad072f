use super::{EventStore, EventStoreConfig, EventStoreStats, ReplayOptions};
use crate::{error::RuntimeResult, event::Event, persist::Persistor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use futures_util::stream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 基于 `Persistor` 的事件存储
pub struct PersistentEventStore {
    persistor: Arc<dyn Persistor>,
    replay_batch_size: usize,
    max_stored_events: usize,
    appended: AtomicU64,
    marked_processed: AtomicU64,
    trimmed: AtomicU64,
}

impl PersistentEventStore {
    pub fn new(config: &EventStoreConfig) -> Self {
        Self::with_persistor(config, config.persistor_type.create())
    }

    pub fn with_persistor(config: &EventStoreConfig, persistor: Arc<dyn Persistor>) -> Self {
        Self {
            persistor,
            replay_batch_size: config.replay_batch_size.max(1),
            max_stored_events: config.max_stored_events,
            appended: AtomicU64::new(0),
            marked_processed: AtomicU64::new(0),
            trimmed: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl EventStore for PersistentEventStore {
    async fn append(&self, event: &Event) -> RuntimeResult<()> {
        self.persistor.save(event).await?;
        self.appended.fetch_add(1, Ordering::Relaxed);

        let trimmed = self.persistor.trim(self.max_stored_events).await?;
        self.trimmed.fetch_add(trimmed as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn mark_processed(&self, event_id: &str) -> RuntimeResult<()> {
        if self.persistor.mark_processed(event_id).await? {
            self.marked_processed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn replay(
        &self,
        from: DateTime<Utc>,
        options: ReplayOptions,
    ) -> BoxStream<'static, RuntimeResult<Vec<Event>>> {
        let batch_size = options.batch_size.unwrap_or(self.replay_batch_size).max(1);

        let records = match self.persistor.load_since(from, options.only_unprocessed).await {
            Ok(records) => records,
            Err(err) => return Box::pin(stream::once(async move { Err(err) })),
        };

        let events: Vec<Event> = records.into_iter().map(|r| r.event).collect();
        let batches: Vec<RuntimeResult<Vec<Event>>> = events
            .chunks(batch_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();

        Box::pin(stream::iter(batches))
    }

    async fn recent(&self, limit: usize) -> RuntimeResult<Vec<Event>> {
        let records = self.persistor.recent(limit).await?;
        Ok(records.into_iter().map(|r| r.event).collect())
    }

    async fn stats(&self) -> EventStoreStats {
        EventStoreStats {
            persistor_type: self.persistor.kind().to_string(),
            stored: self.persistor.len().await,
            appended: self.appended.load(Ordering::Relaxed),
            marked_processed: self.marked_processed.load(Ordering::Relaxed),
            trimmed: self.trimmed.load(Ordering::Relaxed),
        }
    }
}
