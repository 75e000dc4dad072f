use super::{Persistor, StoredEvent};
use crate::{error::RuntimeResult, event::Event};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// 内存版持久化后端，写入顺序即存储顺序
#[derive(Debug, Default)]
pub struct InMemoryPersistor {
    records: RwLock<VecDeque<StoredEvent>>,
}

impl InMemoryPersistor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistor for InMemoryPersistor {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn save(&self, event: &Event) -> RuntimeResult<()> {
        let mut records = self.records.write().await;
        // 同一事件重复保存时覆盖旧记录，保持 id 唯一
        records.retain(|r| r.event.id() != event.id());
        records.push_back(StoredEvent {
            event: event.clone(),
            stored_at: Utc::now(),
            processed: false,
        });
        Ok(())
    }

    async fn mark_processed(&self, event_id: &str) -> RuntimeResult<bool> {
        let mut records = self.records.write().await;
        match records.iter_mut().rev().find(|r| r.event.id() == event_id) {
            Some(record) => {
                record.processed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_since(
        &self,
        from: DateTime<Utc>,
        only_unprocessed: bool,
    ) -> RuntimeResult<Vec<StoredEvent>> {
        let records = self.records.read().await;
        let mut out: Vec<StoredEvent> = records
            .iter()
            .filter(|r| r.event.metadata().timestamp() >= from)
            .filter(|r| !only_unprocessed || !r.processed)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.event.metadata().timestamp());
        Ok(out)
    }

    async fn recent(&self, limit: usize) -> RuntimeResult<Vec<StoredEvent>> {
        let records = self.records.read().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    async fn trim(&self, max: usize) -> RuntimeResult<usize> {
        let mut records = self.records.write().await;
        let excess = records.len().saturating_sub(max);
        for _ in 0..excess {
            records.pop_front();
        }
        Ok(excess)
    }

    async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    async fn clear(&self) -> RuntimeResult<()> {
        self.records.write().await.clear();
        Ok(())
    }
}
