use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    consumer::{ConsumptionRecord, ConsumptionStore},
    message::MessageId,
};

/// In-memory consumption store for tests or single-process consumers.
///
/// Clones share the same records. With a retention period, records older
/// than that are dropped on every write, bounding memory at the cost of
/// forgetting very late duplicates.
#[derive(Clone, Default)]
pub struct InMemoryConsumptionStore {
    records: Arc<Mutex<HashMap<MessageId, ConsumptionRecord>>>,
    retention: Option<Duration>,
}

impl InMemoryConsumptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl ConsumptionStore for InMemoryConsumptionStore {
    type Error = Infallible;

    async fn is_consumed(&self, id: MessageId) -> Result<bool, Infallible> {
        Ok(self.records.lock().await.contains_key(&id))
    }

    async fn record(&self, record: ConsumptionRecord) -> Result<bool, Infallible> {
        let mut records = self.records.lock().await;
        if let Some(cutoff) = self
            .retention
            .and_then(|retention| chrono::Duration::from_std(retention).ok())
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        {
            records.retain(|_, r| r.consumed_at >= cutoff);
        }

        if records.contains_key(&record.message_id) {
            return Ok(false);
        }
        records.insert(record.message_id, record);
        Ok(true)
    }

    async fn purge_before(&self, older_than: DateTime<Utc>) -> Result<u64, Infallible> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.consumed_at >= older_than);
        Ok((before - records.len()) as u64)
    }
}
