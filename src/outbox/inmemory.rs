use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::{
    message::{MessageId, MessageState, OutboxMessage},
    outbox::{AcknowledgeMessages, InsertMessages, InspectMessages, SelectPending},
};

/// An in-memory outbox for testing or local usage.
///
/// Rows live in insertion order behind a shared lock; clones share the same
/// rows, so a store can outlive the relay that was using it (handy for
/// crash-recovery tests). Writes go through an [`InMemoryTransaction`] and
/// become visible only on [`commit`](InMemoryTransaction::commit).
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    messages: Arc<Mutex<Vec<OutboxMessage>>>,
}

impl InMemoryOutbox {
    /// Start a transaction against this store.
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            store: self.clone(),
            staged: Vec::new(),
        }
    }

    /// Copy of every stored row, in insertion order.
    pub async fn snapshot(&self) -> Vec<OutboxMessage> {
        self.messages.lock().await.clone()
    }

    /// Apply `f` to the row `id` if it still has `expected_version` and a
    /// state in `from`; bumps the version when applied.
    async fn update_if<F>(
        &self,
        id: MessageId,
        expected_version: i64,
        from: &[MessageState],
        f: F,
    ) -> bool
    where
        F: FnOnce(&mut OutboxMessage) + Send,
    {
        let mut messages = self.messages.lock().await;
        match messages
            .iter_mut()
            .find(|m| m.id == id && m.version == expected_version && from.contains(&m.state))
        {
            Some(message) => {
                f(message);
                message.version += 1;
                true
            }
            None => false,
        }
    }
}

/// Buffered writes against an [`InMemoryOutbox`].
///
/// Dropping the transaction without committing discards the staged rows,
/// like a database rollback.
pub struct InMemoryTransaction {
    store: InMemoryOutbox,
    staged: Vec<OutboxMessage>,
}

impl InMemoryTransaction {
    /// Make every staged row visible at once.
    pub async fn commit(self) {
        let mut messages = self.store.messages.lock().await;
        messages.extend(self.staged);
    }

    /// Discard every staged row.
    pub fn rollback(self) {}

    /// Number of rows staged so far.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }
}

#[async_trait]
impl InsertMessages for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Transaction<'a> = InMemoryTransaction;

    async fn insert_message(
        &self,
        message: OutboxMessage,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), InMemoryOutboxError> {
        let duplicate = tx.staged.iter().any(|m| m.id == message.id)
            || self.messages.lock().await.iter().any(|m| m.id == message.id);
        if duplicate {
            return Err(InMemoryOutboxError::duplicate(message.id));
        }
        tx.staged.push(message);
        Ok(())
    }
}

#[async_trait]
impl SelectPending for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn select_pending(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<OutboxMessage>, InMemoryOutboxError> {
        let now = Utc::now();
        let messages = self.messages.lock().await;
        let mut due: Vec<_> = messages
            .iter()
            .filter(|m| m.is_due(now, max_attempts))
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        due.sort_by_key(|m| m.created_at);
        due.truncate(limit);
        Ok(due)
    }
}

#[async_trait]
impl AcknowledgeMessages for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn mark_sent(
        &self,
        id: MessageId,
        expected_version: i64,
    ) -> Result<bool, InMemoryOutboxError> {
        let now = Utc::now();
        Ok(self
            .update_if(
                id,
                expected_version,
                &[MessageState::Pending, MessageState::Failed],
                |m| {
                    m.state = MessageState::Sent;
                    m.last_attempt_at = Some(now);
                    m.next_attempt_at = None;
                },
            )
            .await)
    }

    async fn mark_confirmed(
        &self,
        id: MessageId,
        expected_version: i64,
    ) -> Result<bool, InMemoryOutboxError> {
        Ok(self
            .update_if(id, expected_version, &[MessageState::Sent], |m| {
                m.state = MessageState::Confirmed;
            })
            .await)
    }

    async fn mark_failed(
        &self,
        id: MessageId,
        expected_version: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, InMemoryOutboxError> {
        let now = Utc::now();
        let error = error.to_owned();
        Ok(self
            .update_if(id, expected_version, RETRYABLE, |m| {
                m.state = MessageState::Failed;
                m.attempt_count += 1;
                m.last_attempt_at = Some(now);
                m.next_attempt_at = Some(retry_at);
                m.last_error = Some(error);
            })
            .await)
    }

    async fn mark_dead(
        &self,
        id: MessageId,
        expected_version: i64,
        error: &str,
    ) -> Result<bool, InMemoryOutboxError> {
        let now = Utc::now();
        let error = error.to_owned();
        Ok(self
            .update_if(id, expected_version, RETRYABLE, |m| {
                m.state = MessageState::Dead;
                m.attempt_count += 1;
                m.last_attempt_at = Some(now);
                m.next_attempt_at = None;
                m.last_error = Some(error);
            })
            .await)
    }

    async fn expire_unconfirmed(
        &self,
        sent_before: DateTime<Utc>,
        max_attempts: u32,
        error: &str,
    ) -> Result<u64, InMemoryOutboxError> {
        let mut messages = self.messages.lock().await;
        let mut expired = 0;
        for m in messages.iter_mut().filter(|m| {
            m.state == MessageState::Sent && m.last_attempt_at.is_some_and(|at| at <= sent_before)
        }) {
            m.attempt_count += 1;
            m.state = if m.attempt_count >= max_attempts {
                MessageState::Dead
            } else {
                MessageState::Failed
            };
            m.next_attempt_at = None;
            m.last_error = Some(error.to_owned());
            m.version += 1;
            expired += 1;
        }
        Ok(expired)
    }

    async fn bury_exhausted(&self, max_attempts: u32) -> Result<u64, InMemoryOutboxError> {
        let mut messages = self.messages.lock().await;
        let mut buried = 0;
        for m in messages.iter_mut().filter(|m| {
            matches!(m.state, MessageState::Pending | MessageState::Failed)
                && m.attempt_count >= max_attempts
        }) {
            m.state = MessageState::Dead;
            m.next_attempt_at = None;
            m.last_error
                .get_or_insert_with(|| "attempt budget exhausted".to_owned());
            m.version += 1;
            buried += 1;
        }
        Ok(buried)
    }
}

const RETRYABLE: &[MessageState] = &[
    MessageState::Pending,
    MessageState::Sent,
    MessageState::Failed,
];

#[async_trait]
impl InspectMessages for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn find(&self, id: MessageId) -> Result<Option<OutboxMessage>, InMemoryOutboxError> {
        let messages = self.messages.lock().await;
        Ok(messages.iter().find(|m| m.id == id).cloned())
    }

    async fn dead_messages(&self, limit: usize) -> Result<Vec<OutboxMessage>, InMemoryOutboxError> {
        let messages = self.messages.lock().await;
        Ok(messages
            .iter()
            .filter(|m| m.state == MessageState::Dead)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue_dead(&self, id: MessageId) -> Result<bool, InMemoryOutboxError> {
        let mut messages = self.messages.lock().await;
        match messages
            .iter_mut()
            .find(|m| m.id == id && m.state == MessageState::Dead)
        {
            Some(message) => {
                message.state = MessageState::Pending;
                message.attempt_count = 0;
                message.next_attempt_at = None;
                message.version += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_confirmed(&self, older_than: DateTime<Utc>) -> Result<u64, InMemoryOutboxError> {
        let mut messages = self.messages.lock().await;
        let before = messages.len();
        messages.retain(|m| !(m.state == MessageState::Confirmed && m.created_at < older_than));
        Ok((before - messages.len()) as u64)
    }
}

/// Error type for `InMemoryOutbox` operations.
#[derive(Debug)]
pub struct InMemoryOutboxError {
    kind: InMemoryOutboxErrorKind,
}

impl InMemoryOutboxError {
    fn duplicate(id: MessageId) -> Self {
        Self {
            kind: InMemoryOutboxErrorKind::DuplicateId(id),
        }
    }
}

impl std::fmt::Display for InMemoryOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryOutboxErrorKind::DuplicateId(id) => {
                write!(f, "Message {id} already exists in in-memory outbox")
            }
        }
    }
}

impl std::error::Error for InMemoryOutboxError {}

#[derive(Debug)]
enum InMemoryOutboxErrorKind {
    DuplicateId(MessageId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> OutboxMessage {
        OutboxMessage::new("orders", "order.created", Vec::new(), "ORDER_CREATED", Some(key.into()))
    }

    async fn stored(store: &InMemoryOutbox, msgs: Vec<OutboxMessage>) {
        let mut tx = store.begin();
        for m in msgs {
            store.insert_message(m, &mut tx).await.unwrap();
        }
        tx.commit().await;
    }

    #[tokio::test]
    async fn rows_are_invisible_until_commit() {
        let store = InMemoryOutbox::default();
        let mut tx = store.begin();
        store.insert_message(message("a"), &mut tx).await.unwrap();

        assert_eq!(tx.staged(), 1);
        assert!(store.select_pending(10, 5).await.unwrap().is_empty());

        tx.commit().await;
        assert_eq!(store.select_pending(10, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryOutbox::default();
        {
            let mut tx = store.begin();
            store.insert_message(message("a"), &mut tx).await.unwrap();
        }
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = InMemoryOutbox::default();
        let msg = message("a");
        stored(&store, vec![msg.clone()]).await;

        let mut tx = store.begin();
        assert!(store.insert_message(msg, &mut tx).await.is_err());
    }

    #[tokio::test]
    async fn pending_rows_come_back_in_creation_order_up_to_limit() {
        let store = InMemoryOutbox::default();
        stored(&store, vec![message("a"), message("b"), message("c")]).await;

        let keys: Vec<_> = store
            .select_pending(2, 5)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.business_key.unwrap())
            .collect();
        assert_eq!(keys, ["a", "b"]);
    }

    #[tokio::test]
    async fn stale_version_is_a_no_op() {
        let store = InMemoryOutbox::default();
        let msg = message("a");
        stored(&store, vec![msg.clone()]).await;

        assert!(store.mark_sent(msg.id, 0).await.unwrap());
        assert!(!store.mark_sent(msg.id, 0).await.unwrap());

        let row = store.find(msg.id).await.unwrap().unwrap();
        assert_eq!(row.state, MessageState::Sent);
        assert_eq!(row.version, 1);
    }

    #[tokio::test]
    async fn failed_rows_wait_for_their_backoff() {
        let store = InMemoryOutbox::default();
        let msg = message("a");
        stored(&store, vec![msg.clone()]).await;

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert!(store.mark_failed(msg.id, 0, "boom", later).await.unwrap());
        assert!(store.select_pending(10, 5).await.unwrap().is_empty());

        let row = store.find(msg.id).await.unwrap().unwrap();
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn dead_rows_are_listed_and_can_be_replayed() {
        let store = InMemoryOutbox::default();
        let msg = message("a");
        stored(&store, vec![msg.clone()]).await;

        assert!(store.mark_dead(msg.id, 0, "gone").await.unwrap());
        assert!(store.select_pending(10, 5).await.unwrap().is_empty());
        assert_eq!(store.dead_messages(10).await.unwrap().len(), 1);

        assert!(store.requeue_dead(msg.id).await.unwrap());
        assert!(!store.requeue_dead(msg.id).await.unwrap());
        let pending = store.select_pending(10, 5).await.unwrap();
        assert_eq!(pending[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn purge_only_removes_old_confirmed_rows() {
        let store = InMemoryOutbox::default();
        let (a, b) = (message("a"), message("b"));
        stored(&store, vec![a.clone(), b.clone()]).await;

        store.mark_sent(a.id, 0).await.unwrap();
        store.mark_confirmed(a.id, 1).await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.purge_confirmed(cutoff).await.unwrap(), 1);
        assert!(store.find(a.id).await.unwrap().is_none());
        assert!(store.find(b.id).await.unwrap().is_some());
    }
}
