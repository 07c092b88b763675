//! One poll cycle: open → list → filter seen → deliver → mark → close.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::delivery::{DeliveryResult, MessageConsumer, deliver_guarded};
use crate::config::Protocol;
use crate::error::CycleError;
use crate::mail::{InboundMail, MessageRef};
use crate::protocol::{ProtocolStrategy, StoreHandle};
use crate::seen::SeenStore;

/// Result of one cycle.
///
/// `delivered + rejected + failed + skipped + deferred <= listed` always holds.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub cycle_id: Uuid,
    pub protocol: Protocol,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub delivered: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Already in the seen set.
    pub skipped: usize,
    /// Left for a later cycle by the per-cycle message limit.
    pub deferred: usize,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<CycleError>,
}

impl CycleOutcome {
    pub fn begin(protocol: Protocol) -> Self {
        let now = Utc::now();
        Self {
            cycle_id: Uuid::new_v4(),
            protocol,
            started_at: now,
            finished_at: now,
            listed: 0,
            delivered: 0,
            rejected: 0,
            failed: 0,
            skipped: 0,
            deferred: 0,
            error: None,
        }
    }

    pub fn finish(&mut self, error: Option<CycleError>) {
        self.error = error;
        self.finished_at = Utc::now();
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

fn serialize_error<S: Serializer>(error: &Option<CycleError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&format!("{}: {e}", e.kind())),
        None => s.serialize_none(),
    }
}

/// Runs cycles against one mailbox through a protocol strategy.
pub struct PollCycle {
    strategy: Arc<dyn ProtocolStrategy>,
    seen: Option<Arc<dyn SeenStore>>,
    max_messages: Option<usize>,
    delivery_timeout: Option<Duration>,
}

impl PollCycle {
    pub fn new(strategy: Arc<dyn ProtocolStrategy>) -> Self {
        Self {
            strategy,
            seen: None,
            max_messages: None,
            delivery_timeout: None,
        }
    }

    pub fn with_seen_store(mut self, seen: Arc<dyn SeenStore>) -> Self {
        self.seen = Some(seen);
        self
    }

    pub fn with_max_messages(mut self, max: Option<usize>) -> Self {
        self.max_messages = max;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn strategy(&self) -> &Arc<dyn ProtocolStrategy> {
        &self.strategy
    }

    pub fn seen_store(&self) -> Option<&Arc<dyn SeenStore>> {
        self.seen.as_ref()
    }

    /// Execute one cycle. Never panics on consumer failure; the store is
    /// closed exactly once whenever it was opened.
    pub async fn run(&self, consumer: &dyn MessageConsumer) -> CycleOutcome {
        let mut outcome = CycleOutcome::begin(self.strategy.protocol());

        let mut handle = match self.strategy.open_store().await {
            Ok(handle) => handle,
            Err(e) => {
                error!(cycle_id = %outcome.cycle_id, error = %e, "Failed to open store");
                outcome.finish(Some(e.into()));
                return outcome;
            }
        };

        let fatal = self
            .process(&mut handle, consumer, &mut outcome)
            .await
            .err();
        if let Some(e) = &fatal {
            error!(cycle_id = %outcome.cycle_id, error = %e, "Poll cycle aborted");
        }

        let mut first = fatal;
        if let Err(close_err) = self.strategy.close_store(first.is_none(), handle).await {
            if first.is_none() {
                first = Some(close_err.into());
            } else {
                warn!(
                    cycle_id = %outcome.cycle_id,
                    error = %close_err,
                    "Store close failed after earlier error"
                );
            }
        }

        outcome.finish(first);
        outcome
    }

    async fn process(
        &self,
        handle: &mut StoreHandle,
        consumer: &dyn MessageConsumer,
        outcome: &mut CycleOutcome,
    ) -> Result<(), CycleError> {
        let messages = self.strategy.list_messages(handle).await?;
        outcome.listed = messages.len();
        debug!(cycle_id = %outcome.cycle_id, listed = outcome.listed, "Listed messages");

        let limit = self.max_messages.unwrap_or(usize::MAX);
        let mut attempted = 0usize;

        for (idx, message) in messages.iter().enumerate() {
            if attempted >= limit {
                outcome.deferred = messages.len() - idx;
                debug!(deferred = outcome.deferred, "Message limit reached");
                break;
            }

            let key = message.dedup_key();
            if let (Some(seen), Some(key)) = (&self.seen, &key)
                && seen.contains(key).await?
            {
                debug!(seq = message.seq, key = %key, "Skipping already-seen message");
                outcome.skipped += 1;
                // A seen message can still be on the server if the cycle that
                // delivered it never committed its deletion.
                if self.strategy.consumes_destructively() {
                    self.strategy.mark_consumed(handle, message).await?;
                }
                continue;
            }

            attempted += 1;
            let result = self.deliver_one(handle, message, consumer).await;
            match result {
                DeliveryResult::Delivered => outcome.delivered += 1,
                DeliveryResult::Rejected => {
                    warn!(seq = message.seq, "Consumer rejected message, consuming it as poison");
                    outcome.rejected += 1;
                }
                DeliveryResult::TransientFailure => outcome.failed += 1,
            }
            if !result.consumes() {
                continue;
            }

            self.strategy.mark_consumed(handle, message).await?;

            match (&self.seen, key) {
                (Some(seen), Some(key)) => seen.insert(&key).await?,
                (Some(_), None) => {
                    debug!(seq = message.seq, "Message has no stable id, cannot record as seen");
                }
                (None, _) => {}
            }
        }

        Ok(())
    }

    async fn deliver_one(
        &self,
        handle: &mut StoreHandle,
        message: &MessageRef,
        consumer: &dyn MessageConsumer,
    ) -> DeliveryResult {
        let raw = match self.strategy.fetch(handle, message).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(seq = message.seq, error = %e, "Fetch failed, leaving message for redelivery");
                return DeliveryResult::TransientFailure;
            }
        };

        let mail = InboundMail::parse(message.clone(), raw);
        deliver_guarded(consumer, &mail, self.delivery_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::config::SessionConfig;
    use crate::error::{ConnectionError, DatabaseError, DeliveryError, ProtocolError};
    use crate::mail::{FailPoint, Flag, InMemoryMailServer, MailConnector, MailFolder, MailStore};
    use crate::protocol::{ImapStrategy, Pop3Strategy};
    use crate::seen::MemorySeenSet;

    /// Consumer scripted by subject; unknown subjects are delivered.
    #[derive(Default)]
    struct Scripted {
        script: HashMap<String, DeliveryResult>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn with(pairs: &[(&str, DeliveryResult)]) -> Self {
            Self {
                script: pairs.iter().map(|(s, r)| (s.to_string(), *r)).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl MessageConsumer for Scripted {
        async fn deliver(&self, mail: &InboundMail) -> Result<DeliveryResult, DeliveryError> {
            let subject = mail.subject.clone().unwrap_or_default();
            self.calls.lock().await.push(subject.clone());
            if subject == "panic" {
                panic!("consumer exploded");
            }
            Ok(self
                .script
                .get(&subject)
                .copied()
                .unwrap_or(DeliveryResult::Delivered))
        }
    }

    struct BrokenSeen;

    #[async_trait]
    impl SeenStore for BrokenSeen {
        async fn contains(&self, _key: &str) -> Result<bool, DatabaseError> {
            Ok(false)
        }
        async fn insert(&self, _key: &str) -> Result<(), DatabaseError> {
            Err(DatabaseError::Query("disk full".into()))
        }
        async fn remove(&self, _key: &str) -> Result<bool, DatabaseError> {
            Ok(false)
        }
        async fn reset(&self) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn len(&self) -> Result<usize, DatabaseError> {
            Ok(0)
        }
    }

    fn raw(subject: &str) -> String {
        format!(
            "From: sender@example.com\r\nSubject: {subject}\r\nMessage-ID: <{subject}@example.com>\r\n\r\nbody of {subject}\r\n"
        )
    }

    async fn server_with(subjects: &[&str]) -> InMemoryMailServer {
        let server = InMemoryMailServer::new();
        server.create_folder("INBOX").await;
        for s in subjects {
            server.append("INBOX", raw(s)).await;
        }
        server
    }

    fn pop3(server: &InMemoryMailServer, flush: bool) -> Arc<dyn ProtocolStrategy> {
        let session = SessionConfig::new(Protocol::Pop3, "mem.local", "bot", "pw").with_flush(flush);
        Arc::new(Pop3Strategy::new(session, Arc::new(server.clone())))
    }

    fn imap(server: &InMemoryMailServer) -> Arc<dyn ProtocolStrategy> {
        let session = SessionConfig::new(Protocol::Imap, "mem.local", "bot", "pw");
        Arc::new(ImapStrategy::new(session, Arc::new(server.clone())))
    }

    #[tokio::test]
    async fn mixed_batch_commits_successful_deliveries() {
        let server = server_with(&["A", "B", "C"]).await;
        let seen = Arc::new(MemorySeenSet::new());
        let cycle = PollCycle::new(pop3(&server, true)).with_seen_store(seen.clone());
        let consumer = Scripted::with(&[("B", DeliveryResult::TransientFailure)]);

        let outcome = cycle.run(&consumer).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.listed, 3);
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(consumer.calls().await, vec!["A", "B", "C"]);

        // A and C deleted, B left pending.
        assert_eq!(server.uids("INBOX").await, vec![2]);
        assert_eq!(seen.len().await.unwrap(), 2);

        let stats = server.stats().await;
        assert_eq!(stats.folder_closes, vec![true]);
        assert_eq!(stats.store_closes, 1);
    }

    #[tokio::test]
    async fn transient_failure_is_redelivered_next_cycle() {
        let server = server_with(&["A", "B"]).await;
        let cycle = PollCycle::new(pop3(&server, true));
        let consumer = Scripted::with(&[("B", DeliveryResult::TransientFailure)]);

        cycle.run(&consumer).await;
        let second = cycle.run(&consumer).await;

        assert_eq!(second.listed, 1);
        assert_eq!(consumer.calls().await, vec!["A", "B", "B"]);
    }

    #[tokio::test]
    async fn rejected_message_is_consumed() {
        let server = server_with(&["poison", "ok"]).await;
        let cycle = PollCycle::new(pop3(&server, true));
        let consumer = Scripted::with(&[("poison", DeliveryResult::Rejected)]);

        let first = cycle.run(&consumer).await;
        assert_eq!(first.rejected, 1);
        assert_eq!(first.delivered, 1);

        let second = cycle.run(&consumer).await;
        assert_eq!(second.listed, 0);
        assert_eq!(consumer.calls().await, vec!["poison", "ok"]);
    }

    #[tokio::test]
    async fn open_failure_touches_nothing() {
        let server = server_with(&["A"]).await;
        server.inject(FailPoint::Connect).await;
        let cycle = PollCycle::new(pop3(&server, true));
        let consumer = Scripted::default();

        let outcome = cycle.run(&consumer).await;

        assert!(matches!(
            outcome.error,
            Some(CycleError::Connection(ConnectionError::Open { .. }))
        ));
        assert!(consumer.calls().await.is_empty());
        let stats = server.stats().await;
        assert_eq!(stats.flags_set, 0);
        assert!(stats.folder_closes.is_empty());
        assert_eq!(stats.store_closes, 0);
    }

    #[tokio::test]
    async fn list_failure_closes_without_success() {
        let server = server_with(&["A"]).await;
        server.inject(FailPoint::List).await;
        let cycle = PollCycle::new(pop3(&server, true));

        let outcome = cycle.run(&Scripted::default()).await;

        assert!(matches!(
            outcome.error,
            Some(CycleError::Protocol(ProtocolError::List { .. }))
        ));
        let stats = server.stats().await;
        assert_eq!(stats.folder_closes, vec![false]);
        assert_eq!(stats.store_closes, 1);
    }

    #[tokio::test]
    async fn flush_disabled_keeps_every_message() {
        let server = server_with(&["A", "B", "C"]).await;
        let cycle = PollCycle::new(pop3(&server, false));

        let outcome = cycle.run(&Scripted::default()).await;

        assert_eq!(outcome.delivered, 3);
        let stats = server.stats().await;
        assert_eq!(stats.flags_set, 3);
        assert_eq!(stats.folder_closes, vec![false]);
        assert_eq!(server.uids("INBOX").await.len(), 3);
    }

    #[tokio::test]
    async fn mark_failure_aborts_without_deleting() {
        let server = server_with(&["A", "B"]).await;
        server.inject(FailPoint::SetFlag).await;
        let cycle = PollCycle::new(pop3(&server, true));
        let consumer = Scripted::default();

        let outcome = cycle.run(&consumer).await;

        assert!(matches!(
            outcome.error,
            Some(CycleError::Protocol(ProtocolError::MarkConsumed { seq: 1, .. }))
        ));
        assert_eq!(consumer.calls().await, vec!["A"]);
        assert_eq!(server.stats().await.folder_closes, vec![false]);
        assert_eq!(server.uids("INBOX").await.len(), 2);
    }

    #[tokio::test]
    async fn seen_set_suppresses_redelivery() {
        let server = server_with(&["A", "B"]).await;
        let seen = Arc::new(MemorySeenSet::new());
        seen.insert("uid:00000001").await.unwrap();
        let cycle = PollCycle::new(pop3(&server, false)).with_seen_store(seen.clone());
        let consumer = Scripted::default();

        let first = cycle.run(&consumer).await;
        assert_eq!(first.skipped, 1);
        assert_eq!(first.delivered, 1);

        // Flush is off, so both are still listed but both are now seen.
        let second = cycle.run(&consumer).await;
        assert_eq!(second.listed, 2);
        assert_eq!(second.skipped, 2);
        assert_eq!(consumer.calls().await, vec!["B"]);

        seen.reset().await.unwrap();
        let third = cycle.run(&consumer).await;
        assert_eq!(third.delivered, 2);
    }

    #[tokio::test]
    async fn seen_pop3_message_is_deleted_after_failed_commit() {
        let server = server_with(&["A", "B"]).await;
        server.inject(FailPoint::CloseFolder).await;
        let seen = Arc::new(MemorySeenSet::new());
        let cycle = PollCycle::new(pop3(&server, true)).with_seen_store(seen.clone());
        let consumer = Scripted::default();

        let first = cycle.run(&consumer).await;
        assert_eq!(first.delivered, 2);
        assert!(matches!(
            first.error,
            Some(CycleError::Protocol(ProtocolError::CloseFolder { .. }))
        ));
        assert_eq!(server.uids("INBOX").await, vec![1, 2]);

        server.clear(&FailPoint::CloseFolder).await;
        let second = cycle.run(&consumer).await;

        assert!(second.is_success());
        assert_eq!(second.listed, 2);
        assert_eq!(second.skipped, 2);
        assert!(server.uids("INBOX").await.is_empty());
        assert_eq!(consumer.calls().await, vec!["A", "B"]);

        let third = cycle.run(&consumer).await;
        assert_eq!(third.listed, 0);
    }

    #[tokio::test]
    async fn seen_imap_message_is_not_flagged_again() {
        let server = server_with(&["A"]).await;
        let seen = Arc::new(MemorySeenSet::new());
        seen.insert("uid:1:1").await.unwrap();
        let cycle = PollCycle::new(imap(&server)).with_seen_store(seen);

        let outcome = cycle.run(&Scripted::default()).await;

        assert_eq!(outcome.skipped, 1);
        assert_eq!(server.stats().await.flags_set, 0);
        assert!(!server.is_seen("INBOX", 1).await);
    }

    #[tokio::test]
    async fn rejected_imap_message_is_recorded_as_seen() {
        let server = server_with(&["poison", "ok"]).await;
        let seen = Arc::new(MemorySeenSet::new());
        let cycle = PollCycle::new(imap(&server)).with_seen_store(seen.clone());
        let consumer = Scripted::with(&[("poison", DeliveryResult::Rejected)]);

        let outcome = cycle.run(&consumer).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.delivered, 1);
        assert!(seen.contains("uid:1:1").await.unwrap());
        assert!(server.is_seen("INBOX", 1).await);

        // Clear the server flag so only the seen set keeps it from coming back.
        let mut store = server
            .connect("imap", &SessionConfig::new(Protocol::Imap, "mem.local", "bot", "pw"))
            .await
            .unwrap();
        let mut folder = store.open_folder("INBOX").await.unwrap();
        let refs = folder.messages().await.unwrap();
        folder.set_flag(&refs[0], Flag::Seen, false).await.unwrap();
        folder.close(false).await.unwrap();
        store.close().await.unwrap();

        let again = cycle.run(&consumer).await;
        assert_eq!(again.listed, 1);
        assert_eq!(again.skipped, 1);
        assert_eq!(consumer.calls().await, vec!["poison", "ok"]);
    }

    #[tokio::test]
    async fn imap_flags_and_records_seen() {
        let server = server_with(&["A", "B"]).await;
        let seen = Arc::new(MemorySeenSet::new());
        let cycle = PollCycle::new(imap(&server)).with_seen_store(seen.clone());
        let consumer = Scripted::default();

        let outcome = cycle.run(&consumer).await;
        assert_eq!(outcome.delivered, 2);
        assert!(seen.contains("uid:1:1").await.unwrap());
        assert!(seen.contains("uid:1:2").await.unwrap());
        assert!(server.is_seen("INBOX", 1).await);
        assert_eq!(server.uids("INBOX").await.len(), 2);

        let again = cycle.run(&consumer).await;
        assert_eq!(again.listed, 0);
    }

    #[tokio::test]
    async fn consumer_panic_does_not_abort_batch() {
        let server = server_with(&["panic", "B"]).await;
        let cycle = PollCycle::new(pop3(&server, true));
        let consumer = Scripted::default();

        let outcome = cycle.run(&consumer).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(server.uids("INBOX").await, vec![1]);
        assert_eq!(server.stats().await.store_closes, 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_transient() {
        let server = server_with(&["A", "B"]).await;
        server.inject(FailPoint::Fetch(1)).await;
        let cycle = PollCycle::new(pop3(&server, true));
        let consumer = Scripted::default();

        let outcome = cycle.run(&consumer).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(consumer.calls().await, vec!["B"]);
    }

    #[tokio::test]
    async fn message_limit_defers_the_rest() {
        let server = server_with(&["A", "B", "C", "D"]).await;
        let cycle = PollCycle::new(pop3(&server, true)).with_max_messages(Some(2));

        let outcome = cycle.run(&Scripted::default()).await;

        assert_eq!(outcome.listed, 4);
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.deferred, 2);
        assert_eq!(server.uids("INBOX").await, vec![3, 4]);
    }

    #[tokio::test]
    async fn seen_store_failure_aborts_non_destructively() {
        let server = server_with(&["A", "B"]).await;
        let cycle = PollCycle::new(pop3(&server, true)).with_seen_store(Arc::new(BrokenSeen));
        let consumer = Scripted::default();

        let outcome = cycle.run(&consumer).await;

        assert!(matches!(outcome.error, Some(CycleError::SeenStore(_))));
        assert_eq!(consumer.calls().await, vec!["A"]);
        assert_eq!(server.stats().await.folder_closes, vec![false]);
        assert_eq!(server.uids("INBOX").await.len(), 2);
    }

    #[tokio::test]
    async fn close_failure_reported_on_otherwise_clean_cycle() {
        let server = server_with(&["A"]).await;
        server.inject(FailPoint::CloseFolder).await;
        let cycle = PollCycle::new(pop3(&server, true));

        let outcome = cycle.run(&Scripted::default()).await;

        assert_eq!(outcome.delivered, 1);
        assert!(matches!(
            outcome.error,
            Some(CycleError::Protocol(ProtocolError::CloseFolder { .. }))
        ));
        assert_eq!(server.stats().await.store_closes, 1);
    }

    #[tokio::test]
    async fn close_failure_does_not_mask_list_error() {
        let server = server_with(&["A"]).await;
        server.inject(FailPoint::List).await;
        server.inject(FailPoint::CloseStore).await;
        let cycle = PollCycle::new(pop3(&server, true));

        let outcome = cycle.run(&Scripted::default()).await;

        assert!(matches!(
            outcome.error,
            Some(CycleError::Protocol(ProtocolError::List { .. }))
        ));
    }

    #[test]
    fn outcome_serializes_error_as_text() {
        let mut outcome = CycleOutcome::begin(Protocol::Imap);
        outcome.listed = 1;
        outcome.finish(Some(CycleError::SeenStore(DatabaseError::Query("x".into()))));

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["protocol"], "imap");
        assert_eq!(json["listed"], 1);
        assert!(json["error"].as_str().unwrap().starts_with("seen_store:"));
    }
}
