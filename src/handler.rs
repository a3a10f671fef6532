//! Inbound event handling — glue between transport, router, and scheduler.
//!
//! Events for the same user are serialized through a per-user async lock so
//! first-sighting detection and idempotent enrollment stay race-free;
//! different users run fully in parallel. Nothing here waits on the fire
//! loop: the only scheduler-store write on this path is the enrollment
//! batch insert.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::{FALLBACK_TEXT, MessageCatalog};
use crate::error::DatabaseError;
use crate::gateway::DeliveryGateway;
use crate::router::{ReplyText, route};
use crate::scheduler::DripScheduler;
use crate::store::Store;

/// One inbound text-message event from the messaging provider.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub user_id: String,
    pub text: String,
    pub reply_token: String,
}

/// Handles inbound events end to end: state read, routing, synchronous
/// reply, stage write, enrollment.
pub struct InboundHandler {
    store: Arc<dyn Store>,
    scheduler: Arc<DripScheduler>,
    gateway: Arc<dyn DeliveryGateway>,
    catalog: MessageCatalog,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InboundHandler {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Arc<DripScheduler>,
        gateway: Arc<dyn DeliveryGateway>,
        catalog: MessageCatalog,
    ) -> Self {
        Self {
            store,
            scheduler,
            gateway,
            catalog,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one inbound event.
    ///
    /// The user always gets a synchronous reply, even on downstream
    /// scheduling errors; only store failures propagate (the transport
    /// returns its error response and may re-deliver).
    pub async fn handle_event(&self, event: &InboundEvent) -> Result<(), DatabaseError> {
        let lock = self.user_lock(&event.user_id).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        let (record, is_new) = self.store.get_or_create_user(&event.user_id, now).await?;
        let outcome = route(&record, &event.text);

        debug!(
            user_id = %event.user_id,
            is_new,
            stage = ?record.stage,
            reply = ?outcome.reply,
            "Routed inbound event"
        );

        // Synchronous reply first: the user sees a response no matter what
        // happens to stage writes or enrollment below. A reply failure is
        // logged, not propagated — the webhook handshake must complete so
        // the provider does not re-deliver.
        let reply_text = match &outcome.reply {
            ReplyText::CatalogKey(key) => match self.catalog.lookup(key) {
                Ok(text) => text,
                Err(e) => {
                    warn!(user_id = %event.user_id, "Reply catalog miss: {e}");
                    FALLBACK_TEXT
                }
            },
            ReplyText::Fallback => FALLBACK_TEXT,
        };
        if let Err(e) = self
            .gateway
            .reply(&event.reply_token, reply_text, &outcome.quick_choices)
            .await
        {
            warn!(user_id = %event.user_id, "Reply delivery failed: {e}");
        }

        if let Some(stage) = outcome.advance_to {
            self.store.advance_stage(&event.user_id, stage).await?;
        }

        if let Some(campaign_id) = outcome.enroll {
            match self.scheduler.enroll(campaign_id, &event.user_id, now).await {
                Ok(jobs) => {
                    info!(
                        user_id = %event.user_id,
                        campaign_id,
                        jobs = jobs.len(),
                        "Enrollment handled"
                    );
                }
                Err(e) => {
                    // Reply already went out; the enrollment is simply skipped.
                    warn!(user_id = %event.user_id, campaign_id, "Enrollment skipped: {e}");
                }
            }
        }

        Ok(())
    }

    /// Get (or create) the serialization lock for a user id.
    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        Arc::clone(
            locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::campaign::{CampaignRegistry, GIFT_CAMPAIGN};
    use crate::catalog::REQUIRED_KEYS;
    use crate::error::DeliveryError;
    use crate::router::QuickChoice;
    use crate::store::{JobStatus, LibSqlBackend, Stage};

    /// Gateway stub recording replies and pushes.
    struct StubGateway {
        replies: Mutex<Vec<(String, String, usize)>>,
        pushes: Mutex<Vec<(String, String)>>,
    }

    impl StubGateway {
        fn new() -> Self {
            Self {
                replies: Mutex::new(Vec::new()),
                pushes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DeliveryGateway for StubGateway {
        async fn reply(
            &self,
            reply_token: &str,
            text: &str,
            quick_choices: &[QuickChoice],
        ) -> Result<(), DeliveryError> {
            self.replies.lock().await.push((
                reply_token.to_string(),
                text.to_string(),
                quick_choices.len(),
            ));
            Ok(())
        }

        async fn push(&self, user_id: &str, text: &str) -> Result<(), DeliveryError> {
            self.pushes
                .lock()
                .await
                .push((user_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn test_catalog() -> MessageCatalog {
        let messages: HashMap<String, String> = REQUIRED_KEYS
            .iter()
            .map(|k| (k.to_string(), format!("{k} text")))
            .collect();
        MessageCatalog::from_map(messages)
    }

    async fn handler_fixture() -> (InboundHandler, Arc<dyn Store>, Arc<StubGateway>) {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let gateway = Arc::new(StubGateway::new());
        let scheduler = Arc::new(DripScheduler::new(
            Arc::clone(&store),
            CampaignRegistry::new(false),
            Arc::clone(&gateway) as Arc<dyn DeliveryGateway>,
            test_catalog(),
            3,
        ));
        let handler = InboundHandler::new(
            Arc::clone(&store),
            scheduler,
            Arc::clone(&gateway) as Arc<dyn DeliveryGateway>,
            test_catalog(),
        );
        (handler, store, gateway)
    }

    fn event(user_id: &str, text: &str) -> InboundEvent {
        InboundEvent {
            user_id: user_id.to_string(),
            text: text.to_string(),
            reply_token: format!("rt-{user_id}"),
        }
    }

    #[tokio::test]
    async fn first_event_greets_and_advances_stage() {
        let (handler, store, gateway) = handler_fixture().await;

        handler.handle_event(&event("U1", "anything at all")).await.unwrap();

        let replies = gateway.replies.lock().await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1, "greeting text");
        assert_eq!(replies[0].2, 1, "greeting carries the quick choice");

        let user = store.get_user("U1").await.unwrap().unwrap();
        assert_eq!(user.stage, Stage::Greeted);
        assert!(store.live_jobs(GIFT_CAMPAIGN, "U1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gift_message_enrolls_once() {
        let (handler, store, gateway) = handler_fixture().await;

        handler.handle_event(&event("U1", "hello")).await.unwrap();
        handler.handle_event(&event("U1", "gift")).await.unwrap();
        handler.handle_event(&event("U1", "GIFT")).await.unwrap();

        let user = store.get_user("U1").await.unwrap().unwrap();
        assert_eq!(user.stage, Stage::GiftEnrolled);

        // Re-triggering while jobs are live does not duplicate the batch.
        let live = store.live_jobs(GIFT_CAMPAIGN, "U1").await.unwrap();
        assert_eq!(live.len(), 5);

        let replies = gateway.replies.lock().await;
        assert_eq!(replies[1].1, "gift text");
        assert_eq!(replies[2].1, "gift text");
    }

    #[tokio::test]
    async fn fallback_reply_for_unmatched_text() {
        let (handler, _store, gateway) = handler_fixture().await;

        handler.handle_event(&event("U1", "hello")).await.unwrap();
        handler.handle_event(&event("U1", "what now?")).await.unwrap();

        let replies = gateway.replies.lock().await;
        assert_eq!(replies[1].1, FALLBACK_TEXT);
    }

    #[tokio::test]
    async fn rose_reply_changes_nothing() {
        let (handler, store, gateway) = handler_fixture().await;

        handler.handle_event(&event("U1", "hi")).await.unwrap();
        handler.handle_event(&event("U1", "gift")).await.unwrap();
        handler.handle_event(&event("U1", "🌹")).await.unwrap();

        let replies = gateway.replies.lock().await;
        assert_eq!(replies[2].1, "rose_path text");

        let user = store.get_user("U1").await.unwrap().unwrap();
        assert_eq!(user.stage, Stage::GiftEnrolled);
        assert_eq!(store.live_jobs(GIFT_CAMPAIGN, "U1").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn concurrent_first_events_greet_once() {
        let (handler, store, gateway) = handler_fixture().await;
        let handler = Arc::new(handler);

        let mut handles = Vec::new();
        for i in 0..8 {
            let h = Arc::clone(&handler);
            handles.push(tokio::spawn(async move {
                h.handle_event(&event("U1", &format!("msg {i}"))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Exactly one of the racing events observed is_new and greeted.
        let replies = gateway.replies.lock().await;
        let greetings = replies.iter().filter(|(_, t, _)| t == "greeting text").count();
        assert_eq!(greetings, 1);

        let user = store.get_user("U1").await.unwrap().unwrap();
        assert_eq!(user.stage, Stage::Greeted);
    }

    #[tokio::test]
    async fn distinct_users_are_independent() {
        let (handler, store, _gateway) = handler_fixture().await;

        handler.handle_event(&event("U1", "hi")).await.unwrap();
        handler.handle_event(&event("U2", "hi")).await.unwrap();
        handler.handle_event(&event("U1", "gift")).await.unwrap();

        assert_eq!(store.live_jobs(GIFT_CAMPAIGN, "U1").await.unwrap().len(), 5);
        assert!(store.live_jobs(GIFT_CAMPAIGN, "U2").await.unwrap().is_empty());

        let u2 = store.get_user("U2").await.unwrap().unwrap();
        assert_eq!(u2.stage, Stage::Greeted);
    }

    #[tokio::test]
    async fn enrollment_jobs_are_pending_until_fire_loop() {
        let (handler, store, gateway) = handler_fixture().await;

        handler.handle_event(&event("U1", "hi")).await.unwrap();
        handler.handle_event(&event("U1", "receive gift")).await.unwrap();

        assert!(gateway.pushes.lock().await.is_empty(), "inbound path never pushes");
        let live = store.live_jobs(GIFT_CAMPAIGN, "U1").await.unwrap();
        assert!(live.iter().all(|j| j.status == JobStatus::Pending));
    }
}
