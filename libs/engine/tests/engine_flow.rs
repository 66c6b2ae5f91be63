//! End-to-end pipeline tests with in-memory fakes behind every seam.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use gf_core::{
    Automation, AutomationStore, CommentEvent, CoreError, CoreResult, CredentialResolver,
    DeadLetterRecord, DeadLetterSink, DeliveryRecord, DeliveryState, DeliveryStore, DmEvent,
    FollowGate, InstagramApi, InstagramCredentials, ReplyTemplate, SendReceipt,
};
use gf_engine::{
    rate::{AccountRateLimiter, RateLimits},
    Engine, Outcome, SkipReason,
};
use gf_idempotency::{IdempotencyGuard, InMemoryIdemStore};
use tokio::sync::Mutex;

struct FakeAutomationStore {
    automations: Mutex<Vec<Automation>>,
}

impl FakeAutomationStore {
    fn new(automations: Vec<Automation>) -> Self {
        Self {
            automations: Mutex::new(automations),
        }
    }

    async fn replies_left(&self, id: &str) -> u32 {
        self.automations
            .lock()
            .await
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.replies_left)
            .unwrap_or(0)
    }

    async fn hits(&self, id: &str) -> u64 {
        self.automations
            .lock()
            .await
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.hits)
            .unwrap_or(0)
    }
}

#[async_trait]
impl AutomationStore for FakeAutomationStore {
    async fn list_enabled(&self, account_id: &str) -> CoreResult<Vec<Automation>> {
        let mut rules: Vec<Automation> = self
            .automations
            .lock()
            .await
            .iter()
            .filter(|a| a.account_id == account_id && a.enabled)
            .cloned()
            .collect();
        rules.sort_by_key(|a| a.created_at);
        Ok(rules)
    }

    async fn claim_reply_slot(&self, automation_id: &str) -> CoreResult<bool> {
        let mut guard = self.automations.lock().await;
        let Some(automation) = guard.iter_mut().find(|a| a.id == automation_id) else {
            return Ok(false);
        };
        if automation.is_unlimited() {
            return Ok(true);
        }
        if automation.replies_left == 0 {
            return Ok(false);
        }
        automation.replies_left -= 1;
        Ok(true)
    }

    async fn refund_reply_slot(&self, automation_id: &str) -> CoreResult<()> {
        let mut guard = self.automations.lock().await;
        if let Some(automation) = guard.iter_mut().find(|a| a.id == automation_id) {
            if !automation.is_unlimited() {
                automation.replies_left += 1;
            }
        }
        Ok(())
    }

    async fn record_hit(&self, automation_id: &str) -> CoreResult<()> {
        let mut guard = self.automations.lock().await;
        if let Some(automation) = guard.iter_mut().find(|a| a.id == automation_id) {
            automation.hits += 1;
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeDeliveryStore {
    records: Mutex<HashMap<(String, String), DeliveryRecord>>,
}

#[async_trait]
impl DeliveryStore for FakeDeliveryStore {
    async fn find(
        &self,
        automation_id: &str,
        recipient_id: &str,
    ) -> CoreResult<Option<DeliveryRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .get(&(automation_id.to_string(), recipient_id.to_string()))
            .cloned())
    }

    async fn put(&self, record: DeliveryRecord) -> CoreResult<()> {
        self.records.lock().await.insert(
            (record.automation_id.clone(), record.recipient_id.clone()),
            record,
        );
        Ok(())
    }

    async fn awaiting_follow(
        &self,
        account_id: &str,
        recipient_id: &str,
    ) -> CoreResult<Vec<DeliveryRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| {
                r.account_id == account_id
                    && r.recipient_id == recipient_id
                    && r.state == DeliveryState::AwaitingFollow
            })
            .cloned()
            .collect())
    }

    async fn mark_replied(&self, automation_id: &str, recipient_id: &str) -> CoreResult<()> {
        if let Some(record) = self
            .records
            .lock()
            .await
            .get_mut(&(automation_id.to_string(), recipient_id.to_string()))
        {
            record.state = DeliveryState::Replied;
        }
        Ok(())
    }

    async fn remove(&self, automation_id: &str, recipient_id: &str) -> CoreResult<()> {
        self.records
            .lock()
            .await
            .remove(&(automation_id.to_string(), recipient_id.to_string()));
        Ok(())
    }
}

struct FakeCredentials;

#[async_trait]
impl CredentialResolver for FakeCredentials {
    async fn credentials(&self, _account_id: &str) -> CoreResult<Option<InstagramCredentials>> {
        Ok(Some(InstagramCredentials::new("ig-1", "token")))
    }
}

struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    async fn credentials(&self, _account_id: &str) -> CoreResult<Option<InstagramCredentials>> {
        Ok(None)
    }
}

#[derive(Default)]
struct FakeApi {
    followers: Mutex<HashSet<String>>,
    fail_private_reply: Mutex<bool>,
    sent: Mutex<Vec<String>>,
}

impl FakeApi {
    async fn add_follower(&self, user_id: &str) {
        self.followers.lock().await.insert(user_id.to_string());
    }

    async fn set_fail_private_reply(&self, fail: bool) {
        *self.fail_private_reply.lock().await = fail;
    }

    async fn sent(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl InstagramApi for FakeApi {
    async fn reply_to_comment(
        &self,
        _creds: &InstagramCredentials,
        comment_id: &str,
        text: &str,
    ) -> CoreResult<SendReceipt> {
        self.sent
            .lock()
            .await
            .push(format!("comment:{comment_id}:{text}"));
        Ok(SendReceipt::default())
    }

    async fn send_private_reply(
        &self,
        _creds: &InstagramCredentials,
        comment_id: &str,
        template: &ReplyTemplate,
    ) -> CoreResult<SendReceipt> {
        if *self.fail_private_reply.lock().await {
            return Err(CoreError::new("ig_send_failed", "status=400"));
        }
        self.sent
            .lock()
            .await
            .push(format!("private:{comment_id}:{}", template_text(template)));
        Ok(SendReceipt::default())
    }

    async fn send_direct_message(
        &self,
        _creds: &InstagramCredentials,
        recipient_id: &str,
        template: &ReplyTemplate,
    ) -> CoreResult<SendReceipt> {
        self.sent
            .lock()
            .await
            .push(format!("dm:{recipient_id}:{}", template_text(template)));
        Ok(SendReceipt::default())
    }

    async fn is_follower(
        &self,
        _creds: &InstagramCredentials,
        user_id: &str,
    ) -> CoreResult<bool> {
        Ok(self.followers.lock().await.contains(user_id))
    }

    async fn list_comments(
        &self,
        _creds: &InstagramCredentials,
        _media_id: &str,
        _after: Option<&str>,
    ) -> CoreResult<gf_core::CommentPage> {
        Ok(gf_core::CommentPage::default())
    }
}

fn template_text(template: &ReplyTemplate) -> String {
    match template {
        ReplyTemplate::Text { text } => text.clone(),
        ReplyTemplate::Buttons { text, .. } => text.clone(),
        ReplyTemplate::Image { text, .. } => text.clone(),
    }
}

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

#[async_trait]
impl DeadLetterSink for MemorySink {
    async fn publish(&self, record: DeadLetterRecord) -> CoreResult<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

struct Harness {
    engine: Engine,
    automations: Arc<FakeAutomationStore>,
    deliveries: Arc<FakeDeliveryStore>,
    api: Arc<FakeApi>,
    sink: Arc<MemorySink>,
}

fn harness(rules: Vec<Automation>) -> Harness {
    harness_with_creds(rules, Arc::new(FakeCredentials))
}

fn harness_with_creds(rules: Vec<Automation>, creds: Arc<dyn CredentialResolver>) -> Harness {
    let automations = Arc::new(FakeAutomationStore::new(rules));
    let deliveries = Arc::new(FakeDeliveryStore::default());
    let api = Arc::new(FakeApi::default());
    let sink = Arc::new(MemorySink::default());
    let idem = IdempotencyGuard::new(Arc::new(InMemoryIdemStore::new()), 1);
    let limiter = AccountRateLimiter::new(Arc::new(RateLimits::from_env()));
    let engine = Engine::new(
        automations.clone(),
        deliveries.clone(),
        creds,
        api.clone(),
        sink.clone(),
        idem,
        limiter,
    );
    Harness {
        engine,
        automations,
        deliveries,
        api,
        sink,
    }
}

fn rule(account: &str, keywords: &[&str]) -> Automation {
    let mut a = Automation::new(account, ReplyTemplate::text("check your inbox"));
    a.keywords = keywords.iter().map(|k| k.to_string()).collect();
    a
}

fn comment(account: &str, comment_id: &str, commenter: &str, text: &str) -> CommentEvent {
    CommentEvent {
        account_id: account.into(),
        media_id: "media-1".into(),
        comment_id: comment_id.into(),
        commenter_id: commenter.into(),
        commenter_username: Some("fan".into()),
        text: Some(text.into()),
        timestamp: "2025-06-01T12:00:00Z".into(),
    }
}

#[tokio::test]
async fn keyword_comment_gets_dm_and_public_reply() {
    let mut r = rule("acct", &["price"]);
    r.comment_reply = Some("sent you a DM!".into());
    let id = r.id.clone();
    let h = harness(vec![r]);

    let outcome = h
        .engine
        .process_comment(&comment("acct", "c1", "user-1", "what's the PRICE?"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Outcome::Replied {
            automation_id: id.clone(),
            comment_reply_sent: true,
            dm_sent: true,
        }
    );
    let sent = h.api.sent().await;
    assert_eq!(sent.len(), 2);
    assert!(sent[0].starts_with("comment:c1:"));
    assert!(sent[1].starts_with("private:c1:"));
    assert_eq!(h.automations.hits(&id).await, 1);
    let record = h.deliveries.find(&id, "user-1").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Replied);
}

#[tokio::test]
async fn second_comment_from_same_user_is_already_replied() {
    let r = rule("acct", &["price"]);
    let h = harness(vec![r]);

    h.engine
        .process_comment(&comment("acct", "c1", "user-1", "price"))
        .await
        .unwrap();
    let outcome = h
        .engine
        .process_comment(&comment("acct", "c2", "user-1", "price again"))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Skipped(SkipReason::AlreadyReplied));
    assert_eq!(h.api.sent().await.len(), 1);
}

#[tokio::test]
async fn duplicate_comment_event_is_dropped() {
    let r = rule("acct", &["price"]);
    let h = harness(vec![r]);
    let event = comment("acct", "c1", "user-1", "price");

    h.engine.process_comment(&event).await.unwrap();
    let outcome = h.engine.process_comment(&event).await.unwrap();

    assert_eq!(outcome, Outcome::Skipped(SkipReason::Duplicate));
    assert_eq!(h.api.sent().await.len(), 1);
}

#[tokio::test]
async fn self_comments_are_ignored() {
    let mut r = rule("acct", &[]);
    r.respond_to_all = true;
    let h = harness(vec![r]);

    let outcome = h
        .engine
        .process_comment(&comment("acct", "c1", "acct", "first!"))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Skipped(SkipReason::SelfComment));
    assert!(h.api.sent().await.is_empty());
}

#[tokio::test]
async fn respond_to_all_catches_unmatched_comments() {
    let mut r = rule("acct", &[]);
    r.respond_to_all = true;
    let id = r.id.clone();
    let h = harness(vec![r]);

    let outcome = h
        .engine
        .process_comment(&comment("acct", "c1", "user-1", "lovely reel"))
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::Replied { automation_id, .. } if automation_id == id));
}

#[tokio::test]
async fn no_matching_rule_is_a_skip() {
    let r = rule("acct", &["price"]);
    let h = harness(vec![r]);

    let outcome = h
        .engine
        .process_comment(&comment("acct", "c1", "user-1", "nice"))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Skipped(SkipReason::NoMatch));
}

#[tokio::test]
async fn budget_exhaustion_blocks_further_replies() {
    let mut r = rule("acct", &["price"]);
    r.reply_limit = 1;
    r.replies_left = 1;
    let id = r.id.clone();
    let h = harness(vec![r]);

    let first = h
        .engine
        .process_comment(&comment("acct", "c1", "user-1", "price"))
        .await
        .unwrap();
    assert!(matches!(first, Outcome::Replied { .. }));
    assert_eq!(h.automations.replies_left(&id).await, 0);

    let second = h
        .engine
        .process_comment(&comment("acct", "c2", "user-2", "price"))
        .await
        .unwrap();
    assert_eq!(second, Outcome::Skipped(SkipReason::BudgetExhausted));
}

#[tokio::test]
async fn failed_dm_refunds_budget_and_dead_letters() {
    let mut r = rule("acct", &["price"]);
    r.reply_limit = 5;
    r.replies_left = 5;
    let id = r.id.clone();
    let h = harness(vec![r]);
    h.api.set_fail_private_reply(true).await;

    let result = h
        .engine
        .process_comment(&comment("acct", "c1", "user-1", "price"))
        .await;

    assert!(result.is_err());
    assert_eq!(h.automations.replies_left(&id).await, 5);
    let dead = h.sink.records.lock().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].stage, "comment_dispatch");
    assert_eq!(dead[0].code, "ig_send_failed");
    // No delivery record: the user can be retried.
    assert!(h.deliveries.find(&id, "user-1").await.unwrap().is_none());
}

#[tokio::test]
async fn missing_credentials_skip_without_sending() {
    let mut r = rule("acct", &[]);
    r.respond_to_all = true;
    let h = harness_with_creds(vec![r], Arc::new(NoCredentials));

    let outcome = h
        .engine
        .process_comment(&comment("acct", "c1", "user-1", "hello"))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Skipped(SkipReason::NoCredentials));
}

#[tokio::test]
async fn non_follower_is_parked_behind_the_gate() {
    let mut r = rule("acct", &["promo"]);
    r.reply_limit = 3;
    r.replies_left = 3;
    r.follow_gate = Some(FollowGate {
        not_follower_message: "follow us first".into(),
        follow_up_message: "thanks for the follow, here it is".into(),
    });
    let id = r.id.clone();
    let h = harness(vec![r]);

    let outcome = h
        .engine
        .process_comment(&comment("acct", "c1", "user-1", "promo"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Outcome::GatePending {
            automation_id: id.clone()
        }
    );
    let sent = h.api.sent().await;
    assert_eq!(sent, vec!["private:c1:follow us first".to_string()]);
    // Parking does not consume budget.
    assert_eq!(h.automations.replies_left(&id).await, 3);
    let record = h.deliveries.find(&id, "user-1").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::AwaitingFollow);
}

#[tokio::test]
async fn follow_then_dm_releases_the_parked_reply() {
    let mut r = rule("acct", &["promo"]);
    r.reply_limit = 3;
    r.replies_left = 3;
    r.follow_gate = Some(FollowGate {
        not_follower_message: "follow us first".into(),
        follow_up_message: "here is your link".into(),
    });
    let id = r.id.clone();
    let h = harness(vec![r]);

    h.engine
        .process_comment(&comment("acct", "c1", "user-1", "promo"))
        .await
        .unwrap();
    h.api.add_follower("user-1").await;

    let dm = DmEvent {
        account_id: "acct".into(),
        sender_id: "user-1".into(),
        message_id: "m1".into(),
        text: Some("done, followed you".into()),
        timestamp: "2025-06-01T12:05:00Z".into(),
    };
    h.engine.process_dm(&dm).await.unwrap();

    let sent = h.api.sent().await;
    assert!(sent.contains(&"dm:user-1:here is your link".to_string()));
    let record = h.deliveries.find(&id, "user-1").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::Replied);
    // The release claims the slot the park refunded.
    assert_eq!(h.automations.replies_left(&id).await, 2);
    assert_eq!(h.automations.hits(&id).await, 1);
}

#[tokio::test]
async fn disabling_a_rule_drops_its_parked_deliveries() {
    let mut r = rule("acct", &["promo"]);
    r.follow_gate = Some(FollowGate {
        not_follower_message: "follow us first".into(),
        follow_up_message: "here it is".into(),
    });
    let id = r.id.clone();
    let h = harness(vec![r]);

    h.engine
        .process_comment(&comment("acct", "c1", "user-1", "promo"))
        .await
        .unwrap();
    let record = h.deliveries.find(&id, "user-1").await.unwrap().unwrap();
    assert_eq!(record.state, DeliveryState::AwaitingFollow);

    h.automations.automations.lock().await[0].enabled = false;

    let outcome = h
        .engine
        .process_comment(&comment("acct", "c2", "user-1", "promo"))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Skipped(SkipReason::NoMatch));
    // The park can never be released now, so the record is dropped and a
    // re-enabled rule starts fresh for this user.
    assert!(h.deliveries.find(&id, "user-1").await.unwrap().is_none());
    assert_eq!(h.api.sent().await.len(), 1);
}

#[tokio::test]
async fn follower_passes_the_gate_directly() {
    let mut r = rule("acct", &["promo"]);
    r.follow_gate = Some(FollowGate {
        not_follower_message: "follow us first".into(),
        follow_up_message: "here it is".into(),
    });
    let h = harness(vec![r]);
    h.api.add_follower("user-1").await;

    let outcome = h
        .engine
        .process_comment(&comment("acct", "c1", "user-1", "promo"))
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::Replied { dm_sent: true, .. }));
    let sent = h.api.sent().await;
    assert_eq!(sent, vec!["private:c1:check your inbox".to_string()]);
}

#[tokio::test]
async fn dm_echo_is_ignored() {
    let mut r = rule("acct", &[]);
    r.respond_to_all = true;
    let h = harness(vec![r]);

    let echo = DmEvent {
        account_id: "acct".into(),
        sender_id: "acct".into(),
        message_id: "m1".into(),
        text: Some("auto reply".into()),
        timestamp: "2025-06-01T12:00:00Z".into(),
    };
    let outcome = h.engine.process_dm(&echo).await.unwrap();

    assert_eq!(outcome, Outcome::Skipped(SkipReason::Echo));
    assert!(h.api.sent().await.is_empty());
}

#[tokio::test]
async fn dm_keyword_rule_replies_by_direct_message() {
    let r = rule("acct", &["help"]);
    let id = r.id.clone();
    let h = harness(vec![r]);

    let dm = DmEvent {
        account_id: "acct".into(),
        sender_id: "user-9".into(),
        message_id: "m1".into(),
        text: Some("HELP please".into()),
        timestamp: "2025-06-01T12:00:00Z".into(),
    };
    let outcome = h.engine.process_dm(&dm).await.unwrap();

    assert!(matches!(outcome, Outcome::Replied { automation_id, .. } if automation_id == id));
    assert_eq!(
        h.api.sent().await,
        vec!["dm:user-9:check your inbox".to_string()]
    );
}

#[tokio::test]
async fn media_bound_rule_ignores_dms() {
    let mut r = rule("acct", &["help"]);
    r.media_id = Some("media-1".into());
    let h = harness(vec![r]);

    let dm = DmEvent {
        account_id: "acct".into(),
        sender_id: "user-9".into(),
        message_id: "m1".into(),
        text: Some("help".into()),
        timestamp: "2025-06-01T12:00:00Z".into(),
    };
    let outcome = h.engine.process_dm(&dm).await.unwrap();

    assert_eq!(outcome, Outcome::Skipped(SkipReason::NoMatch));
}
