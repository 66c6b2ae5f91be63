//! Reply dispatch pipeline: dedup, rule selection, budget, follow gate,
//! Graph API sends, and delivery bookkeeping. Both the live webhook path and
//! backtrack replay funnel through [`Engine::process_comment`], so the two
//! paths cannot disagree on semantics.

pub mod matcher;
pub mod rate;

use std::sync::Arc;

use gf_core::{
    Automation, AutomationStore, CommentEvent, CoreError, CoreResult, CredentialResolver,
    DeadLetterRecord, DeadLetterSink, DeliveryRecord, DeliveryState, DeliveryStore, DmEvent,
    FollowGate, InstagramApi, InstagramCredentials, ReplyTemplate,
};
use gf_idempotency::{IdKey, IdempotencyGuard};
use rate::AccountRateLimiter;
use tracing::{info, warn};

/// Why an event produced no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Duplicate,
    SelfComment,
    Echo,
    NoMatch,
    AlreadyReplied,
    AwaitingFollow,
    BudgetExhausted,
    NoCredentials,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Duplicate => "duplicate",
            SkipReason::SelfComment => "self_comment",
            SkipReason::Echo => "echo",
            SkipReason::NoMatch => "no_match",
            SkipReason::AlreadyReplied => "already_replied",
            SkipReason::AwaitingFollow => "awaiting_follow",
            SkipReason::BudgetExhausted => "budget_exhausted",
            SkipReason::NoCredentials => "no_credentials",
        }
    }
}

/// What the engine did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Replied {
        automation_id: String,
        comment_reply_sent: bool,
        dm_sent: bool,
    },
    /// Gate message sent, real reply parked until the user follows.
    GatePending { automation_id: String },
    Skipped(SkipReason),
}

#[derive(Clone)]
pub struct Engine {
    automations: Arc<dyn AutomationStore>,
    deliveries: Arc<dyn DeliveryStore>,
    credentials: Arc<dyn CredentialResolver>,
    api: Arc<dyn InstagramApi>,
    dead_letters: Arc<dyn DeadLetterSink>,
    idem: IdempotencyGuard,
    limiter: AccountRateLimiter,
}

impl Engine {
    pub fn new(
        automations: Arc<dyn AutomationStore>,
        deliveries: Arc<dyn DeliveryStore>,
        credentials: Arc<dyn CredentialResolver>,
        api: Arc<dyn InstagramApi>,
        dead_letters: Arc<dyn DeadLetterSink>,
        idem: IdempotencyGuard,
        limiter: AccountRateLimiter,
    ) -> Self {
        Self {
            automations,
            deliveries,
            credentials,
            api,
            dead_letters,
            idem,
            limiter,
        }
    }

    /// Runs one comment through the full pipeline. Idempotent per
    /// (account, media, comment) regardless of whether the comment arrived by
    /// webhook or backtrack.
    pub async fn process_comment(&self, event: &CommentEvent) -> CoreResult<Outcome> {
        if event.is_self_comment() {
            return Ok(self.skip(&event.account_id, "comments", SkipReason::SelfComment));
        }

        let key = IdKey {
            account: event.account_id.clone(),
            surface: "comments".to_string(),
            event_id: format!("{}:{}", event.media_id, event.comment_id),
        };
        // A broken dedup store must not silence replies; fail open.
        match self.idem.should_process(&key).await {
            Ok(true) => {}
            Ok(false) => {
                return Ok(self.skip(&event.account_id, "comments", SkipReason::Duplicate))
            }
            Err(err) => {
                warn!(account = %event.account_id, error = %err, "idempotency store unavailable, continuing");
            }
        }

        let rules = self.automations.list_enabled(&event.account_id).await?;

        let creds = self.credentials.credentials(&event.account_id).await?;
        let Some(creds) = creds else {
            return Ok(self.skip(&event.account_id, "comments", SkipReason::NoCredentials));
        };

        // A fresh comment is also a follow signal for parked replies.
        self.release_follow_ups(&creds, &event.account_id, &event.commenter_id, &rules)
            .await;

        let Some(automation) =
            matcher::select_for_comment(&rules, &event.media_id, event.text.as_deref())
        else {
            return Ok(self.skip(&event.account_id, "comments", SkipReason::NoMatch));
        };

        match self
            .deliveries
            .find(&automation.id, &event.commenter_id)
            .await?
        {
            Some(existing) if existing.state == DeliveryState::Replied => {
                return Ok(self.skip(&event.account_id, "comments", SkipReason::AlreadyReplied));
            }
            Some(_) => {
                return Ok(self.skip(&event.account_id, "comments", SkipReason::AwaitingFollow));
            }
            None => {}
        }

        if !self.automations.claim_reply_slot(&automation.id).await? {
            return Ok(self.skip(&event.account_id, "comments", SkipReason::BudgetExhausted));
        }

        if let Some(gate) = &automation.follow_gate {
            match self.check_follow(&creds, &event.commenter_id).await {
                Ok(true) => {}
                Ok(false) => {
                    return self
                        .park_behind_gate(
                            automation,
                            gate,
                            &creds,
                            &event.commenter_id,
                            Some(event.comment_id.clone()),
                            serde_json::to_value(event).unwrap_or_default(),
                        )
                        .await;
                }
                Err(err) => {
                    self.refund(automation).await;
                    self.dead_letter(
                        &event.account_id,
                        "follow_check",
                        &err,
                        &event.comment_id,
                        serde_json::to_value(event).unwrap_or_default(),
                    )
                    .await;
                    return Err(err);
                }
            }
        }

        self.limiter.acquire(&event.account_id).await;

        // The public reply is best effort; the DM is the deliverable.
        let mut comment_reply_sent = false;
        if let Some(text) = &automation.comment_reply {
            match self
                .api
                .reply_to_comment(&creds, &event.comment_id, text)
                .await
            {
                Ok(_) => comment_reply_sent = true,
                Err(err) => {
                    warn!(
                        account = %event.account_id,
                        comment = %event.comment_id,
                        error = %err,
                        "public comment reply failed"
                    );
                }
            }
        }

        if let Err(err) = self
            .api
            .send_private_reply(&creds, &event.comment_id, &automation.dm_reply)
            .await
        {
            self.refund(automation).await;
            self.dead_letter(
                &event.account_id,
                "comment_dispatch",
                &err,
                &event.comment_id,
                serde_json::to_value(event).unwrap_or_default(),
            )
            .await;
            return Err(err);
        }

        self.record_reply(
            automation,
            &event.commenter_id,
            Some(event.comment_id.clone()),
            "comments",
        )
        .await;

        Ok(Outcome::Replied {
            automation_id: automation.id.clone(),
            comment_reply_sent,
            dm_sent: true,
        })
    }

    /// Runs one inbound DM through the pipeline. Only rules without a media
    /// binding apply; replies go out as ordinary direct messages.
    pub async fn process_dm(&self, event: &DmEvent) -> CoreResult<Outcome> {
        if event.is_echo() {
            return Ok(self.skip(&event.account_id, "dm", SkipReason::Echo));
        }

        let key = IdKey {
            account: event.account_id.clone(),
            surface: "dm".to_string(),
            event_id: event.message_id.clone(),
        };
        match self.idem.should_process(&key).await {
            Ok(true) => {}
            Ok(false) => return Ok(self.skip(&event.account_id, "dm", SkipReason::Duplicate)),
            Err(err) => {
                warn!(account = %event.account_id, error = %err, "idempotency store unavailable, continuing");
            }
        }

        let rules = self.automations.list_enabled(&event.account_id).await?;

        let creds = self.credentials.credentials(&event.account_id).await?;
        let Some(creds) = creds else {
            return Ok(self.skip(&event.account_id, "dm", SkipReason::NoCredentials));
        };

        // Any inbound DM re-checks parked follow-gated replies for the sender.
        self.release_follow_ups(&creds, &event.account_id, &event.sender_id, &rules)
            .await;

        let Some(automation) = matcher::select_for_dm(&rules, event.text.as_deref()) else {
            return Ok(self.skip(&event.account_id, "dm", SkipReason::NoMatch));
        };

        match self.deliveries.find(&automation.id, &event.sender_id).await? {
            Some(existing) if existing.state == DeliveryState::Replied => {
                return Ok(self.skip(&event.account_id, "dm", SkipReason::AlreadyReplied));
            }
            Some(_) => {
                return Ok(self.skip(&event.account_id, "dm", SkipReason::AwaitingFollow));
            }
            None => {}
        }

        if !self.automations.claim_reply_slot(&automation.id).await? {
            return Ok(self.skip(&event.account_id, "dm", SkipReason::BudgetExhausted));
        }

        if let Some(gate) = &automation.follow_gate {
            match self.check_follow(&creds, &event.sender_id).await {
                Ok(true) => {}
                Ok(false) => {
                    return self
                        .park_behind_gate(
                            automation,
                            gate,
                            &creds,
                            &event.sender_id,
                            None,
                            serde_json::to_value(event).unwrap_or_default(),
                        )
                        .await;
                }
                Err(err) => {
                    self.refund(automation).await;
                    self.dead_letter(
                        &event.account_id,
                        "follow_check",
                        &err,
                        &event.message_id,
                        serde_json::to_value(event).unwrap_or_default(),
                    )
                    .await;
                    return Err(err);
                }
            }
        }

        self.limiter.acquire(&event.account_id).await;

        if let Err(err) = self
            .api
            .send_direct_message(&creds, &event.sender_id, &automation.dm_reply)
            .await
        {
            self.refund(automation).await;
            self.dead_letter(
                &event.account_id,
                "dm_dispatch",
                &err,
                &event.message_id,
                serde_json::to_value(event).unwrap_or_default(),
            )
            .await;
            return Err(err);
        }

        self.record_reply(automation, &event.sender_id, None, "dm")
            .await;

        Ok(Outcome::Replied {
            automation_id: automation.id.clone(),
            comment_reply_sent: false,
            dm_sent: true,
        })
    }

    /// Sends the follow-up message for every parked delivery whose recipient
    /// now follows the account. Best effort: a failed release stays parked and
    /// will be retried on the recipient's next event.
    async fn release_follow_ups(
        &self,
        creds: &InstagramCredentials,
        account_id: &str,
        user_id: &str,
        rules: &[Automation],
    ) {
        let parked = match self.deliveries.awaiting_follow(account_id, user_id).await {
            Ok(parked) if !parked.is_empty() => parked,
            Ok(_) => return,
            Err(err) => {
                warn!(account = %account_id, error = %err, "awaiting-follow lookup failed");
                return;
            }
        };

        // A record whose rule was deleted, disabled, or lost its gate can
        // never be released; drop it so the recipient is not stuck forever.
        let mut releasable = Vec::new();
        for record in parked {
            let gate = rules
                .iter()
                .find(|a| a.id == record.automation_id)
                .and_then(|a| a.follow_gate.as_ref().map(|gate| (a, gate)));
            match gate {
                Some((automation, gate)) => releasable.push((record, automation, gate)),
                None => {
                    if let Err(err) = self
                        .deliveries
                        .remove(&record.automation_id, &record.recipient_id)
                        .await
                    {
                        warn!(account = %account_id, error = %err, "failed to drop orphaned parked delivery");
                    }
                }
            }
        }
        if releasable.is_empty() {
            return;
        }

        match self.check_follow(creds, user_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(account = %account_id, user = %user_id, error = %err, "follow re-check failed");
                return;
            }
        }

        for (_record, automation, gate) in releasable {
            // The slot refunded at park time is re-claimed for the real send.
            match self.automations.claim_reply_slot(&automation.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(account = %account_id, error = %err, "budget claim failed during release");
                    continue;
                }
            }
            self.limiter.acquire(account_id).await;
            let template = ReplyTemplate::text(gate.follow_up_message.clone());
            if let Err(err) = self.api.send_direct_message(creds, user_id, &template).await {
                warn!(account = %account_id, user = %user_id, error = %err, "follow-up send failed");
                self.refund(automation).await;
                continue;
            }
            if let Err(err) = self
                .deliveries
                .mark_replied(&automation.id, user_id)
                .await
            {
                warn!(account = %account_id, error = %err, "failed to mark follow-up as replied");
            }
            if let Err(err) = self.automations.record_hit(&automation.id).await {
                warn!(account = %account_id, error = %err, "hit counter update failed");
            }
            metrics::counter!(
                "follow_ups_released_total",
                "account" => account_id.to_string()
            )
            .increment(1);
            info!(account = %account_id, user = %user_id, automation = %automation.id, "follow-up released");
        }
    }

    async fn check_follow(
        &self,
        creds: &InstagramCredentials,
        user_id: &str,
    ) -> CoreResult<bool> {
        self.api.is_follower(creds, user_id).await
    }

    /// Sends the gate message, refunds the slot, and parks the delivery.
    async fn park_behind_gate(
        &self,
        automation: &Automation,
        gate: &FollowGate,
        creds: &InstagramCredentials,
        recipient_id: &str,
        comment_id: Option<String>,
        envelope: serde_json::Value,
    ) -> CoreResult<Outcome> {
        self.limiter.acquire(&automation.account_id).await;
        let template = ReplyTemplate::text(gate.not_follower_message.clone());
        let send = match &comment_id {
            Some(cid) => self.api.send_private_reply(creds, cid, &template).await,
            None => {
                self.api
                    .send_direct_message(creds, recipient_id, &template)
                    .await
            }
        };
        if let Err(err) = send {
            self.refund(automation).await;
            self.dead_letter(
                &automation.account_id,
                "gate_dispatch",
                &err,
                comment_id.as_deref().unwrap_or(recipient_id),
                envelope,
            )
            .await;
            return Err(err);
        }

        // The parked reply has not consumed budget yet.
        self.refund(automation).await;

        self.deliveries
            .put(DeliveryRecord::awaiting_follow(
                &automation.id,
                &automation.account_id,
                recipient_id,
                comment_id,
            ))
            .await?;
        metrics::counter!(
            "engine_gate_parks_total",
            "account" => automation.account_id.clone()
        )
        .increment(1);
        Ok(Outcome::GatePending {
            automation_id: automation.id.clone(),
        })
    }

    async fn record_reply(
        &self,
        automation: &Automation,
        recipient_id: &str,
        comment_id: Option<String>,
        surface: &str,
    ) {
        if let Err(err) = self
            .deliveries
            .put(DeliveryRecord::replied(
                &automation.id,
                &automation.account_id,
                recipient_id,
                comment_id,
            ))
            .await
        {
            warn!(account = %automation.account_id, error = %err, "failed to record delivery");
        }
        if let Err(err) = self.automations.record_hit(&automation.id).await {
            warn!(account = %automation.account_id, error = %err, "hit counter update failed");
        }
        metrics::counter!(
            "engine_replies_total",
            "account" => automation.account_id.clone(),
            "surface" => surface.to_string()
        )
        .increment(1);
        info!(
            account = %automation.account_id,
            automation = %automation.id,
            recipient = %recipient_id,
            surface = %surface,
            "reply dispatched"
        );
    }

    async fn refund(&self, automation: &Automation) {
        if let Err(err) = self.automations.refund_reply_slot(&automation.id).await {
            warn!(
                account = %automation.account_id,
                automation = %automation.id,
                error = %err,
                "budget refund failed"
            );
        }
    }

    async fn dead_letter(
        &self,
        account_id: &str,
        stage: &str,
        err: &CoreError,
        event_id: &str,
        envelope: serde_json::Value,
    ) {
        let record = DeadLetterRecord::new(
            account_id,
            stage,
            err.code.clone(),
            err.message.clone(),
            event_id,
            envelope,
        );
        if let Err(sink_err) = self.dead_letters.publish(record).await {
            warn!(account = %account_id, error = %sink_err, "dead letter publish failed");
        }
    }

    fn skip(&self, account_id: &str, surface: &str, reason: SkipReason) -> Outcome {
        metrics::counter!(
            "engine_skips_total",
            "account" => account_id.to_string(),
            "surface" => surface.to_string(),
            "reason" => reason.as_str()
        )
        .increment(1);
        Outcome::Skipped(reason)
    }
}
