use chrono::{Duration, Utc};
use std::sync::Arc;
use teloxide::types::ChatId;
use tracing::warn;

use crate::config::{ActionKind, CompiledPolicy};
use crate::counter::CounterStore;
use crate::detect::{DetectorKind, Verdict};
use crate::message::Inbound;
use crate::outcome::{OutcomeLog, OutcomeRecord};
use crate::sched::Scheduler;
use crate::transport::Transport;

const WARN_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunishmentOutcome {
    pub action: ActionKind,
    pub escalated: bool,
    pub warn_count: Option<u32>,
    pub deferred: bool,
    pub ok: bool,
}

/// Maps a verdict to transport calls. Best-effort within one invocation:
/// transport failures are logged and swallowed, never retried. Anything
/// that must fire later goes through the scheduler instead.
pub struct Punisher {
    transport: Arc<dyn Transport>,
    counters: Arc<CounterStore>,
    scheduler: Arc<Scheduler>,
    outcomes: Arc<OutcomeLog>,
}

fn warn_key(chat: ChatId, user: teloxide::types::UserId) -> String {
    format!("warn:{}:{}", chat.0, user.0)
}

impl Punisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        counters: Arc<CounterStore>,
        scheduler: Arc<Scheduler>,
        outcomes: Arc<OutcomeLog>,
    ) -> Self {
        Self {
            transport,
            counters,
            scheduler,
            outcomes,
        }
    }

    fn warn_limit_for(verdict: &Verdict, policy: &CompiledPolicy) -> u32 {
        match verdict.detector {
            DetectorKind::Ad => policy.cfg.anti_ads.warn_limit,
            _ => 3,
        }
    }

    async fn delete_now(&self, msg: &Inbound) -> bool {
        match self
            .transport
            .delete_message(msg.chat_id, msg.message_id)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "delete failed (chat={} msg={}): {:?}",
                    msg.chat_id, msg.message_id.0, e
                );
                false
            }
        }
    }

    pub async fn apply(
        &self,
        verdict: &Verdict,
        policy: &CompiledPolicy,
        msg: &Inbound,
    ) -> PunishmentOutcome {
        let action = verdict.suggested_action.unwrap_or(ActionKind::Delete);

        // a per-rule delay defers the delete to the sweep
        if action == ActionKind::Delete && verdict.delay_seconds > 0 {
            self.scheduler
                .schedule(
                    msg.chat_id,
                    msg.message_id,
                    verdict.delay_seconds,
                    verdict.detector.as_str(),
                )
                .await;
            let outcome = PunishmentOutcome {
                action,
                escalated: false,
                warn_count: None,
                deferred: true,
                ok: true,
            };
            self.audit(verdict, msg, &outcome);
            return outcome;
        }

        let mut escalated = false;
        let mut warn_count = None;
        let ok = match action {
            ActionKind::Delete => self.delete_now(msg).await,
            ActionKind::Warn => {
                let deleted = self.delete_now(msg).await;
                let count = self
                    .counters
                    .increment(&warn_key(msg.chat_id, msg.user_id), Duration::days(WARN_TTL_DAYS));
                warn_count = Some(count);
                let limit = Self::warn_limit_for(verdict, policy);
                if count >= limit {
                    escalated = true;
                    self.counters.reset(&warn_key(msg.chat_id, msg.user_id));
                    if let Err(e) = self.transport.kick(msg.chat_id, msg.user_id).await {
                        warn!("escalation kick failed (user={}): {:?}", msg.user_id, e);
                    }
                } else {
                    let notice = format!(
                        "⚠️ 警告 {}/{}：{}",
                        count, limit, verdict.reason
                    );
                    if let Err(e) = self.transport.send_text(msg.chat_id, &notice).await {
                        warn!("warn notice failed: {:?}", e);
                    }
                }
                deleted
            }
            ActionKind::Mute => {
                let deleted = self.delete_now(msg).await;
                let until = Utc::now()
                    + Duration::seconds(policy.cfg.anti_spam.mute_duration_seconds.max(60));
                if let Err(e) = self
                    .transport
                    .restrict(msg.chat_id, msg.user_id, Some(until))
                    .await
                {
                    warn!("mute failed (user={}): {:?}", msg.user_id, e);
                }
                deleted
            }
            ActionKind::Kick => {
                match self.transport.kick(msg.chat_id, msg.user_id).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("kick failed (user={}): {:?}", msg.user_id, e);
                        false
                    }
                }
            }
            ActionKind::Ban => {
                match self.transport.ban(msg.chat_id, msg.user_id, None).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("ban failed (user={}): {:?}", msg.user_id, e);
                        false
                    }
                }
            }
        };

        if verdict.detector == DetectorKind::SensitiveWord && policy.cfg.sensitive_words.notify_admin
        {
            let notice = format!("🔔 敏感词命中（{}），消息已处理。", verdict.reason);
            if let Err(e) = self.transport.send_text(msg.chat_id, &notice).await {
                warn!("admin notify failed: {:?}", e);
            }
        }

        let outcome = PunishmentOutcome {
            action,
            escalated,
            warn_count,
            deferred: false,
            ok,
        };
        self.audit(verdict, msg, &outcome);
        outcome
    }

    fn audit(&self, verdict: &Verdict, msg: &Inbound, outcome: &PunishmentOutcome) {
        self.outcomes.append(OutcomeRecord {
            at: Utc::now(),
            chat_id: msg.chat_id.0,
            user_id: Some(msg.user_id.0),
            source: format!("moderation:{}", verdict.detector.as_str()),
            action: format!("{:?}", outcome.action).to_lowercase(),
            ok: outcome.ok,
            detail: if outcome.escalated {
                format!("{} (warn limit reached, kicked)", verdict.reason)
            } else if outcome.deferred {
                format!("{} (deferred {}s)", verdict.reason, verdict.delay_seconds)
            } else {
                verdict.reason.clone()
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupPolicy;
    use crate::transport::fake::{Call, FakeTransport};
    use chrono::Utc;

    fn setup(tag: &str) -> (Arc<FakeTransport>, Arc<Scheduler>, Punisher, String) {
        let dir = std::env::temp_dir()
            .join(format!("warden-punish-{}-{}", tag, std::process::id()))
            .to_str()
            .unwrap()
            .to_string();
        let transport: Arc<FakeTransport> = Arc::new(FakeTransport::new());
        let outcomes = Arc::new(OutcomeLog::new(&dir));
        let scheduler = Arc::new(Scheduler::new(transport.clone(), outcomes.clone(), &dir));
        let punisher = Punisher::new(
            transport.clone(),
            Arc::new(CounterStore::new()),
            scheduler.clone(),
            outcomes,
        );
        (transport, scheduler, punisher, dir)
    }

    fn verdict(detector: DetectorKind, action: ActionKind) -> Verdict {
        Verdict {
            detector,
            matched: true,
            reason: "test".into(),
            confidence: 1.0,
            suggested_action: Some(action),
            delay_seconds: 0,
        }
    }

    #[tokio::test]
    async fn delete_calls_transport_synchronously() {
        let (transport, _, punisher, dir) = setup("delete");
        let p = CompiledPolicy::compile(GroupPolicy::default(), "t");
        let msg = Inbound::sample(1, 2, 3, "x");
        let out = punisher
            .apply(&verdict(DetectorKind::SensitiveWord, ActionKind::Delete), &p, &msg)
            .await;
        assert!(out.ok && !out.deferred);
        assert_eq!(transport.deletes(), vec![(1, 3)]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn delayed_rule_defers_instead_of_deleting() {
        let (transport, scheduler, punisher, dir) = setup("defer");
        let p = CompiledPolicy::compile(GroupPolicy::default(), "t");
        let msg = Inbound::sample(1, 2, 42, "/cmd");
        let mut v = verdict(DetectorKind::AutoDelete, ActionKind::Delete);
        v.delay_seconds = 60;
        let out = punisher.apply(&v, &p, &msg).await;
        assert!(out.deferred);
        assert!(transport.deletes().is_empty());
        assert_eq!(scheduler.pending_count(), 1);
        let stats = scheduler.sweep(Utc::now() + Duration::seconds(61)).await;
        assert_eq!(stats.succeeded, 1);
        assert_eq!(transport.deletes(), vec![(1, 42)]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn warn_escalates_to_kick_at_limit_and_resets() {
        let (transport, _, punisher, dir) = setup("warn");
        let mut cfg = GroupPolicy::default();
        cfg.anti_ads.enabled = true;
        cfg.anti_ads.warn_limit = 3;
        let p = CompiledPolicy::compile(cfg, "t");
        let v = verdict(DetectorKind::Ad, ActionKind::Warn);

        for expect in 1..=2u32 {
            let msg = Inbound::sample(1, 2, expect as i32, "加群");
            let out = punisher.apply(&v, &p, &msg).await;
            assert_eq!(out.warn_count, Some(expect));
            assert!(!out.escalated);
        }

        let msg = Inbound::sample(1, 2, 3, "加群");
        let out = punisher.apply(&v, &p, &msg).await;
        assert!(out.escalated);
        assert!(transport
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Kick { chat: 1, user: 2 })));

        // counter reset: the next warn starts over at 1
        let msg = Inbound::sample(1, 2, 4, "加群");
        let out = punisher.apply(&v, &p, &msg).await;
        assert_eq!(out.warn_count, Some(1));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn mute_deletes_then_restricts() {
        let (transport, _, punisher, dir) = setup("mute");
        let p = CompiledPolicy::compile(GroupPolicy::default(), "t");
        let msg = Inbound::sample(1, 2, 3, "spam");
        punisher
            .apply(&verdict(DetectorKind::Flood, ActionKind::Mute), &p, &msg)
            .await;
        let calls = transport.calls();
        assert!(matches!(calls[0], Call::Delete { .. }));
        assert!(matches!(calls[1], Call::Restrict { chat: 1, user: 2 }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn transport_failure_is_swallowed_and_audited() {
        let (transport, _, punisher, dir) = setup("swallow");
        transport
            .fail_delete
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let p = CompiledPolicy::compile(GroupPolicy::default(), "t");
        let msg = Inbound::sample(1, 2, 3, "x");
        let out = punisher
            .apply(&verdict(DetectorKind::SensitiveWord, ActionKind::Delete), &p, &msg)
            .await;
        assert!(!out.ok); // reported, not propagated
        let _ = std::fs::remove_dir_all(&dir);
    }
}
