use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, UserId};
use tracing::{info, warn};

use crate::config::{ActionKind, CompiledPolicy, VerifyKind};
use crate::outcome::{OutcomeLog, OutcomeRecord};
use crate::persist;
use crate::sched::Scheduler;
use crate::transport::Transport;

const VERIFY_FILE: &str = "verify.json";
const CALLBACK_PREFIX: &str = "v";
const DEFAULT_WELCOME_TTL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Pending,
    Passed,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MathOp {
    Add,
    Sub,
    Mul,
}

impl MathOp {
    fn symbol(&self) -> char {
        match self {
            MathOp::Add => '+',
            MathOp::Sub => '-',
            MathOp::Mul => '×',
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Challenge {
    Math { a: i64, b: i64, op: MathOp, answer: i64 },
    Image { code: String },
    Channel { channel_id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: u64,
    pub chat_id: i64,
    pub telegram_user_id: u64,
    pub kind: VerifyKind,
    pub challenge: Challenge,
    pub status: VerifyStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub punishment: ActionKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    Passed,
    Wrong { remaining: u32 },
    Failed,
    Expired,
    NoPending,
    /// Membership could not be checked; the record is left untouched.
    Unavailable,
}

pub fn callback_data(chat: ChatId) -> String {
    format!("{}:{}", CALLBACK_PREFIX, chat.0)
}

pub fn parse_callback_data(data: &str) -> Option<ChatId> {
    let parts: Vec<&str> = data.split(':').collect();
    if parts.len() != 2 || parts[0] != CALLBACK_PREFIX {
        return None;
    }
    parts[1].parse::<i64>().ok().map(ChatId)
}

fn generate_challenge(cfg: &crate::config::VerificationCfg) -> Challenge {
    let mut rng = rand::thread_rng();
    match cfg.kind {
        VerifyKind::Math => {
            let mut a: i64 = rng.gen_range(2..=9);
            let mut b: i64 = rng.gen_range(1..=9);
            let op = *[MathOp::Add, MathOp::Sub, MathOp::Mul]
                .choose(&mut rng)
                .unwrap_or(&MathOp::Add);
            if op == MathOp::Sub && b > a {
                std::mem::swap(&mut a, &mut b);
            }
            let answer = match op {
                MathOp::Add => a + b,
                MathOp::Sub => a - b,
                MathOp::Mul => a * b,
            };
            Challenge::Math { a, b, op, answer }
        }
        VerifyKind::Image => {
            // no ambiguous glyphs in the code alphabet
            const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
            let len = (cfg.difficulty.unwrap_or(1).clamp(1, 4) + 3) as usize;
            let code: String = (0..len)
                .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                .collect();
            Challenge::Image { code }
        }
        VerifyKind::Channel => Challenge::Channel {
            channel_id: cfg.channel_id.unwrap_or(0),
        },
    }
}

fn challenge_prompt(challenge: &Challenge, timeout_seconds: i64, max_attempts: u32) -> String {
    match challenge {
        Challenge::Math { a, b, op, .. } => format!(
            "请在 {} 秒内私聊回复算式答案完成验证：{} {} {} = ?（最多 {} 次机会）",
            timeout_seconds,
            a,
            op.symbol(),
            b,
            max_attempts
        ),
        Challenge::Image { code } => format!(
            "请在 {} 秒内私聊回复下方验证码完成验证：「{}」（最多 {} 次机会）",
            timeout_seconds, code, max_attempts
        ),
        Challenge::Channel { .. } => format!(
            "请先关注指定频道，然后在 {} 秒内点击下方按钮完成验证。",
            timeout_seconds
        ),
    }
}

/// Per (group, user) challenge lifecycle. `NotStarted` is the absence of a
/// record; the map holds only `Pending` records, so removing one is the
/// atomic claim that makes every terminal transition happen exactly once.
pub struct Verifier {
    records: DashMap<(ChatId, UserId), VerificationRecord>,
    next_id: AtomicU64,
    transport: Arc<dyn Transport>,
    scheduler: Arc<Scheduler>,
    outcomes: Arc<OutcomeLog>,
    data_dir: String,
    welcome_ttl_secs: i64,
}

impl Verifier {
    pub fn new(
        transport: Arc<dyn Transport>,
        scheduler: Arc<Scheduler>,
        outcomes: Arc<OutcomeLog>,
        data_dir: &str,
        welcome_ttl_secs: Option<i64>,
    ) -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
            transport,
            scheduler,
            outcomes,
            data_dir: data_dir.to_string(),
            welcome_ttl_secs: welcome_ttl_secs.unwrap_or(DEFAULT_WELCOME_TTL_SECS),
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(VERIFY_FILE)
    }

    pub fn restore(&self) {
        let Some(text) = persist::read_snapshot(&self.snapshot_path()) else {
            return;
        };
        let records: Vec<VerificationRecord> = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!("verify snapshot unreadable, starting empty: {:?}", e);
                return;
            }
        };
        let now = Utc::now();
        let mut max_id = 0;
        for rec in records {
            max_id = max_id.max(rec.id);
            if rec.status == VerifyStatus::Pending && now <= rec.expires_at {
                self.records
                    .insert((ChatId(rec.chat_id), UserId(rec.telegram_user_id)), rec);
            }
        }
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        info!("restored {} pending verifications", self.records.len());
    }

    async fn persist(&self) {
        let records: Vec<VerificationRecord> =
            self.records.iter().map(|e| e.value().clone()).collect();
        match serde_json::to_vec_pretty(&records) {
            Ok(bytes) => persist::write_atomic_async(self.snapshot_path(), bytes).await,
            Err(e) => warn!("verify serialize failed: {:?}", e),
        }
    }

    fn audit(&self, rec: &VerificationRecord, action: &str, ok: bool, detail: &str) {
        self.outcomes.append(OutcomeRecord {
            at: Utc::now(),
            chat_id: rec.chat_id,
            user_id: Some(rec.telegram_user_id),
            source: "verify".into(),
            action: action.into(),
            ok,
            detail: detail.into(),
        });
    }

    pub fn pending_for(&self, chat: ChatId, user: UserId) -> Option<VerificationRecord> {
        self.records.get(&(chat, user)).map(|r| r.clone())
    }

    /// Join flow: restrict, create (or explicitly supersede) the pending
    /// record, issue the challenge.
    pub async fn on_join(
        &self,
        chat: ChatId,
        user: UserId,
        user_is_bot: bool,
        policy: &CompiledPolicy,
    ) -> anyhow::Result<()> {
        let cfg = &policy.cfg.verification;
        if !cfg.enabled || user_is_bot {
            return Ok(());
        }

        let now = Utc::now();
        let expires_at = now + Duration::seconds(cfg.timeout_seconds);

        if let Err(e) = self.transport.restrict(chat, user, Some(expires_at)).await {
            warn!("join restrict failed (chat={} user={}): {:?}", chat, user, e);
        }

        let challenge = generate_challenge(cfg);
        let rec = VerificationRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            chat_id: chat.0,
            telegram_user_id: user.0,
            kind: cfg.kind,
            challenge: challenge.clone(),
            status: VerifyStatus::Pending,
            attempt_count: 0,
            max_attempts: cfg.max_attempts,
            punishment: cfg.punishment,
            created_at: now,
            expires_at,
            completed_at: None,
        };

        // single-pending invariant: a second join replaces the stale record
        if let Some(prev) = self.records.insert((chat, user), rec.clone()) {
            warn!(
                "superseding pending verification (chat={} user={} old_id={})",
                chat, user, prev.id
            );
        }
        self.persist().await;
        self.audit(&rec, "challenge_issued", true, &format!("{:?}", cfg.kind));

        let prompt = challenge_prompt(&challenge, cfg.timeout_seconds, cfg.max_attempts);
        match &challenge {
            Challenge::Channel { .. } => {
                let kb = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
                    "我已关注，点此验证",
                    callback_data(chat),
                )]]);
                if let Err(e) = self.transport.send_with_keyboard(chat, &prompt, kb).await {
                    warn!("challenge send failed (chat={}): {:?}", chat, e);
                }
            }
            _ => {
                let dm = ChatId(user.0 as i64);
                if self.transport.send_text(dm, &prompt).await.is_err() {
                    // 用户可能未 /start，退回群内提示
                    let fallback = format!(
                        "⚠️ 无法私聊发送验证题，请先私聊 bot /start 后重新入群。（超时 {} 秒）",
                        cfg.timeout_seconds
                    );
                    if let Err(e) = self.transport.send_text(chat, &fallback).await {
                        warn!("challenge fallback notice failed: {:?}", e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Private-message answer for math/image challenges. Returns the chat
    /// whose pending record was touched, if any.
    pub async fn on_answer(
        &self,
        user: UserId,
        text: &str,
        now: DateTime<Utc>,
    ) -> Option<(ChatId, AnswerOutcome)> {
        let key = self
            .records
            .iter()
            .find(|e| e.key().1 == user && !matches!(e.value().challenge, Challenge::Channel { .. }))
            .map(|e| *e.key())?;

        let correct = match self.records.get(&key).map(|r| r.challenge.clone()) {
            Some(Challenge::Math { answer, .. }) => {
                text.trim().parse::<i64>().map(|n| n == answer).unwrap_or(false)
            }
            Some(Challenge::Image { code }) => text.trim().eq_ignore_ascii_case(&code),
            _ => return None,
        };

        let outcome = self.resolve(key, correct, now).await;
        Some((key.0, outcome))
    }

    /// Callback-button press for channel-follow challenges. Membership is
    /// checked live against the platform, not a stored answer.
    pub async fn on_callback(
        &self,
        chat: ChatId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> AnswerOutcome {
        let key = (chat, user);
        let channel = match self.records.get(&key).map(|r| r.challenge.clone()) {
            Some(Challenge::Channel { channel_id }) => ChatId(channel_id),
            Some(_) => return AnswerOutcome::NoPending,
            None => return AnswerOutcome::NoPending,
        };

        let member = match self.transport.is_channel_member(channel, user).await {
            Ok(m) => m,
            Err(e) => {
                // transport trouble is not a wrong answer; leave the record be
                warn!("channel membership check failed (user={}): {:?}", user, e);
                return AnswerOutcome::Unavailable;
            }
        };

        self.resolve(key, member, now).await
    }

    async fn resolve(
        &self,
        key: (ChatId, UserId),
        correct: bool,
        now: DateTime<Utc>,
    ) -> AnswerOutcome {
        // expiry is advisory until checked; the answer path checks it here
        let expired = match self.records.get(&key) {
            Some(rec) => now > rec.expires_at,
            None => return AnswerOutcome::NoPending,
        };
        if expired {
            if let Some((_, mut rec)) = self.records.remove(&key) {
                rec.status = VerifyStatus::Expired;
                rec.completed_at = Some(now);
                self.apply_fail_punishment(&rec).await;
                self.audit(&rec, "expired", true, "answer after deadline");
                self.persist().await;
            }
            return AnswerOutcome::Expired;
        }

        if correct {
            // the remove is the claim: a concurrent duplicate answer finds
            // nothing and cannot re-run the terminal transition
            let Some((_, mut rec)) = self.records.remove(&key) else {
                return AnswerOutcome::NoPending;
            };
            rec.status = VerifyStatus::Passed;
            rec.completed_at = Some(now);
            if let Err(e) = self.transport.unrestrict(key.0, key.1).await {
                warn!("unrestrict failed (chat={} user={}): {:?}", key.0, key.1, e);
            }
            self.welcome(key.0, key.1).await;
            self.audit(&rec, "passed", true, &format!("attempts={}", rec.attempt_count));
            self.persist().await;
            return AnswerOutcome::Passed;
        }

        let exhausted = match self.records.get_mut(&key) {
            Some(mut rec) => {
                rec.attempt_count += 1;
                rec.attempt_count >= rec.max_attempts
            }
            None => return AnswerOutcome::NoPending,
        };

        if exhausted {
            let Some((_, mut rec)) = self.records.remove(&key) else {
                return AnswerOutcome::NoPending;
            };
            rec.status = VerifyStatus::Failed;
            rec.completed_at = Some(now);
            self.apply_fail_punishment(&rec).await;
            self.audit(&rec, "failed", true, &format!("attempts={}", rec.attempt_count));
            self.persist().await;
            return AnswerOutcome::Failed;
        }

        let remaining = self
            .records
            .get(&key)
            .map(|r| r.max_attempts.saturating_sub(r.attempt_count))
            .unwrap_or(0);
        self.persist().await;
        AnswerOutcome::Wrong { remaining }
    }

    async fn welcome(&self, chat: ChatId, user: UserId) {
        let text = format!("✅ 验证通过，欢迎新成员（{}）！", user);
        match self.transport.send_text(chat, &text).await {
            Ok(message_id) => {
                // the welcome message cleans itself up via the sweep; an
                // in-memory delay would die with this invocation
                self.scheduler
                    .schedule(chat, message_id, self.welcome_ttl_secs, "welcome")
                    .await;
            }
            Err(e) => warn!("welcome send failed (chat={}): {:?}", chat, e),
        }
    }

    async fn apply_fail_punishment(&self, rec: &VerificationRecord) {
        let chat = ChatId(rec.chat_id);
        let user = UserId(rec.telegram_user_id);
        let res = match rec.punishment {
            ActionKind::Kick => self.transport.kick(chat, user).await,
            ActionKind::Ban => self.transport.ban(chat, user, None).await,
            // anything else leaves the join restriction in place
            _ => Ok(()),
        };
        if let Err(e) = res {
            warn!(
                "verification punishment failed (chat={} user={}): {:?}",
                rec.chat_id, rec.telegram_user_id, e
            );
        }
    }

    /// Expires stale pending records that nobody answered. Races safely
    /// with the answer path: whoever removes the record first owns the
    /// terminal transition.
    pub async fn prune(&self, now: DateTime<Utc>) {
        let stale: Vec<(ChatId, UserId)> = self
            .records
            .iter()
            .filter(|e| now > e.value().expires_at)
            .map(|e| *e.key())
            .collect();
        let mut changed = false;
        for key in stale {
            if let Some((_, mut rec)) = self.records.remove(&key) {
                rec.status = VerifyStatus::Expired;
                rec.completed_at = Some(now);
                self.apply_fail_punishment(&rec).await;
                self.audit(&rec, "expired", true, "deadline passed unanswered");
                changed = true;
            }
        }
        if changed {
            self.persist().await;
        }
    }
}
