use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use teloxide::types::{ChatId, UserId};

use crate::config::{ActionKind, CompiledPolicy, RuleKind};
use crate::message::{Inbound, MediaClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    SensitiveWord,
    Flood,
    Duplicate,
    Ad,
    AutoDelete,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::SensitiveWord => "sensitive_word",
            DetectorKind::Flood => "flood",
            DetectorKind::Duplicate => "duplicate",
            DetectorKind::Ad => "ad",
            DetectorKind::AutoDelete => "auto_delete",
        }
    }
}

/// One detector's evaluation of one message. Produced fresh per message;
/// only the outcome log outlives the pipeline run.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub detector: DetectorKind,
    pub matched: bool,
    pub reason: String,
    pub confidence: f32,
    pub suggested_action: Option<ActionKind>,
    pub delay_seconds: i64,
}

impl Verdict {
    fn hit(detector: DetectorKind, reason: String, confidence: f32, action: ActionKind) -> Self {
        Self {
            detector,
            matched: true,
            reason,
            confidence,
            suggested_action: Some(action),
            delay_seconds: 0,
        }
    }
}

/// Adding a detector is a data change: implement this and append it to the
/// pipeline's ordered list.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, msg: &Inbound, policy: &CompiledPolicy, now: DateTime<Utc>)
        -> Option<Verdict>;
}

pub struct SensitiveWordDetector;

impl Detector for SensitiveWordDetector {
    fn name(&self) -> &'static str {
        "sensitive_word"
    }

    fn evaluate(&self, msg: &Inbound, policy: &CompiledPolicy, _now: DateTime<Utc>)
        -> Option<Verdict> {
        let cfg = &policy.cfg.sensitive_words;
        if !cfg.enabled || msg.text.is_empty() {
            return None;
        }
        let lowered = msg.text.to_lowercase();
        for word in &cfg.words {
            if lowered.contains(&word.to_lowercase()) {
                return Some(Verdict::hit(
                    DetectorKind::SensitiveWord,
                    format!("word:{}", word),
                    1.0,
                    cfg.action,
                ));
            }
        }
        for re in &policy.word_patterns {
            if re.is_match(&msg.text) {
                return Some(Verdict::hit(
                    DetectorKind::SensitiveWord,
                    format!("pattern:{}", re.as_str()),
                    1.0,
                    cfg.action,
                ));
            }
        }
        None
    }
}

/// Sliding-window message counter per (chat, user). State lives in the
/// detector so evaluation stays a single call; entries are pruned on touch.
#[derive(Default)]
pub struct FloodDetector {
    windows: DashMap<(ChatId, UserId), Vec<DateTime<Utc>>>,
}

impl FloodDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Detector for FloodDetector {
    fn name(&self) -> &'static str {
        "flood"
    }

    fn evaluate(&self, msg: &Inbound, policy: &CompiledPolicy, now: DateTime<Utc>)
        -> Option<Verdict> {
        let cfg = &policy.cfg.anti_spam;
        if !cfg.enabled {
            return None;
        }
        let window = Duration::seconds(cfg.window_seconds);
        let mut stamps = self
            .windows
            .entry((msg.chat_id, msg.user_id))
            .or_default();
        stamps.retain(|ts| now - *ts <= window);
        stamps.push(now);
        let count = stamps.len() as u32;
        drop(stamps);

        if count >= cfg.max_messages {
            return Some(Verdict::hit(
                DetectorKind::Flood,
                format!("{} msgs in {}s", count, cfg.window_seconds),
                0.9,
                cfg.action,
            ));
        }
        None
    }
}

#[derive(Default)]
pub struct DuplicateDetector {
    recent: DashMap<(ChatId, UserId), Vec<(String, DateTime<Utc>)>>,
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

fn normalize_body(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl Detector for DuplicateDetector {
    fn name(&self) -> &'static str {
        "duplicate"
    }

    fn evaluate(&self, msg: &Inbound, policy: &CompiledPolicy, now: DateTime<Utc>)
        -> Option<Verdict> {
        let cfg = &policy.cfg.anti_spam;
        if !cfg.enabled || msg.text.is_empty() {
            return None;
        }
        let body = normalize_body(&msg.text);
        let window = Duration::seconds(cfg.window_seconds);

        let mut entries = self
            .recent
            .entry((msg.chat_id, msg.user_id))
            .or_default();
        entries.retain(|(_, ts)| now - *ts <= window);
        entries.push((body.clone(), now));
        let repeats = entries.iter().filter(|(b, _)| *b == body).count() as u32;
        drop(entries);

        if repeats > cfg.duplicate_threshold {
            return Some(Verdict::hit(
                DetectorKind::Duplicate,
                format!("repeated {} times in {}s", repeats, cfg.window_seconds),
                0.85,
                cfg.action,
            ));
        }
        None
    }
}

const AD_CONFIDENCE_STICKER: f32 = 0.8;
const AD_CONFIDENCE_KEYWORD: f32 = 0.6;
const AD_CONFIDENCE_INVITE: f32 = 0.95;
const AD_CONFIDENCE_REFERRAL: f32 = 0.9;

fn is_invite_link(link: &str) -> bool {
    link.contains("t.me/+") || link.contains("joinchat")
}

fn has_referral_param(link: &str) -> bool {
    link.contains("start=") || link.contains("ref=") || link.contains("invite=")
}

pub struct AdDetector;

impl Detector for AdDetector {
    fn name(&self) -> &'static str {
        "ad"
    }

    fn evaluate(&self, msg: &Inbound, policy: &CompiledPolicy, _now: DateTime<Utc>)
        -> Option<Verdict> {
        let cfg = &policy.cfg.anti_ads;
        if !cfg.enabled {
            return None;
        }

        if let Some(set) = &msg.sticker_set {
            if set.contains('@') {
                return Some(Verdict::hit(
                    DetectorKind::Ad,
                    format!("sticker_set:{}", set),
                    AD_CONFIDENCE_STICKER,
                    cfg.action,
                ));
            }
        }

        let lowered = msg.text.to_lowercase();
        for kw in &cfg.keywords {
            if lowered.contains(&kw.to_lowercase()) {
                return Some(Verdict::hit(
                    DetectorKind::Ad,
                    format!("keyword:{}", kw),
                    AD_CONFIDENCE_KEYWORD,
                    cfg.action,
                ));
            }
        }

        for link in &msg.links {
            if is_invite_link(link) {
                return Some(Verdict::hit(
                    DetectorKind::Ad,
                    format!("invite_link:{}", link),
                    AD_CONFIDENCE_INVITE,
                    cfg.action,
                ));
            }
            if has_referral_param(link) {
                return Some(Verdict::hit(
                    DetectorKind::Ad,
                    format!("referral_link:{}", link),
                    AD_CONFIDENCE_REFERRAL,
                    cfg.action,
                ));
            }
        }
        None
    }
}

const EXECUTABLE_EXTS: &[&str] = &["exe", "bat", "cmd", "sh", "msi", "apk", "scr", "com", "dll"];
const ARCHIVE_EXTS: &[&str] = &["zip", "rar", "7z", "tar", "gz", "bz2", "xz"];
const DEFAULT_LONG_TEXT: usize = 500;

fn file_ext(name: &str) -> Option<String> {
    name.rsplit('.').next().map(|e| e.to_lowercase())
}

pub struct AutoDeleteRuleMatcher;

impl AutoDeleteRuleMatcher {
    fn rule_matches(
        rule_idx: usize,
        rule: &crate::config::AutoDeleteRule,
        msg: &Inbound,
        policy: &CompiledPolicy,
    ) -> bool {
        match rule.kind {
            RuleKind::Command => msg.is_command(),
            RuleKind::Media => msg.media != MediaClass::None,
            RuleKind::Sticker => msg.media == MediaClass::Sticker,
            RuleKind::Video => msg.media == MediaClass::Video,
            RuleKind::Document => msg.media == MediaClass::Document,
            RuleKind::Executable => msg
                .document_name
                .as_deref()
                .and_then(file_ext)
                .map(|e| EXECUTABLE_EXTS.contains(&e.as_str()))
                .unwrap_or(false),
            RuleKind::Archive => msg
                .document_name
                .as_deref()
                .and_then(file_ext)
                .map(|e| ARCHIVE_EXTS.contains(&e.as_str()))
                .unwrap_or(false),
            RuleKind::Link => !msg.links.is_empty(),
            RuleKind::Forwarded => msg.forwarded,
            RuleKind::Contact => msg.contact,
            RuleKind::PremiumEmoji => msg.premium_emoji,
            RuleKind::LongText => {
                msg.text.chars().count() > rule.min_length.unwrap_or(DEFAULT_LONG_TEXT)
            }
            RuleKind::Keyword => rule
                .keyword
                .as_deref()
                .map(|kw| msg.text.to_lowercase().contains(&kw.to_lowercase()))
                .unwrap_or(false),
            RuleKind::Regex => policy
                .rule_patterns
                .get(rule_idx)
                .and_then(|re| re.as_ref())
                .map(|re| re.is_match(&msg.text))
                .unwrap_or(false),
            RuleKind::Any => true,
        }
    }
}

impl Detector for AutoDeleteRuleMatcher {
    fn name(&self) -> &'static str {
        "auto_delete"
    }

    fn evaluate(&self, msg: &Inbound, policy: &CompiledPolicy, _now: DateTime<Utc>)
        -> Option<Verdict> {
        let cfg = &policy.cfg.auto_delete;
        if !cfg.enabled {
            return None;
        }
        for (i, rule) in cfg.rules.iter().enumerate() {
            if Self::rule_matches(i, rule, msg, policy) {
                let mut v = Verdict::hit(
                    DetectorKind::AutoDelete,
                    format!("rule#{}:{:?}", i, rule.kind),
                    1.0,
                    rule.action,
                );
                v.delay_seconds = rule.delay_seconds;
                return Some(v);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoDeleteRule, GroupPolicy};

    fn policy(cfg: GroupPolicy) -> CompiledPolicy {
        CompiledPolicy::compile(cfg, "t")
    }

    fn ads_policy(keywords: &[&str]) -> CompiledPolicy {
        let mut cfg = GroupPolicy::default();
        cfg.anti_ads.enabled = true;
        cfg.anti_ads.keywords = keywords.iter().map(|s| s.to_string()).collect();
        policy(cfg)
    }

    #[test]
    fn ad_keyword_scenario_fires_with_keyword_confidence() {
        let p = ads_policy(&["加群"]);
        let msg = Inbound::sample(1, 2, 3, "加群点我");
        let v = AdDetector.evaluate(&msg, &p, Utc::now()).unwrap();
        assert!(v.matched);
        assert_eq!(v.detector, DetectorKind::Ad);
        assert_eq!(v.confidence, AD_CONFIDENCE_KEYWORD);
        assert_eq!(v.suggested_action, Some(ActionKind::Warn));
    }

    #[test]
    fn ad_sub_checks_run_in_order_sticker_first() {
        let p = ads_policy(&["vpn"]);
        let mut msg = Inbound::sample(1, 2, 3, "vpn https://t.me/+abc");
        msg.sticker_set = Some("ads_by_@spam".into());
        let v = AdDetector.evaluate(&msg, &p, Utc::now()).unwrap();
        assert_eq!(v.confidence, AD_CONFIDENCE_STICKER);
    }

    #[test]
    fn invite_link_outranks_referral() {
        let p = ads_policy(&[]);
        let msg = Inbound::sample(1, 2, 3, "https://t.me/+AbCd https://x.y/?start=r");
        let v = AdDetector.evaluate(&msg, &p, Utc::now()).unwrap();
        assert_eq!(v.confidence, AD_CONFIDENCE_INVITE);
    }

    #[test]
    fn referral_link_detected_without_keywords() {
        let p = ads_policy(&[]);
        let msg = Inbound::sample(1, 2, 3, "点 https://shop.example/?ref=abc123");
        let v = AdDetector.evaluate(&msg, &p, Utc::now()).unwrap();
        assert_eq!(v.confidence, AD_CONFIDENCE_REFERRAL);
    }

    #[test]
    fn sensitive_word_substring_is_case_insensitive() {
        let mut cfg = GroupPolicy::default();
        cfg.sensitive_words.enabled = true;
        cfg.sensitive_words.words = vec!["BadWord".into()];
        let p = policy(cfg);
        let msg = Inbound::sample(1, 2, 3, "xx badword yy");
        let v = SensitiveWordDetector.evaluate(&msg, &p, Utc::now()).unwrap();
        assert!(v.reason.starts_with("word:"));
    }

    #[test]
    fn sensitive_pattern_reports_which_pattern() {
        let mut cfg = GroupPolicy::default();
        cfg.sensitive_words.enabled = true;
        cfg.sensitive_words.patterns = vec![r"b[a4]d".into()];
        let p = policy(cfg);
        let msg = Inbound::sample(1, 2, 3, "b4d stuff");
        let v = SensitiveWordDetector.evaluate(&msg, &p, Utc::now()).unwrap();
        assert!(v.reason.starts_with("pattern:"));
    }

    #[test]
    fn flood_fires_at_threshold_within_window() {
        let mut cfg = GroupPolicy::default();
        cfg.anti_spam.enabled = true;
        cfg.anti_spam.max_messages = 3;
        cfg.anti_spam.window_seconds = 10;
        let p = policy(cfg);
        let det = FloodDetector::new();
        let t0 = Utc::now();
        for i in 0..2 {
            let msg = Inbound::sample(1, 2, i, "hi");
            assert!(det.evaluate(&msg, &p, t0).is_none());
        }
        let msg = Inbound::sample(1, 2, 9, "hi");
        let v = det.evaluate(&msg, &p, t0 + Duration::seconds(1)).unwrap();
        assert_eq!(v.detector, DetectorKind::Flood);
    }

    #[test]
    fn flood_window_slides() {
        let mut cfg = GroupPolicy::default();
        cfg.anti_spam.enabled = true;
        cfg.anti_spam.max_messages = 2;
        cfg.anti_spam.window_seconds = 5;
        let p = policy(cfg);
        let det = FloodDetector::new();
        let t0 = Utc::now();
        let msg = Inbound::sample(1, 2, 1, "a");
        assert!(det.evaluate(&msg, &p, t0).is_none());
        // first message has left the window by now
        assert!(det
            .evaluate(&msg, &p, t0 + Duration::seconds(30))
            .is_none());
    }

    #[test]
    fn duplicate_fires_past_threshold_only_for_same_body() {
        let mut cfg = GroupPolicy::default();
        cfg.anti_spam.enabled = true;
        cfg.anti_spam.max_messages = 100;
        cfg.anti_spam.window_seconds = 60;
        cfg.anti_spam.duplicate_threshold = 2;
        let p = policy(cfg);
        let det = DuplicateDetector::new();
        let now = Utc::now();
        let msg = Inbound::sample(1, 2, 1, "  Buy   NOW ");
        assert!(det.evaluate(&msg, &p, now).is_none());
        let msg2 = Inbound::sample(1, 2, 2, "buy now");
        assert!(det.evaluate(&msg2, &p, now).is_none());
        let v = det.evaluate(&msg2, &p, now).unwrap();
        assert_eq!(v.detector, DetectorKind::Duplicate);
        // a different body does not count toward the run
        let other = Inbound::sample(1, 2, 3, "hello");
        assert!(det.evaluate(&other, &p, now).is_none());
    }

    fn rule(kind: RuleKind) -> AutoDeleteRule {
        AutoDeleteRule {
            kind,
            action: ActionKind::Delete,
            delay_seconds: 0,
            keyword: None,
            pattern: None,
            min_length: None,
        }
    }

    #[test]
    fn auto_delete_first_matching_rule_wins_and_carries_delay() {
        let mut cfg = GroupPolicy::default();
        cfg.auto_delete.enabled = true;
        let mut command = rule(RuleKind::Command);
        command.delay_seconds = 60;
        cfg.auto_delete.rules = vec![command, rule(RuleKind::Any)];
        let p = policy(cfg);
        let msg = Inbound::sample(1, 2, 3, "/start");
        let v = AutoDeleteRuleMatcher.evaluate(&msg, &p, Utc::now()).unwrap();
        assert_eq!(v.delay_seconds, 60);
        assert!(v.reason.starts_with("rule#0"));
    }

    #[test]
    fn executable_and_archive_rules_match_on_extension() {
        let mut cfg = GroupPolicy::default();
        cfg.auto_delete.enabled = true;
        cfg.auto_delete.rules = vec![rule(RuleKind::Executable), rule(RuleKind::Archive)];
        let p = policy(cfg);
        let mut msg = Inbound::sample(1, 2, 3, "");
        msg.media = MediaClass::Document;
        msg.document_name = Some("setup.EXE".into());
        let v = AutoDeleteRuleMatcher.evaluate(&msg, &p, Utc::now()).unwrap();
        assert!(v.reason.contains("Executable"));
        msg.document_name = Some("pack.tar.gz".into());
        let v = AutoDeleteRuleMatcher.evaluate(&msg, &p, Utc::now()).unwrap();
        assert!(v.reason.contains("Archive"));
    }

    #[test]
    fn broken_rule_regex_degrades_to_no_match() {
        let mut cfg = GroupPolicy::default();
        cfg.auto_delete.enabled = true;
        let mut r = rule(RuleKind::Regex);
        r.pattern = Some("([broken".into());
        cfg.auto_delete.rules = vec![r];
        let p = policy(cfg);
        let msg = Inbound::sample(1, 2, 3, "anything at all");
        assert!(AutoDeleteRuleMatcher.evaluate(&msg, &p, Utc::now()).is_none());
    }
}
