use chrono::{DateTime, Utc};

use crate::config::CompiledPolicy;
use crate::detect::{
    AdDetector, AutoDeleteRuleMatcher, Detector, DuplicateDetector, FloodDetector,
    SensitiveWordDetector, Verdict,
};
use crate::message::Inbound;

#[derive(Debug)]
pub struct PipelineOutcome {
    pub verdict: Option<Verdict>,
}

/// Fixed-priority, short-circuiting detector chain. Order is part of the
/// contract: sensitive words, then flood, then duplicate, then ads, then
/// auto-delete rules.
pub struct Pipeline {
    detectors: Vec<Box<dyn Detector>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            detectors: vec![
                Box::new(SensitiveWordDetector),
                Box::new(FloodDetector::new()),
                Box::new(DuplicateDetector::new()),
                Box::new(AdDetector),
                Box::new(AutoDeleteRuleMatcher),
            ],
        }
    }

    pub fn evaluate(&self, msg: &Inbound, policy: &CompiledPolicy) -> PipelineOutcome {
        self.evaluate_at(msg, policy, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        msg: &Inbound,
        policy: &CompiledPolicy,
        now: DateTime<Utc>,
    ) -> PipelineOutcome {
        for det in &self.detectors {
            if let Some(verdict) = det.evaluate(msg, policy, now) {
                tracing::debug!(
                    "pipeline hit: detector={} reason={} chat={} user={}",
                    det.name(),
                    verdict.reason,
                    msg.chat_id,
                    msg.user_id
                );
                return PipelineOutcome {
                    verdict: Some(verdict),
                };
            }
        }
        PipelineOutcome { verdict: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActionKind, AutoDeleteRule, GroupPolicy, RuleKind};
    use crate::detect::DetectorKind;

    fn full_policy() -> CompiledPolicy {
        let mut cfg = GroupPolicy::default();
        cfg.sensitive_words.enabled = true;
        cfg.sensitive_words.words = vec!["禁词".into()];
        cfg.anti_spam.enabled = true;
        cfg.anti_spam.max_messages = 2;
        cfg.anti_spam.window_seconds = 60;
        cfg.anti_ads.enabled = true;
        cfg.anti_ads.keywords = vec!["加群".into()];
        cfg.auto_delete.enabled = true;
        cfg.auto_delete.rules = vec![AutoDeleteRule {
            kind: RuleKind::Any,
            action: ActionKind::Delete,
            delay_seconds: 0,
            keyword: None,
            pattern: None,
            min_length: None,
        }];
        CompiledPolicy::compile(cfg, "t")
    }

    #[test]
    fn short_circuits_before_lower_priority_detectors() {
        let pipeline = Pipeline::new();
        let p = full_policy();
        // matches the sensitive word AND the flood threshold AND the ad
        // keyword AND the catch-all rule; only the first may fire
        let msg = Inbound::sample(1, 2, 3, "禁词 加群");
        let out = pipeline.evaluate(&msg, &p);
        assert_eq!(out.verdict.unwrap().detector, DetectorKind::SensitiveWord);

        // the flood window must not have recorded the short-circuited
        // message: with max_messages=2 a clean follow-up counts 1, so flood
        // stays silent and the catch-all rule fires instead
        let clean = Inbound::sample(1, 2, 4, "你好");
        let out = pipeline.evaluate(&clean, &p);
        assert_eq!(out.verdict.unwrap().detector, DetectorKind::AutoDelete);
    }

    #[test]
    fn invalid_regex_still_produces_a_result_for_every_message() {
        let mut cfg = GroupPolicy::default();
        cfg.sensitive_words.enabled = true;
        cfg.sensitive_words.patterns = vec!["([bad".into()];
        let p = CompiledPolicy::compile(cfg, "t");
        let pipeline = Pipeline::new();
        for text in ["hello", "", "([bad literal"] {
            let msg = Inbound::sample(1, 2, 3, text);
            let out = pipeline.evaluate(&msg, &p);
            assert!(out.verdict.is_none());
        }
    }

    #[test]
    fn ad_scenario_fires_when_sensitive_words_disabled() {
        let mut cfg = GroupPolicy::default();
        cfg.anti_ads.enabled = true;
        cfg.anti_ads.keywords = vec!["加群".into()];
        let p = CompiledPolicy::compile(cfg, "t");
        let pipeline = Pipeline::new();
        let msg = Inbound::sample(1, 2, 3, "加群点我");
        let out = pipeline.evaluate(&msg, &p);
        let v = out.verdict.unwrap();
        assert_eq!(v.detector, DetectorKind::Ad);
        assert_eq!(v.suggested_action, Some(ActionKind::Warn));
    }

    #[test]
    fn clean_message_passes_through() {
        let pipeline = Pipeline::new();
        let p = CompiledPolicy::compile(GroupPolicy::default(), "t");
        let msg = Inbound::sample(1, 2, 3, "正常聊天");
        assert!(pipeline.evaluate(&msg, &p).verdict.is_none());
    }
}
