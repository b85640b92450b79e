use anyhow::{anyhow, Context, Result};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

const POLICY_FILE_PREFIX: &str = "policy_";
const POLICY_FILE_SUFFIX: &str = ".json";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub bot: BotConfig,
    pub runtime: RuntimeConfig,
    pub groups: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    pub token: String,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub data_dir: Option<String>,
    pub policy_dir: Option<String>,
    pub sweep_interval_secs: Option<u64>,
    pub sweep_secret: String,
    pub welcome_ttl_secs: Option<i64>,
    pub ignore_admins: Option<bool>,
}

impl RuntimeConfig {
    pub fn data_dir(&self) -> String {
        self.data_dir.clone().unwrap_or_else(|| "./data".to_string())
    }
    pub fn policy_dir(&self) -> String {
        self.policy_dir.clone().unwrap_or_else(|| "./policies".to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroupEntry {
    pub name: String,
    pub chat_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Delete,
    Warn,
    Mute,
    Kick,
    Ban,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyKind {
    Math,
    Image,
    Channel,
}

/// Per-group policy snapshot, one JSON document per group, owned by the
/// external configuration service. Read-only here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct GroupPolicy {
    pub sensitive_words: SensitiveWordsCfg,
    pub anti_spam: AntiSpamCfg,
    pub anti_ads: AntiAdsCfg,
    pub auto_delete: AutoDeleteCfg,
    pub verification: VerificationCfg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SensitiveWordsCfg {
    pub enabled: bool,
    pub words: Vec<String>,
    pub patterns: Vec<String>,
    pub action: ActionKind,
    pub notify_admin: bool,
}

impl Default for SensitiveWordsCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            words: vec![],
            patterns: vec![],
            action: ActionKind::Delete,
            notify_admin: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AntiSpamCfg {
    pub enabled: bool,
    pub max_messages: u32,
    pub window_seconds: i64,
    pub duplicate_threshold: u32,
    pub action: ActionKind,
    pub mute_duration_seconds: i64,
}

impl Default for AntiSpamCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            max_messages: 8,
            window_seconds: 10,
            duplicate_threshold: 3,
            action: ActionKind::Mute,
            mute_duration_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AntiAdsCfg {
    pub enabled: bool,
    pub keywords: Vec<String>,
    pub action: ActionKind,
    pub warn_limit: u32,
}

impl Default for AntiAdsCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            keywords: vec![],
            action: ActionKind::Warn,
            warn_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AutoDeleteCfg {
    pub enabled: bool,
    pub rules: Vec<AutoDeleteRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Command,
    Media,
    Sticker,
    Video,
    Document,
    Executable,
    Archive,
    Link,
    Forwarded,
    Contact,
    PremiumEmoji,
    LongText,
    Keyword,
    Regex,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AutoDeleteRule {
    pub kind: RuleKind,
    #[serde(default = "default_rule_action")]
    pub action: ActionKind,
    #[serde(default)]
    pub delay_seconds: i64,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub min_length: Option<usize>,
}

fn default_rule_action() -> ActionKind {
    ActionKind::Delete
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct VerificationCfg {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: VerifyKind,
    pub timeout_seconds: i64,
    pub punishment: ActionKind,
    pub channel_id: Option<i64>,
    pub difficulty: Option<u32>,
    pub max_attempts: u32,
}

impl Default for VerificationCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: VerifyKind::Math,
            timeout_seconds: 300,
            punishment: ActionKind::Kick,
            channel_id: None,
            difficulty: None,
            max_attempts: 3,
        }
    }
}

/// Policy snapshot with every configured pattern compiled exactly once.
/// A pattern that fails to compile is dropped with a warning; the detector
/// that owns it degrades to "no match" instead of failing the pipeline.
pub struct CompiledPolicy {
    pub cfg: GroupPolicy,
    pub word_patterns: Vec<regex::Regex>,
    pub rule_patterns: Vec<Option<regex::Regex>>,
}

impl CompiledPolicy {
    pub fn compile(cfg: GroupPolicy, group: &str) -> Self {
        let mut word_patterns = Vec::new();
        for pat in &cfg.sensitive_words.patterns {
            match RegexBuilder::new(pat).case_insensitive(true).build() {
                Ok(re) => word_patterns.push(re),
                Err(e) => warn!("group '{}' sensitive pattern '{}' dropped: {:?}", group, pat, e),
            }
        }

        let mut rule_patterns = Vec::with_capacity(cfg.auto_delete.rules.len());
        for rule in &cfg.auto_delete.rules {
            let compiled = match (&rule.kind, &rule.pattern) {
                (RuleKind::Regex, Some(pat)) => {
                    match RegexBuilder::new(pat).case_insensitive(true).build() {
                        Ok(re) => Some(re),
                        Err(e) => {
                            warn!("group '{}' auto-delete pattern '{}' dropped: {:?}", group, pat, e);
                            None
                        }
                    }
                }
                _ => None,
            };
            rule_patterns.push(compiled);
        }

        Self {
            cfg,
            word_patterns,
            rule_patterns,
        }
    }
}

pub fn load_config(path: &PathBuf) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&text).context("parse yaml")?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.runtime.sweep_secret.trim().is_empty() {
        return Err(anyhow!("runtime.sweep_secret must not be empty"));
    }
    let mut seen_chat = std::collections::HashMap::<i64, String>::new();
    for g in &cfg.groups {
        if let Some(prev) = seen_chat.insert(g.chat_id, g.name.clone()) {
            return Err(anyhow!(
                "duplicate chat_id {} found in groups: '{}' and '{}'",
                g.chat_id,
                prev,
                g.name
            ));
        }
    }
    Ok(())
}

pub fn policy_path(policy_dir: &str, chat_id: i64) -> PathBuf {
    PathBuf::from(format!(
        "{}/{}{}{}",
        policy_dir, POLICY_FILE_PREFIX, chat_id, POLICY_FILE_SUFFIX
    ))
}

/// Loads and compiles one group's policy snapshot. A missing file means the
/// group runs with everything disabled.
pub fn load_policy(policy_dir: &str, group: &GroupEntry) -> Result<CompiledPolicy> {
    let path = policy_path(policy_dir, group.chat_id);
    let cfg = match std::fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str::<GroupPolicy>(&text)
            .with_context(|| format!("parse policy: {}", path.display()))?,
        Err(_) => GroupPolicy::default(),
    };
    validate_policy(&cfg, &group.name)?;
    Ok(CompiledPolicy::compile(cfg, &group.name))
}

pub fn validate_policy(cfg: &GroupPolicy, group: &str) -> Result<()> {
    if cfg.anti_spam.enabled {
        if cfg.anti_spam.window_seconds <= 0 {
            return Err(anyhow!("group '{}' anti_spam.window_seconds must be > 0", group));
        }
        if cfg.anti_spam.max_messages == 0 {
            return Err(anyhow!("group '{}' anti_spam.max_messages must be > 0", group));
        }
    }
    if cfg.anti_ads.enabled && cfg.anti_ads.warn_limit == 0 {
        return Err(anyhow!("group '{}' anti_ads.warn_limit must be > 0", group));
    }
    if cfg.verification.enabled {
        if cfg.verification.timeout_seconds < 5 || cfg.verification.timeout_seconds > 86400 {
            return Err(anyhow!(
                "group '{}' verification.timeout_seconds={} out of range (5..=86400)",
                group,
                cfg.verification.timeout_seconds
            ));
        }
        if cfg.verification.max_attempts == 0 {
            return Err(anyhow!("group '{}' verification.max_attempts must be > 0", group));
        }
        if cfg.verification.kind == VerifyKind::Channel && cfg.verification.channel_id.is_none() {
            return Err(anyhow!(
                "group '{}' verification.type=channel requires channel_id",
                group
            ));
        }
    }
    Ok(())
}

pub fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

#[allow(dead_code)]
pub fn policy_files(policy_dir: &str) -> Vec<PathBuf> {
    let mut out = vec![];
    let rd = match std::fs::read_dir(Path::new(policy_dir)) {
        Ok(r) => r,
        Err(_) => return out,
    };
    for ent in rd.flatten() {
        let p = ent.path();
        let name = match p.file_name().and_then(|x| x.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if name.starts_with(POLICY_FILE_PREFIX) && name.ends_with(POLICY_FILE_SUFFIX) {
            out.push(p);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_snapshot_round_trips_from_json() {
        let doc = r#"{
            "sensitive_words": {"enabled": true, "words": ["坏词"], "patterns": ["b[a4]d"], "action": "delete", "notify_admin": true},
            "anti_spam": {"enabled": true, "max_messages": 5, "window_seconds": 10, "duplicate_threshold": 2, "action": "mute", "mute_duration_seconds": 300},
            "anti_ads": {"enabled": true, "keywords": ["加群"], "action": "warn", "warn_limit": 3},
            "auto_delete": {"enabled": true, "rules": [{"kind": "command", "delay_seconds": 60}]},
            "verification": {"enabled": true, "type": "math", "timeout_seconds": 120, "punishment": "kick", "max_attempts": 3}
        }"#;
        let cfg: GroupPolicy = serde_json::from_str(doc).unwrap();
        assert!(cfg.sensitive_words.enabled);
        assert_eq!(cfg.anti_ads.keywords, vec!["加群"]);
        assert_eq!(cfg.auto_delete.rules[0].delay_seconds, 60);
        assert_eq!(cfg.verification.kind, VerifyKind::Math);
        validate_policy(&cfg, "t").unwrap();
    }

    #[test]
    fn missing_sections_fall_back_to_disabled_defaults() {
        let cfg: GroupPolicy = serde_json::from_str("{}").unwrap();
        assert!(!cfg.sensitive_words.enabled);
        assert!(!cfg.verification.enabled);
        assert_eq!(cfg.anti_ads.warn_limit, 3);
    }

    #[test]
    fn invalid_pattern_is_dropped_not_fatal() {
        let mut cfg = GroupPolicy::default();
        cfg.sensitive_words.enabled = true;
        cfg.sensitive_words.patterns = vec!["([unclosed".into(), "ok.*ay".into()];
        let compiled = CompiledPolicy::compile(cfg, "t");
        assert_eq!(compiled.word_patterns.len(), 1);
    }

    #[test]
    fn channel_verification_requires_channel_id() {
        let mut cfg = GroupPolicy::default();
        cfg.verification.enabled = true;
        cfg.verification.kind = VerifyKind::Channel;
        assert!(validate_policy(&cfg, "t").is_err());
    }
}
