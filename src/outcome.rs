use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

const OUTCOME_FILE: &str = "outcomes.jsonl";

/// One audited action: a punishment, a verification transition, or a sweep
/// attempt. Appended as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub at: DateTime<Utc>,
    pub chat_id: i64,
    pub user_id: Option<u64>,
    pub source: String,
    pub action: String,
    pub ok: bool,
    pub detail: String,
}

pub struct OutcomeLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OutcomeLog {
    pub fn new(data_dir: &str) -> Self {
        Self {
            path: PathBuf::from(data_dir).join(OUTCOME_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Best-effort append; audit loss is logged but never fails the caller.
    pub fn append(&self, rec: OutcomeRecord) {
        let line = match serde_json::to_string(&rec) {
            Ok(l) => l,
            Err(e) => {
                warn!("outcome serialize failed: {:?}", e);
                return;
            }
        };
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let res = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = res {
            warn!("outcome append failed: {}: {:?}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_json_line_per_record() {
        let dir = std::env::temp_dir().join(format!("warden-outcome-{}", std::process::id()));
        let log = OutcomeLog::new(dir.to_str().unwrap());
        for i in 0..3 {
            log.append(OutcomeRecord {
                at: Utc::now(),
                chat_id: 1,
                user_id: Some(i),
                source: "moderation".into(),
                action: "delete".into(),
                ok: true,
                detail: String::new(),
            });
        }
        let text = std::fs::read_to_string(dir.join(OUTCOME_FILE)).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let rec: OutcomeRecord = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(rec.user_id, Some(2));
        let _ = std::fs::remove_dir_all(dir);
    }
}
