use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use teloxide::types::{ChatId, MessageId};
use tracing::{info, warn};

use crate::outcome::{OutcomeLog, OutcomeRecord};
use crate::persist;
use crate::transport::Transport;

const PENDING_FILE: &str = "pending_deletes.json";
const SWEEP_BATCH: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDelete {
    pub id: u64,
    pub chat_id: i64,
    pub message_id: i32,
    pub delete_at: DateTime<Utc>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Durable store of deletes that must fire after the current invocation
/// ends. Records are claimed by atomic removal, then executed; a record is
/// gone after one sweep touches it whether or not the transport call worked,
/// so the store is self-draining and a delete can never run twice.
pub struct Scheduler {
    records: DashMap<u64, PendingDelete>,
    next_id: AtomicU64,
    transport: Arc<dyn Transport>,
    outcomes: Arc<OutcomeLog>,
    data_dir: String,
}

impl Scheduler {
    pub fn new(transport: Arc<dyn Transport>, outcomes: Arc<OutcomeLog>, data_dir: &str) -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
            transport,
            outcomes,
            data_dir: data_dir.to_string(),
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(PENDING_FILE)
    }

    pub fn restore(&self) {
        let Some(text) = persist::read_snapshot(&self.snapshot_path()) else {
            return;
        };
        let records: Vec<PendingDelete> = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!("pending delete snapshot unreadable, starting empty: {:?}", e);
                return;
            }
        };
        let mut max_id = 0;
        for rec in records {
            max_id = max_id.max(rec.id);
            self.records.insert(rec.id, rec);
        }
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        info!("restored {} pending deletes", self.records.len());
    }

    async fn persist(&self) {
        let records: Vec<PendingDelete> = self.records.iter().map(|e| e.value().clone()).collect();
        match serde_json::to_vec_pretty(&records) {
            Ok(bytes) => persist::write_atomic_async(self.snapshot_path(), bytes).await,
            Err(e) => warn!("pending delete serialize failed: {:?}", e),
        }
    }

    pub async fn schedule(
        &self,
        chat: ChatId,
        message: MessageId,
        delay_seconds: i64,
        reason: &str,
    ) -> u64 {
        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records.insert(
            id,
            PendingDelete {
                id,
                chat_id: chat.0,
                message_id: message.0,
                delete_at: now + Duration::seconds(delay_seconds),
                reason: reason.to_string(),
                created_at: now,
            },
        );
        self.persist().await;
        id
    }

    pub fn pending_count(&self) -> usize {
        self.records.len()
    }

    /// Executes all due records (bounded batch). At-most-once: the record is
    /// removed before the transport call, so an overlapping sweep that races
    /// on the same candidate loses the claim and skips it.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepStats {
        let mut due: Vec<(DateTime<Utc>, u64)> = self
            .records
            .iter()
            .filter(|e| e.value().delete_at <= now)
            .map(|e| (e.value().delete_at, *e.key()))
            .collect();
        due.sort();
        due.truncate(SWEEP_BATCH);

        let mut stats = SweepStats::default();
        for (_, id) in due {
            let Some((_, rec)) = self.records.remove(&id) else {
                continue; // claimed by a concurrent sweep
            };
            stats.processed += 1;
            let res = self
                .transport
                .delete_message(ChatId(rec.chat_id), MessageId(rec.message_id))
                .await;
            let ok = match res {
                Ok(()) => {
                    stats.succeeded += 1;
                    true
                }
                Err(e) => {
                    // not retried: the record is already gone
                    warn!(
                        "deferred delete failed (chat={} msg={} reason={}): {:?}",
                        rec.chat_id, rec.message_id, rec.reason, e
                    );
                    stats.failed += 1;
                    false
                }
            };
            self.outcomes.append(OutcomeRecord {
                at: now,
                chat_id: rec.chat_id,
                user_id: None,
                source: "sweep".into(),
                action: "delete".into(),
                ok,
                detail: rec.reason,
            });
        }

        if stats.processed > 0 {
            self.persist().await;
            info!(
                "sweep done: processed={} succeeded={} failed={}",
                stats.processed, stats.succeeded, stats.failed
            );
        }
        stats
    }
}
