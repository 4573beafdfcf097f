//! Per-pipeline audit state: `NoEntry -> Running -> Success | Failed`.

use chrono::NaiveDateTime;
use sdw_core::{default_watermark, AuditLogEntry, EtlError, RunStatus};
use sdw_storage::AuditStore;
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditState {
    NoEntry,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub processed: u64,
    pub rejected: u64,
    pub loaded: u64,
}

/// Tracks one run against the audit log entry it started from.
#[derive(Debug, Clone)]
pub struct AuditTracker {
    pipeline_name: String,
    previous: Option<AuditLogEntry>,
    state: AuditState,
    counters: RunCounters,
}

impl AuditTracker {
    /// Reads the prior entry. A read failure is fatal: the run cannot know its window.
    pub async fn open(store: &dyn AuditStore, pipeline_name: &str) -> Result<Self, EtlError> {
        let previous = store.read_entry(pipeline_name).await.map_err(EtlError::Audit)?;
        Ok(Self::resume(pipeline_name, previous))
    }

    pub fn resume(pipeline_name: &str, previous: Option<AuditLogEntry>) -> Self {
        let state = match &previous {
            None => AuditState::NoEntry,
            Some(entry) => match entry.run_status {
                RunStatus::Success => AuditState::Success,
                RunStatus::Failed => AuditState::Failed,
            },
        };
        Self {
            pipeline_name: pipeline_name.to_string(),
            previous,
            state,
            counters: RunCounters::default(),
        }
    }

    pub fn state(&self) -> AuditState {
        self.state
    }

    pub fn previous(&self) -> Option<&AuditLogEntry> {
        self.previous.as_ref()
    }

    /// Lower bound of this run's extraction window.
    pub fn watermark(&self) -> NaiveDateTime {
        self.previous
            .as_ref()
            .map_or_else(default_watermark, |e| e.last_processed_ingest_date)
    }

    pub fn start(&mut self) -> NaiveDateTime {
        self.state = AuditState::Running;
        self.counters = RunCounters::default();
        self.watermark()
    }

    pub fn counters(&self) -> RunCounters {
        self.counters
    }

    pub fn add_processed(&mut self, n: usize) {
        self.counters.processed += n as u64;
    }

    pub fn add_rejected(&mut self, n: usize) {
        self.counters.rejected += n as u64;
    }

    pub fn set_loaded(&mut self, n: u64) {
        self.counters.loaded = n;
    }

    /// Entry written inside the load transaction; the watermark advances to `now`.
    pub fn success_entry(&self, now: NaiveDateTime) -> AuditLogEntry {
        AuditLogEntry {
            pipeline_name: self.pipeline_name.clone(),
            last_processed_ingest_date: now,
            records_processed: self.counters.processed,
            records_rejected: self.counters.rejected,
            records_loaded: self.counters.loaded,
            run_status: RunStatus::Success,
        }
    }

    /// The watermark stays where it was so the window is re-extracted; nothing counts as loaded.
    pub fn failure_entry(&self) -> AuditLogEntry {
        AuditLogEntry {
            pipeline_name: self.pipeline_name.clone(),
            last_processed_ingest_date: self.watermark(),
            records_processed: self.counters.processed,
            records_rejected: self.counters.rejected,
            records_loaded: 0,
            run_status: RunStatus::Failed,
        }
    }

    pub fn mark_succeeded(&mut self) {
        self.state = AuditState::Success;
        info!(
            pipeline = %self.pipeline_name,
            counters = ?self.counters,
            "audit log updated: SUCCESS"
        );
    }

    /// Best-effort FAILED upsert. The caller re-raises the original error either way.
    pub async fn record_failure(&mut self, store: &dyn AuditStore) {
        self.state = AuditState::Failed;
        self.counters.loaded = 0;
        let entry = self.failure_entry();
        match store.upsert_run(&entry).await {
            Ok(()) => info!(
                pipeline = %self.pipeline_name,
                counters = ?self.counters,
                "audit log updated: FAILED"
            ),
            Err(err) => error!(
                pipeline = %self.pipeline_name,
                error = %format!("{err:#}"),
                "failed to record FAILED run"
            ),
        }
    }
}
