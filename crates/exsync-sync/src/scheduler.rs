use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use exsync_core::SyncTrigger;
use exsync_storage::{CaseSelection, Store};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::cron::CronTriggers;
use crate::orchestrator::{CaseSyncReport, CaseSyncer};
use crate::SyncError;

/// Process-wide "a repository sync is in flight" flag.
#[derive(Debug, Default)]
pub struct RunGuard {
    running: AtomicBool,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// `None` when another run already holds the guard.
    pub fn try_acquire(self: &Arc<Self>) -> Option<RunPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit {
                guard: Arc::clone(self),
            })
    }
}

/// Clears the guard when dropped.
#[derive(Debug)]
pub struct RunPermit {
    guard: Arc<RunGuard>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub incremental_limit: usize,
    pub incremental_stale: chrono::Duration,
    pub incremental_delay: Duration,
    pub run_deadline: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl BatchSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_pause: config.batch_pause,
            incremental_limit: config.incremental_limit,
            incremental_stale: chrono::Duration::hours(config.incremental_stale_hours),
            incremental_delay: config.incremental_delay,
            run_deadline: config.run_deadline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Incremental,
    SingleCase,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::SingleCase => "single_case",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFailure {
    pub case_id: Uuid,
    pub error: String,
}

/// Counts summed over every case a run visited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAggregate {
    pub mode: RunMode,
    pub reason: Option<String>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub entities_created: usize,
    pub users_created: usize,
    pub contacts_created: usize,
    pub participants_added: usize,
    pub failures: Vec<CaseFailure>,
    pub deadline_exceeded: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunAggregate {
    fn new(mode: RunMode, reason: Option<&str>, total: usize) -> Self {
        let now = Utc::now();
        Self {
            mode,
            reason: reason.map(str::to_string),
            total,
            successful: 0,
            failed: 0,
            skipped: 0,
            entities_created: 0,
            users_created: 0,
            contacts_created: 0,
            participants_added: 0,
            failures: Vec::new(),
            deadline_exceeded: false,
            started_at: now,
            finished_at: now,
        }
    }

    fn record(&mut self, case_id: Uuid, result: Result<CaseSyncReport, SyncError>) {
        match result {
            Ok(report) => {
                self.successful += 1;
                self.users_created += report.users.created;
                self.contacts_created += report.contacts.created;
                self.entities_created += report.entities_created();
                self.participants_added += report.participants_added;
            }
            Err(err) => self.record_failure(case_id, err.to_string()),
        }
    }

    fn record_failure(&mut self, case_id: Uuid, error: String) {
        self.failed += 1;
        self.failures.push(CaseFailure { case_id, error });
    }

    fn stop_at_deadline(&mut self, remaining: usize) {
        warn!(remaining, "run deadline exceeded; skipping remaining cases");
        self.skipped += remaining;
        self.deadline_exceeded = true;
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        info!(
            mode = self.mode.as_str(),
            total = self.total,
            successful = self.successful,
            failed = self.failed,
            skipped = self.skipped,
            entities_created = self.entities_created,
            "sync run finished"
        );
        self
    }
}

/// What a trigger call did. The three variants stay distinguishable all the
/// way to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// The run happened; individual cases may still have failed.
    Completed(RunAggregate),
    /// Another repository sync held the guard; nothing was done.
    AlreadyRunning,
    /// The run crashed before producing aggregates.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<RunAggregate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<TriggerOutcome> for TriggerResponse {
    fn from(outcome: TriggerOutcome) -> Self {
        match outcome {
            TriggerOutcome::Completed(aggregate) => Self {
                success: true,
                skipped: false,
                results: Some(aggregate),
                error: None,
            },
            TriggerOutcome::AlreadyRunning => Self {
                success: true,
                skipped: true,
                results: None,
                error: Some("sync already running".to_string()),
            },
            TriggerOutcome::Failed { error } => Self {
                success: false,
                skipped: false,
                results: None,
                error: Some(error),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_running: bool,
    pub scheduled_triggers_active: Vec<String>,
    pub next_scheduled_run_times: BTreeMap<String, Option<DateTime<Utc>>>,
}

/// Batch runner over [`CaseSyncer`] with a shared re-entrancy guard.
#[derive(Clone)]
pub struct SyncScheduler {
    store: Arc<dyn Store>,
    syncer: CaseSyncer,
    guard: Arc<RunGuard>,
    settings: BatchSettings,
}

impl SyncScheduler {
    pub fn new(syncer: CaseSyncer, guard: Arc<RunGuard>, settings: BatchSettings) -> Self {
        Self {
            store: syncer.store().clone(),
            syncer,
            guard,
            settings,
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &SyncConfig) -> Self {
        Self::new(
            CaseSyncer::new(store, config.case_timeout),
            Arc::new(RunGuard::new()),
            BatchSettings::from_config(config),
        )
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn trigger_full_sync(&self, reason: Option<&str>) -> TriggerOutcome {
        let Some(permit) = self.guard.try_acquire() else {
            info!(reason, "full sync requested while a sync is running; skipped");
            return TriggerOutcome::AlreadyRunning;
        };
        let span = info_span!("sync_run", mode = "full", reason);
        let this = self.clone();
        let reason = reason.map(str::to_string);
        Self::run_guarded(permit, span, async move { this.run_full(reason.as_deref()).await }).await
    }

    pub async fn trigger_incremental_sync(&self, reason: Option<&str>) -> TriggerOutcome {
        let Some(permit) = self.guard.try_acquire() else {
            info!(reason, "incremental sync requested while a sync is running; skipped");
            return TriggerOutcome::AlreadyRunning;
        };
        let span = info_span!("sync_run", mode = "incremental", reason);
        let this = self.clone();
        let reason = reason.map(str::to_string);
        Self::run_guarded(permit, span, async move { this.run_incremental(reason.as_deref()).await })
            .await
    }

    /// Runs a repository pass on its own task. The permit travels with the
    /// pass, so a dropped caller neither releases the guard nor stops the run.
    async fn run_guarded<F>(permit: RunPermit, span: Span, run: F) -> TriggerOutcome
    where
        F: Future<Output = Result<RunAggregate, SyncError>> + Send + 'static,
    {
        let handle = tokio::spawn(
            async move {
                let _permit = permit;
                run.await
            }
            .instrument(span),
        );
        match handle.await {
            Ok(result) => Self::outcome(result),
            Err(join_err) => {
                error!(error = %join_err, "sync run task aborted");
                TriggerOutcome::Failed {
                    error: format!("sync run aborted: {join_err}"),
                }
            }
        }
    }

    /// Sync one case on demand. Does not take the repository guard.
    pub async fn trigger_single_case_sync(&self, case_id: Uuid) -> TriggerOutcome {
        let mut aggregate = RunAggregate::new(RunMode::SingleCase, None, 1);
        let result = self.syncer.sync_case(case_id, SyncTrigger::Manual).await;
        aggregate.record(case_id, result);
        TriggerOutcome::Completed(aggregate.finish())
    }

    pub async fn sync_status(&self, triggers: Option<&CronTriggers>) -> SyncStatus {
        let (scheduled_triggers_active, next_scheduled_run_times) = match triggers {
            Some(triggers) => (triggers.active_triggers().await, triggers.next_run_times().await),
            None => (Vec::new(), BTreeMap::new()),
        };
        SyncStatus {
            is_running: self.is_running(),
            scheduled_triggers_active,
            next_scheduled_run_times,
        }
    }

    fn outcome(result: Result<RunAggregate, SyncError>) -> TriggerOutcome {
        match result {
            Ok(aggregate) => TriggerOutcome::Completed(aggregate),
            Err(err) => {
                error!(error = %err, "sync run crashed");
                TriggerOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    async fn run_full(&self, reason: Option<&str>) -> Result<RunAggregate, SyncError> {
        let started = Instant::now();
        let cases = self.store.select_cases(&CaseSelection::Full).await?;
        let mut aggregate = RunAggregate::new(RunMode::Full, reason, cases.len());
        info!(cases = cases.len(), batch_size = self.settings.batch_size, "starting full sync");

        let mut processed = 0usize;
        for (index, batch) in cases.chunks(self.settings.batch_size).enumerate() {
            if started.elapsed() >= self.settings.run_deadline {
                aggregate.stop_at_deadline(cases.len() - processed);
                break;
            }
            if index > 0 && !self.settings.batch_pause.is_zero() {
                tokio::time::sleep(self.settings.batch_pause).await;
            }

            let handles: Vec<_> = batch
                .iter()
                .map(|case| {
                    let syncer = self.syncer.clone();
                    let case_id = case.id;
                    let handle =
                        tokio::spawn(async move { syncer.sync_case(case_id, SyncTrigger::FullSync).await });
                    (case_id, handle)
                })
                .collect();

            for (case_id, handle) in handles {
                match handle.await {
                    Ok(result) => aggregate.record(case_id, result),
                    Err(join_err) => {
                        error!(%case_id, error = %join_err, "case sync task aborted");
                        aggregate.record_failure(case_id, format!("task aborted: {join_err}"));
                    }
                }
            }
            processed += batch.len();
        }

        Ok(aggregate.finish())
    }

    async fn run_incremental(&self, reason: Option<&str>) -> Result<RunAggregate, SyncError> {
        let started = Instant::now();
        let selection = CaseSelection::Incremental {
            stale_before: Utc::now() - self.settings.incremental_stale,
            limit: self.settings.incremental_limit,
        };
        let cases = self.store.select_cases(&selection).await?;
        let mut aggregate = RunAggregate::new(RunMode::Incremental, reason, cases.len());
        info!(cases = cases.len(), "starting incremental sync");

        for (index, case) in cases.iter().enumerate() {
            if started.elapsed() >= self.settings.run_deadline {
                aggregate.stop_at_deadline(cases.len() - index);
                break;
            }
            if index > 0 && !self.settings.incremental_delay.is_zero() {
                tokio::time::sleep(self.settings.incremental_delay).await;
            }
            let result = self
                .syncer
                .sync_case(case.id, SyncTrigger::IncrementalSync)
                .await;
            aggregate.record(case.id, result);
        }

        Ok(aggregate.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_admits_one_holder_at_a_time() {
        let guard = Arc::new(RunGuard::new());
        let permit = guard.try_acquire().expect("first acquire");
        assert!(guard.is_running());
        assert!(guard.try_acquire().is_none());
        drop(permit);
        assert!(!guard.is_running());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn trigger_responses_keep_outcomes_apart() {
        let skipped = TriggerResponse::from(TriggerOutcome::AlreadyRunning);
        assert!(skipped.success && skipped.skipped);

        let crashed = TriggerResponse::from(TriggerOutcome::Failed {
            error: "database error".into(),
        });
        assert!(!crashed.success && !crashed.skipped);
        assert_eq!(crashed.error.as_deref(), Some("database error"));

        let mut aggregate = RunAggregate::new(RunMode::Full, Some("nightly"), 2);
        aggregate.record_failure(Uuid::new_v4(), "boom".into());
        let ran = TriggerResponse::from(TriggerOutcome::Completed(aggregate));
        assert!(ran.success && !ran.skipped);
        assert_eq!(ran.results.as_ref().map(|r| r.failed), Some(1));

        let json = serde_json::to_value(&ran).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["results"]["mode"], "full");
    }
}
