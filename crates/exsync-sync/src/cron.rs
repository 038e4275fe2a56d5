use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{JobKind, ScheduleRegistry};
use crate::pull::RawCasePull;
use crate::scheduler::{SyncScheduler, TriggerOutcome};
use crate::purge_expired_logs;

#[derive(Debug, Clone)]
struct RegisteredTrigger {
    name: String,
    job_id: Uuid,
}

/// Named cron triggers, started and stopped by the process owner.
pub struct CronTriggers {
    scheduler: JobScheduler,
    registered: Mutex<Vec<RegisteredTrigger>>,
}

impl CronTriggers {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self {
            scheduler,
            registered: Mutex::new(Vec::new()),
        })
    }

    pub async fn register_trigger<F, Fut>(&self, name: &str, cron: &str, handler: F) -> Result<Uuid>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler().await })
        })
        .with_context(|| format!("creating scheduler job {name} for cron {cron}"))?;
        let job_id = self.scheduler.add(job).await.context("adding scheduler job")?;

        self.registered.lock().await.push(RegisteredTrigger {
            name: name.to_string(),
            job_id,
        });
        info!(trigger = name, cron, "registered cron trigger");
        Ok(job_id)
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await.context("starting scheduler")
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await.context("stopping scheduler")
    }

    pub async fn active_triggers(&self) -> Vec<String> {
        self.registered
            .lock()
            .await
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    pub async fn next_run_times(&self) -> BTreeMap<String, Option<DateTime<Utc>>> {
        let registered = self.registered.lock().await.clone();
        let mut scheduler = self.scheduler.clone();
        let mut times = BTreeMap::new();
        for trigger in registered {
            let next = scheduler.next_tick_for_job(trigger.job_id).await.ok().flatten();
            times.insert(trigger.name, next);
        }
        times
    }
}

fn log_outcome(trigger: &str, outcome: &TriggerOutcome) {
    match outcome {
        TriggerOutcome::Completed(aggregate) => info!(
            trigger,
            successful = aggregate.successful,
            failed = aggregate.failed,
            "scheduled sync finished"
        ),
        TriggerOutcome::AlreadyRunning => info!(trigger, "scheduled sync skipped; already running"),
        TriggerOutcome::Failed { error } => warn!(trigger, error = %error, "scheduled sync failed"),
    }
}

/// Register every enabled trigger of `registry`. Returns how many were registered.
///
/// `pull` jobs are skipped with a warning when no upstream source is configured.
pub async fn install_triggers(
    triggers: &CronTriggers,
    registry: &ScheduleRegistry,
    scheduler: SyncScheduler,
    pull: Option<RawCasePull>,
    log_retention_days: u32,
) -> Result<usize> {
    let mut installed = 0usize;

    for spec in registry.enabled() {
        let name = spec.name.clone();
        match spec.job {
            JobKind::FullSync => {
                let scheduler = scheduler.clone();
                triggers
                    .register_trigger(&spec.name, &spec.cron, move || {
                        let scheduler = scheduler.clone();
                        let name = name.clone();
                        async move {
                            let outcome = scheduler.trigger_full_sync(Some(&name)).await;
                            log_outcome(&name, &outcome);
                        }
                    })
                    .await?;
            }
            JobKind::IncrementalSync => {
                let scheduler = scheduler.clone();
                triggers
                    .register_trigger(&spec.name, &spec.cron, move || {
                        let scheduler = scheduler.clone();
                        let name = name.clone();
                        async move {
                            let outcome = scheduler.trigger_incremental_sync(Some(&name)).await;
                            log_outcome(&name, &outcome);
                        }
                    })
                    .await?;
            }
            JobKind::PurgeLogs => {
                let store = scheduler.store().clone();
                triggers
                    .register_trigger(&spec.name, &spec.cron, move || {
                        let store = store.clone();
                        async move {
                            if let Err(err) = purge_expired_logs(store.as_ref(), log_retention_days).await {
                                warn!(error = %err, "scheduled log purge failed");
                            }
                        }
                    })
                    .await?;
            }
            JobKind::Pull => {
                let Some(pull) = pull.clone() else {
                    warn!(trigger = %spec.name, "no upstream source configured; pull trigger not installed");
                    continue;
                };
                triggers
                    .register_trigger(&spec.name, &spec.cron, move || {
                        let pull = pull.clone();
                        async move {
                            if let Err(err) = pull.run().await {
                                warn!(error = %err, "scheduled pull failed");
                            }
                        }
                    })
                    .await?;
            }
        }
        installed += 1;
    }

    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use exsync_storage::MemoryStore;

    #[tokio::test(flavor = "multi_thread")]
    async fn installs_enabled_triggers_and_reports_next_runs() {
        let triggers = CronTriggers::new().await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let scheduler = SyncScheduler::from_config(store, &crate::SyncConfig::default());

        let mut registry = ScheduleRegistry::default();
        registry.triggers[2].enabled = false;

        let installed = install_triggers(&triggers, &registry, scheduler.clone(), None, 30)
            .await
            .unwrap();
        assert_eq!(installed, 2);

        let status = scheduler.sync_status(Some(&triggers)).await;
        assert!(!status.is_running);
        assert_eq!(
            status.scheduled_triggers_active,
            vec!["nightly-full-sync".to_string(), "incremental-sync".to_string()]
        );
        assert_eq!(status.next_scheduled_run_times.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_cron_expression_is_rejected() {
        let triggers = CronTriggers::new().await.unwrap();
        let result = triggers.register_trigger("broken", "not a cron", || async {}).await;
        assert!(result.is_err());
        assert!(triggers.active_triggers().await.is_empty());
    }
}
