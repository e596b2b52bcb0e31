//! Refresh orchestration: run state machine, scheduler and completion event

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clean::{clean, CleanRecord, CleaningReport, Row};
use crate::error::{Error, Result};
use crate::ingest::Ingest;
use crate::registry::{DatasetSpec, Registry, CHOMAGE_REGIONAL, COMMUNES, REGION_BUDGETS};
use crate::store::Store;
use crate::transform::{transform, RegionStat, REGION_STATS_TABLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// Record of one refresh, retained for the run-status query.
/// A run with entries in `failed_datasets` but status `Succeeded`
/// completed in degraded mode.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// committed rows per target table
    pub rows: BTreeMap<String, u64>,
    /// cleaning counters per dataset that made it through fetch+clean
    pub reports: BTreeMap<String, CleaningReport>,
    /// datasets that contributed nothing this run, with the reason
    pub failed_datasets: BTreeMap<String, String>,
    pub unmapped_communes: u64,
    pub error: Option<String>,
}

/// Single-fire notification emitted after a full successful commit
#[derive(Debug, Clone)]
pub struct RefreshCompleted {
    pub run_id: Uuid,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    ingest: Arc<dyn Ingest>,
    store: Arc<dyn Store>,
    running: AtomicBool,
    last_run: RwLock<Option<RefreshRun>>,
    completed: broadcast::Sender<RefreshCompleted>,
}

/// Clears the running flag on every exit path out of a run
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        ingest: Arc<dyn Ingest>,
        store: Arc<dyn Store>,
    ) -> Arc<Orchestrator> {
        let (completed, _) = broadcast::channel(16);
        Arc::new(Orchestrator {
            registry,
            ingest,
            store,
            running: AtomicBool::new(false),
            last_run: RwLock::new(None),
            completed,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshCompleted> {
        self.completed.subscribe()
    }

    /// The run-status query: most recent run, including one in flight
    pub fn last_run(&self) -> Option<RefreshRun> {
        self.last_run.read().expect("run lock poisoned").clone()
    }

    /// Run the full pipeline now. At most one run is in flight
    /// process-wide; a concurrent trigger is rejected, never queued.
    pub async fn trigger_now(&self) -> Result<RefreshRun> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        Ok(self.run_pipeline().await)
    }

    /// Tick every `every`, skipping ticks while a run is still in
    /// flight. The first run fires immediately. Runs are spawned as
    /// their own tasks, so stopping the scheduler never cancels one.
    pub fn start_periodic(self: Arc<Self>, every: Duration) -> SchedulerHandle {
        let orchestrator = self;
        info!(interval_secs = every.as_secs(), "periodic refresh enabled");
        let ticker_task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    match orchestrator.trigger_now().await {
                        Ok(run) => {
                            info!(run_id = %run.id, status = ?run.status, "scheduled refresh done")
                        }
                        Err(Error::AlreadyRunning) => {
                            info!("previous refresh still running, tick skipped")
                        }
                        Err(e) => warn!(error = %e, "scheduled refresh could not start"),
                    }
                });
            }
        });
        SchedulerHandle { ticker_task }
    }

    async fn run_pipeline(&self) -> RefreshRun {
        let mut run = RefreshRun {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            rows: BTreeMap::new(),
            reports: BTreeMap::new(),
            failed_datasets: BTreeMap::new(),
            unmapped_communes: 0,
            error: None,
        };
        *self.last_run.write().expect("run lock poisoned") = Some(run.clone());
        info!(run_id = %run.id, "refresh started");

        // fetch + clean every dataset concurrently; failures are isolated
        let mut tasks = JoinSet::new();
        for spec in self.registry.list_datasets().to_vec() {
            let ingest = Arc::clone(&self.ingest);
            tasks.spawn(async move {
                let outcome = match ingest.fetch(&spec).await {
                    Ok(raw) => clean(&spec, &raw),
                    Err(e) => Err(e),
                };
                (spec, outcome)
            });
        }
        let mut cleaned: Vec<(DatasetSpec, Vec<CleanRecord>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((spec, Ok((records, report)))) => {
                    info!(
                        dataset = spec.id,
                        kept = report.kept,
                        rejected = report.rejected,
                        duplicates = report.duplicates,
                        "dataset cleaned"
                    );
                    run.reports.insert(spec.id.to_string(), report);
                    cleaned.push((spec, records));
                }
                Ok((spec, Err(e))) => {
                    warn!(dataset = spec.id, error = %e, "dataset skipped this run");
                    run.failed_datasets.insert(spec.id.to_string(), e.to_string());
                }
                Err(e) => {
                    warn!(error = %e, "dataset task aborted");
                }
            }
        }

        // barrier: all outcomes are in; derive over whatever succeeded
        let by_id = |id: &str| {
            cleaned
                .iter()
                .find(|(s, _)| s.id == id)
                .map(|(_, records)| records.as_slice())
        };
        let (stats, transform_report) = transform(
            by_id(REGION_BUDGETS),
            by_id(COMMUNES),
            by_id(CHOMAGE_REGIONAL),
        );
        run.unmapped_communes = transform_report.unmapped_communes;

        match self.commit(&cleaned, stats, &mut run) {
            Ok(()) => run.status = RunStatus::Succeeded,
            Err(e) => {
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
            }
        }
        run.finished_at = Some(Utc::now());
        *self.last_run.write().expect("run lock poisoned") = Some(run.clone());

        match run.status {
            RunStatus::Succeeded => {
                let mut succeeded: Vec<String> =
                    cleaned.iter().map(|(s, _)| s.id.to_string()).collect();
                succeeded.sort();
                let failed: Vec<String> = run.failed_datasets.keys().cloned().collect();
                let _ = self.completed.send(RefreshCompleted {
                    run_id: run.id,
                    succeeded,
                    failed,
                });
                info!(
                    run_id = %run.id,
                    degraded = !run.failed_datasets.is_empty(),
                    "refresh succeeded"
                );
            }
            _ => {
                error!(run_id = %run.id, error = run.error.as_deref(), "refresh failed");
            }
        }
        run
    }

    /// Commit cleaned tables then the derived table. All-or-nothing per
    /// table only: a failure keeps earlier tables from this run in place
    /// and fails the run.
    fn commit(
        &self,
        cleaned: &[(DatasetSpec, Vec<CleanRecord>)],
        stats: Vec<RegionStat>,
        run: &mut RefreshRun,
    ) -> Result<()> {
        for (spec, records) in cleaned {
            let rows: Vec<Row> = records.iter().map(|r| r.fields.clone()).collect();
            let n = self.store.upsert_batch(spec.target_table, rows, spec.natural_key)?;
            run.rows.insert(spec.target_table.to_string(), n);
        }
        let derived: Vec<Row> = stats.into_iter().map(RegionStat::into_row).collect();
        let n = self
            .store
            .upsert_batch(REGION_STATS_TABLE, derived, &["year", "region_code"])?;
        run.rows.insert(REGION_STATS_TABLE.to_string(), n);
        Ok(())
    }
}

/// Cancellable handle on the periodic ticker
pub struct SchedulerHandle {
    ticker_task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Cancel future ticks; an in-flight run completes on its own
    pub fn stop(&self) {
        self.ticker_task.abort();
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.ticker_task.abort();
    }
}
