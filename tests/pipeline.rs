//! End-to-end refresh scenarios over the orchestrated pipeline,
//! with the network replaced by a stub ingest implementation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use govsense::cache::{invalidate_on_refresh, TtlCache};
use govsense::clean::Value;
use govsense::ingest::{decode_csv, Ingest, RawRecord};
use govsense::refresh::{Orchestrator, RunStatus};
use govsense::registry::{DatasetSpec, Registry, CHOMAGE_REGIONAL, COMMUNES, REGION_BUDGETS};
use govsense::store::{MemoryStore, Store};
use govsense::transform::REGION_STATS_TABLE;
use govsense::Error;

const BUDGETS_CSV: &str = "year;region_code;region_name;recettes;depenses;dette
2022;011;REG ILE-DE-FRANCE;1000;800;2000
2023;011;REG ILE-DE-FRANCE;1000;800;2100
";

const COMMUNES_CSV: &str = "code_insee,nom,reg_code,reg_nom,population
75056,Paris,11,Ile-de-France,500
";

const EMPLOYMENT_CSV: &str = "mois;reg;libelle_region;masse_salariale_brute;assiette_chomage_partiel
2023-01;11;Ile-de-France;100,5;10
2023-02;11;Ile-de-France;200,5;20
";

#[derive(Default)]
struct StubIngest {
    csvs: HashMap<&'static str, &'static str>,
    fail: HashSet<&'static str>,
    delay: Option<Duration>,
}

impl StubIngest {
    fn complete() -> StubIngest {
        let mut stub = StubIngest::default();
        stub.csvs.insert(REGION_BUDGETS, BUDGETS_CSV);
        stub.csvs.insert(COMMUNES, COMMUNES_CSV);
        stub.csvs.insert(CHOMAGE_REGIONAL, EMPLOYMENT_CSV);
        stub
    }
}

#[async_trait]
impl Ingest for StubIngest {
    async fn fetch(&self, spec: &DatasetSpec) -> govsense::Result<Vec<RawRecord>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.contains(spec.id) {
            return Err(Error::SourceUnavailable(format!(
                "{}: stubbed outage",
                spec.id
            )));
        }
        match self.csvs.get(spec.id) {
            Some(payload) => decode_csv(payload, spec.delimiter),
            None => Err(Error::SourceUnavailable(format!(
                "{}: no stub payload",
                spec.id
            ))),
        }
    }
}

fn orchestrator_with(stub: StubIngest) -> (Arc<Orchestrator>, Arc<MemoryStore>) {
    let registry = Arc::new(Registry::new());
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(registry, Arc::new(stub), store.clone());
    (orchestrator, store)
}

fn col<'a>(row: &'a [(String, Value)], name: &str) -> &'a Value {
    &row.iter()
        .find(|(c, _)| c.as_str() == name)
        .unwrap_or_else(|| panic!("column {name} missing"))
        .1
}

fn stats_for(store: &MemoryStore, year: i64, region: &str) -> Vec<(String, Value)> {
    let rows = store
        .read(
            REGION_STATS_TABLE,
            &[
                ("year".to_string(), Value::Int(year)),
                ("region_code".to_string(), Value::Text(region.to_string())),
            ],
        )
        .unwrap();
    assert_eq!(rows.len(), 1, "expected one stat row for {region}/{year}");
    rows.into_iter().next().unwrap()
}

#[tokio::test]
async fn scenario_a_per_capita_metrics() {
    let (orchestrator, store) = orchestrator_with(StubIngest::complete());
    let run = orchestrator.trigger_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.failed_datasets.is_empty());

    let idf = stats_for(&store, 2023, "11");
    assert_eq!(col(&idf, "population"), &Value::Int(500));
    assert_eq!(col(&idf, "recettes"), &Value::Float(1000.0));
    assert_eq!(col(&idf, "recette_per_capita"), &Value::Float(2.0));
    assert_eq!(col(&idf, "depense_per_capita"), &Value::Float(1.6));

    // employment months aggregate into the same (region, year) row
    assert_eq!(col(&idf, "masse_salariale"), &Value::Float(301.0));
    assert_eq!(col(&idf, "chomage_partiel"), &Value::Float(30.0));

    // the 2022 budget row derives its own period, without employment
    let idf_2022 = stats_for(&store, 2022, "11");
    assert_eq!(col(&idf_2022, "recette_per_capita"), &Value::Float(2.0));
    assert_eq!(col(&idf_2022, "masse_salariale"), &Value::Null);
}

#[tokio::test]
async fn scenario_b_duplicate_natural_key_keeps_last() {
    let mut stub = StubIngest::complete();
    stub.csvs.insert(
        REGION_BUDGETS,
        "year;region_code;recettes;depenses
2023;11;900;700
2023;11;1000;800
",
    );
    let (orchestrator, store) = orchestrator_with(stub);
    let run = orchestrator.trigger_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.reports[REGION_BUDGETS].duplicates, 1);
    assert_eq!(run.reports[REGION_BUDGETS].kept, 1);

    let rows = store
        .read(
            "region_budgets",
            &[("year".to_string(), Value::Int(2023))],
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(col(&rows[0], "recettes"), &Value::Float(1000.0));
}

#[tokio::test]
async fn scenario_c_source_outage_degrades_the_run() {
    let mut stub = StubIngest::complete();
    stub.fail.insert(CHOMAGE_REGIONAL);
    let (orchestrator, store) = orchestrator_with(stub);

    let mut completed = orchestrator.subscribe();
    let run = orchestrator.trigger_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.failed_datasets.contains_key(CHOMAGE_REGIONAL));

    let idf = stats_for(&store, 2023, "11");
    assert_eq!(col(&idf, "recette_per_capita"), &Value::Float(2.0));
    assert_eq!(col(&idf, "masse_salariale"), &Value::Null);
    assert_eq!(col(&idf, "chomage_partiel"), &Value::Null);

    let event = completed.try_recv().unwrap();
    assert_eq!(event.run_id, run.id);
    assert!(event.failed.contains(&CHOMAGE_REGIONAL.to_string()));
    assert!(event.succeeded.contains(&REGION_BUDGETS.to_string()));
}

#[tokio::test]
async fn scenario_d_bad_required_value_rejects_exactly_one_row() {
    let mut stub = StubIngest::complete();
    stub.csvs.insert(
        REGION_BUDGETS,
        "year;region_code;recettes
2022;11;900
abc;11;950
2023;11;1000
",
    );
    let (orchestrator, _store) = orchestrator_with(stub);
    let run = orchestrator.trigger_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    let report = &run.reports[REGION_BUDGETS];
    assert_eq!(report.total, 3);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.kept, 2);
}

#[tokio::test]
async fn concurrent_triggers_reject_all_but_one() {
    let mut stub = StubIngest::complete();
    stub.delay = Some(Duration::from_millis(100));
    let (orchestrator, _store) = orchestrator_with(stub);

    let (first, second) = tokio::join!(orchestrator.trigger_now(), orchestrator.trigger_now());
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(Error::AlreadyRunning))));

    // once the run is terminal, triggering works again
    let rerun = orchestrator.trigger_now().await.unwrap();
    assert_eq!(rerun.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn refresh_completion_flushes_the_cache() {
    let (orchestrator, _store) = orchestrator_with(StubIngest::complete());
    let cache: Arc<TtlCache<String>> = Arc::new(TtlCache::new());
    let _listener = invalidate_on_refresh(Arc::clone(&cache), orchestrator.subscribe());

    let hits = Arc::new(AtomicUsize::new(0));
    let ttl = Duration::from_secs(300);
    let compute = |hits: Arc<AtomicUsize>| {
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
            std::future::ready("stats".to_string())
        }
    };

    cache.get_or_compute("kpis", ttl, compute(hits.clone())).await;
    cache.get_or_compute("kpis", ttl, compute(hits.clone())).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1, "second read must hit");

    orchestrator.trigger_now().await.unwrap();
    // let the listener task observe the broadcast
    tokio::time::sleep(Duration::from_millis(50)).await;

    cache.get_or_compute("kpis", ttl, compute(hits.clone())).await;
    assert_eq!(
        hits.load(Ordering::SeqCst),
        2,
        "post-refresh read must recompute"
    );
}

#[tokio::test]
async fn failed_commit_is_not_broadcast() {
    // a store that rejects the derived table commit
    struct FailingStore {
        inner: MemoryStore,
    }
    impl Store for FailingStore {
        fn upsert_batch(
            &self,
            table: &str,
            rows: Vec<govsense::clean::Row>,
            natural_key: &[&str],
        ) -> govsense::Result<u64> {
            if table == REGION_STATS_TABLE {
                return Err(Error::StorageCommit(format!("{table}: disk full")));
            }
            self.inner.upsert_batch(table, rows, natural_key)
        }
        fn read(
            &self,
            table: &str,
            filter: &[(String, Value)],
        ) -> govsense::Result<Vec<govsense::clean::Row>> {
            self.inner.read(table, filter)
        }
    }

    let registry = Arc::new(Registry::new());
    let store = Arc::new(FailingStore {
        inner: MemoryStore::new(),
    });
    let orchestrator = Orchestrator::new(registry, Arc::new(StubIngest::complete()), store.clone());

    let mut completed = orchestrator.subscribe();
    let run = orchestrator.trigger_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.is_some());
    assert!(completed.try_recv().is_err(), "failed run must not broadcast");

    // tables committed before the failure stay readable
    let budgets = store.read("region_budgets", &[]).unwrap();
    assert!(!budgets.is_empty());
}

#[tokio::test]
async fn run_status_is_queryable_during_and_after_a_run() {
    let mut stub = StubIngest::complete();
    stub.delay = Some(Duration::from_millis(100));
    let (orchestrator, _store) = orchestrator_with(stub);

    assert!(orchestrator.last_run().is_none());
    let in_flight = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.trigger_now().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let running = orchestrator.last_run().expect("run should be visible");
    assert_eq!(running.status, RunStatus::Running);

    let finished = in_flight.await.unwrap().unwrap();
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert_eq!(
        orchestrator.last_run().unwrap().status,
        RunStatus::Succeeded
    );
}

#[tokio::test]
async fn periodic_scheduler_runs_and_stops() {
    let (orchestrator, _store) = orchestrator_with(StubIngest::complete());
    let scheduler = Arc::clone(&orchestrator).start_periodic(Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(
        orchestrator.last_run().is_some(),
        "first tick fires immediately"
    );
    scheduler.stop();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let after_stop = orchestrator.last_run().unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(
        orchestrator.last_run().unwrap().id,
        after_stop.id,
        "no new runs after stop"
    );
}
