use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use callsight_app::services::{
    AnalyzerError, CallAnalyzer, CsvCallFeed, ReconcileEngine, ReconcileReport, ReportStore,
    SourceRecord,
};

const FEED_CSV: &str = "\
Store Name,Recording URL,Duration,is_converted,Date
Indiranagar,https://example.com/a.mp4,312,1,2025-10-21
Koramangala,https://example.com/b.mp4,198,0,2025-10-22
HSR Layout,,240,1,2025-10-23
";

struct CountingAnalyzer {
    calls: AtomicUsize,
    fail_key: Option<String>,
}

impl CountingAnalyzer {
    fn healthy() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_key: None,
        })
    }

    fn failing_on(key: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_key: Some(key.to_string()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallAnalyzer for CountingAnalyzer {
    async fn analyze(&self, record: &SourceRecord) -> Result<Value, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_key.as_deref() == Some(record.key.as_str()) {
            return Err(AnalyzerError::Timeout);
        }
        Ok(json!({
            "Functional": { "Call_ID": record.key, "Store_Location": record.store_name },
            "Scoring": { "Overall": { "score": 6 } },
        }))
    }
}

fn write_feed(dir: &TempDir) -> CsvCallFeed {
    let path = dir.path().join("calls.csv");
    std::fs::File::create(&path)
        .and_then(|mut f| f.write_all(FEED_CSV.as_bytes()))
        .expect("write feed csv");
    CsvCallFeed::new(path)
}

#[tokio::test]
async fn full_pass_then_idempotent_repeat() {
    let dir = TempDir::new().unwrap();
    let feed = write_feed(&dir);
    let analyzer = CountingAnalyzer::healthy();

    let store = ReportStore::open(dir.path().join("results.json")).unwrap();
    let engine = ReconcileEngine::new(Arc::new(store), analyzer.clone());

    let first = engine.reconcile_all(&feed).await.unwrap();
    assert_eq!(
        first,
        ReconcileReport {
            newly_processed: 2,
            already_reconciled: 0,
            failed: 1,
        }
    );
    assert_eq!(analyzer.calls(), 2, "the record without a url is never sent out");

    let second = engine.reconcile_all(&feed).await.unwrap();
    assert_eq!(
        second,
        ReconcileReport {
            newly_processed: 0,
            already_reconciled: 3,
            failed: 0,
        }
    );
    assert_eq!(analyzer.calls(), 2, "a converged feed causes no vendor calls");
}

#[tokio::test]
async fn results_survive_restart_and_failures_stay_terminal() {
    let dir = TempDir::new().unwrap();
    let feed = write_feed(&dir);
    let store_path = dir.path().join("results.json");

    // First process lifetime: one record fails at the vendor.
    let first_analyzer = CountingAnalyzer::failing_on("video_1");
    {
        let store = ReportStore::open(&store_path).unwrap();
        let engine = ReconcileEngine::new(Arc::new(store), first_analyzer.clone());
        let report = engine.reconcile_all(&feed).await.unwrap();
        assert_eq!(report.newly_processed, 1);
        assert_eq!(report.failed, 2);
    }
    assert_eq!(first_analyzer.calls(), 2);

    // Second lifetime over the same file: everything is already terminal,
    // the earlier vendor failure included.
    let second_analyzer = CountingAnalyzer::healthy();
    let store = ReportStore::open(&store_path).unwrap();
    let engine = ReconcileEngine::new(Arc::new(store), second_analyzer.clone());

    let report = engine.reconcile_all(&feed).await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            newly_processed: 0,
            already_reconciled: 3,
            failed: 0,
        }
    );
    assert_eq!(second_analyzer.calls(), 0);

    let failed = engine.store().get("video_1").unwrap();
    assert!(!failed.outcome.is_success());
    assert_eq!(failed.document["error"], true);
}

#[tokio::test]
async fn force_refresh_recovers_a_failed_record() {
    let dir = TempDir::new().unwrap();
    let feed = write_feed(&dir);
    let store_path = dir.path().join("results.json");

    {
        let store = ReportStore::open(&store_path).unwrap();
        let engine = ReconcileEngine::new(Arc::new(store), CountingAnalyzer::failing_on("video_1"));
        engine.reconcile_all(&feed).await.unwrap();
    }

    let analyzer = CountingAnalyzer::healthy();
    let store = ReportStore::open(&store_path).unwrap();
    let engine = ReconcileEngine::new(Arc::new(store), analyzer.clone());

    let refreshed = engine.reconcile_one(&feed, "video_1", true).await.unwrap();
    assert!(refreshed.outcome.is_success());
    assert_eq!(analyzer.calls(), 1);

    // The overwrite is durable.
    let reopened = ReportStore::open(&store_path).unwrap();
    assert!(reopened.get("video_1").unwrap().outcome.is_success());
}
