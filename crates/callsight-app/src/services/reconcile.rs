use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::services::analyzer::{AnalyzerError, CallAnalyzer};
use crate::services::feed::{CallFeed, FeedError, SourceRecord};
use crate::services::store::{AnalysisOutcome, AnalysisReport, ReportStore, StoreError};

// Batch reconciliation.
//
// A pass walks the feed in order and converges the store toward "one
// terminal report per feed record". Presence in the store is the sole
// reconciliation marker: Success and Failed both count, so a failed record
// is never retried implicitly. Only a force-refresh re-runs analysis.

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub newly_processed: usize,
    pub already_reconciled: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no record with key {key}")]
    RecordNotFound { key: String },

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

pub struct ReconcileEngine {
    store: Arc<ReportStore>,
    analyzer: Arc<dyn CallAnalyzer>,
}

impl ReconcileEngine {
    pub fn new(store: Arc<ReportStore>, analyzer: Arc<dyn CallAnalyzer>) -> Self {
        Self { store, analyzer }
    }

    pub fn store(&self) -> &Arc<ReportStore> {
        &self.store
    }

    /// Run one full pass over `feed`. Per-record failures are recorded and
    /// counted but never abort the pass; only a feed that cannot be loaded
    /// at all, or a store that cannot be opened, fails the pass itself.
    pub async fn reconcile_all(&self, feed: &dyn CallFeed) -> Result<ReconcileReport, ReconcileError> {
        let records = feed.records()?;
        tracing::info!(
            event = "reconcile.pass_started",
            feed_records = records.len(),
            stored_reports = self.store.len(),
        );

        let mut report = ReconcileReport::default();
        for record in &records {
            if self.store.exists(&record.key) {
                report.already_reconciled += 1;
                continue;
            }
            match self.reconcile_record(record).await {
                Ok(outcome) if outcome.is_success() => report.newly_processed += 1,
                Ok(_) => report.failed += 1,
                Err(error) => {
                    // The store refused the write; nothing durable changed
                    // for this record, so count it and move on.
                    tracing::error!(
                        event = "reconcile.store_write_failed",
                        key = %record.key,
                        error = %error,
                    );
                    report.failed += 1;
                }
            }
        }

        debug_assert_eq!(
            report.newly_processed + report.already_reconciled + report.failed,
            records.len(),
        );
        tracing::info!(
            event = "reconcile.pass_finished",
            newly_processed = report.newly_processed,
            already_reconciled = report.already_reconciled,
            failed = report.failed,
        );
        Ok(report)
    }

    /// Reconcile a single record by key. With `force` unset this is a pure
    /// cache read when a report already exists; with `force` set the record
    /// is re-analyzed and the stored report overwritten.
    pub async fn reconcile_one(
        &self,
        feed: &dyn CallFeed,
        key: &str,
        force: bool,
    ) -> Result<AnalysisReport, ReconcileError> {
        if !force && let Some(existing) = self.store.get(key) {
            tracing::debug!(event = "reconcile.cache_hit", key = %key);
            return Ok(existing);
        }

        let record = feed
            .find(key)?
            .ok_or_else(|| ReconcileError::RecordNotFound { key: key.to_string() })?;

        self.reconcile_record(&record).await?;
        debug_assert!(self.store.exists(key));
        self.store.get(key).ok_or(ReconcileError::RecordNotFound {
            key: key.to_string(),
        })
    }

    /// Analyze `record` and persist exactly one terminal report for it.
    async fn reconcile_record(&self, record: &SourceRecord) -> Result<AnalysisOutcome, ReconcileError> {
        if !record.has_locator() {
            tracing::warn!(event = "reconcile.missing_locator", key = %record.key);
            let outcome = AnalysisOutcome::Failed {
                reason: "no recording url".to_string(),
            };
            self.store.put(failed_report(record, &outcome))?;
            return Ok(outcome);
        }

        match self.analyzer.analyze(record).await {
            Ok(document) => {
                self.store.put(AnalysisReport {
                    key: record.key.clone(),
                    outcome: AnalysisOutcome::Success,
                    document,
                    produced_at: Utc::now(),
                })?;
                tracing::info!(event = "reconcile.record_processed", key = %record.key);
                Ok(AnalysisOutcome::Success)
            }
            Err(error) => {
                tracing::warn!(
                    event = "reconcile.record_failed",
                    key = %record.key,
                    error = %error,
                );
                let outcome = AnalysisOutcome::Failed {
                    reason: failure_reason(&error),
                };
                self.store.put(failed_report(record, &outcome))?;
                Ok(outcome)
            }
        }
    }
}

fn failure_reason(error: &AnalyzerError) -> String {
    match error {
        AnalyzerError::Vendor { status, .. } => format!("vendor returned {status}"),
        other => other.to_string(),
    }
}

fn failed_report(record: &SourceRecord, outcome: &AnalysisOutcome) -> AnalysisReport {
    let reason = match outcome {
        AnalysisOutcome::Failed { reason } => reason.as_str(),
        AnalysisOutcome::Success => unreachable!("only failures produce error documents"),
    };
    AnalysisReport {
        key: record.key.clone(),
        outcome: outcome.clone(),
        document: json!({
            "Functional": {
                "Call_ID": record.key,
                "Store_Location": record.store_name,
                "error": reason,
            },
            "error": true,
            "timestamp": Utc::now().to_rfc3339(),
        }),
        produced_at: Utc::now(),
    }
}
