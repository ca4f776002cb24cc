pub mod analyzer;
pub mod auth;
pub mod call_stats;
pub mod feed;
pub mod reconcile;
pub mod store;

pub use analyzer::{AnalyzerError, CallAnalyzer, GeminiAnalyzer};
pub use auth::{AuthError, AuthService, Session};
pub use call_stats::{CallReport, CallReportSet, CallStats};
pub use feed::{CallFeed, CsvCallFeed, FeedError, SourceRecord};
pub use reconcile::{ReconcileEngine, ReconcileError, ReconcileReport};
pub use store::{AnalysisOutcome, AnalysisReport, RecordKey, ReportStore, StoreError};
