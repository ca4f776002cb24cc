//! Application-level error type shared across the binary and services.

use thiserror::Error;

use crate::config;
use crate::server;
use crate::services::analyzer::AnalyzerError;
use crate::services::feed::FeedError;
use crate::services::reconcile::ReconcileError;
use crate::services::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error(transparent)]
    Server(#[from] server::ServerError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
