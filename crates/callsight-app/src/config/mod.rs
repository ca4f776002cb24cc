//! Configuration loading and XDG path helpers.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub feed: FeedConfig,
    pub analyzer: AnalyzerConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// JSON file holding every persisted analysis report.
    pub results_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    /// CSV of raw call records to reconcile.
    pub calls_csv: PathBuf,
    /// CSV of enriched call reports served read-only.
    pub call_reports_csv: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    /// Vendor API key; when empty the process-environment fallback applies.
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub admin_email: String,
    pub admin_password: String,
    pub token_ttl_minutes: i64,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let data_dir = default_data_dir()?;
    let builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default(
            "storage.results_path",
            data_dir.join("video_reports.json").to_string_lossy().to_string(),
        )?
        .set_default(
            "feed.calls_csv",
            data_dir.join("calls.csv").to_string_lossy().to_string(),
        )?
        .set_default(
            "feed.call_reports_csv",
            data_dir
                .join("staff_quality_analysis_results.csv")
                .to_string_lossy()
                .to_string(),
        )?
        .set_default("analyzer.api_key", "")?
        .set_default("analyzer.model", "gemini-1.5-flash")?
        .set_default("analyzer.base_url", "https://generativelanguage.googleapis.com")?
        .set_default("analyzer.timeout_secs", 300)?
        .set_default("auth.admin_email", "admin@example.com")?
        .set_default("auth.admin_password", "")?
        .set_default("auth.token_ttl_minutes", 24 * 60)?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("CALLSIGHT").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "callsight", "callsight").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_data_dir() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}
