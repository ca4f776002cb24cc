use std::{process, sync::Arc, time::Duration};

use tracing_subscriber::{filter::LevelFilter, fmt};

use callsight_app::cli::{Cli, Commands, PreprocessArgs};
use callsight_app::config;
use callsight_app::error::AppError;
use callsight_app::server::{self, AppState};
use callsight_app::services::{
    AuthService, CallReportSet, CsvCallFeed, GeminiAnalyzer, ReconcileEngine, ReportStore,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Serve(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        Some(Commands::Preprocess(_)) => match cli.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        None => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => {
            let config = config::load()?;
            let state = build_state(&config)?;
            server::serve(&config.server.listen_addr, Arc::new(state)).await?;
        }
        Some(Commands::Preprocess(args)) => {
            run_preprocess(args).await?;
        }
        None => {
            Cli::print_help();
        }
    }

    Ok(())
}

fn build_state(config: &config::AppConfig) -> Result<AppState, AppError> {
    let store = Arc::new(ReportStore::open(&config.storage.results_path)?);
    let analyzer = build_analyzer(&config.analyzer)?;
    let engine = ReconcileEngine::new(store, analyzer);

    let feed = Arc::new(CsvCallFeed::new(&config.feed.calls_csv));
    let auth = Arc::new(AuthService::new(
        &config.auth.admin_email,
        &config.auth.admin_password,
        chrono::Duration::minutes(config.auth.token_ttl_minutes),
    ));
    if !auth.is_configured() {
        tracing::warn!("no admin password configured; every login will be rejected");
    }
    let call_reports = CallReportSet::new(&config.feed.call_reports_csv);

    Ok(AppState {
        engine,
        feed,
        auth,
        call_reports,
    })
}

fn build_analyzer(
    config: &config::AnalyzerConfig,
) -> Result<Arc<dyn callsight_app::services::CallAnalyzer>, AppError> {
    let api_key = if config.api_key.trim().is_empty() {
        GeminiAnalyzer::key_from_env().unwrap_or_default()
    } else {
        config.api_key.clone()
    };

    let analyzer = GeminiAnalyzer::builder(api_key)
        .model(&config.model)
        .base_url(&config.base_url)
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    Ok(Arc::new(analyzer))
}

async fn run_preprocess(args: PreprocessArgs) -> Result<(), AppError> {
    let config = config::load()?;
    let state = build_state(&config)?;

    let report = state.engine.reconcile_all(state.feed.as_ref()).await?;
    println!(
        "reconciliation pass finished: {} newly processed, {} already reconciled, {} failed",
        report.newly_processed, report.already_reconciled, report.failed
    );

    if args.list {
        for (key, stored) in state.engine.store().list_all() {
            let status = if stored.outcome.is_success() {
                "success"
            } else {
                "failed"
            };
            println!("{key}\t{status}");
        }
    }

    Ok(())
}
