use anyhow::{bail, Context};
use chrono::Utc;
use forecast_pipeline::cli::{ReplayArgs, ResolveArgs, RunArgs};
use forecast_pipeline::config::{AppConfig, LoggingConfig};
use forecast_pipeline::dump::{replay_run, ReplayOptions};
use forecast_pipeline::experiments::{build_manifest, ManifestConfiguration, SuiteRegistry};
use forecast_pipeline::ingestion::GammaClient;
use forecast_pipeline::llm::LlmRuntime;
use forecast_pipeline::persistence::{InMemoryStore, PostgresStore};
use forecast_pipeline::pipeline::{write_json_report, PipelineRunner, RunOptions};
use forecast_pipeline::resolution::{ResolutionOptions, ResolutionSweep};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "forecast-pipeline.log";

pub fn load_config(config_dir: &Path) -> anyhow::Result<AppConfig> {
    let config = AppConfig::load_from(config_dir)
        .with_context(|| format!("failed to load configuration from {}", config_dir.display()))?;
    if let Err(errors) = config.validate() {
        bail!("invalid configuration: {}", errors.join("; "));
    }
    Ok(config)
}

/// Writable log directory: `FORECAST_LOG_DIR`, then `LOG_DIR`, then the configured one
fn log_dir(logging: &LoggingConfig) -> Option<String> {
    let dir = std::env::var("FORECAST_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .ok()
        .or_else(|| logging.dir.clone())?;

    // `rolling::daily` panics when it cannot create the first file.
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("Warning: Could not create log directory {} ({}), file logging disabled", dir, e);
        return None;
    }
    let marker = Path::new(&dir).join(".forecast_write_test");
    match std::fs::OpenOptions::new().create(true).append(true).open(&marker) {
        Ok(_) => {
            let _ = std::fs::remove_file(&marker);
            Some(dir)
        }
        Err(e) => {
            eprintln!(
                "Warning: Could not write to log directory {} ({}), file logging disabled",
                dir, e
            );
            None
        }
    }
}

pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},forecast_pipeline=debug,sqlx=warn",
            logging.level
        ))
    });

    let dir = log_dir(logging);
    let file_layer = dir.as_ref().map(|dir| {
        let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // The process exits right after the command finishes; keep the writer flushing until then.
        Box::leak(Box::new(guard));
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
    });

    let (json_layer, text_layer) = if logging.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();

    if let Some(dir) = dir {
        eprintln!("Logging to: {}/{}", dir, LOG_FILE);
    }
}

async fn connect(config: &AppConfig) -> anyhow::Result<PostgresStore> {
    let store = PostgresStore::new(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to the database")?;
    store.migrate().await?;
    Ok(store)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_pipeline(config: &AppConfig, args: &RunArgs) -> anyhow::Result<()> {
    let registry = SuiteRegistry::from_config(config)?;
    let suites = registry.load(&args.suites)?;
    let selection = args.selection();

    if args.list_experiments {
        let mut manifest = build_manifest(&suites, &selection, Utc::now());
        manifest.configuration = Some(ManifestConfiguration::new(
            args.stage.as_str(),
            &args.suites,
            &selection,
        ));
        return print_json(&manifest);
    }

    let llm = Arc::new(LlmRuntime::from_config(&config.llm)?);
    let source = GammaClient::new(&config.ingestion)?;

    let mut options = RunOptions::new(
        Utc::now().date_naive(),
        args.window_days.unwrap_or(config.pipeline.window_days),
    );
    options.target_date = args.target_date;
    options.dry_run = args.dry_run;
    options.limit = args.limit;
    options.selection = selection;
    options.debug_dump_dir = args.dump_dir(config.pipeline.debug_dump_dir.as_ref());
    options.summary_path = args.summary_path.clone();
    options.git_sha = std::env::var("GIT_SHA").ok().filter(|s| !s.is_empty());

    let summary = if args.dry_run {
        info!("Dry run: results are not persisted");
        let store = InMemoryStore::new();
        PipelineRunner::new(config, &source, &store, llm)
            .run(&suites, &options)
            .await?
    } else {
        let store = connect(config).await?;
        PipelineRunner::new(config, &source, &store, llm)
            .run(&suites, &options)
            .await?
    };
    print_json(&summary)
}

pub async fn run_replay(config: &AppConfig, args: &ReplayArgs) -> anyhow::Result<()> {
    let Some(dump_dir) = args
        .dump_dir
        .clone()
        .or_else(|| config.pipeline.debug_dump_dir.clone())
    else {
        bail!("no dump directory given and pipeline.debug_dump_dir is not configured");
    };

    let options = ReplayOptions {
        run_id: args.run_id.clone(),
        dump_dir,
        events: args.events.clone(),
        skip_market_upsert: args.skip_market_upsert,
        dry_run: args.dry_run,
    };

    let summary = if args.dry_run {
        replay_run(&options, &InMemoryStore::new()).await?
    } else {
        let store = connect(config).await?;
        replay_run(&options, &store).await?
    };
    if summary.events_failed > 0 {
        warn!("Replay finished with {} failed events", summary.events_failed);
    }
    print_json(&summary)
}

pub async fn run_resolution(config: &AppConfig, args: &ResolveArgs) -> anyhow::Result<()> {
    let source = GammaClient::new(&config.ingestion)?;
    let store = connect(config).await?;
    let options = ResolutionOptions {
        limit: args.limit,
        batch_size: args.batch_size,
        event_ids: args.event_ids.clone(),
        recent_hours: args.recent_hours,
    };

    let summary = ResolutionSweep::new(config, &source, &store)
        .run(&options)
        .await?;
    if let Some(path) = &args.summary_path {
        write_json_report(path, &summary)?;
        info!("Resolution summary written to {}", path.display());
    }
    print_json(&summary)
}

pub async fn run_migrations(config: &AppConfig) -> anyhow::Result<()> {
    connect(config).await?;
    Ok(())
}
