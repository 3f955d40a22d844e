use clap::{Args, Parser, Subcommand, ValueEnum};
use chrono::NaiveDate;
use std::path::PathBuf;

use crate::experiments::{Stage, StageSelection};

#[derive(Parser, Debug)]
#[command(name = "forecast-pipeline")]
#[command(version = "0.1.0")]
#[command(about = "Daily research and forecast experiment pipeline for prediction markets", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and <FORECAST_ENV>.toml
    #[arg(long, global = true, default_value = "config")]
    pub config_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daily pipeline for markets closing in the target window
    Run(RunArgs),
    /// Persist a previous run's debug dumps
    Replay(ReplayArgs),
    /// Reconcile market and event resolution with the upstream catalogue
    Resolve(ResolveArgs),
    /// Apply database migrations
    Migrate,
}

/// Stages to execute
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageArg {
    Research,
    Forecast,
    #[default]
    Both,
}

impl StageArg {
    pub fn stages(self) -> Vec<Stage> {
        match self {
            StageArg::Research => vec![Stage::Research],
            StageArg::Forecast => vec![Stage::Forecast],
            StageArg::Both => Stage::ALL.to_vec(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageArg::Research => "research",
            StageArg::Forecast => "forecast",
            StageArg::Both => "both",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Days ahead of the run date to target
    #[arg(long)]
    pub window_days: Option<i64>,

    /// Explicit close date (YYYY-MM-DD); must not be before the run date
    #[arg(long)]
    pub target_date: Option<NaiveDate>,

    /// Execute experiments without persisting anything
    #[arg(long)]
    pub dry_run: bool,

    /// Stop after this many markets
    #[arg(long)]
    pub limit: Option<usize>,

    /// Write the run summary JSON here
    #[arg(long)]
    pub summary_path: Option<PathBuf>,

    /// Suite ids to run (repeatable); defaults to every registered suite
    #[arg(long = "suite")]
    pub suites: Vec<String>,

    #[arg(long, value_enum, default_value_t = StageArg::Both)]
    pub stage: StageArg,

    /// Comma-separated research variants (`name` or `suite:name`)
    #[arg(long)]
    pub include_research: Option<String>,

    /// Comma-separated forecast variants (`name` or `suite:name`)
    #[arg(long)]
    pub include_forecast: Option<String>,

    /// Write per-event debug dumps under this directory
    #[arg(long)]
    pub debug_dump_dir: Option<PathBuf>,

    /// Disable debug dumps even when configured
    #[arg(long, conflicts_with = "debug_dump_dir")]
    pub no_debug_dump: bool,

    /// Print the experiment manifest and exit
    #[arg(long)]
    pub list_experiments: bool,
}

impl RunArgs {
    pub fn selection(&self) -> StageSelection {
        StageSelection::new(
            self.stage.stages(),
            self.include_research.as_deref(),
            self.include_forecast.as_deref(),
        )
    }

    /// CLI directory, then the configured one, unless dumps are disabled
    pub fn dump_dir(&self, configured: Option<&PathBuf>) -> Option<PathBuf> {
        if self.no_debug_dump {
            return None;
        }
        self.debug_dump_dir.clone().or_else(|| configured.cloned())
    }
}

#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    /// Run whose dumps are replayed
    #[arg(long)]
    pub run_id: String,

    /// Dump root; defaults to the configured debug dump directory
    #[arg(long)]
    pub dump_dir: Option<PathBuf>,

    /// Event keys to replay (repeatable)
    #[arg(long = "event")]
    pub events: Vec<String>,

    /// Do not refresh market and event rows
    #[arg(long)]
    pub skip_market_upsert: bool,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    #[arg(long)]
    pub limit: Option<i64>,

    #[arg(long)]
    pub batch_size: Option<i64>,

    /// Restrict to these events (repeatable)
    #[arg(long = "event-id")]
    pub event_ids: Vec<String>,

    /// Only markets synced within this many hours
    #[arg(long)]
    pub recent_hours: Option<f64>,

    #[arg(long)]
    pub summary_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::parse_from([
            "forecast-pipeline",
            "run",
            "--suite",
            "baseline",
            "--suite",
            "openai",
            "--stage",
            "research",
            "--target-date",
            "2025-03-04",
            "--include-research",
            "a,baseline:b",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.suites, vec!["baseline", "openai"]);
        assert_eq!(args.target_date, NaiveDate::from_ymd_opt(2025, 3, 4));
        let selection = args.selection();
        assert!(selection.is_active(Stage::Research));
        assert!(!selection.is_active(Stage::Forecast));
        assert_eq!(cli.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn test_no_debug_dump_wins() {
        let cli = Cli::parse_from(["forecast-pipeline", "run", "--no-debug-dump"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.dump_dir(Some(&PathBuf::from("/tmp/d"))), None);

        let cli = Cli::parse_from(["forecast-pipeline", "run"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(
            args.dump_dir(Some(&PathBuf::from("/tmp/d"))),
            Some(PathBuf::from("/tmp/d"))
        );
    }

    #[test]
    fn test_parse_replay_and_resolve() {
        let cli = Cli::parse_from([
            "forecast-pipeline",
            "--config-dir",
            "/etc/fp",
            "replay",
            "--run-id",
            "r1",
            "--event",
            "e1",
            "--event",
            "e2",
            "--skip-market-upsert",
        ]);
        assert_eq!(cli.config_dir, PathBuf::from("/etc/fp"));
        let Commands::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(args.events, vec!["e1", "e2"]);
        assert!(args.skip_market_upsert);

        let cli = Cli::parse_from(["forecast-pipeline", "resolve", "--event-id", "e9", "--recent-hours", "6"]);
        let Commands::Resolve(args) = cli.command else {
            panic!("expected resolve");
        };
        assert_eq!(args.event_ids, vec!["e9"]);
        assert_eq!(args.recent_hours, Some(6.0));
    }
}
