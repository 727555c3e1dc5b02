mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hoops_automation::{
    run_with_retry, shutdown_channel, AutomationConfig, DailyScheduler, EtlAutomation,
    ExtractorCommand, SchedulerConfig, SystemClock,
};
use hoops_core::{DatabaseSettings, Settings};
use hoops_db::LoadOutcome;
use hoops_etl::{AdvancedConfig, AdvancedTransformer, CoreConfig, CorePipeline, PipelineReport};
use hoops_extract::{ExtractorConfig, RemoteDatasetSource, StagingExtractor};
use hoops_storage::HttpClientConfig;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "hoops")]
#[command(about = "NBA playoffs statistics ETL")]
struct Cli {
    /// YAML settings file; built-in defaults apply when omitted.
    #[arg(long, global = true, env = "HOOPS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull the dataset into a new staging snapshot and promote the playoffs file.
    Extract {
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        staging: Option<PathBuf>,
        #[arg(long)]
        pattern: Option<String>,
    },
    /// Core transform and load of the playoffs file.
    Etl {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        staging: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[command(flatten)]
        db: DbArgs,
    },
    /// Advanced metrics over the most processed input available.
    Advanced {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        search_root: Option<PathBuf>,
        #[command(flatten)]
        db: DbArgs,
    },
    /// Extract then run the core pipeline, daily or once.
    Automate {
        /// Daily run time as HH:MM.
        #[arg(long)]
        time: Option<String>,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        staging: Option<PathBuf>,
        /// Run once with retries and exit.
        #[arg(long)]
        no_schedule: bool,
        #[command(flatten)]
        db: DbArgs,
    },
}

#[derive(Debug, Args)]
struct DbArgs {
    #[arg(long = "db-host", env = "HOOPS_DB_HOST")]
    host: Option<String>,
    #[arg(long = "db-port", env = "HOOPS_DB_PORT")]
    port: Option<u16>,
    #[arg(long = "db-name", env = "HOOPS_DB_NAME")]
    database: Option<String>,
    #[arg(long = "db-user", env = "HOOPS_DB_USER")]
    user: Option<String>,
    #[arg(long = "db-password", env = "HOOPS_DB_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Skip the load step entirely.
    #[arg(long)]
    no_db: bool,
}

impl DbArgs {
    fn apply(self, settings: &mut DatabaseSettings) {
        if let Some(host) = self.host {
            settings.host = host;
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(database) = self.database {
            settings.database = database;
        }
        if let Some(user) = self.user {
            settings.user = user;
        }
        if self.password.is_some() {
            settings.password = self.password;
        }
        if self.no_db {
            settings.enabled = false;
        }
    }
}

impl Commands {
    fn component(&self) -> &'static str {
        match self {
            Commands::Extract { .. } => "extraction",
            Commands::Etl { .. } => "etl",
            Commands::Advanced { .. } => "advanced_transform",
            Commands::Automate { .. } => "etl_automation",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(log_dir) = &cli.log_dir {
        settings.paths.log_dir = log_dir.clone();
    }
    if let Err(err) = logging::init(&settings.paths.log_dir, cli.command.component()) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli, settings).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, mut settings: Settings) -> Result<bool> {
    match cli.command {
        Commands::Extract {
            repo,
            staging,
            pattern,
        } => {
            if let Some(repo) = repo {
                settings.source.repo_url = repo;
            }
            if let Some(staging) = staging {
                settings.paths.staging_dir = staging;
            }
            if let Some(pattern) = pattern {
                settings.source.pattern = pattern;
            }
            let source = RemoteDatasetSource::new(HttpClientConfig::default())?;
            let extractor =
                StagingExtractor::new(ExtractorConfig::from_settings(&settings), Box::new(source));
            let report = extractor.run().await?;
            println!(
                "extraction complete: run_id={} snapshot={} files={} promoted={}",
                report.run_id,
                report.snapshot_dir.display(),
                report.manifest.file_count,
                report
                    .promoted_from
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "none".to_string()),
            );
            Ok(true)
        }
        Commands::Etl {
            input,
            staging,
            output_dir,
            db,
        } => {
            if let Some(staging) = staging {
                settings.paths.staging_dir = staging;
            }
            if let Some(output_dir) = output_dir {
                settings.paths.processed_dir = output_dir;
            }
            db.apply(&mut settings.database);
            let report = CorePipeline::new(CoreConfig::from_settings(&settings, input))
                .run()
                .await?;
            print_report("etl", &report);
            Ok(true)
        }
        Commands::Advanced {
            input,
            output_dir,
            search_root,
            db,
        } => {
            if let Some(output_dir) = output_dir {
                settings.paths.advanced_output_dir = output_dir;
            }
            if let Some(search_root) = search_root {
                settings.paths.search_root = search_root;
            }
            db.apply(&mut settings.database);
            let report = AdvancedTransformer::new(AdvancedConfig::from_settings(&settings, input))
                .run()
                .await?;
            print_report("advanced transform", &report);
            Ok(true)
        }
        Commands::Automate {
            time,
            repo,
            staging,
            no_schedule,
            db,
        } => {
            if let Some(time) = time {
                settings.automation.schedule_time = time;
            }
            if let Some(repo) = repo {
                settings.source.repo_url = repo;
            }
            if let Some(staging) = staging {
                settings.paths.staging_dir = staging;
            }
            db.apply(&mut settings.database);
            automate(cli.config, settings, no_schedule).await
        }
    }
}

async fn automate(config_file: Option<PathBuf>, settings: Settings, no_schedule: bool) -> Result<bool> {
    let scheduler_config = SchedulerConfig::from_settings(&settings.automation)?;
    let program = std::env::current_exe().context("locating the hoops executable")?;
    let mut extractor = ExtractorCommand::hoops(
        program,
        config_file.as_deref(),
        &settings.source.repo_url,
        &settings.paths.staging_dir,
    );
    extractor.args.extend([
        "--log-dir".to_string(),
        settings.paths.log_dir.display().to_string(),
    ]);

    let automation = Arc::new(EtlAutomation::new(AutomationConfig::from_settings(
        &settings, extractor,
    )));
    let clock = Arc::new(SystemClock);

    if no_schedule {
        info!("running automated etl once");
        return Ok(run_with_retry(&*automation, &scheduler_config.retry, &*clock).await);
    }

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested");
            trigger.trigger();
        }
    });

    info!(time = %scheduler_config.time, "starting daily scheduler");
    let summary = DailyScheduler::new(automation, clock, scheduler_config)
        .start(shutdown)
        .await;
    println!(
        "scheduler stopped: runs={} succeeded={} failed={} panicked={}",
        summary.runs, summary.succeeded, summary.failed, summary.panicked
    );
    Ok(true)
}

fn print_report(stage: &str, report: &PipelineReport) {
    let load = match &report.load {
        LoadOutcome::Skipped => "skipped".to_string(),
        LoadOutcome::Loaded(counts) => format!(
            "detailed={} season={} team={}",
            counts.detailed, counts.season, counts.team
        ),
        LoadOutcome::Failed(message) => format!("failed ({message})"),
    };
    println!(
        "{stage} complete: run_id={} input={} rows={} load={} marker={}",
        report.run_id,
        report.input.display(),
        report.rows,
        load,
        report.marker.display()
    );
}
