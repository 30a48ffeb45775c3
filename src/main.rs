use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use asp_harvester::chrome::ChromeSession;
use asp_harvester::config::Settings;
use asp_harvester::executor::ActionExecutor;
use asp_harvester::interpreter::GeminiInterpreter;
use asp_harvester::notify::Notifier;
use asp_harvester::runner::{Runner, SessionFactory};
use asp_harvester::scenario::ScenarioSource;
use asp_harvester::session::BrowserSession;
use asp_harvester::store::{RecordStore, SqliteStore};
use asp_harvester::types::ExecutionType;

/// Collects affiliate revenue figures from ASP portals by driving a browser
/// through per-ASP scenarios.
#[derive(Parser)]
#[command(name = "asp-harvester", version)]
struct Cli {
    /// Single ASP to run, by scenario key.
    #[arg(long, conflicts_with = "all")]
    asp: Option<String>,

    /// Run every ASP that has a scenario.
    #[arg(long)]
    all: bool,

    #[arg(long, value_enum, default_value = "daily")]
    execution_type: ExecutionType,

    /// Show the browser window instead of running headless.
    #[arg(long)]
    no_headless: bool,

    /// SQLite database path (overrides DATABASE_PATH).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory of declarative scenario files (overrides SCENARIOS_DIR).
    #[arg(long)]
    scenarios_dir: Option<PathBuf>,

    /// Render declarative scenarios to JSON and stamp them onto the
    /// matching ASP rows, then exit.
    #[arg(long)]
    sync_scenarios: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(db) = cli.db {
        settings.database_path = db;
    }
    if let Some(dir) = cli.scenarios_dir {
        settings.scenarios_dir = dir;
    }
    if cli.no_headless {
        settings.headless = false;
    }

    let store = Arc::new(SqliteStore::open(&settings.database_path)?);
    let source = ScenarioSource::new(settings.scenarios_dir.clone(), store.clone());

    if cli.sync_scenarios {
        source.sync_to_store()?;
        return Ok(ExitCode::SUCCESS);
    }

    let targets: Vec<String> = if let Some(asp) = cli.asp {
        vec![asp]
    } else if cli.all {
        let mut names = source.list_files();
        for name in store.list_scenario_asps()? {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.sort();
        names
    } else {
        anyhow::bail!("pass --asp <name> or --all");
    };
    if targets.is_empty() {
        warn!("no scenarios found, nothing to do");
        return Ok(ExitCode::SUCCESS);
    }

    if settings.google_api_key.is_empty() {
        warn!("GOOGLE_API_KEY not set; free-text scenario steps will fail to interpret");
    }
    let interpreter = Arc::new(GeminiInterpreter::new(
        settings.google_api_key.clone(),
        settings.gemini_model.clone(),
    )?);
    let executor = ActionExecutor::new(store.clone() as Arc<dyn RecordStore>);
    let headless = settings.headless;
    let sessions: SessionFactory = Arc::new(move || {
        ChromeSession::launch(headless).map(|s| Box::new(s) as Box<dyn BrowserSession>)
    });
    let runner = Runner::new(
        source,
        store.clone() as Arc<dyn RecordStore>,
        interpreter,
        executor,
        sessions,
        settings.screenshots_dir.clone(),
    );

    let reports = runner
        .run_batch(
            &targets,
            cli.execution_type,
            Duration::from_secs(settings.run_delay_secs),
        )
        .await;

    let succeeded = reports.iter().filter(|r| r.success).count();
    let records: u32 = reports.iter().map(|r| r.records_saved).sum();
    info!(
        succeeded,
        total = reports.len(),
        records,
        "batch finished"
    );

    Notifier::new(settings.slack_webhook_url.clone())
        .send_batch_summary(&reports, cli.execution_type.as_str())
        .await;

    if succeeded == reports.len() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
