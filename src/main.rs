//! permit-pilot - files express mechanical permits through the county portal
//!
//! ```bash
//! permit-pilot enqueue request.json
//! permit-pilot --headless --limit 5
//! permit-pilot confirm-payment 7f3c... --reference CHK-1182
//! permit-pilot --submission-id 7f3c...
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use permit_pilot::batch::{BatchRunner, BatchSummary};
use permit_pilot::browser::SessionFactory;
use permit_pilot::cli::{print_banner, print_error, print_info, print_status, print_success, print_summary, print_warning};
use permit_pilot::core::{ConfigManager, OrchestratorConfig, SubmissionRequest};
use permit_pilot::logging::SystemLogger;
use permit_pilot::orchestrator::{CheckpointStore, SqliteCheckpointStore, StaticAnalyzer, StepAnalyzer, StepSequencer, VisionAnalyzer};
use permit_pilot::queue::{QueueStatus, SubmissionQueue};

#[derive(Parser)]
#[command(name = "permit-pilot")]
#[command(version)]
#[command(about = "Files express mechanical permits by driving the county permit portal")]
#[command(long_about = r#"
Works through the submission queue: each request is filed through the
portal's application wizard, paused for manual fee payment, and finished
with the issued permit number once payment is confirmed.

Examples:
  permit-pilot enqueue request.json
  permit-pilot --dry-run
  permit-pilot --headless --limit 5
  permit-pilot confirm-payment <id> --reference CHK-1182
  permit-pilot status <id>
"#)]
struct Args {
    /// Process only this submission
    #[arg(long, value_name = "ID")]
    submission_id: Option<String>,

    /// Run the browser without a window
    #[arg(long, env = "PERMIT_PILOT_HEADLESS")]
    headless: bool,

    /// List pending submissions without executing them
    #[arg(long)]
    dry_run: bool,

    /// Maximum submissions to process (default from config, 10)
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Config file (default: <config dir>/permit-pilot/config.toml)
    #[arg(long, value_name = "PATH", env = "PERMIT_PILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Never call the vision model; adaptive steps rely on heuristics only
    #[arg(long)]
    no_vision: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a submission request (JSON file) to the queue
    Enqueue { file: PathBuf },

    /// Record that the permit fee was paid outside the tool
    ConfirmPayment {
        id: String,
        /// Receipt or check number
        #[arg(long)]
        reference: Option<String>,
    },

    /// Show the checkpoint and queue row of a submission
    Status { id: String },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.debug, args.log_json);

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}

fn init_tracing(debug: bool, json: bool) {
    let default = if debug { "permit_pilot=debug,audit=debug" } else { "permit_pilot=info,audit=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

async fn run(args: Args) -> Result<i32> {
    let manager = match &args.config {
        Some(path) => ConfigManager::at(path),
        None => ConfigManager::new(),
    };
    let config = manager
        .load()
        .with_context(|| format!("loading config from {}", manager.path().display()))?;

    let audit = Arc::new(SystemLogger::new());
    let store = Arc::new(
        SqliteCheckpointStore::open(&config.storage.database_path).context("opening checkpoint database")?,
    );
    let queue = Arc::new(SubmissionQueue::open(&config.storage.database_path).context("opening submission queue")?);

    if let Some(command) = args.command {
        return match command {
            Commands::Enqueue { file } => enqueue(&queue, &file),
            Commands::ConfirmPayment { id, reference } => {
                let sequencer = StepSequencer::new(config, store, Arc::new(StaticAnalyzer::disabled()), audit);
                sequencer.confirm_payment(&id, reference.as_deref())?;
                if let Err(e) = queue.set_status(&id, QueueStatus::PaymentReceived, None) {
                    print_warning(&format!("Checkpoint updated but queue row not: {}", e));
                }
                print_success(&format!("Payment recorded for {}; the next run will finish it", id));
                Ok(0)
            }
            Commands::Status { id } => {
                let checkpoint = store.load_checkpoint(&id)?;
                let item = queue.get(&id)?;
                if checkpoint.is_none() && item.is_none() {
                    bail!("no submission with id {}", id);
                }
                print_status(checkpoint.as_ref(), item.as_ref());
                Ok(0)
            }
        };
    }

    print_banner();

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
        eprintln!("\nStopping after the current step...");
    }) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }

    let limit = args.limit.unwrap_or(config.batch.default_limit);
    let sessions = session_factory(&config, args.headless, args.dry_run)?;
    let analyzer = build_analyzer(&config, args.no_vision);
    let sequencer = StepSequencer::new(config, store, analyzer, audit.clone()).with_cancel_flag(cancel);
    let runner = BatchRunner::new(Arc::new(sequencer), queue, sessions, audit);

    let summary = match &args.submission_id {
        Some(id) if args.dry_run => {
            let item = runner.list_one(id).with_context(|| format!("looking up {} (enqueue it first)", id))?;
            BatchSummary { items: vec![item], dry_run: true, ..Default::default() }
        }
        Some(id) => {
            let item = runner
                .run_one(id)
                .await
                .with_context(|| format!("processing {} (enqueue it first)", id))?;
            BatchSummary { items: vec![item], ..Default::default() }
        }
        _ => runner.run_batch(limit, args.dry_run).await?,
    };

    print_summary(&summary);
    if summary.stopped_early.as_deref() == Some("cancelled") {
        return Ok(130);
    }
    Ok(0)
}

fn enqueue(queue: &SubmissionQueue, file: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let request: SubmissionRequest =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;
    let request = request.with_generated_id();
    request.validate()?;

    let (id, inserted) = queue.enqueue(request)?;
    if inserted {
        print_success(&format!("Queued {}", id));
    } else {
        print_info(&format!("{} is already queued", id));
    }
    Ok(0)
}

fn build_analyzer(config: &OrchestratorConfig, no_vision: bool) -> Arc<dyn StepAnalyzer> {
    if no_vision {
        info!("Vision disabled by flag");
        return Arc::new(StaticAnalyzer::disabled());
    }
    match VisionAnalyzer::new(config.vision.clone()) {
        Ok(analyzer) => Arc::new(analyzer),
        Err(e) => {
            print_warning(&format!("Vision unavailable ({}); adaptive steps will use heuristics only", e));
            Arc::new(StaticAnalyzer::disabled())
        }
    }
}

#[cfg(feature = "browser")]
fn session_factory(config: &OrchestratorConfig, headless: bool, _dry_run: bool) -> Result<Arc<dyn SessionFactory>> {
    use permit_pilot::browser::playwright::PlaywrightSessionFactory;
    use permit_pilot::browser::session::FileSessionStore;

    let store = Arc::new(FileSessionStore::new(&config.storage.session_path));
    Ok(Arc::new(PlaywrightSessionFactory::new(headless, store)))
}

#[cfg(not(feature = "browser"))]
fn session_factory(_config: &OrchestratorConfig, _headless: bool, dry_run: bool) -> Result<Arc<dyn SessionFactory>> {
    if !dry_run {
        bail!("permit-pilot was built without the `browser` feature; rebuild with --features browser");
    }
    Ok(Arc::new(NoBrowser))
}

/// Stand-in for dry runs of a build without a browser driver
#[cfg(not(feature = "browser"))]
struct NoBrowser;

#[cfg(not(feature = "browser"))]
#[async_trait::async_trait]
impl SessionFactory for NoBrowser {
    async fn open(
        &self,
        _submission_id: &str,
    ) -> permit_pilot::browser::BrowserResult<Box<dyn permit_pilot::browser::PortalSession>> {
        Err(permit_pilot::browser::BrowserError::Driver("no browser driver in this build".into()))
    }
}
