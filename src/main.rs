use anyhow::{bail, Context, Result};
use page_beacon::config::{default_config_path, load_config, resolve_config};
use page_beacon::hooks::{DispatchHook, HookedSender, JsonlDispatchLog, TracingHook};
use page_beacon::page::{load_snapshot, PageEnvironment, StaticPage};
use page_beacon::sender::{BestEffortSender, HttpSender, RecordingSender};
use page_beacon::tracker::Tracker;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::FmtSubscriber;

const USAGE: &str = "Usage: beacon-replay [--config PATH] [--dry-run] [--debug-log PATH] [--verbose] [--click ID]... <page.toml>";

struct CliArgs {
    page_file: PathBuf,
    config: Option<PathBuf>,
    debug_log: Option<PathBuf>,
    clicks: Vec<String>,
    dry_run: bool,
    verbose: bool,
}

fn parse_cli_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut page_file = None;
    let mut config = None;
    let mut debug_log = None;
    let mut clicks = Vec::new();
    let mut dry_run = false;
    let mut verbose = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "--debug-log" | "--click" => {
                let Some(value) = args.next() else {
                    eprintln!("Warning: {} requires a value; ignoring.", arg);
                    continue;
                };
                match arg.as_str() {
                    "--config" => config = Some(PathBuf::from(value)),
                    "--debug-log" => debug_log = Some(PathBuf::from(value)),
                    _ => clicks.push(value),
                }
            }
            "--dry-run" => dry_run = true,
            "--verbose" | "-v" => verbose = true,
            "--help" | "-h" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other if page_file.is_none() => page_file = Some(PathBuf::from(other)),
            other => eprintln!("Warning: ignoring extra argument '{}'.", other),
        }
    }

    let Some(page_file) = page_file else {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    };

    CliArgs {
        page_file,
        config,
        debug_log,
        clicks,
        dry_run,
        verbose,
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .json()
        .with_writer(BoxMakeWriter::new(std::io::stderr))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_cli_args();
    init_logging(args.verbose)?;

    let config_path = match &args.config {
        Some(path) if !path.exists() => bail!("config file {} does not exist", path.display()),
        Some(path) => path.clone(),
        None => default_config_path(),
    };
    let resolved = resolve_config(load_config(&config_path).as_ref());
    for warning in &resolved.warnings {
        warn!("{}", warning);
    }

    let snapshot = load_snapshot(&args.page_file)?;
    let page = Arc::new(StaticPage::from_snapshot(snapshot));

    let mut recorder = None;
    let mut http = None;
    let base: Arc<dyn BestEffortSender> = if args.dry_run {
        let sender =
            Arc::new(RecordingSender::new().with_beacon_limit(resolved.max_payload_bytes));
        recorder = Some(Arc::clone(&sender));
        sender as Arc<dyn BestEffortSender>
    } else {
        let sender = Arc::new(
            HttpSender::new(resolved.sender_options()).context("failed to set up http sender")?,
        );
        http = Some(Arc::clone(&sender));
        sender as Arc<dyn BestEffortSender>
    };

    let mut hooks: Vec<Arc<dyn DispatchHook>> = vec![Arc::new(TracingHook)];
    if let Some(path) = &args.debug_log {
        hooks.push(Arc::new(JsonlDispatchLog::new(path)?));
    }
    let sender: Arc<dyn BestEffortSender> = Arc::new(HookedSender::new(base, hooks));

    let env: Arc<dyn PageEnvironment> = page.clone();
    let tracker = Tracker::new(env, sender)
        .with_endpoints(resolved.endpoints.clone())
        .with_selectors(resolved.selectors.clone());
    let report = tracker.initialize()?;

    let mut replayed = 0usize;
    for id in &args.clicks {
        match page.click(id) {
            Some(outcome) => {
                replayed += 1;
                info!(
                    anchor = %id,
                    listeners = outcome.listeners_run,
                    navigate_to = outcome.navigate_to.as_deref().unwrap_or(""),
                    "click replayed"
                );
            }
            None => warn!(anchor = %id, "no anchor with that id; skipping click"),
        }
    }

    // Page teardown: deliveries already handed off keep going.
    drop(tracker);
    drop(page);

    if let Err(error) = report.page_view.await {
        warn!(error = %error, "page-view task ended abnormally");
    }
    if let Some(http) = &http {
        http.drain().await;
    }

    let dispatches = recorder
        .as_ref()
        .map(|recorder| recorder.dispatches())
        .unwrap_or_default();
    let summary = json!({
        "page": report.page,
        "bound": {
            "outbound": report.bindings.outbound,
            "downloads": report.bindings.downloads,
        },
        "clicks_replayed": replayed,
        "dry_run": args.dry_run,
        "dispatches": dispatches,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
