use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand, ValueEnum};
use crcwatch_api::{ClientConfig, DashboardApi, HttpApi, StaticDirApi};
use crcwatch_core::columns::{crc_columns, render_header, render_row};
use crcwatch_core::markdown::TerminalMarkdown;
use crcwatch_core::{LinkMode, Snapshot, KNOWN_RESULTS, KNOWN_STATES};
use crcwatch_ops::{CancelOutcome, Coordinator, CoordinatorError};
use crcwatch_search::{is_placeholder, FilterCriteria};
use crcwatch_store::{spawn_sync, SyncConfig};
use tracing::{info, warn};

mod console;

#[derive(Parser, Debug)]
#[command(name = "crcwatchctl", version, about = "Live status of test case run configurations")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    source: Source,

    #[command(subcommand)]
    command: Commands,
}

/// Where the state comes from.
#[derive(Args, Debug)]
struct Source {
    /// Dashboard base url, e.g. http://host:5000
    #[arg(long = "url", env = "CRCWATCH_URL", global = true)]
    url: Option<String>,

    /// Saved dashboard directory (read-only; cancel disabled)
    #[arg(long = "static-dir", env = "CRCWATCH_STATIC_DIR", global = true, conflicts_with = "url")]
    static_dir: Option<std::path::PathBuf>,

    /// The url serves a saved dashboard (read-only; cancel disabled)
    #[arg(long = "saved", action = ArgAction::SetTrue, global = true)]
    saved: bool,

    /// The dashboard predates filtered cancel
    #[arg(long = "legacy-backend", env = "CRCWATCH_LEGACY_BACKEND", action = ArgAction::SetTrue, global = true)]
    legacy_backend: bool,

    /// Request timeout in seconds
    #[arg(long = "timeout-secs", env = "CRCWATCH_HTTP_TIMEOUT_SECS", global = true, default_value_t = 5)]
    timeout_secs: u64,

    /// Poll period in milliseconds; 0 fetches once
    #[arg(long = "interval-ms", env = "CRCWATCH_REFRESH_MS", global = true, default_value_t = 1000)]
    interval_ms: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch once and list configurations passing the filter
    Ls {
        /// Filter query, e.g. plan:nightly state:running "config:arch:x86_64"
        filter: Vec<String>,
        /// Explain filter stages and counts
        #[arg(long = "explain", action = ArgAction::SetTrue)]
        explain: bool,
        /// Print log links under each row
        #[arg(long = "logs", action = ArgAction::SetTrue)]
        logs: bool,
    },
    /// List test plans with member counts
    Plans,
    /// Poll continuously, printing rows as they change; commands on stdin
    Watch {
        /// Initial filter query
        filter: Vec<String>,
    },
    /// Cancel configurations
    #[command(group(ArgGroup::new("scope").required(true).args(["crc", "plan", "all", "filtered"])))]
    Cancel {
        /// One configuration, in every plan it runs in
        #[arg(long = "crc")]
        crc: Option<String>,
        /// Every configuration of a plan
        #[arg(long = "plan")]
        plan: Option<String>,
        /// Everything
        #[arg(long = "all", action = ArgAction::SetTrue)]
        all: bool,
        /// Configurations matching a filter query
        #[arg(long = "filtered")]
        filtered: Option<String>,
        /// Plan context for --filtered
        #[arg(long = "in-plan", requires = "filtered")]
        in_plan: Option<String>,
        /// Answer yes to the confirmation
        #[arg(long = "yes", short = 'y', action = ArgAction::SetTrue)]
        yes: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("CRCWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CRCWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CRCWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

fn build_api(source: &Source) -> Result<Arc<dyn DashboardApi>> {
    if let Some(dir) = &source.static_dir {
        info!(dir = %dir.display(), "using saved dashboard directory");
        return Ok(Arc::new(StaticDirApi::new(dir.clone())));
    }
    let url = source.url.clone().context("no state source: pass --url (CRCWATCH_URL) or --static-dir (CRCWATCH_STATIC_DIR)")?;
    let mode = if source.saved { LinkMode::Static } else { LinkMode::Live };
    let cfg = ClientConfig::new(url)
        .with_timeout(Duration::from_secs(source.timeout_secs))
        .with_mode(mode)
        .with_filtered_cancel(!source.legacy_backend);
    Ok(Arc::new(HttpApi::new(cfg)?))
}

/// Saved dashboards never refresh on their own.
fn effective_interval(api: &dyn DashboardApi, interval_ms: u64) -> Duration {
    match api.link_mode() {
        LinkMode::Static => Duration::ZERO,
        LinkMode::Live => Duration::from_millis(interval_ms),
    }
}

fn parse_filter(words: &[String]) -> FilterCriteria {
    let criteria = FilterCriteria::parse(&words.join(" "));
    if !is_placeholder(&criteria.state) && !KNOWN_STATES.contains(&criteria.state.as_str()) {
        warn!(state = %criteria.state, known = ?KNOWN_STATES, "unknown state; the filter may match nothing");
    }
    if !is_placeholder(&criteria.result) && !KNOWN_RESULTS.contains(&criteria.result.as_str()) {
        warn!(result = %criteria.result, known = ?KNOWN_RESULTS, "unknown result; the filter may match nothing");
    }
    criteria
}

async fn fetch_snapshot(api: &dyn DashboardApi) -> Result<Snapshot> {
    let t0 = Instant::now();
    let items = api.fetch_state().await.context("state query failed")?;
    info!(items = items.len(), took_ms = %t0.elapsed().as_millis(), "state fetched");
    Ok(Snapshot::new(1, items))
}

fn confirm_on_stdin(prompt: &str) -> Result<bool> {
    eprint!("{} [y/N] ", prompt);
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "YES"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let api = build_api(&cli.source)?;

    match cli.command {
        Commands::Ls { filter, explain, logs } => {
            let criteria = parse_filter(&filter);
            info!(query = %filter.join(" "), "ls invoked");
            let snap = fetch_snapshot(api.as_ref()).await?;
            let (matched, dbg) = criteria.evaluate(&snap);
            let rows: Vec<_> = matched.iter().filter_map(|id| snap.get(id)).collect();

            match cli.output {
                Output::Human => {
                    let cols = crc_columns();
                    let md = TerminalMarkdown;
                    println!("{}", render_header(&cols));
                    for crc in &rows {
                        println!("{}", render_row(crc, &cols, &md));
                        if logs {
                            for (name, url) in crc.log_links(api.link_mode(), &api.logs_root()) {
                                println!("    {:<24} {}", name, url);
                            }
                        }
                    }
                }
                Output::Json => {
                    if explain {
                        #[derive(serde::Serialize)]
                        struct Explain<'a, T> { items: T, debug: &'a crcwatch_search::FilterDebugInfo }
                        println!("{}", serde_json::to_string_pretty(&Explain { items: &rows, debug: &dbg })?);
                    } else {
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                    }
                }
            }
            if explain && matches!(cli.output, Output::Human) {
                eprintln!(
                    "debug: total={} after_testcase={} after_testplan={} after_configuration={} after_state={} after_result={} after_workflow={}",
                    dbg.total, dbg.after_testcase, dbg.after_testplan, dbg.after_configuration, dbg.after_state, dbg.after_result, dbg.after_workflow
                );
            }
        }
        Commands::Plans => {
            info!("plans invoked");
            let snap = fetch_snapshot(api.as_ref()).await?;
            #[derive(serde::Serialize)]
            struct PlanRow { plan: String, total: usize, active: usize }
            let rows: Vec<PlanRow> = snap
                .plans()
                .into_iter()
                .map(|plan| {
                    let (total, active) = snap.plan_members(&plan).fold((0, 0), |(t, a), c| (t + 1, a + usize::from(c.active)));
                    PlanRow { plan, total, active }
                })
                .collect();
            match cli.output {
                Output::Human => {
                    println!("{:<40} {:>6} {:>6}", "PLAN", "TOTAL", "ACTIVE");
                    for r in &rows {
                        println!("{:<40} {:>6} {:>6}", r.plan, r.total, r.active);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Watch { filter } => {
            let interval = effective_interval(api.as_ref(), cli.source.interval_ms);
            info!(interval_ms = interval.as_millis() as u64, query = %filter.join(" "), "watch invoked");
            let sink = console::TerminalSink::new(cli.output);
            let sync = spawn_sync(Arc::clone(&api), sink, SyncConfig::from_env(interval));
            if !filter.is_empty() {
                sync.set_filter(parse_filter(&filter)).await?;
            }
            if matches!(cli.output, Output::Human) {
                eprintln!("type help for commands, quit or Ctrl-C to stop");
            }
            console::run(api, sync).await?;
            warn!("watch loop ended (graceful shutdown)");
        }
        Commands::Cancel { crc, plan, all, filtered, in_plan, yes } => {
            let mut co = Coordinator::new(Arc::clone(&api));
            let md = TerminalMarkdown;
            let attempt = if let Some(id) = crc {
                let snap = fetch_snapshot(api.as_ref()).await?;
                co.cancel_one(&id, &snap)
            } else if let Some(plan) = plan {
                co.cancel_plan(&plan)
            } else if all {
                co.cancel_all()
            } else if let Some(query) = filtered {
                let snap = fetch_snapshot(api.as_ref()).await?;
                let (matched, _) = parse_filter(std::slice::from_ref(&query)).evaluate(&snap);
                info!(matched = matched.len(), plan = ?in_plan, "filtered cancel");
                co.cancel_filtered(matched.ids(), in_plan.as_deref())
            } else {
                bail!("no cancel scope given");
            };

            let outcome = match attempt {
                Ok(outcome) => outcome,
                Err(e @ (CoordinatorError::FilterUnavailable | CoordinatorError::NothingToCancel)) => {
                    if let Some(d) = co.dialog() {
                        console::print_dialog(&d.view(), &md);
                    }
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            };
            let outcome = match outcome {
                CancelOutcome::AwaitingConfirmation => {
                    if let Some(d) = co.dialog() {
                        console::print_dialog(&d.view(), &md);
                    }
                    let accepted = yes || confirm_on_stdin("Proceed?")?;
                    co.press(if accepted { "yes" } else { "no" })?
                }
                other => other,
            };
            match outcome {
                CancelOutcome::Dispatched(handle) => {
                    handle.await?.context("cancel request failed")?;
                    match cli.output {
                        Output::Human => println!("cancel sent"),
                        Output::Json => println!("{}", serde_json::json!({ "sent": true })),
                    }
                }
                _ => match cli.output {
                    Output::Human => println!("nothing canceled"),
                    Output::Json => println!("{}", serde_json::json!({ "sent": false })),
                },
            }
        }
    }

    Ok(())
}
