use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::json;
use stagehand_apply::KubePlatform;
use stagehand_autoscale::{Controller, ControllerConfig, DEFAULT_COOLDOWN};
use stagehand_core::{cancel_pair, parse_duration, CancelHandle, ConfigError, Labels, RolloutState, RolloutStatus};
use stagehand_ops::{KubeMetrics, KubeScaler};
use stagehand_persist::{RolloutRecord, SqliteStore, Store};
use stagehand_policy::{rules_from_specs, Direction};
use stagehand_rollout::{failures, Backoff, RolloutError, Sequencer, SequencerConfig};
use stagehand_store::{Catalog, LoadOptions, Plan, StateBoard};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stagehandctl", version, about = "Staged rollouts, network policy checks and autoscaling")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Target namespace
    #[arg(long = "ns", global = true, env = "STAGEHAND_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate definitions and print the stage order
    Plan {
        /// Manifest file or directory
        path: PathBuf,
        /// Add a stage-0 Namespace for --ns when none is defined
        #[arg(long = "create-namespace", action = ArgAction::SetTrue)]
        create_namespace: bool,
        /// Readiness timeout for resources that carry none
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,
    },
    /// Apply definitions stage by stage, waiting for readiness between stages
    Rollout {
        /// Manifest file or directory
        path: PathBuf,
        /// Readiness timeout for resources that carry none
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,
        /// Server-side dry run; nothing is persisted by the cluster
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Add a stage-0 Namespace for --ns when none is defined
        #[arg(long = "create-namespace", action = ArgAction::SetTrue)]
        create_namespace: bool,
        /// Skip recording the outcome in the history store
        #[arg(long = "no-history", action = ArgAction::SetTrue)]
        no_history: bool,
    },
    /// Show the most recently recorded rollout
    Status {
        /// Show this many past rollouts (requires --ns)
        #[arg(long)]
        history: Option<usize>,
    },
    /// Decide whether a flow is allowed by the NetworkPolicies in a manifest set
    Policy {
        /// Manifest file or directory
        path: PathBuf,
        /// Source workload labels, e.g. app=frontend,tier=web
        #[arg(long, value_parser = Labels::parse)]
        from: Labels,
        /// Destination workload labels
        #[arg(long, value_parser = Labels::parse)]
        to: Labels,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = "egress", value_parser = Direction::from_str)]
        direction: Direction,
    },
    /// Run the autoscaler for every HorizontalPodAutoscaler in a manifest set
    Autoscale {
        /// Manifest file or directory
        path: PathBuf,
        #[arg(long, value_parser = parse_duration, default_value = "15s")]
        interval: Duration,
        #[arg(long, value_parser = parse_duration)]
        cooldown: Option<Duration>,
        /// Tick each workload once and exit
        #[arg(long, action = ArgAction::SetTrue)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            if e.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let ns = cli.namespace.as_deref();
    match cli.command {
        Commands::Plan { path, create_namespace, timeout } => {
            info!(path = %path.display(), ns = ?ns, "plan invoked");
            let catalog = load_catalog(&path, ns, create_namespace)?;
            let plan = Plan::build(catalog.into_specs(), timeout)?;
            match cli.output {
                Output::Human => {
                    for stage in plan.stages() {
                        println!("stage {}", stage.index);
                        for s in &stage.resources {
                            let timeout = s.timeout.map(|t| format!("{}s", t.as_secs())).unwrap_or_else(|| "-".into());
                            let deps: Vec<String> = s.depends_on.iter().map(|d| d.to_string()).collect();
                            println!(
                                "  {:<40} readiness={:<12} timeout={:<6} {}{}",
                                s.id.to_string(),
                                s.readiness.as_str(),
                                timeout,
                                if s.optional { "optional " } else { "" },
                                if deps.is_empty() { String::new() } else { format!("after {}", deps.join(", ")) },
                            );
                        }
                    }
                }
                Output::Json => {
                    let stages: Vec<_> = plan
                        .stages()
                        .iter()
                        .map(|st| {
                            let resources: Vec<_> = st
                                .resources
                                .iter()
                                .map(|s| {
                                    json!({
                                        "id": s.id,
                                        "namespace": s.namespace,
                                        "readiness": s.readiness,
                                        "optional": s.optional,
                                        "timeout_secs": s.timeout.map(|t| t.as_secs_f64()),
                                        "depends_on": s.depends_on,
                                    })
                                })
                                .collect();
                            json!({ "stage": st.index, "resources": resources })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&stages)?);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rollout { path, timeout, dry_run, create_namespace, no_history } => {
            let ns = ns.context("rollout needs a target namespace (--ns)")?;
            info!(path = %path.display(), ns = %ns, dry_run, "rollout invoked");
            let catalog = load_catalog(&path, Some(ns), create_namespace)?;
            let plan = Plan::build(catalog.into_specs(), timeout)?;
            let board = StateBoard::new(RolloutState::new(plan.specs()));

            let platform = KubePlatform::connect(dry_run).await?;
            let config = SequencerConfig { default_timeout: timeout, backoff: Backoff::from_env() };
            let sequencer = Sequencer::new(platform, config);

            let (handle, signal) = cancel_pair();
            spawn_interrupt(handle);

            let mut epochs = board.subscribe_epoch();
            let mut shown = board.current();
            let rollout = sequencer.rollout_with_board(&plan, &board, signal);
            tokio::pin!(rollout);
            let outcome = loop {
                tokio::select! {
                    res = &mut rollout => break res,
                    Ok(()) = epochs.changed() => {
                        let now = board.current();
                        if cli.output == Output::Human {
                            print_transitions(&shown, &now);
                        }
                        shown = now;
                    }
                }
            };
            if cli.output == Output::Human {
                print_transitions(&shown, &board.current());
            }

            let (code, settled, summary, state) = match outcome {
                Ok(state) => {
                    let ready = state.count(RolloutStatus::Ready);
                    (ExitCode::SUCCESS, true, format!("settled: {}/{} ready", ready, state.resources.len()), state)
                }
                Err(RolloutError::Config(e)) => return Err(e.into()),
                Err(e) => {
                    let summary = e.to_string();
                    let state = e.partial_state().cloned().unwrap_or_default();
                    (ExitCode::FAILURE, false, summary, state)
                }
            };

            if !no_history && !dry_run {
                let rec = RolloutRecord::new(ns, settled, summary.clone(), state.clone());
                match SqliteStore::open_default().and_then(|s| s.put_rollout(&rec)) {
                    Ok(()) => info!(id = %rec.id, "rollout recorded"),
                    Err(e) => warn!(error = %e, "failed to record rollout history"),
                }
            }

            let failed = failures(&state);
            match cli.output {
                Output::Human => {
                    for f in &failed {
                        let note = if f.optional { " (optional)" } else { "" };
                        println!("{}{}", f, note);
                    }
                    println!("{}", summary);
                }
                Output::Json => {
                    let out = json!({ "settled": settled, "summary": summary, "failures": failed, "state": state });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            Ok(code)
        }
        Commands::Status { history } => {
            let store = SqliteStore::open_default()?;
            let records = match (history, ns) {
                (Some(limit), Some(ns)) => store.history(ns, limit)?,
                (Some(_), None) => anyhow::bail!("--history needs --ns"),
                (None, _) => store.latest_rollout(ns)?.into_iter().collect(),
            };
            if records.is_empty() {
                match ns {
                    Some(ns) => println!("no rollouts recorded for namespace {}", ns),
                    None => println!("no rollouts recorded"),
                }
                return Ok(ExitCode::SUCCESS);
            }
            match cli.output {
                Output::Human => {
                    for rec in &records {
                        println!("{}  ns={}  ts={}  {}", rec.id, rec.namespace, rec.ts, rec.summary);
                    }
                    if let [rec] = records.as_slice() {
                        print_state(&rec.state);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&records)?),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Policy { path, from, to, port, direction } => {
            let catalog = load_catalog(&path, ns, false)?;
            let rules = rules_from_specs(catalog.specs()).map_err(ConfigError::from)?;
            info!(rules = rules.len(), "network rules loaded");
            let verdict = rules.evaluate(&from, &to, port, direction);
            let matched = rules.matching(&from, &to, port, direction);
            match cli.output {
                Output::Human => {
                    println!("{}", verdict);
                    if let Some(rule) = matched {
                        println!("  by {}", rule);
                    }
                }
                Output::Json => {
                    let out = json!({ "verdict": verdict, "rule": matched });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            Ok(if verdict.is_allow() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Autoscale { path, interval, cooldown, once } => {
            let ns = ns.context("autoscale needs a target namespace (--ns)")?;
            let catalog = load_catalog(&path, Some(ns), false)?;
            let targets = catalog.autoscale_targets()?;
            if targets.is_empty() {
                warn!("no HorizontalPodAutoscaler definitions found");
                return Ok(ExitCode::SUCCESS);
            }
            let client = stagehand_kubehub::client().await?;
            let config = ControllerConfig { interval, cooldown: cooldown.unwrap_or(DEFAULT_COOLDOWN) };
            let controller = Controller::new(KubeMetrics::new(client.clone()), KubeScaler::new(client), config);
            for t in targets {
                let workload = t.workload.clone();
                if let Err(e) = controller.register(t).await {
                    warn!(workload = %workload, error = %format!("{:#}", e), "not autoscaling");
                }
            }
            let keys = controller.keys();
            if keys.is_empty() {
                anyhow::bail!("no workload could be registered");
            }

            if once {
                let mut rows = Vec::with_capacity(keys.len());
                for key in &keys {
                    let row = match controller.tick(key).await {
                        Ok(d) => {
                            if cli.output == Output::Human {
                                println!("{:<40} {}", key.to_string(), d);
                            }
                            json!({ "workload": key.to_string(), "decision": d })
                        }
                        Err(e) => {
                            if cli.output == Output::Human {
                                println!("{:<40} skipped: {}", key.to_string(), e);
                            }
                            json!({ "workload": key.to_string(), "error": e.to_string() })
                        }
                    };
                    rows.push(row);
                }
                if cli.output == Output::Json {
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
                return Ok(ExitCode::SUCCESS);
            }

            let (handle, signal) = cancel_pair();
            spawn_interrupt(handle);
            controller.run(signal).await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_catalog(path: &std::path::Path, ns: Option<&str>, create_namespace: bool) -> Result<Catalog, ConfigError> {
    let opts = LoadOptions { namespace: ns.map(str::to_string), create_namespace };
    Catalog::load(path, &opts)
}

/// Cancel on the first Ctrl-C.
fn spawn_interrupt(handle: CancelHandle) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Ctrl-C received; cancelling");
                handle.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
}

fn print_transitions(before: &RolloutState, after: &RolloutState) {
    for (id, r) in &after.resources {
        if before.status(id) == Some(r.status) {
            continue;
        }
        let detail = match r.status {
            RolloutStatus::Failed => r.error.as_deref(),
            _ => r.last_observed.as_deref(),
        };
        match detail {
            Some(d) => eprintln!("  stage {} {:<40} {:<12} {}", r.stage, id.to_string(), r.status.to_string(), d),
            None => eprintln!("  stage {} {:<40} {}", r.stage, id.to_string(), r.status),
        }
    }
}

fn print_state(state: &RolloutState) {
    println!("STAGE  RESOURCE                                 STATUS       PROBES  DETAIL");
    let mut rows: Vec<_> = state.resources.iter().collect();
    rows.sort_by_key(|(_, r)| r.stage);
    for (id, r) in rows {
        let detail = r.error.as_deref().or(r.last_observed.as_deref()).unwrap_or("");
        let status = if r.reused { format!("{} (reused)", r.status) } else { r.status.to_string() };
        println!("{:<6} {:<40} {:<12} {:<7} {}", r.stage, id.to_string(), status, r.probes, detail);
    }
}

fn init_tracing() {
    let env = std::env::var("STAGEHAND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STAGEHAND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STAGEHAND_METRICS_ADDR; expected host:port");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_rollout_flags() {
        let cli = Cli::parse_from([
            "stagehandctl", "rollout", "deploy/", "--ns", "shop", "--timeout", "90s", "--dry-run", "-o", "json",
        ]);
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.namespace.as_deref(), Some("shop"));
        match cli.command {
            Commands::Rollout { timeout, dry_run, create_namespace, .. } => {
                assert_eq!(timeout, Some(Duration::from_secs(90)));
                assert!(dry_run);
                assert!(!create_namespace);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_policy_query() {
        let cli = Cli::parse_from([
            "stagehandctl", "policy", "net.yaml", "--from", "app=web", "--to", "app=db", "--port", "5432",
            "--direction", "Ingress",
        ]);
        match cli.command {
            Commands::Policy { from, to, port, direction, .. } => {
                assert_eq!(from.get("app"), Some("web"));
                assert_eq!(to.get("app"), Some("db"));
                assert_eq!(port, 5432);
                assert_eq!(direction, Direction::Ingress);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_duration() {
        assert!(Cli::try_parse_from(["stagehandctl", "autoscale", "hpa.yaml", "--interval", "soon"]).is_err());
    }
}
