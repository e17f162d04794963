use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use gantry_api::{parse_yaml, CreateRequest, GantryApi, InProcApi};
use gantry_core::prelude::*;
use gantry_ingest::{spawn_ingest, IngestConfig, Ingestor};
use gantry_kubehub::{KubePlatform, Platform};
use gantry_persist::{SqliteStore, Store};
use gantry_reconcile::{Reconciler, Scheduler, SchedulerConfig, StoreTriggers};
use serde::Serialize;
use tokio::signal;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gantryctl", version, about = "Gantry reconciliation engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database path
    #[arg(long = "db", global = true, env = "GANTRY_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run ingest and the reconcile scheduler against the current cluster context
    Run,
    /// Create a deployment from a YAML file (template, namespace, spec, policy)
    Create {
        #[arg(short = 'f', long = "file")]
        file: String,
    },
    /// Replace a deployment's desired spec from a YAML file (objects list)
    Update {
        id: String,
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Fail if the deployment is no longer at this generation
        #[arg(long = "expect-generation")]
        expect_generation: Option<u64>,
    },
    /// Stop reconciling a deployment; drift is still recorded
    Pause { id: String },
    /// Resume a paused deployment
    Resume { id: String },
    /// Tear down a deployment's objects and archive it
    Delete { id: String },
    /// Reconcile now, bypassing backoff
    Trigger { id: String },
    /// Approve adopting an out-of-band change, e.g. `Workload/games/gs /spec/replicas`
    Approve {
        id: String,
        /// Kind/namespace/name
        object: String,
        /// JSON pointer at or above the changed field
        path: String,
    },
    /// Show a deployment's status and reconcile job
    Status { id: String },
    /// List deployments
    Ls {
        /// Include archived deployments
        #[arg(long = "all", action = ArgAction::SetTrue)]
        all: bool,
    },
    /// Print a deployment's event log
    Events {
        id: String,
        #[arg(long = "after", default_value_t = 0)]
        after: i64,
        #[arg(long = "limit", default_value_t = 100)]
        limit: usize,
        /// Keep printing new events until Ctrl-C
        #[arg(long = "follow", action = ArgAction::SetTrue)]
        follow: bool,
    },
    /// Show the last observed per-resource status
    Snapshot { id: String },
}

fn init_tracing() {
    let env = std::env::var("GANTRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("GANTRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid GANTRY_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_id(s: &str) -> Result<DeploymentId> { DeploymentId::from_str(s).map_err(|e| anyhow!("invalid deployment id {s:?}: {e}")) }

fn parse_object(s: &str) -> Result<ObjectRef> {
    match s.split('/').collect::<Vec<_>>().as_slice() {
        [kind, ns, name] if !ns.is_empty() && !name.is_empty() => {
            let kind = ObjectKind::from_str(kind).map_err(|e| anyhow!("{e}"))?;
            Ok(ObjectRef::new(kind, *ns, *name))
        }
        _ => Err(anyhow!("expected Kind/namespace/name, got {s:?}")),
    }
}

fn read_file(path: &str) -> Result<String> { std::fs::read_to_string(path).with_context(|| format!("reading {path}")) }

fn open_store(db: Option<&str>) -> Result<Arc<SqliteStore>> {
    let path = db.map(str::to_string).unwrap_or_else(gantry_persist::default_db_path);
    let store = SqliteStore::open(&path).with_context(|| format!("opening {path}"))?;
    Ok(Arc::new(store))
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_deployment(out: Output, d: &Deployment) -> Result<()> {
    match out {
        Output::Human => {
            println!("{}  gen {}  {}  {}", d.id, d.generation, d.lifecycle, d.status);
            Ok(())
        }
        Output::Json => print_json(d),
    }
}

fn print_event(e: &Event) {
    println!("{:>6}  {}  {:<14} {:<26} {}", e.seq, e.created_at.to_rfc3339(), e.source.as_str(), e.event_type.as_str(), e.payload);
}

async fn run(store: Arc<SqliteStore>) -> Result<()> {
    let platform: Arc<dyn Platform> = Arc::new(KubePlatform::connect().await?);
    let store_dyn: Arc<dyn Store> = store;
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&store_dyn), Arc::clone(&platform)));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store_dyn), reconciler, SchedulerConfig::from_env()));
    let ingestor = Arc::new(Ingestor::new(Arc::clone(&store_dyn), scheduler.triggers()));
    let ingest = spawn_ingest(platform, ingestor, IngestConfig::from_env());

    let (stop_tx, stop_rx) = watch::channel(false);
    let sched = tokio::spawn(Arc::clone(&scheduler).run(stop_rx));
    info!("gantry running; Ctrl-C to stop");
    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; letting in-flight reconciles finish");
    drop(ingest);
    let _ = stop_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(60), sched).await.is_err() {
        warn!("scheduler did not stop within 60s; exiting anyway");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = open_store(cli.db.as_deref())?;
    let store_dyn: Arc<dyn Store> = store.clone();
    // a running controller polls the same database; nothing in this process waits on the wakeup
    let triggers = Arc::new(StoreTriggers::new(Arc::clone(&store_dyn), Arc::new(Notify::new())));
    let api = InProcApi::new(store_dyn, triggers);
    let out = cli.output;

    match cli.command {
        Commands::Run => run(store).await?,
        Commands::Create { file } => {
            let req: CreateRequest = parse_yaml(&read_file(&file)?)?;
            let d = api.create_deployment(req).await?;
            print_deployment(out, &d)?;
        }
        Commands::Update { id, file, expect_generation } => {
            let spec: DesiredSpec = parse_yaml(&read_file(&file)?)?;
            let d = api.update_spec(parse_id(&id)?, expect_generation.map(Generation), spec).await?;
            print_deployment(out, &d)?;
        }
        Commands::Pause { id } => print_deployment(out, &api.set_lifecycle(parse_id(&id)?, LifecycleState::Paused).await?)?,
        Commands::Resume { id } => print_deployment(out, &api.set_lifecycle(parse_id(&id)?, LifecycleState::Active).await?)?,
        Commands::Delete { id } => print_deployment(out, &api.delete_deployment(parse_id(&id)?).await?)?,
        Commands::Trigger { id } => {
            api.trigger(parse_id(&id)?).await?;
            if out == Output::Human {
                println!("reconcile requested");
            }
        }
        Commands::Approve { id, object, path } => {
            let approval = api.approve_adoption(parse_id(&id)?, parse_object(&object)?, &path).await?;
            match out {
                Output::Human => println!("approval {approval} recorded"),
                Output::Json => print_json(&serde_json::json!({"approval_id": approval}))?,
            }
        }
        Commands::Status { id } => {
            let st = api.status(parse_id(&id)?).await?;
            match out {
                Output::Human => {
                    let s = &st.summary;
                    println!("id:          {}", s.id);
                    println!("template:    {}@{}", s.template.name, s.template.version);
                    println!("namespace:   {}", s.namespace);
                    println!("generation:  {} (applied {})", s.generation, s.last_applied_generation);
                    println!("lifecycle:   {}{}", s.lifecycle, if s.archived { " (archived)" } else { "" });
                    println!("status:      {}{}", s.status, if st.converged { " (converged)" } else { "" });
                    if let Some(job) = &st.job {
                        println!("job:         {:?} reason={} attempts={} next={}", job.state, job.reason, job.attempts, job.next_run_at.to_rfc3339());
                        if let Some(err) = &job.last_error {
                            println!("last error:  {err}");
                        }
                    }
                }
                Output::Json => print_json(&st)?,
            }
        }
        Commands::Ls { all } => {
            let rows = api.list(all).await?;
            match out {
                Output::Human => {
                    println!("{:<36}  {:<20} {:<12} {:>4} {:>4}  {:<9} STATUS", "ID", "TEMPLATE", "NAMESPACE", "GEN", "APPL", "LIFECYCLE");
                    for d in rows {
                        println!(
                            "{:<36}  {:<20} {:<12} {:>4} {:>4}  {:<9} {}",
                            d.id.to_string(),
                            format!("{}@{}", d.template.name, d.template.version),
                            d.namespace,
                            d.generation.to_string(),
                            d.last_applied_generation.to_string(),
                            d.lifecycle.as_str(),
                            d.status
                        );
                    }
                }
                Output::Json => print_json(&rows)?,
            }
        }
        Commands::Events { id, after, limit, follow } => {
            let id = parse_id(&id)?;
            if follow {
                let mut h = api.follow_events(id, after).await?;
                loop {
                    tokio::select! {
                        maybe = h.rx.recv() => match maybe {
                            Some(e) if out == Output::Json => println!("{}", serde_json::to_string(&e)?),
                            Some(e) => print_event(&e),
                            None => break,
                        },
                        _ = signal::ctrl_c() => break,
                    }
                }
                h.cancel.cancel();
            } else {
                let events = api.events(id, after, limit).await?;
                match out {
                    Output::Human => events.iter().for_each(print_event),
                    Output::Json => print_json(&events)?,
                }
            }
        }
        Commands::Snapshot { id } => {
            let snap = api.snapshot(parse_id(&id)?).await?;
            match out {
                Output::Human => {
                    println!("observed at {}  summary {}", snap.observed_at.to_rfc3339(), snap.summary());
                    for (key, st) in &snap.resources {
                        println!("{:<48} {:?} {}", key, st.health, st.message.as_deref().unwrap_or(""));
                    }
                }
                Output::Json => print_json(&snap)?,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() { Cli::command().debug_assert(); }

    #[test]
    fn object_refs_parse_from_paths() {
        let r = parse_object("Workload/games/gs").unwrap();
        assert_eq!(r, ObjectRef::new(ObjectKind::Workload, "games", "gs"));
        assert!(parse_object("Workload/gs").is_err());
        assert!(parse_object("Deployment/games/gs").is_err());
    }

    #[test]
    fn approve_takes_object_and_path() {
        let cli = Cli::try_parse_from(["gantryctl", "approve", "7d3e", "Workload/games/gs", "/spec/replicas"]).unwrap();
        assert!(matches!(cli.command, Commands::Approve { ref path, .. } if path == "/spec/replicas"));
    }
}
