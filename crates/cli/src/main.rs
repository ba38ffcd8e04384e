use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use factbridge_core::Value;
use factbridge_kubehub::{spawn_kind, Watched};
use factbridge_marshal::{tables, Fact, Marshal};
use factbridge_txn::{
    spawn_scheduler, ChangeDumper, DiscardSink, DumpFormat, MemEngine, OutputHandler, Program, SchedulerConfig,
    TableRegistry,
};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1 as netv1;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "factbridgectl", version, about = "Mirror Kubernetes state into a policy engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch namespaces, pods and network policies and feed them to the engine
    Run(RunArgs),
    /// Marshal a Pod, Namespace or NetworkPolicy manifest and print its value
    Encode {
        /// YAML manifest
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// List the engine tables the pipeline writes
    Tables,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Commit once this many commands are pending (1 = one command per transaction)
    #[arg(long, env = "FACTBRIDGE_BATCH_SIZE", default_value_t = 32)]
    batch_size: usize,
    /// Commit once the oldest pending command is this old
    #[arg(long = "batch-timeout-ms", env = "FACTBRIDGE_BATCH_TIMEOUT_MS", default_value_t = 100)]
    batch_timeout_ms: u64,
    /// Command channel capacity
    #[arg(long = "queue-cap", env = "FACTBRIDGE_QUEUE_CAP", default_value_t = 32)]
    queue_cap: usize,
    /// Commit the pending batch on Ctrl-C instead of discarding it
    #[arg(long, env = "FACTBRIDGE_FLUSH_ON_SHUTDOWN", action = ArgAction::SetTrue)]
    flush_on_shutdown: bool,
    /// Record every transaction to this file
    #[arg(long, env = "FACTBRIDGE_RECORD_COMMANDS")]
    record_commands: Option<PathBuf>,
    /// Write output changes to this file ("-" for stdout)
    #[arg(long, env = "FACTBRIDGE_DUMP_CHANGES")]
    dump_changes: Option<String>,
    /// text or json
    #[arg(long, default_value = "text")]
    dump_format: DumpFormat,
    /// Key workers per watched kind
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

impl RunArgs {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            batch_size: self.batch_size.max(1),
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            queue_capacity: self.queue_cap.max(1),
            flush_on_shutdown: self.flush_on_shutdown,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("FACTBRIDGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FACTBRIDGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FACTBRIDGE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Reference engine holding the three input tables, keyed the way deletes address them.
fn build_engine() -> MemEngine {
    MemEngine::new()
        .with_keyed_table(tables::NAMESPACE, |v| factbridge_marshal::Namespace::key_of(v).ok())
        .with_keyed_table(tables::POD, |v| factbridge_marshal::Pod::key_of(v).ok())
        .with_keyed_table(tables::NETWORK_POLICY, |v| factbridge_marshal::NetworkPolicy::key_of(v).ok())
}

fn output_handler(target: Option<&str>, format: DumpFormat) -> Result<Box<dyn OutputHandler>> {
    Ok(match target {
        None => Box::new(DiscardSink),
        Some("-") => Box::new(ChangeDumper::stdout(format)),
        Some(path) => Box::new(
            ChangeDumper::create(path, format).with_context(|| format!("creating change dump {}", path))?,
        ),
    })
}

async fn run(args: RunArgs) -> Result<()> {
    let engine = build_engine();
    let registry = TableRegistry::resolve(&engine, tables::ALL).context("resolving engine tables")?;
    let handler = output_handler(args.dump_changes.as_deref(), args.dump_format)?;
    let mut program = Program::new(engine, registry.clone(), handler);
    if let Some(path) = &args.record_commands {
        program.start_recording(path).context("starting command recording")?;
    }

    let cfg = args.scheduler_config();
    info!(batch_size = cfg.batch_size, timeout_ms = args.batch_timeout_ms, queue_cap = cfg.queue_capacity, "run invoked");
    let (stop_tx, stop_rx) = watch::channel(false);
    let (cmd_tx, scheduler) = spawn_scheduler(program, cfg, stop_rx.clone());

    let client = kube::Client::try_default().await.context("connecting to cluster")?;
    let kinds = vec![
        spawn_kind::<corev1::Namespace>(
            client.clone(),
            registry.require(tables::NAMESPACE)?,
            cmd_tx.clone(),
            stop_rx.clone(),
            args.workers,
        ),
        spawn_kind::<corev1::Pod>(client.clone(), registry.require(tables::POD)?, cmd_tx.clone(), stop_rx.clone(), args.workers),
        spawn_kind::<netv1::NetworkPolicy>(
            client,
            registry.require(tables::NETWORK_POLICY)?,
            cmd_tx.clone(),
            stop_rx,
            args.workers,
        ),
    ];
    // workers hold the remaining senders
    drop(cmd_tx);

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    let _ = stop_tx.send(true);
    for kind in kinds {
        kind.join().await;
    }
    let mut program = scheduler.await.context("scheduler task")?;
    program.stop_recording()?;
    info!("shutdown complete");
    Ok(())
}

fn encode_as<K: Watched>(doc: serde_yaml::Value) -> Result<(&'static str, Value)> {
    let obj: K = serde_yaml::from_value(doc).with_context(|| format!("decoding {} manifest", K::KIND))?;
    let model = obj.to_model()?;
    let value = model.encode();
    let back = <K::Model as Marshal>::decode(&value)?;
    if back.encode() != value {
        bail!("{} value does not survive a decode/encode round trip", K::KIND);
    }
    Ok((<K::Model as Fact>::TABLE, value))
}

fn encode_manifest(text: &str) -> Result<(&'static str, Value)> {
    let doc: serde_yaml::Value = serde_yaml::from_str(text).context("parsing YAML")?;
    let kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
    match kind.as_str() {
        "Namespace" => encode_as::<corev1::Namespace>(doc),
        "Pod" => encode_as::<corev1::Pod>(doc),
        "NetworkPolicy" => encode_as::<netv1::NetworkPolicy>(doc),
        other => bail!("unsupported kind {:?}: expected Namespace, Pod or NetworkPolicy", other),
    }
}

fn encode_file(path: &Path) -> Result<(&'static str, Value)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    encode_manifest(&text)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            if let Err(e) = run(args).await {
                error!(error = ?e, "run failed");
                return Err(e);
            }
        }
        Commands::Encode { file } => {
            let (table, value) = encode_file(&file)?;
            match cli.output {
                Output::Human => println!("{}: {}", table, value),
                Output::Json => {
                    let doc = serde_json::json!({ "table": table, "value": value });
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
            }
        }
        Commands::Tables => {
            let engine = build_engine();
            let registry = TableRegistry::resolve(&engine, tables::ALL)?;
            match cli.output {
                Output::Human => {
                    for (id, name) in registry.iter() {
                        println!("{:<4} {}", id, name);
                    }
                }
                Output::Json => {
                    let items: Vec<_> =
                        registry.iter().map(|(id, name)| serde_json::json!({ "id": id.0, "name": name })).collect();
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
    }
    Ok(())
}
