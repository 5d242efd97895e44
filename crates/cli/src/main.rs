use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use amp_operator::{BackendReconciler, OperatorConfig, PassReport};
use amp_schema::APIManager;
use amp_store::MemStore;

#[derive(Parser, Debug)]
#[command(name = "ampctl", version, about = "3scale API Management operator")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

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
    /// Run the controller against the current cluster context
    Run {
        /// Only watch this namespace (default: all)
        #[arg(long = "ns", env = "AMP_WATCH_NAMESPACE")]
        namespace: Option<String>,
        /// Requeue converged APIManagers after this many seconds
        #[arg(long = "resync-secs", env = "AMP_RESYNC_SECS")]
        resync_secs: Option<u64>,
        /// Requeue failed passes after this many seconds
        #[arg(long = "error-backoff-secs", env = "AMP_ERROR_BACKOFF_SECS")]
        error_backoff_secs: Option<u64>,
    },
    /// Run backend passes offline against an empty in-memory store
    Plan {
        /// APIManager manifest (YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Namespace used when the manifest has none
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
        /// Number of consecutive passes
        #[arg(long = "passes", default_value_t = 2)]
        passes: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("AMP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("AMP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid AMP_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_apimanager(path: &Path, namespace: &str) -> Result<APIManager> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut am: APIManager = serde_yaml::from_str(&text).with_context(|| format!("parsing {} as APIManager", path.display()))?;
    if am.metadata.namespace.as_deref().map_or(true, str::is_empty) {
        am.metadata.namespace = Some(namespace.to_string());
    }
    Ok(am)
}

fn print_report(output: Output, pass: usize, report: &PassReport) -> Result<()> {
    match output {
        Output::Human => {
            println!("# pass {}", pass);
            for step in report.iter() {
                println!("{:<10} {}", step.outcome, step.resource);
            }
        }
        Output::Json => println!("{}", serde_json::to_string(&serde_json::json!({ "pass": pass, "steps": report.steps }))?),
    }
    Ok(())
}

async fn plan(output: Output, file: PathBuf, namespace: String, passes: usize) -> Result<()> {
    let am = load_apimanager(&file, &namespace)?;
    let store = MemStore::new();
    let cancel = CancellationToken::new();
    for n in 1..=passes.max(1) {
        let report = BackendReconciler::new(&store, cancel.clone(), &am)
            .reconcile()
            .await
            .with_context(|| format!("pass {}", n))?;
        print_report(output, n, &report)?;
    }
    info!(objects = store.len(), writes = store.writes(), "plan complete");
    Ok(())
}

async fn run(namespace: Option<String>, resync_secs: Option<u64>, error_backoff_secs: Option<u64>) -> Result<()> {
    let mut config = OperatorConfig::from_env();
    if namespace.is_some() {
        config.watch_namespace = namespace;
    }
    if let Some(s) = resync_secs.filter(|s| *s > 0) {
        config.resync_secs = s;
    }
    if let Some(s) = error_backoff_secs.filter(|s| *s > 0) {
        config.error_backoff_secs = s;
    }
    let client = amp_kubehub::get_kube_client().await.context("connecting to cluster")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received; shutting down"),
                Err(e) => error!(error = %e, "failed to listen for ctrl-c; shutting down"),
            }
            cancel.cancel();
        }
    });
    amp_operator::controller::run(client, config, cancel).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { namespace, resync_secs, error_backoff_secs } => run(namespace, resync_secs, error_backoff_secs).await,
        Commands::Plan { file, namespace, passes } => plan(cli.output, file, namespace, passes).await,
    }
}
