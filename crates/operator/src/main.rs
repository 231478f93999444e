use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use kiln_builder::{Builder, BuilderConfig};
use kiln_controller::{spawn_workers, EventSink, KitReconciler, KubeEvents, OperatorConfig, RuntimeConfig};
use kiln_core::{Build, BuildPhase, Kit, Platform};
use kiln_kubehub::{spawn_watchers, WatchConfig, WorkQueue};
use kiln_store::{ClusterStore, KubeStore};
use kube::CustomResourceExt;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Kiln kit operator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch kits, builds and platforms and reconcile kits
    Run {
        /// Identity matched against the kiln.dev/operator.id annotation
        #[arg(long = "operator-id", env = "KILN_OPERATOR_ID", default_value = "kiln")]
        operator_id: String,
        /// Only reconcile this namespace (default: all)
        #[arg(long = "namespace", env = "KILN_WATCH_NAMESPACE")]
        namespace: Option<String>,
        #[arg(long = "workers", default_value_t = 4)]
        workers: usize,
        /// Claim kits without an operator-id annotation
        #[arg(long = "default-operator", env = "KILN_DEFAULT_OPERATOR", default_value_t = true, action = ArgAction::Set)]
        default_operator: bool,
        /// Deadline for one reconcile pass, including any build it runs
        #[arg(long = "pass-timeout-secs", default_value_t = 900)]
        pass_timeout_secs: u64,
    },
    /// Execute one Build and record its status
    Build {
        name: String,
        #[arg(long = "namespace", env = "KILN_WATCH_NAMESPACE", default_value = "default")]
        namespace: String,
    },
    /// Print the CRD manifests
    Crd,
}

fn init_tracing() {
    let env = std::env::var("KILN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KILN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KILN_METRICS_ADDR; expected host:port");
        }
    }
}

fn crd_manifests() -> Result<String> {
    let docs = [
        serde_yaml::to_string(&Kit::crd())?,
        serde_yaml::to_string(&Build::crd())?,
        serde_yaml::to_string(&Platform::crd())?,
    ];
    Ok(docs.join("---\n"))
}

async fn run(operator: OperatorConfig, namespace: Option<String>, runtime: RuntimeConfig) -> Result<()> {
    let client = kiln_kubehub::get_kube_client().await?;
    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client.clone()));
    let events: Arc<dyn EventSink> = Arc::new(KubeEvents::new(client.clone(), Some(operator.operator_id.clone())));
    let watch = WatchConfig { namespace, operator_id: operator.operator_id.clone(), ..Default::default() };
    info!(operator_id = %operator.operator_id, namespace = ?watch.namespace, workers = runtime.workers, "kiln operator starting");

    let reconciler = Arc::new(KitReconciler::new(Arc::clone(&store), events, operator, BuilderConfig::from_env()));
    let queue = Arc::new(WorkQueue::new());
    let watchers = spawn_watchers(client, store, Arc::clone(&queue), watch);
    let workers = spawn_workers(reconciler, Arc::clone(&queue), runtime);

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested");
    queue.shutdown();
    // dropping in-flight passes kills any running build
    for h in watchers.iter().chain(workers.iter()) {
        h.abort();
    }
    Ok(())
}

async fn build_once(namespace: &str, name: &str) -> Result<()> {
    let store = KubeStore::try_default().await?;
    let build = store
        .get_build(namespace, name)
        .await
        .with_context(|| format!("reading build {}/{}", namespace, name))?
        .with_context(|| format!("build {}/{} not found", namespace, name))?;
    let config = BuilderConfig::from_env();
    let status = Builder::new(&store, &config).run(&build).await;
    store
        .patch_build_status(&build, &status)
        .await
        .with_context(|| format!("recording status of build {}/{}", namespace, name))?;
    if status.phase != BuildPhase::Succeeded {
        bail!("build {}/{} failed: {}", namespace, name, status.error.unwrap_or_default());
    }
    println!("{}", status.image.unwrap_or_default());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let res = match cli.command {
        Commands::Run { operator_id, namespace, workers, default_operator, pass_timeout_secs } => {
            let operator = OperatorConfig {
                operator_id,
                watch_namespaces: namespace.iter().cloned().collect(),
                default_operator,
            };
            let runtime = RuntimeConfig {
                workers,
                pass_timeout: Duration::from_secs(pass_timeout_secs),
                ..Default::default()
            };
            run(operator, namespace, runtime).await
        }
        Commands::Build { name, namespace } => build_once(&namespace, &name).await,
        Commands::Crd => crd_manifests().map(|s| print!("{}", s)),
    };
    if let Err(e) = &res {
        error!(error = %format!("{:#}", e), "kiln failed");
    }
    res
}
