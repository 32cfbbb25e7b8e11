use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use kwatch_classify::Classifier;
use kwatch_core::{ResourceKind, WatchConfig};
use kwatch_diff::external::ExternalTool;
use kwatch_dispatch::{ClassifyingSink, DispatchMode, Dispatcher, ReportHandler, WriterSink};
use kwatch_kubehub::KubeSource;
use kwatch_store::{CacheOptions, RunningCache};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kwatchctl", version, about = "Watch Kubernetes resources and print meaningful changes")]
struct Cli {
    /// YAML file with watch settings; flags override it
    #[arg(long = "config", env = "KWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to watch (default: "default")
    #[arg(long = "ns", env = "KWATCH_NAMESPACE", conflicts_with = "all_namespaces")]
    namespace: Option<String>,

    /// Watch every namespace
    #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
    all_namespaces: bool,

    /// Kinds to watch, repeatable or comma separated (deployment, pod)
    #[arg(long = "kind", env = "KWATCH_KINDS", value_delimiter = ',')]
    kinds: Vec<ResourceKind>,

    /// Full re-list period in seconds; 0 disables it
    #[arg(long = "resync-secs", env = "KWATCH_RESYNC_SECS")]
    resync_secs: Option<u64>,

    /// Give up if a cache has not synced within this many seconds
    #[arg(long = "sync-timeout-secs", env = "KWATCH_SYNC_TIMEOUT_SECS")]
    sync_timeout_secs: Option<u64>,

    /// Dispatch queue capacity per kind; 0 runs handlers inline
    #[arg(long = "queue-cap", env = "KWATCH_QUEUE_CAP")]
    queue_cap: Option<usize>,

    /// External diff command, e.g. "git --no-pager diff --no-index"
    #[arg(long = "diff-tool", env = "KWATCH_DIFF_TOOL")]
    diff_tool: Option<String>,

    /// Prefix report headers with the local time
    #[arg(long = "timestamps", action = ArgAction::SetTrue)]
    timestamps: bool,

    /// Do not report objects found by the initial list
    #[arg(long = "no-initial", action = ArgAction::SetTrue)]
    no_initial: bool,
}

fn init_tracing() {
    let env = std::env::var("KWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_config_file(path: &Path) -> Result<WatchConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn load_config(cli: &Cli) -> Result<WatchConfig> {
    let mut cfg = match &cli.config {
        Some(path) => read_config_file(path)?,
        None => WatchConfig::default(),
    };
    if cli.all_namespaces {
        cfg.namespace = None;
    } else if let Some(ns) = &cli.namespace {
        cfg.namespace = Some(ns.clone());
    }
    if !cli.kinds.is_empty() {
        cfg.kinds = cli.kinds.clone();
    }
    cfg.kinds.sort();
    cfg.kinds.dedup();
    if let Some(secs) = cli.resync_secs {
        cfg.resync_secs = secs;
    }
    if let Some(secs) = cli.sync_timeout_secs {
        cfg.sync_timeout_secs = secs;
    }
    if let Some(cap) = cli.queue_cap {
        cfg.queue_capacity = cap;
    }
    if cli.no_initial {
        cfg.emit_initial = false;
    }
    Ok(cfg)
}

async fn start_kind(
    kind: ResourceKind,
    cfg: &WatchConfig,
    classifier: &Arc<Classifier>,
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
) -> Result<Option<RunningCache>> {
    let Some(d) = dispatcher.for_kind(kind) else {
        return Ok(None);
    };
    let source = KubeSource::connect(kind, cfg.namespace.as_deref())
        .await
        .with_context(|| format!("connecting {kind} source"))?;
    let sink = Arc::new(ClassifyingSink::new(Arc::clone(classifier), Arc::clone(d)));
    let cache = kwatch_store::start(Arc::new(source), CacheOptions::from(cfg), sink, cancel.child_token()).await?;
    Ok(Some(cache))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;
    let tool = match cli.diff_tool.as_deref() {
        Some(cmd) => Some(ExternalTool::parse(cmd).context("--diff-tool is empty")?),
        None => None,
    };
    info!(ns = ?cfg.namespace, kinds = ?cfg.kinds, resync_secs = cfg.resync_secs, queue_cap = cfg.queue_capacity, "starting watch");

    let cancel = CancellationToken::new();
    let classifier = Arc::new(Classifier::from_config(&cfg));
    let dispatcher = Dispatcher::new(&cfg.kinds, DispatchMode::from_capacity(cfg.queue_capacity), &cancel);

    let (out, writer) = WriterSink::stdout();
    let mut report = ReportHandler::new(out).with_tool(tool).with_timestamps(cli.timestamps);
    for &kind in &cfg.kinds {
        report = report.with_mask(kind, cfg.mask_for(kind));
    }
    let report = Arc::new(report);
    for &kind in &cfg.kinds {
        dispatcher.register(kind, report.clone());
    }

    let mut caches = Vec::new();
    for &kind in &cfg.kinds {
        if let Some(cache) = start_kind(kind, &cfg, &classifier, &dispatcher, &cancel).await? {
            caches.push(cache);
        }
    }

    let synced = async {
        for c in &caches {
            c.handle.wait_synced(cfg.sync_timeout()).await?;
            info!(kind = %c.handle.kind(), objects = c.handle.list().len(), "cache synced");
        }
        Ok::<_, kwatch_store::CacheError>(())
    };
    tokio::select! {
        res = synced => res?,
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received before caches synced; shutting down");
            cancel.cancel();
            return Ok(());
        }
    }

    signal::ctrl_c().await.context("listening for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    cancel.cancel();
    for c in caches {
        let kind = c.handle.kind();
        if let Err(e) = c.task.await {
            error!(%kind, error = %e, "cache producer failed");
        }
    }
    dispatcher.join().await;
    drop(report);
    match writer.await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "writing report failed"),
        Err(e) => error!(error = %e, "report writer failed"),
    }
    warn!("watch ended (graceful shutdown)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("kwatchctl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_watch_deployments_in_default_namespace() {
        let cfg = load_config(&parse(&[])).unwrap();
        assert_eq!(cfg.namespace.as_deref(), Some("default"));
        assert_eq!(cfg.kinds, [ResourceKind::Deployment]);
        assert_eq!(cfg.resync_secs, 10);
        assert!(cfg.emit_initial);
    }

    #[test]
    fn flags_override_config() {
        let cli = parse(&["-A", "--kind", "pod,deployment", "--kind", "pods", "--queue-cap", "0", "--no-initial"]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.namespace, None);
        assert_eq!(cfg.kinds, [ResourceKind::Deployment, ResourceKind::Pod]);
        assert_eq!(cfg.queue_capacity, 0);
        assert!(!cfg.emit_initial);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let res = Cli::try_parse_from(["kwatchctl", "--kind", "service"]);
        assert!(res.is_err());
    }

    #[test]
    fn namespace_conflicts_with_all_namespaces() {
        assert!(Cli::try_parse_from(["kwatchctl", "--ns", "kube-system", "-A"]).is_err());
    }

    #[test]
    fn config_file_sets_masks() {
        let path = std::env::temp_dir().join(format!("kwatchctl-test-{}.yaml", std::process::id()));
        std::fs::write(&path, "namespace: prod\nmasks:\n  Deployment:\n    - status\n    - metadata.generation\n").unwrap();
        let cli = parse(&["--config", path.to_str().unwrap(), "--resync-secs", "0"]);
        let cfg = load_config(&cli).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.namespace.as_deref(), Some("prod"));
        assert_eq!(cfg.resync_secs, 0);
        assert_eq!(cfg.mask_for(ResourceKind::Deployment).paths().len(), 2);
    }
}
