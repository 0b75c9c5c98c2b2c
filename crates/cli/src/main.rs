use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lookout_cache::{CancellationToken, HandlerFns};
use lookout_core::{ListOptions, Obj, ObjKey};
use lookout_kubehub::InformerFactory;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lookoutctl", version, about = "Lookout CLI: watch-cache driven views of cluster objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Server-side label selector, e.g. "app=web,tier!=db"
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// Seconds between resyncs (0 disables)
    #[arg(long = "resync-secs", global = true, env = "LOOKOUT_RESYNC_SECS", default_value_t = 0)]
    resync_secs: u64,

    /// Give up waiting for the initial list after this many seconds
    #[arg(long = "sync-timeout-secs", global = true, env = "LOOKOUT_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    sync_timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List cached objects for a group/version/kind key once synced
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Print one cached object
    Get {
        /// GVK key, e.g. "v1/ConfigMap"
        gvk: String,
        /// "namespace/name", or "name" (namespace taken from --ns if given)
        key: String,
    },
    /// Print +/~/- handler events until Ctrl-C
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
}

fn init_tracing() {
    let env = std::env::var("LOOKOUT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LOOKOUT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid LOOKOUT_METRICS_ADDR; expected host:port");
        }
    }
}

async fn factory(cli: &Cli) -> Result<InformerFactory> {
    let client = kube_client().await?;
    let mut f = InformerFactory::new(client, Duration::from_secs(cli.resync_secs));
    if let Some(ns) = &cli.namespace {
        f = f.with_namespace(ns.clone());
    }
    if let Some(sel) = cli.selector.clone() {
        f = f.with_tweak(Arc::new(move |o: &mut ListOptions| o.label_selector = Some(sel.clone())));
    }
    Ok(f)
}

async fn kube_client() -> Result<kube::Client> {
    kube::Client::try_default().await.map_err(|e| anyhow!("building kube client: {}", e))
}

/// Start the informer for `gvk` and wait for its initial list, bounded by the sync timeout.
async fn synced(cli: &Cli, gvk: &str, stop: &CancellationToken) -> Result<(InformerFactory, Arc<lookout_cache::Cache>)> {
    let f = factory(cli).await?;
    let cache = f.informer_for(gvk).await?;
    f.start(stop);
    let deadline = stop.child_token();
    let timer = {
        let deadline = deadline.clone();
        let secs = cli.sync_timeout_secs;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            deadline.cancel();
        })
    };
    let states = f.wait_for_cache_sync(&deadline).await;
    timer.abort();
    if states.values().any(|s| !s) {
        stop.cancel();
        return Err(anyhow!("{} did not sync within {}s", gvk, cli.sync_timeout_secs));
    }
    Ok((f, cache))
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn print_objs(output: Output, objs: &[Arc<Obj>]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<20} {:<40} {:<12} AGE", "NAMESPACE", "NAME", "VERSION");
            for o in objs {
                let ns_col = o.key.namespace.as_deref().unwrap_or("-");
                println!("{:<20} {:<40} {:<12} {}", ns_col, o.key.name, o.version, render_age(o.creation_ts));
            }
        }
        Output::Json => {
            let raws: Vec<&serde_json::Value> = objs.iter().map(|o| &o.raw).collect();
            println!("{}", serde_json::to_string_pretty(&raws)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let stop = CancellationToken::new();

    match &cli.command {
        Commands::Ls { gvk } => {
            info!(gvk = %gvk, ns = ?cli.namespace, "ls invoked");
            let (f, cache) = synced(&cli, gvk, &stop).await?;
            let lister = cache.lister();
            let objs = match cli.namespace.as_deref() {
                Some(ns) => {
                    let in_ns = lister.namespaced(ns).list();
                    // cluster-scoped kinds ignore --ns
                    if in_ns.is_empty() { lister.list_all() } else { in_ns }
                }
                None => lister.list_all(),
            };
            print_objs(cli.output, &objs)?;
            stop.cancel();
            f.shutdown().await;
        }
        Commands::Get { gvk, key } => {
            let key = match (key.contains('/'), cli.namespace.as_deref()) {
                (true, _) => ObjKey::parse(key)?,
                (false, Some(ns)) => ObjKey::namespaced(ns, key),
                (false, None) => ObjKey::cluster(key),
            };
            info!(gvk = %gvk, key = %key, "get invoked");
            let (f, cache) = synced(&cli, gvk, &stop).await?;
            let found = cache.lister().get(&key);
            stop.cancel();
            f.shutdown().await;
            match found {
                Some(o) => print_objs(cli.output, &[o])?,
                None => return Err(anyhow!("{} {} not found", gvk, key)),
            }
        }
        Commands::Watch { gvk } => {
            info!(gvk = %gvk, ns = ?cli.namespace, resync_secs = cli.resync_secs, "watch invoked");
            let f = factory(&cli).await?;
            let cache = f.informer_for(gvk).await?;
            let json = cli.output == Output::Json;
            cache.add_event_handler(
                HandlerFns::new()
                    .on_add(move |o| print_event(json, "+", o))
                    .on_update(move |old, new| print_event(json, if old.version == new.version { "=" } else { "~" }, new))
                    .on_delete(move |o| print_event(json, "-", o)),
            );
            f.start(&stop);
            signal::ctrl_c().await?;
            info!("Ctrl-C received; shutting down");
            stop.cancel();
            f.shutdown().await;
        }
    }

    Ok(())
}

fn print_event(json: bool, mark: &str, o: &Arc<Obj>) -> Result<()> {
    if json {
        let line = serde_json::json!({ "event": mark, "key": o.key.to_string(), "version": o.version.0, "object": o.raw });
        println!("{}", serde_json::to_string(&line)?);
    } else {
        println!("{} {} @{}", mark, o.key, o.version);
    }
    Ok(())
}
