//! Folio smoke harness
//!
//! Registers the offline worker against a live origin, lets it install and
//! activate, then fetches a list of paths through it and reports where each
//! response came from.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use folio_core::{init_logging, LogConfig, LogFormat, StorageBackend, WorkerConfig};
use folio_net::{HttpNetwork, LoaderConfig};
use folio_sw::{
    CacheLifecycleManager, CacheStorage, DiskCacheStorage, FetchSource, HostEvent,
    MemoryCacheStorage, Request, WorkerHost,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "folio-smoke", version, about)]
struct Args {
    /// JSON worker config; defaults apply for missing fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Origin to register the worker for
    #[arg(long)]
    origin: Option<Url>,

    /// Cache version override
    #[arg(long = "cache-version")]
    cache_version: Option<u32>,

    /// Keep buckets on disk under this directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Compact)]
    log_format: LogFormatArg,

    /// Path to fetch through the worker after activation (repeatable)
    #[arg(long = "fetch", value_name = "PATH")]
    fetch: Vec<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Serialize)]
struct FetchReport {
    path: String,
    /// "cache", "network", "offline-page", "synthesized" or "passthrough"
    source: &'static str,
    status: Option<u16>,
    bytes: usize,
    elapsed_ms: f64,
}

fn source_name(source: FetchSource) -> &'static str {
    match source {
        FetchSource::Cache => "cache",
        FetchSource::Network => "network",
        FetchSource::OfflinePage => "offline-page",
        FetchSource::Synthesized => "synthesized",
    }
}

/// Paths that look like pages are fetched as navigations.
fn request_for(url: Url) -> Request {
    let path = url.path();
    if path.ends_with('/') || path.ends_with(".html") {
        Request::navigate(url)
    } else {
        Request::get(url)
    }
}

fn round_ms(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 100_000.0).round() / 100.0
}

fn load_config(args: &Args) -> anyhow::Result<WorkerConfig> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => WorkerConfig::default(),
    };

    if let Some(origin) = &args.origin {
        config = config.with_origin(origin.clone());
    }
    if let Some(version) = args.cache_version {
        config = config.with_version(version);
    }
    if let Some(dir) = &args.storage_dir {
        config.storage.backend = StorageBackend::Disk;
        config.storage.dir = dir.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn open_storage(config: &WorkerConfig) -> anyhow::Result<Arc<dyn CacheStorage>> {
    let storage: Arc<dyn CacheStorage> = match config.storage.backend {
        StorageBackend::Memory => {
            Arc::new(MemoryCacheStorage::with_quota(config.storage.quota_bytes))
        }
        StorageBackend::Disk => Arc::new(
            DiskCacheStorage::new(config.storage.dir.clone())
                .await
                .with_context(|| format!("opening {}", config.storage.dir.display()))?,
        ),
    };
    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(LogConfig::default().with_format(args.log_format.into()))?;

    let config = load_config(&args)?;
    let origin = config.origin.clone();
    let cache_name = config.cache_name();
    info!(origin = %origin, cache = %cache_name, "Starting smoke run");

    let storage = open_storage(&config).await?;
    let network = Arc::new(HttpNetwork::new(origin.clone(), LoaderConfig::default())?);
    let manager = Arc::new(CacheLifecycleManager::new(
        config,
        Arc::clone(&storage),
        network,
    )?);

    let (host, mut events) = WorkerHost::new(origin.clone());
    let page = host.add_client(origin.clone()).await;

    let started = Instant::now();
    let registered = host.register(manager, cache_name.clone()).await;
    let register_ms = round_ms(started.elapsed());

    if !registered.install.is_complete() {
        for failure in &registered.install.failed {
            warn!(url = %failure.url, reason = %failure.reason, "Not precached");
        }
    }

    let mut fetches = Vec::new();
    for path in &args.fetch {
        let url = origin
            .join(path)
            .with_context(|| format!("resolving {}", path))?;

        let started = Instant::now();
        let outcome = host.fetch(Some(&page.id), request_for(url)).await;
        let elapsed_ms = round_ms(started.elapsed());

        let report = match outcome {
            Some(outcome) => {
                let report = FetchReport {
                    path: path.clone(),
                    source: source_name(outcome.source),
                    status: Some(outcome.response.status),
                    bytes: outcome.response.body.len(),
                    elapsed_ms,
                };
                if let Some(revalidation) = outcome.revalidation {
                    let _ = revalidation.await;
                }
                report
            }
            None => FetchReport {
                path: path.clone(),
                source: "passthrough",
                status: None,
                bytes: 0,
                elapsed_ms,
            },
        };
        fetches.push(report);
    }

    let buckets = storage.keys().await?;

    let mut state_changes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let HostEvent::StateChange { new_state, .. } = event {
            state_changes.push(new_state.to_string());
        }
    }

    let activate = registered.activate.as_ref();
    let report = json!({
        "origin": origin.as_str(),
        "cache": cache_name,
        "register_ms": register_ms,
        "install": {
            "cached": registered.install.cached.len(),
            "failed": registered.install.failed.iter().map(|f| &f.url).collect::<Vec<_>>(),
        },
        "activated": activate.is_some(),
        "deleted": activate.map(|a| a.deleted.clone()).unwrap_or_default(),
        "states": state_changes,
        "buckets": buckets,
        "fetches": fetches,
    });

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{}: {} cached, {} failed, activated={}",
            cache_name,
            registered.install.cached.len(),
            registered.install.failed.len(),
            activate.is_some()
        );
        for fetch in &fetches {
            println!(
                "  {:<32} {:<12} {:>4} {:>8} bytes {:>8.2} ms",
                fetch.path,
                fetch.source,
                fetch
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                fetch.bytes,
                fetch.elapsed_ms
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "folio-smoke",
            "--origin",
            "https://folio.example/",
            "--cache-version",
            "3",
            "--fetch",
            "/",
            "--fetch",
            "/styles.css",
            "--json",
        ])
        .unwrap();

        assert_eq!(args.cache_version, Some(3));
        assert_eq!(args.fetch, vec!["/".to_string(), "/styles.css".to_string()]);
        assert!(args.json);

        let config = load_config(&args).unwrap();
        assert_eq!(config.cache_name(), "portfolio-cache-v3");
        assert_eq!(config.origin.as_str(), "https://folio.example/");
    }

    #[test]
    fn test_log_format_is_a_value_enum() {
        let args = Args::try_parse_from(["folio-smoke"]).unwrap();
        assert_eq!(args.log_format, LogFormatArg::Compact);

        let args = Args::try_parse_from(["folio-smoke", "--log-format", "json"]).unwrap();
        assert_eq!(LogFormat::from(args.log_format), LogFormat::Json);

        let err = Args::try_parse_from(["folio-smoke", "--log-format", "xml"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn test_storage_dir_selects_disk() {
        let args =
            Args::try_parse_from(["folio-smoke", "--storage-dir", "/tmp/folio-smoke"]).unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Disk);
        assert_eq!(config.storage.dir, PathBuf::from("/tmp/folio-smoke"));
    }

    #[test]
    fn test_request_for() {
        let origin = Url::parse("https://folio.example/").unwrap();
        assert!(request_for(origin.clone()).is_navigation());
        assert!(request_for(origin.join("/projects.html").unwrap()).is_navigation());
        assert!(!request_for(origin.join("/styles.css").unwrap()).is_navigation());
    }
}
