//! Uncover Markets worker smoke harness
//!
//! Installs and activates the offline worker against a live origin, then
//! routes each URL given on the command line through it and prints a JSON
//! report. Running it twice with `--storage` pointing at the same file shows
//! the second run serving the app shell from the store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use uncover_common::{init_logging, LogConfig, LogFormat};
use uncover_core::{StorageConfig, WorkerConfig};
use uncover_net::{HttpFetcher, LoaderConfig, Request};
use uncover_sw::{CacheStorage, ServiceWorkerContainer};

#[derive(Parser, Debug)]
#[command(name = "uncover-smoke")]
#[command(about = "Install the offline worker against a live origin and route URLs through it")]
struct Args {
    /// Worker config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the store version
    #[arg(long = "version", value_name = "VERSION")]
    worker_version: Option<String>,

    /// Override the scope URL
    #[arg(long)]
    scope: Option<String>,

    /// SQLite database for the stores
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Keep the stores in memory
    #[arg(long, conflicts_with = "storage")]
    memory: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Compact)]
    log_format: LogFormatArg,

    /// Debug logging with source locations
    #[arg(long, short)]
    verbose: bool,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,

    /// URLs to route, absolute or relative to the scope
    urls: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
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

impl Args {
    fn worker_config(&self) -> Result<WorkerConfig> {
        let mut config = match self.config {
            Some(ref path) => WorkerConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => WorkerConfig::default(),
        };

        if let Some(ref version) = self.worker_version {
            config.version = version.clone();
        }
        if let Some(ref scope) = self.scope {
            config.scope = Url::parse(scope).with_context(|| format!("invalid scope {scope}"))?;
        }
        if self.memory {
            config.storage = StorageConfig::Memory;
        } else if let Some(ref path) = self.storage {
            config.storage = StorageConfig::Sqlite { path: path.clone() };
        }

        config.validate().context("invalid worker config")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_config = if args.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(args.log_format.into()))?;

    let config = args.worker_config()?;
    info!(version = %config.version, scope = %config.scope, "Starting smoke run");

    let storage = CacheStorage::from_config(&config.storage).context("opening cache storage")?;
    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::from(&config.network))?);
    let (container, mut events) = ServiceWorkerContainer::new(storage.clone());

    let started = Instant::now();
    let scope = container.register(config.clone(), fetcher).await?;
    let install = scope.install().await;
    let install_ms = started.elapsed().as_millis();

    while let Ok(event) = events.try_recv() {
        info!(?event, "Worker event");
    }

    if let Err(ref e) = install {
        warn!(error = %e, "Install failed");
    }

    let mut routed = Vec::new();
    for raw in &args.urls {
        let url = config
            .resolve(raw)
            .with_context(|| format!("invalid URL {raw}"))?;
        let started = Instant::now();
        let outcome = match scope.handle_fetch(&Request::get(url.clone())).await {
            Some(response) => json!({
                "url": url.as_str(),
                "status": response.status.as_u16(),
                "status_text": response.status_text(),
                "bytes": response.body().len(),
                "elapsed_ms": started.elapsed().as_millis(),
            }),
            None => json!({ "url": url.as_str(), "intercepted": false }),
        };
        routed.push(outcome);
    }

    let report = json!({
        "version": config.version,
        "state": format!("{:?}", scope.state().await),
        "install": {
            "ok": install.is_ok(),
            "error": install.as_ref().err().map(|e| e.to_string()),
            "elapsed_ms": install_ms,
        },
        "stores": storage.keys().await?,
        "entries": storage.cache(&config.version).keys().await?.len(),
        "routed": routed,
    });

    let rendered = serde_json::to_string_pretty(&report)?;
    match args.report {
        Some(ref path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("writing report to {}", path.display()))?;
            info!(path = %path.display(), "Report written");
        }
        None => println!("{rendered}"),
    }

    if install.is_err() {
        bail!("worker did not install");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_flags_and_urls() {
        let args = Args::try_parse_from([
            "uncover-smoke",
            "--version",
            "v9",
            "--memory",
            "--log-format",
            "json",
            "-v",
            "/",
            "/index.html",
        ])
        .unwrap();

        assert_eq!(args.worker_version.as_deref(), Some("v9"));
        assert!(args.memory);
        assert!(args.verbose);
        assert_eq!(args.log_format, LogFormatArg::Json);
        assert_eq!(args.urls, vec!["/", "/index.html"]);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        for argv in [
            vec!["uncover-smoke", "--log-format", "bogus"],
            vec!["uncover-smoke", "--config"],
            vec!["uncover-smoke", "--no-such-flag"],
            vec!["uncover-smoke", "--memory", "--storage", "sw.sqlite3"],
        ] {
            assert!(Args::try_parse_from(argv.iter().copied()).is_err(), "{argv:?}");
        }
    }

    #[test]
    fn test_help_is_available() {
        let err = Args::try_parse_from(["uncover-smoke", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
