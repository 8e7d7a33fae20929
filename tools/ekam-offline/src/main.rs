//! Command-line harness for the Ekam offline cache controller.
//!
//! Keeps cache storage in a JSON snapshot between runs, so an `install`
//! followed by `fetch` against a stopped server shows exactly what a page
//! would get while offline.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the app shell from a local server and activate it
//! ekam-offline install --origin http://localhost:5000
//!
//! # Replay a navigation through the controller
//! ekam-offline fetch --origin http://localhost:5000 /properties --navigate
//!
//! # List cache generations in the snapshot
//! ekam-offline status
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ekam_common::{
    init_logging, retry_with_backoff, EkamError, LogConfig, LogFormat, OptionExt, RetryConfig,
};
use ekam_net::{Fetcher, HttpFetcher, LoaderConfig, Request};
use ekam_sw::{
    CacheStorage, ControllerConfig, FetchOutcome, OfflineController, ServiceWorkerError,
};
use http::Method;
use tokio::sync::RwLock;
use tracing::{error, info, Level};
use url::Url;

#[derive(Parser)]
#[command(name = "ekam-offline")]
#[command(about = "Drive the Ekam offline cache controller against a live origin")]
struct Cli {
    /// Cache snapshot file
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Controller config (JSON); defaults are used for missing keys
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Log format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache the manifest from an origin, then activate
    Install {
        /// Site origin, e.g. http://localhost:5000
        #[arg(long)]
        origin: Url,
        /// Install attempts before giving up
        #[arg(long, default_value = "3")]
        attempts: u32,
    },

    /// Send one request through the controller
    Fetch {
        /// Site origin
        #[arg(long)]
        origin: Url,
        /// Path or absolute URL to request
        target: String,
        /// Treat as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Accept header
        #[arg(long)]
        accept: Option<String>,
        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: Method,
    },

    /// List cache generations in the snapshot
    Status,

    /// Delete every generation except the configured one
    Purge,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig::default()
        .with_level(cli.log_level)
        .with_format(cli.log_format);
    if let Err(e) = init_logging(log_config) {
        eprintln!("{e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(category = e.category(), "{e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<(), EkamError> {
    let store = match cli.store {
        Some(path) => path,
        None => default_store_path().ok_or_not_found("cache directory")?,
    };
    let config = match cli.config {
        Some(ref path) => ControllerConfig::from_json_file(path).map_err(to_ekam)?,
        None => ControllerConfig::default(),
    };

    match cli.command {
        Commands::Install { origin, attempts } => install(&store, config, origin, attempts).await,
        Commands::Fetch {
            origin,
            target,
            navigate,
            accept,
            method,
        } => {
            let url = origin
                .join(&target)
                .map_err(|e| EkamError::InvalidArgument(format!("{target}: {e}")))?;
            let mut request = if navigate {
                Request::navigate(url)
            } else {
                Request::get(url)
            }
            .with_method(method);
            if let Some(accept) = accept {
                request = request.accept(&accept);
            }
            fetch(&store, config, origin, request).await
        }
        Commands::Status => status(&store, &config),
        Commands::Purge => purge(&store, config).await,
    }
}

async fn install(
    store: &Path,
    config: ControllerConfig,
    origin: Url,
    attempts: u32,
) -> Result<(), EkamError> {
    let controller = controller(store, config, origin)?;
    let c = &controller;

    retry_with_backoff(
        &RetryConfig::attempts(attempts),
        EkamError::is_retryable,
        || async move { c.install().await.map_err(to_ekam) },
    )
    .await?;
    controller.activate().await.map_err(to_ekam)?;

    save(&controller, store).await?;
    info!(cache = %controller.config().cache_name, store = %store.display(), "Installed");
    Ok(())
}

async fn fetch(
    store: &Path,
    config: ControllerConfig,
    origin: Url,
    request: Request,
) -> Result<(), EkamError> {
    let controller = controller(store, config, origin)?;
    controller.restore().await.map_err(to_ekam)?;

    match controller.handle_fetch(&request).await.map_err(to_ekam)? {
        FetchOutcome::Passthrough(reason) => {
            println!("{} {} not intercepted ({:?})", request.method, request.url, reason);
        }
        FetchOutcome::Respond(served) => {
            let content_type = served
                .response
                .content_type()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{} {}", request.method, request.url);
            println!("  Status:       {}", served.response.status);
            println!("  Source:       {}", served.source.as_str());
            println!("  Type:         {}", served.response.response_type.as_str());
            println!("  Content-Type: {}", content_type);
            println!("  Bytes:        {}", served.response.body.len());
        }
    }

    save(&controller, store).await
}

fn status(store: &Path, config: &ControllerConfig) -> Result<(), EkamError> {
    let storage = CacheStorage::load(store).map_err(to_ekam)?;
    let names = storage.keys();

    println!("Snapshot: {}", store.display());
    if names.is_empty() {
        println!("  (no cache generations)");
    }
    for name in names {
        let entries = storage.get(&name).map(|c| c.len()).unwrap_or(0);
        let marker = if name == config.cache_name { "*" } else { " " };
        println!("{} {:<24} {} entries", marker, name, entries);
    }
    Ok(())
}

async fn purge(store: &Path, config: ControllerConfig) -> Result<(), EkamError> {
    // Purging never touches the network; the origin only anchors the scope.
    let scope = Url::parse("http://localhost/")
        .map_err(|e| EkamError::InvalidArgument(e.to_string()))?;
    let controller = controller(store, config, scope)?;

    let removed = controller.delete_stale_caches().await;
    println!("Removed {} stale generation(s)", removed.len());
    for name in removed {
        println!("  {name}");
    }

    save(&controller, store).await
}

fn controller(
    store: &Path,
    config: ControllerConfig,
    origin: Url,
) -> Result<OfflineController, EkamError> {
    let storage = CacheStorage::load(store).map_err(to_ekam)?;
    let fetcher: Arc<dyn Fetcher> = Arc::new(
        HttpFetcher::new(&origin, LoaderConfig::default())
            .map_err(|e| EkamError::network("cannot build HTTP client").with_source(e))?,
    );

    let (controller, _events) = OfflineController::with_storage(
        config,
        origin,
        fetcher,
        Arc::new(RwLock::new(storage)),
    )
    .map_err(to_ekam)?;
    Ok(controller)
}

async fn save(controller: &OfflineController, store: &Path) -> Result<(), EkamError> {
    controller
        .caches()
        .read()
        .await
        .save(store)
        .map_err(|e| EkamError::cache(format!("cannot write {}", store.display())).with_source(e))
}

fn default_store_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("ekam").join("offline-cache.json"))
}

/// sysexits(3) codes, so scripts can tell an unreachable origin from a bad config.
fn exit_code(error: &EkamError) -> u8 {
    match error {
        EkamError::InvalidArgument(_) => 64,
        EkamError::Cache { .. } => 65,
        EkamError::NotFound(_) => 66,
        EkamError::Network { .. } => 69,
        EkamError::Io(_) => 74,
        EkamError::Lifecycle { .. } | EkamError::Timeout(_) => 75,
        EkamError::Config { .. } => 78,
    }
}

fn to_ekam(error: ServiceWorkerError) -> EkamError {
    match error {
        ServiceWorkerError::InstallFailed { .. } => {
            EkamError::lifecycle("install failed").with_source(error)
        }
        ServiceWorkerError::Network { .. } => EkamError::network("fetch failed").with_source(error),
        ServiceWorkerError::NotFound(what) => {
            EkamError::NotFound(format!("{what} (run `ekam-offline install` first)"))
        }
        ServiceWorkerError::Config(message) => EkamError::config(message),
        ServiceWorkerError::State(message) => EkamError::InvalidArgument(message),
        other => EkamError::cache("cache storage").with_source(other),
    }
}
