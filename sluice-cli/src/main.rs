//! Sluice CLI

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http::header::{HeaderName, HeaderValue};
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Full};
use serde_json::json;
use sluice_core::response::responses;
use sluice_core::{handler_fn, Body, Middleware, Next};
use sluice_scripting::{EngineLifecycleManager, InterceptConfig, InterceptDispatcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Script interception for HTTP handler chains", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Construct the script engine described by a configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "sluice.yaml")]
        config: PathBuf,
    },

    /// Run one request through the interceptor against an echo handler
    Invoke {
        /// Path to configuration file
        #[arg(short, long, default_value = "sluice.yaml")]
        config: PathBuf,

        /// Request method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Request path and query
        #[arg(short, long, default_value = "/")]
        path: String,

        /// Request header as `name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        body: Option<String>,

        /// Print dispatch statistics after the response
        #[arg(long)]
        stats: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Check { config } => {
            let config = load_config(&config)?;
            let manager = EngineLifecycleManager::with_rhai(config);

            match manager.current_handle() {
                Ok(handle) => {
                    tracing::info!("✓ Script engine constructed");
                    tracing::info!("  Entry: {}::{}", handle.module(), handle.function());
                    tracing::info!("  Language: {}", handle.engine().language());
                    match handle.watched() {
                        Some(watched) => tracing::info!("  Watching: {}", watched.path().display()),
                        None => tracing::info!("  Watching: nothing (reload detection off)"),
                    }
                    let cache = handle.cache_stats();
                    tracing::info!("  Compiled modules: {}", cache.cached_scripts);
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("✗ Script engine failed to initialize: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Invoke {
            config,
            method,
            path,
            headers,
            body,
            stats,
        } => {
            let config = load_config(&config)?;
            let manager = Arc::new(EngineLifecycleManager::with_rhai(config));
            manager.start();
            let dispatcher = Arc::new(InterceptDispatcher::new(manager));

            let stack: Arc<[Arc<dyn Middleware>]> =
                Arc::new([Arc::clone(&dispatcher) as Arc<dyn Middleware>]);
            let chain = Next::with_handler(stack, handler_fn(echo));

            let request = build_request(&method, &path, &headers, body)?;
            let response = match chain.run(request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "Request failed outside the interceptor");
                    responses::from_error(&e)?
                }
            };

            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| anyhow!("Failed to read response body: {e:?}"))?
                .to_bytes();

            tracing::info!(status = %parts.status, "Request dispatched");
            println!("{:?} {}", parts.version, parts.status);
            for (name, value) in &parts.headers {
                println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
            println!();
            println!("{}", String::from_utf8_lossy(&body));

            if stats {
                println!("{}", serde_json::to_string_pretty(&dispatcher.stats())?);
            }
            Ok(())
        }

        Commands::Version => {
            println!("Sluice");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

/// Load a configuration file, resolving a relative home against its directory
fn load_config(path: &Path) -> Result<InterceptConfig> {
    tracing::info!("Loading configuration: {}", path.display());
    let mut config = InterceptConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    if let Some(home) = config.home.as_ref().filter(|home| home.is_relative()) {
        config.home = Some(base.join(home));
    }
    if let Some(watched) = config.watched_path.as_ref().filter(|p| p.is_relative()) {
        config.watched_path = Some(base.join(watched));
    }
    Ok(config)
}

fn build_request(
    method: &str,
    path: &str,
    headers: &[String],
    body: Option<String>,
) -> Result<Request<Body>> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid method '{method}'"))?;
    let mut builder = Request::builder().method(method).uri(path);

    for header in headers {
        let Some((name, value)) = header.split_once(':') else {
            bail!("Header '{header}' is not in 'name: value' form");
        };
        builder = builder.header(
            HeaderName::from_bytes(name.trim().as_bytes())?,
            HeaderValue::from_str(value.trim())?,
        );
    }

    let body = body.map(Bytes::from).unwrap_or_default();
    Ok(builder.body(Full::new(body))?)
}

/// Final handler answering with a JSON description of the request it saw
async fn echo(req: Request<Body>) -> sluice_core::Result<Response<Body>> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| sluice_core::Error::Internal(format!("{e:?}")))?
        .to_bytes();

    let headers: serde_json::Map<String, serde_json::Value> = parts
        .headers
        .iter()
        .map(|(name, value)| (name.to_string(), json!(value.to_str().unwrap_or_default())))
        .collect();

    responses::ok()
        .header(HeaderName::from_static("x-echo"), "1")
        .json_body(&json!({
            "method": parts.method.as_str(),
            "uri": parts.uri.to_string(),
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
}

fn init_tracing(level: &str) {
    let filter = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(filter.into()))
        .init();
}
