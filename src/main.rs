//! Request engine runner.
//!
//! ```text
//!   --config engine.toml
//!        │
//!        ▼
//!   load + validate ──→ logging, metrics
//!        │
//!        ▼
//!   RequestHandler::start ──→ transport (HTTP | FastCGI) ──→ worker pool
//!        │
//!        ▼
//!   control loop
//!     SIGHUP / file change → reload config + filters → reconfigure
//!     SIGUSR2              → restart
//!     SIGINT / SIGTERM     → stop (bounded by termination_timeout)
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::sync::mpsc;

use request_engine::config::watcher::ConfigWatcher;
use request_engine::config::{load_config, EngineConfig};
use request_engine::connection::Connection;
use request_engine::lifecycle::{ControlEvent, Signals};
use request_engine::observability::{logging, metrics};
use request_engine::session::SessionValue;
use request_engine::{handler_ref, AccessFilterList, HandlerResult, PredicateRegistry, RequestHandler};

#[derive(Parser)]
#[command(name = "request-engine")]
#[command(about = "Serve a demo application over HTTP or FastCGI", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    logging::init(&config.logging);

    let registry = demo_registry();
    let filters = AccessFilterList::from_config(&config.filters, &registry)?;
    if cli.check {
        tracing::info!(rules = filters.len(), "Configuration is valid");
        return Ok(());
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        transport = config.transport.kind.as_str(),
        workers = config.workers.concurrency,
        filters = filters.len(),
        "request-engine v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let engine = RequestHandler::new(handler_ref(demo_handler), filters, config.clone())?;
    engine.start().await?;

    let mut signals = Signals::install()?;
    let (_watcher, mut updates) = match (&cli.config, config.lifecycle.watch_config) {
        (Some(path), true) => {
            let (watcher, rx) = ConfigWatcher::new(path);
            (Some(watcher.run()?), Some(rx))
        }
        _ => (None, None),
    };

    loop {
        tokio::select! {
            event = signals.recv() => match event {
                ControlEvent::Reload => {
                    if let Some(path) = &cli.config {
                        reload_from(path, &engine, &registry);
                    }
                }
                ControlEvent::Restart => {
                    if let Err(e) = engine.restart().await {
                        tracing::error!(error = %e, "Restart failed");
                    }
                }
                ControlEvent::Stop => break,
            },
            Some(new_config) = next_update(&mut updates) => {
                apply(new_config, &engine, &registry);
            }
        }
    }

    let deadline = engine.snapshot().config.lifecycle.termination_timeout();
    match tokio::time::timeout(deadline, engine.stop()).await {
        Ok(Ok(())) => tracing::info!("Shutdown complete"),
        Ok(Err(e)) => tracing::error!(error = %e, "Shutdown failed"),
        Err(_) => {
            tracing::warn!(timeout = ?deadline, "Handlers still running at deadline, exiting");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn next_update(rx: &mut Option<mpsc::UnboundedReceiver<EngineConfig>>) -> Option<EngineConfig> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn reload_from(path: &Path, engine: &RequestHandler, registry: &PredicateRegistry) {
    match load_config(path) {
        Ok(config) => apply(config, engine, registry),
        Err(e) => tracing::error!(error = %e, "Reload failed, keeping current configuration"),
    }
}

fn apply(config: EngineConfig, engine: &RequestHandler, registry: &PredicateRegistry) {
    let filters = match AccessFilterList::from_config(&config.filters, registry) {
        Ok(filters) => filters,
        Err(e) => {
            tracing::error!(error = %e, "Invalid filters, keeping current configuration");
            return;
        }
    };
    if let Err(e) = engine.reconfigure(None, Some(filters), Some(config)) {
        tracing::error!(error = %e, "Reconfigure rejected");
    }
}

/// Credentials for the `demo` predicate come from the environment.
fn demo_registry() -> PredicateRegistry {
    let user = std::env::var("ENGINE_DEMO_USER").ok();
    let password = std::env::var("ENGINE_DEMO_PASSWORD").ok();
    let mut registry = PredicateRegistry::new();
    registry.register("demo", move |u: &str, p: &str| {
        matches!((&user, &password), (Some(user), Some(password)) if user == u && password == p)
    });
    registry
}

fn demo_handler(conn: &mut Connection) -> HandlerResult {
    let visits = conn.session().update(|values| {
        let next = match values.get("visits") {
            Some(SessionValue::UInt(n)) => n + 1,
            _ => 1,
        };
        values.insert("visits".to_string(), SessionValue::UInt(next));
        next
    })?;

    let path = conn.request().path_string();
    let method = conn.request().method().to_string();
    let response = conn.response_mut();
    response.set_header("cache-control", "no-store");
    response.set_body(format!(
        "<!DOCTYPE html>\n<html><body><h1>request-engine</h1>\
         <p>{} {}</p><p>Visits this session: {}</p></body></html>\n",
        method,
        html_escape(&path),
        visits
    ));
    Ok(())
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
