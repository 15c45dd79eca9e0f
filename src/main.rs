use std::{sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use synapse::{
    adapters::{CoapConnectionManager, HttpConnectionManager, HttpUpstreamClient},
    config::models::ServerConfig,
    core::{
        Looper,
        context::{GlobalContext, KEY_CONFIG, KEY_COUNTERS, KEY_WORKER_POOL, SystemCounters},
        router::RouterRoot,
    },
    requests, tracing_setup,
    utils::shutdown::Shutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "synapse.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "synapse.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "synapse.toml")]
        config: String,
    },
    /// Start the dispatch server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "synapse.toml")]
        config: String,
    },
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Synapse dispatch server configuration

http_bind_address = "127.0.0.1:28690"
coap_bind_address = "127.0.0.1:18991"
upstream_address = "http://127.0.0.1:28881/json_rpc"

http_connection_timeout_ms = 30000
upstream_request_timeout_ms = 10000

# 0 means one worker per available CPU
workers_count = 0
worker_queue_len = 32
workers_expelling_interval_ms = 1000
timer_poll_interval_ms = 1000
again_bound = 10
shutdown_grace_ms = 30000

log_level = "info"
log_format = "console"
"#;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => return validate_config_command(&config_path),
        "init" => return init_config_command(&config_path),
        _ => {}
    }

    let config = load_or_default(&config_path)?;
    config
        .validate()
        .map_err(|e| eyre!("configuration rejected: {e}"))?;

    tracing_setup::init_tracing(&config.log_level, config.log_format)
        .map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;
    tracing::info!(config = %config_path, "starting synapse");

    serve(config).await
}

fn load_or_default(config_path: &str) -> Result<ServerConfig> {
    if std::path::Path::new(config_path).exists() {
        synapse::config::load_config(config_path)
    } else {
        eprintln!("config file {config_path} not found, using defaults");
        Ok(ServerConfig::default())
    }
}

fn validate_config_command(config_path: &str) -> Result<()> {
    let config = synapse::config::load_config(config_path)
        .with_context(|| format!("failed to load {config_path}"))?;
    config
        .validate()
        .map_err(|e| eyre!("configuration rejected: {e}"))?;
    println!("{config_path}: configuration is valid");
    Ok(())
}

fn init_config_command(config_path: &str) -> Result<()> {
    if std::path::Path::new(config_path).exists() {
        return Err(eyre!("{config_path} already exists, refusing to overwrite"));
    }
    std::fs::write(config_path, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("failed to write {config_path}"))?;
    println!("wrote default configuration to {config_path}");
    Ok(())
}

async fn serve(config: ServerConfig) -> Result<()> {
    // Global context: populated once here, read-only for handlers afterwards
    // (counters use interior atomics).
    let global = GlobalContext::new();
    let counters = Arc::new(SystemCounters::default());
    global.set(KEY_CONFIG, config.clone());
    global.set_shared(KEY_COUNTERS, Arc::clone(&counters));

    // Route registration happens before arming; arming compiles the matcher
    // and freezes the registration set.
    let router = Arc::new(RouterRoot::new());
    requests::register_all(&router).map_err(|e| eyre!("route registration failed: {e}"))?;
    router.arm().map_err(|e| eyre!("router arming failed: {e}"))?;

    let shutdown = Arc::new(Shutdown::new());
    let upstream = Arc::new(
        HttpUpstreamClient::new(Duration::from_millis(config.upstream_request_timeout_ms))
            .context("failed to build upstream client")?,
    );

    let (looper, handle) = Looper::new(
        &config,
        global.clone(),
        Arc::clone(&counters),
        upstream,
        shutdown.token(),
    );
    global.set_shared(KEY_WORKER_POOL, looper.pool());

    let looper_task = tokio::spawn(looper.run());

    let connection_timeout = Duration::from_millis(config.http_connection_timeout_ms);
    let http = Arc::new(HttpConnectionManager::new(
        Arc::clone(&router),
        handle.clone(),
        connection_timeout,
    ));
    let coap = Arc::new(CoapConnectionManager::new(
        Arc::clone(&router),
        handle.clone(),
        connection_timeout,
    ));

    let http_addr = config.http_bind_address.clone();
    let http_token = shutdown.token();
    let http_task = tokio::spawn(async move { http.serve(&http_addr, http_token).await });

    let coap_addr = config.coap_bind_address.clone();
    let coap_token = shutdown.token();
    let coap_task = tokio::spawn(async move { coap.serve(&coap_addr, coap_token).await });

    shutdown.run_signal_handler().await?;

    // The servers stop accepting on the shutdown token; the looper drains
    // in-flight tasks within the grace period.
    let grace = Duration::from_millis(config.shutdown_grace_ms) + Duration::from_secs(5);
    for (name, task) in [
        ("http", http_task),
        ("coap", coap_task),
    ] {
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!("{name} server failed: {e}"),
            Ok(Err(e)) => tracing::error!("{name} server panicked: {e}"),
            Err(_) => tracing::warn!("{name} server did not stop within the grace period"),
        }
    }
    match tokio::time::timeout(grace, looper_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("looper panicked: {e}"),
        Err(_) => tracing::warn!("looper did not stop within the grace period"),
    }

    tracing::info!("synapse stopped");
    Ok(())
}
