//! modhost CLI entry point.
//!
//! Loads the configuration, starts the module host with its kv/sql bridges
//! and serves it over HTTP until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modhost_bridge::{Bridges, register_all};
use modhost_common::{ConfigFile, HostError};
use modhost_core::{ModuleHost, WasmEngine, create_linker};
use modhost_server::{ModuleServer, ServerConfig};

/// Sandboxed WebAssembly module host.
#[derive(Debug, Parser)]
#[command(name = "modhost")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "MODHOST_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, e.g. 0.0.0.0:8080
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<SocketAddr>,

    /// Module directory or single module file to watch
    #[arg(long, env = "EXECUTE_PATH")]
    execute_path: Option<PathBuf>,

    /// Instances per module
    #[arg(long, env = "WASM_INSTANCE_NUM")]
    instances: Option<usize>,

    /// Redis URL for the kv bridge
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Postgres URL for the sql bridge
    #[arg(long, env = "POSTGRES_URL")]
    postgres_url: Option<String>,

    /// Enable or disable the module host
    #[arg(long, env = "WASM_ENABLE")]
    wasm_enable: Option<bool>,
}

impl Cli {
    /// Read the config file, if any, and apply command-line overrides.
    fn load_config(&self) -> anyhow::Result<ConfigFile> {
        let mut config = match &self.config {
            Some(path) => ConfigFile::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ConfigFile::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut ConfigFile) {
        let host = &mut config.runtime.host;
        if let Some(path) = &self.execute_path {
            host.watch_path.clone_from(path);
        }
        if let Some(instances) = self.instances {
            host.max_instances = instances;
        }
        if let Some(enabled) = self.wasm_enable {
            host.enabled = enabled;
        }

        let bridges = &mut config.runtime.bridges;
        if let Some(url) = &self.redis_url {
            bridges.kv.url = Some(url.clone());
        }
        if let Some(url) = &self.postgres_url {
            bridges.sql.url = Some(url.clone());
        }

        if let Some(bind) = self.bind {
            config.server.bind_addr = bind.to_string();
        }
    }
}

/// Log host events through tracing.
fn install_callbacks(host: &ModuleHost) {
    host.on_module_loaded(|name| info!(module = name, "Module ready"));
    host.on_module_unloaded(|name| info!(module = name, "Module removed"));
    host.on_call_error(|module, function, err| {
        error!(module, function, error = %err, "Module error");
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,modhost=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let runtime = &config.runtime;

    info!(
        watch_path = %runtime.host.watch_path.display(),
        max_instances = runtime.host.max_instances,
        bind_addr = %config.server.bind_addr,
        "Configuration loaded"
    );

    let engine = WasmEngine::new(&runtime.engine).context("Failed to create engine")?;
    let bridges = Bridges::connect(&runtime.bridges).await;

    let mut linker = create_linker(&engine).context("Failed to create linker")?;
    register_all(&mut linker, &bridges).context("Failed to register host functions")?;

    let host = ModuleHost::new(runtime, engine, linker);
    install_callbacks(&host);

    match host.start().await {
        Ok(()) => {}
        Err(HostError::Disabled) => warn!("Module host disabled; calls will be rejected"),
        Err(e) => return Err(e).context("Failed to start module host"),
    }

    let server_config = ServerConfig::from_file(&config.server, &config.admin)?;
    let server = ModuleServer::new(Arc::clone(&host), server_config);

    info!("Server initialized. Available endpoints:");
    info!("  POST /run                                  - Run a module's entry point");
    info!("  POST /wasm                                 - Call a function by options");
    info!("  POST /modules/:name/functions/:function    - Call a function with JSON args");
    info!("  GET  /modules, /modules/:name              - Inspect loaded modules");
    info!("  GET  /health, /ready                       - Health and readiness");

    let served = server.run().await;
    host.shutdown().await;
    served?;

    Ok(())
}
