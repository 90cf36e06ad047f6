//! Frost host entry point.
//!
//! Parses the command line, loads configuration, loads every shard in the
//! shard directory and runs the console until a shutdown signal arrives or
//! stdin closes. All shards are then torn down and local stores flushed.

mod cli;
mod config;
mod console;
mod logging;
mod signals;

use anyhow::Context;
use cli::CliArgs;
use config::AppConfig;
use shard_system::{CommandTable, HostServices, ShardManager};
use std::sync::Arc;
use tracing::{error, info, warn};

// ============================================================================
// Application
// ============================================================================

pub struct Application {
    config: AppConfig,
    manager: ShardManager,
    commands: Arc<CommandTable>,
}

impl Application {
    /// Loads configuration, sets up logging and builds the shard manager.
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        config.apply_cli(&args);
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

        logging::setup_logging(&config.logging)?;
        display_banner();

        let services = HostServices::local(config.store_directory())
            .await
            .context("opening local storage")?;
        let commands = Arc::new(CommandTable::new());
        let manager = ShardManager::builder(config.to_manager_config())
            .services(services)
            .dispatcher(commands.clone())
            .shared_export("frost.version", env!("CARGO_PKG_VERSION").to_string())
            .build()?;

        info!(
            "📂 Config: {} | Data: {}",
            args.config_path.display(),
            config.server.data_directory
        );
        Ok(Self {
            config,
            manager,
            commands,
        })
    }

    /// Loads every shard, serves the console, then shuts down.
    pub async fn run(self) -> anyhow::Result<()> {
        let manager_config = self.manager.config();
        info!("📋 Configuration Summary:");
        info!("  🔌 Shard directory: {}", manager_config.shard_directory.display());
        info!("  📦 Library cache: {}", manager_config.resolver.local_repository.display());
        info!(
            "  🌐 Repositories: {}",
            manager_config
                .resolver
                .default_repositories
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        info!("  💾 Store directory: {}", self.config.store_directory().display());

        let report = self.manager.load_all().await?;
        if report.failures() > 0 {
            warn!(
                "⚠️ {} shard(s) failed to load; see the report above",
                report.failures()
            );
        }
        info!(
            "✅ Frost is running with {} active shard(s) and {} command(s)",
            report.successes(),
            self.commands.commands().len()
        );
        info!("🛑 Press Ctrl+C to shut down");

        let console = tokio::spawn(console::run_console(self.commands.clone()));
        tokio::select! {
            signal = signals::wait_for_shutdown() => {
                if let Err(e) = signal {
                    error!("❌ Signal handling failed: {}", e);
                }
                info!("🛑 Shutdown signal received");
            }
            finished = console => {
                match finished {
                    Ok(Ok(())) => info!("🛑 Console closed"),
                    Ok(Err(e)) => error!("❌ Console error: {}", e),
                    Err(e) => error!("❌ Console task failed: {}", e),
                }
            }
        }

        let teardown = self.manager.shutdown_all().await;
        if teardown.failures() > 0 {
            warn!("⚠️ {} shard(s) failed to tear down cleanly", teardown.failures());
        }
        info!("👋 Frost shutdown complete");
        Ok(())
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:#}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start Frost: {:#}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║              ❄️  FROST HOST               ║");
    info!("║  {:<40}║", format!("v{}", version));
    info!("║                                          ║");
    info!("║  Isolated shard loading                  ║");
    info!("║  Runtime dependency resolution           ║");
    info!("╚══════════════════════════════════════════╝");
}
