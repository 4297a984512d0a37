//! MemDB daemon
//!
//! Loads configuration, starts every shard and keeps serving until SIGINT or
//! SIGTERM, then stops gracefully so dirty documents reach the backend.

use anyhow::Context;
use colored::Colorize;
use memdb::{BackendConfig, Database, DatabaseConfig};
use tracing_subscriber::{filter::EnvFilter, fmt};

const DEFAULT_CONFIG_PATH: &str = "memdb.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let default_level = if cfg!(debug_assertions) {
        "memdb=debug"
    } else {
        "memdb=info"
    };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    print_banner();

    let config =
        DatabaseConfig::load_from_path(DEFAULT_CONFIG_PATH).context("failed to load config")?;
    print_config(&config);

    let db = Database::open(config).context("failed to open database")?;
    db.start().await.context("failed to start database")?;
    println!("{}", "MemDB is running".bright_green());

    wait_for_shutdown_signal().await?;
    println!("\n{}", "Received shutdown signal".bright_yellow());

    if let Err(e) = db.stop(false).await {
        eprintln!("{} {}", "Error during shutdown:".bright_red(), e);
        return Err(e.into());
    }

    println!("{}", "MemDB stopped".bright_green());
    Ok(())
}

fn print_banner() {
    let banner = r#"
    ███╗   ███╗███████╗███╗   ███╗██████╗ ██████╗
    ████╗ ████║██╔════╝████╗ ████║██╔══██╗██╔══██╗
    ██╔████╔██║█████╗  ██╔████╔██║██║  ██║██████╔╝
    ██║╚██╔╝██║██╔══╝  ██║╚██╔╝██║██║  ██║██╔══██╗
    ██║ ╚═╝ ██║███████╗██║ ╚═╝ ██║██████╔╝██████╔╝
    ╚═╝     ╚═╝╚══════╝╚═╝     ╚═╝╚═════╝ ╚═════╝
                  Document Store v0.1.0
    "#;

    println!("{}", banner.bright_blue());
}

fn print_config(config: &DatabaseConfig) {
    println!("Configuration:");
    match &config.backend {
        BackendConfig::Memory => println!("  Backend: {}", "memory".bright_cyan()),
        BackendConfig::File { data_dir } => {
            println!("  Backend: {} ({})", "file".bright_cyan(), data_dir.bright_cyan())
        }
    }
    for shard in &config.shards {
        println!(
            "  Shard {}: persistent delay {} ms, idle timeout {} ms",
            shard.id.bright_cyan(),
            shard.persistent_delay_ms.to_string().bright_cyan(),
            shard.idle_timeout_ms.to_string().bright_cyan()
        );
    }
    for (name, collection) in &config.collections {
        println!(
            "  Collection {}: indexes [{}]",
            name.bright_cyan(),
            collection.indexes.join(", ")
        );
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).context("failed to create SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to create SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
    }

    Ok(())
}
