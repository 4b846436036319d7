pub mod cli;
pub mod db;
pub mod plugin;
pub mod query;
pub mod settings;
mod utils;
pub mod writer;

use anyhow::Context;
use clap::Parser;

pub use db::{Database, StoreError, StoreResult, Value, ValueKind};
pub use plugin::Plugin;
pub use settings::PluginConfig;

pub fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = cli::Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(cli::handle(cli))
}
