//! 'main' for the Tessera node process

use std::sync::Arc;

use anyhow::Result;
use caryatid_process::Process;
use clap::Parser;
use config::{Config, Environment, File};
use tessera_common::messages::Message;
use tessera_module_consensus::Consensus;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

#[derive(Debug, clap::Parser)]
#[command(name = "tessera-node", about = "Validating node following the most-work chain")]
struct Args {
    /// Configuration files, later ones override earlier ones
    #[arg(long, value_name = "PATH", default_values_t = vec!["node.toml".to_string()])]
    config: Vec<String>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG sets levels; fjall is noisy below warn
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,fjall=warn"));
    Registry::default().with(fmt::layer().with_filter(filter)).init();

    info!("Tessera node process");

    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = Arc::new(builder.add_source(Environment::with_prefix("TESSERA")).build()?);

    let mut process = Process::<Message>::create(config).await;

    Consensus::register(&mut process);

    process.run().await?;

    info!("Exiting");
    Ok(())
}
