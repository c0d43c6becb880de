// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use visorcloud::config::CloudConfig;

#[derive(Parser)]
#[command(name = "visor-cloud", about = "Smart-glasses cloud control plane")]
struct Cli {
    #[command(flatten)]
    config: CloudConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = visorcloud::run(cli.config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
