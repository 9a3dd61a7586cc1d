/*
 * SPDX-FileCopyrightText: 2026 Corvid Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use corvid_core::{config::FederationConfig, runtime::FederationState, server};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn parse_config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config requires a path")?;
            return Ok(Some(PathBuf::from(path)));
        }
    }
    if let Ok(path) = std::env::var("CORVID_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(Some(PathBuf::from(path)));
        }
    }
    Ok(None)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match parse_config_path()? {
        Some(path) => {
            info!("config: {}", path.display());
            FederationConfig::load(&path)?
        }
        None => {
            info!("no config given; using defaults");
            FederationConfig::default()
        }
    };

    let data_dir = config.data_dir()?;
    let bind = config.bind.clone();
    let state = FederationState::open(config, &data_dir)?;
    info!("corvid federation service starting as {}", state.local_actor_id());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    state.start_workers(shutdown_rx);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!("listening on {bind}");

    let app = server::app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    Ok(())
}
