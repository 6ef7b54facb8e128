/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use lysand_core::config::{default_data_dir, ServerConfig};
use lysand_core::logging::init_tracing;
use lysand_core::object_fetch::{HttpFetcher, RemoteFetcher};
use lysand_core::users::{IdentityResolver, StoreIdentityResolver};
use lysand_core::{routes, NoteDb, NoteEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("LYSAND_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(default_data_dir()?.join("config.json"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl_c listener failed: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg_path = parse_config_path()?;
    let cfg = Arc::new(ServerConfig::load(&cfg_path)?);
    init_tracing(&cfg.logging.filter);
    info!(version = lysand_core::version(), "lysand core service starting");
    info!("config: {}", cfg_path.display());

    let db_path = cfg.database_path()?;
    let db = NoteDb::open(&db_path)?;
    info!("database: {}", db_path.display());

    let fetcher: Arc<dyn RemoteFetcher> = Arc::new(HttpFetcher::new(Duration::from_secs(
        cfg.federation.fetch_timeout_secs,
    ))?);
    let identities: Arc<dyn IdentityResolver> =
        Arc::new(StoreIdentityResolver::new(db.clone(), cfg.clone(), fetcher.clone()));
    let engine = NoteEngine::new(db, cfg.clone(), fetcher, identities);

    let listener = tokio::net::TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("bind {}", cfg.http.bind))?;
    info!("listening on http://{} (public {})", cfg.http.bind, cfg.base_url());

    axum::serve(listener, routes::router(engine).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;
    info!("lysand core service stopped");
    Ok(())
}
