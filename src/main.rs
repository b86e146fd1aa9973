// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result};
use ovlnet::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger_default},
    crypto::identity::Identity,
    node::engine::OverlayNode,
    services::echo::EchoService,
    utils::human_rate,
};
use tokio::time::interval;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_logger_default();

    // Optional config file; a bare start runs on defaults (port 7741).
    let cfg = match std::env::args().nth(1) {
        Some(path) => resolve_config_path(&path)
            .and_then(Config::load_from_file)
            .context("failed to resolve or load config")?,
        None => Config::default(),
    };

    let identity = match &cfg.node.identity_file {
        Some(path) if std::path::Path::new(path).exists() => {
            Identity::load(path).context("failed to load identity")?
        },
        Some(path) => {
            let id = Identity::generate()?;
            id.save(path).context("failed to save fresh identity")?;
            info!(path = %path, "created fresh identity");
            id
        },
        None => Identity::generate()?,
    };

    let node = OverlayNode::start(cfg, identity, Box::new(EchoService)).await?;
    info!(id = %node.local_id(), port = node.local_port(), "daemon up");

    let mut status = interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                node.shutdown();
                break;
            },
            _ = status.tick() => {
                let stats = node.stats();
                let nodes = node.num_nodes().await.unwrap_or(0);
                info!(
                    nodes,
                    in_rate = %human_rate(stats.in_rate),
                    out_rate = %human_rate(stats.out_rate),
                    "status"
                );
            },
        }
    }
    Ok(())
}
