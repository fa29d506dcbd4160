// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use clap::Parser;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use haproxy_ingress::config::Config;
use haproxy_ingress::controller::Controller;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    info!(
        "Starting {} for ingress class {}",
        haproxy_ingress::constants::CONTROLLER_NAME,
        config.ingress_class
    );

    // Fail fast on an invalid reload strategy, before touching the cluster
    config.reload_strategy()?;

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let controller = Controller::configure(&config, client)?;
    controller.start();

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
        _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
    }

    controller.stop().await;
    info!("{} stopped after {} updates", controller.name(), controller.update_count());
    Ok(())
}
