//! lbsd — LBP bootstrap server daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use lbs_core::BootstrapConfig;
use lbs_services::{BootstrapEvent, ChannelObserver};
use lbsd::bridge::{ModemBridge, UdpLink};
use lbsd::engine::RekeyError;
use lbsd::{BootstrapEngine, BootstrapService, ServiceHandle};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = BootstrapConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BootstrapConfig::load().context("failed to load config")?;
    tracing::info!(
        server = %config.identity.server_identity,
        base = config.bootstrap.short_address_base,
        capacity = config.bootstrap.capacity,
        slots = config.bootstrap.slots,
        "lbsd starting"
    );

    // Engine
    let (link, requests) = UdpLink::new(config.network.max_hops);
    let mut engine =
        BootstrapEngine::new(&config, Arc::new(link)).context("invalid bootstrap configuration")?;
    let (observer, events) = ChannelObserver::new(64);
    engine.set_observer(Arc::new(observer));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let (service, handle) =
        BootstrapService::new(engine, config.tick_interval(), shutdown_tx.subscribe());
    let service_task = tokio::spawn(service.run());

    let socket = Arc::new(
        UdpSocket::bind(config.network.bridge_bind)
            .await
            .with_context(|| format!("failed to bind {}", config.network.bridge_bind))?,
    );
    let bridge_task = tokio::spawn(
        ModemBridge::new(
            socket,
            config.network.modem_addr,
            handle.clone(),
            requests,
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let event_task = tokio::spawn(log_events(events));

    let rekey_task = config.rekey_interval().map(|period| {
        tracing::info!(period_secs = period.as_secs(), "periodic rekey enabled");
        tokio::spawn(periodic_rekey(handle.clone(), period, shutdown_tx.subscribe()))
    });

    drop(handle);

    tokio::select! {
        r = bridge_task => match r {
            Ok(Ok(())) => tracing::info!("modem bridge stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "modem bridge failed"),
            Err(e) => tracing::error!(error = %e, "modem bridge panicked"),
        },
        r = service_task => match r {
            Ok(engine) => tracing::info!(joined = engine.joined_count(), "bootstrap service stopped"),
            Err(e) => tracing::error!(error = %e, "bootstrap service panicked"),
        },
    }

    let _ = shutdown_tx.send(());
    if let Some(task) = rekey_task {
        task.abort();
    }
    event_task.abort();
    tracing::info!("lbsd stopped");
    Ok(())
}

async fn log_events(mut events: tokio::sync::mpsc::Receiver<BootstrapEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            BootstrapEvent::Joined { identity, address } => {
                tracing::info!(device = %identity, address = %address, "event: joined")
            }
            BootstrapEvent::Departed { identity, address } => {
                tracing::info!(device = %identity, address = %address, "event: departed")
            }
            BootstrapEvent::RekeyCompleted { key_index } => {
                tracing::info!(key_index, "event: group key rotated")
            }
        }
    }
}

async fn periodic_rekey(
    handle: ServiceHandle,
    period: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    // The first tick fires immediately; skip it.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => match handle.launch_rekey().await {
                Ok(Ok(())) => {}
                Ok(Err(RekeyError::NoDevices)) => tracing::debug!("no devices to rekey"),
                Ok(Err(e)) => tracing::info!(error = %e, "periodic rekey skipped"),
                Err(e) => {
                    tracing::warn!(error = %e, "bootstrap service gone");
                    return;
                }
            },
        }
    }
}
