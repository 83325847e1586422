mod config;
mod db;
mod mqtt;
mod state;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::{Db, SqliteSnapshotStore};
use mqtt::{AckTracker, MqttDispatcher, MqttEntities};
use smart_water_engine::{Engine, Host, SystemClock};
use state::HubState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:smart-water.db?mode=rwc".to_string());
    let config_path = PathBuf::from(env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string()));

    // ── Controller config ───────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    info!(
        name = %cfg.name,
        stations = cfg.num_stations(),
        control = ?cfg.control_method,
        "controller config loaded"
    );

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    let store = Arc::new(SqliteSnapshotStore::new(db, cfg.unique_prefix()));

    // ── Shared state (ephemeral, for the status endpoint) ───────────
    let shared = Arc::new(RwLock::new(HubState::new()));
    shared.write().await.record_system("hub started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("smart-water-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    let entities = Arc::new(MqttEntities::default());
    let acks = Arc::new(AckTracker::new());
    tokio::spawn(mqtt::run(client.clone(), eventloop, entities.clone(), acks.clone(), shared.clone()));
    if !acks.wait_connected(Duration::from_secs(10)).await {
        warn!("mqtt broker not reachable yet, starting without it");
    }

    // ── Engine ──────────────────────────────────────────────────────
    let engine = Engine::new(
        cfg,
        Host {
            clock: Arc::new(SystemClock),
            entities,
            dispatcher: Arc::new(MqttDispatcher::new(client, acks)),
            store,
        },
    )
    .context("invalid controller configuration")?;
    engine.start().await;

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        engine: engine.clone(),
        hub: shared.clone(),
        config_path,
    };
    let web = tokio::spawn(web::serve(app));

    tokio::select! {
        res = web => match res {
            Ok(Ok(())) => warn!("web server exited"),
            Ok(Err(e)) => error!("web server failed: {e:#}"),
            Err(e) => error!("web server task panicked: {e}"),
        },
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for shutdown signal: {e}");
            }
            info!("shutdown requested");
        }
    }

    engine.shutdown();
    shared.write().await.record_system("hub stopped".to_string());
    Ok(())
}
