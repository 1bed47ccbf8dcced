pub mod config;
pub mod db;
pub mod hardware;
pub mod ingest;
pub mod monitoring;
pub mod samples;
pub mod sensing;
pub mod stage;
pub mod utils;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde_json::Map;

use config::AppConfig;
use db::Database;
use ingest::{BrokerSupervisor, Ingestion, MessageRouter};
use monitoring::SystemMonitor;
use samples::SampleManager;
use sensing::{PresencePoller, TagPoller};
use stage::{BroadcastObserver, LogObserver, StageController, StageName, StageTimings};

const DISPLAY_CHANNEL_CAPACITY: usize = 64;

/// Everything the station runs, in the order it was started.
struct Station {
    stage: StageController,
    ingestion: Ingestion,
    monitor: Option<SystemMonitor>,
    broker: BrokerSupervisor,
}

pub fn run() -> Result<()> {
    utils::init_logging();
    info!("UroGuardian starting up...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    runtime.block_on(async {
        let config = AppConfig::load(&AppConfig::default_path())?;
        let station = start(config).await?;

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        info!("Shutdown requested");

        stop(station).await;
        Ok(())
    })
}

async fn start(config: AppConfig) -> Result<Station> {
    let database = Database::new(config.database_path.clone())?;

    let broker_config = config.broker.clone();
    let (broker, broker_up) = tokio::task::spawn_blocking(move || {
        let mut supervisor = BrokerSupervisor::from_config(&broker_config);
        let up = supervisor.ensure_running(
            broker_config.max_retries,
            Duration::from_millis(broker_config.retry_delay_ms),
        );
        (supervisor, up)
    })
    .await
    .context("broker supervisor task failed")?;
    if !broker_up {
        // The client keeps retrying, so an external broker may still appear.
        warn!("MQTT broker is not running; ingestion will keep retrying");
    }

    let distance_sensor = hardware::build_distance_sensor(&config.presence)?;
    let tag_reader = hardware::build_tag_reader(&config.tag_reader)?;

    let stage = StageController::new(
        database.clone(),
        PresencePoller::from_config(distance_sensor, &config.presence),
        TagPoller::new(tag_reader),
        StageTimings::from_config(&config),
    );
    stage.register_observer(Arc::new(LogObserver));
    let stage_updates = config.mqtt.stage_topic.clone().map(|topic| {
        let display = BroadcastObserver::new(DISPLAY_CHANNEL_CAPACITY);
        let updates = display.subscribe();
        stage.register_observer(Arc::new(display));
        (updates, topic)
    });
    stage.set_stage(StageName::Idle, Map::new()).await?;

    let samples = Arc::new(SampleManager::new(
        database.clone(),
        stage.clone(),
        config.processing.clone(),
    ));
    let recovered = samples.recover_open_samples().await?;
    if recovered > 0 {
        warn!("Closed {recovered} samples left open by the previous run");
    }

    let router = Arc::new(MessageRouter::new(database.clone(), samples, &config.mqtt));
    let mut ingestion = Ingestion::start(&config.mqtt, router)?;
    if let Some((updates, topic)) = stage_updates {
        ingestion.publish_stages(updates, topic);
    }

    let monitor = config.monitoring.enabled.then(|| {
        SystemMonitor::start(
            database.clone(),
            Duration::from_secs(config.monitoring.interval_secs),
        )
    });

    info!("UroGuardian ready");
    Ok(Station {
        stage,
        ingestion,
        monitor,
        broker,
    })
}

async fn stop(station: Station) {
    let Station {
        stage,
        ingestion,
        monitor,
        mut broker,
    } = station;

    stage.shutdown().await;
    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    ingestion.disconnect().await;

    if let Err(err) = tokio::task::spawn_blocking(move || broker.shutdown()).await {
        error!("Broker shutdown task failed: {err}");
    }
    info!("UroGuardian stopped");
}
