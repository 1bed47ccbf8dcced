use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::PresenceConfig;
use crate::hardware::DistanceSensor;

use super::worker::{PendingStop, Worker};
use super::BoxFuture;
use crate::log_debug;

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceEvent {
    InUse,
    Nearby,
    Absent,
}

impl PresenceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceEvent::InUse => "IN_USE",
            PresenceEvent::Nearby => "NEARBY",
            PresenceEvent::Absent => "ABSENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceThresholds {
    pub in_use_cm: u16,
    pub near_cm: u16,
}

impl PresenceThresholds {
    pub fn from_config(config: &PresenceConfig) -> Self {
        Self {
            in_use_cm: config.in_use_threshold_cm,
            near_cm: config.near_threshold_cm,
        }
    }
}

/// Classifies the closest reported distance. No readings means nobody is there.
pub fn classify(distances: &[u16], thresholds: PresenceThresholds) -> PresenceEvent {
    match distances.iter().min() {
        Some(&closest) if closest <= thresholds.in_use_cm => PresenceEvent::InUse,
        Some(&closest) if closest <= thresholds.near_cm => PresenceEvent::Nearby,
        _ => PresenceEvent::Absent,
    }
}

pub type PresenceCallback = Arc<dyn Fn(PresenceEvent) -> BoxFuture + Send + Sync>;

pub struct PresencePoller {
    sensor: Arc<dyn DistanceSensor>,
    thresholds: PresenceThresholds,
    read_timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl PresencePoller {
    pub fn new(
        sensor: Arc<dyn DistanceSensor>,
        thresholds: PresenceThresholds,
        read_timeout: Duration,
    ) -> Self {
        Self {
            sensor,
            thresholds,
            read_timeout,
            worker: Mutex::new(None),
        }
    }

    pub fn from_config(sensor: Arc<dyn DistanceSensor>, config: &PresenceConfig) -> Self {
        Self::new(
            sensor,
            PresenceThresholds::from_config(config),
            config.read_timeout(),
        )
    }

    pub fn thresholds(&self) -> PresenceThresholds {
        self.thresholds
    }

    /// One bounded read. Failures and timeouts read as nobody present.
    pub async fn read_event(&self) -> PresenceEvent {
        read_presence(self.sensor.clone(), self.thresholds, self.read_timeout).await
    }

    /// Starts polling every `interval`; the first read happens one interval
    /// from now. Returns false when a loop is already running.
    pub fn start(&self, callback: PresenceCallback, interval: Duration) -> bool {
        let mut worker = lock_worker(&self.worker);
        if worker.as_ref().is_some_and(|w| !w.is_finished()) {
            log_debug!("Presence polling already running");
            return false;
        }

        let sensor = self.sensor.clone();
        let thresholds = self.thresholds;
        let read_timeout = self.read_timeout;
        *worker = Some(Worker::spawn(move |cancel_token| {
            presence_loop(sensor, thresholds, read_timeout, interval, callback, cancel_token)
        }));

        info!("Presence polling started (every {}ms)", interval.as_millis());
        true
    }

    pub fn is_running(&self) -> bool {
        lock_worker(&self.worker)
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Cancels the loop without waiting for it. Safe when nothing is running.
    pub fn begin_stop(&self) -> PendingStop {
        match lock_worker(&self.worker).take() {
            Some(worker) => {
                info!("Presence polling stopping");
                worker.cancel()
            }
            None => PendingStop::none(),
        }
    }

    pub async fn stop(&self) {
        self.begin_stop().join().await;
    }
}

fn lock_worker(worker: &Mutex<Option<Worker>>) -> std::sync::MutexGuard<'_, Option<Worker>> {
    // Poisoning only means a panic elsewhere; the slot itself is still valid.
    worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_presence(
    sensor: Arc<dyn DistanceSensor>,
    thresholds: PresenceThresholds,
    read_timeout: Duration,
) -> PresenceEvent {
    let read = tokio::task::spawn_blocking(move || sensor.read_report());

    match timeout(read_timeout, read).await {
        Ok(Ok(Ok(report))) => {
            let event = classify(&report.distances(), thresholds);
            log_debug!("Presence report {report:?} -> {}", event.as_str());
            event
        }
        Ok(Ok(Err(err))) => {
            warn!("Presence read failed: {err:#}");
            PresenceEvent::Absent
        }
        Ok(Err(err)) => {
            warn!("Presence read task failed: {err}");
            PresenceEvent::Absent
        }
        Err(_) => {
            warn!("Presence read timed out after {}ms", read_timeout.as_millis());
            PresenceEvent::Absent
        }
    }
}

async fn presence_loop(
    sensor: Arc<dyn DistanceSensor>,
    thresholds: PresenceThresholds,
    read_timeout: Duration,
    interval: Duration,
    callback: PresenceCallback,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel_token.cancelled() => break,
        }

        let event = tokio::select! {
            event = read_presence(sensor.clone(), thresholds, read_timeout) => event,
            _ = cancel_token.cancelled() => break,
        };

        callback(event).await;

        if cancel_token.is_cancelled() {
            break;
        }
    }

    info!("Presence polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{DistanceReport, SimulatedDistanceSensor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const THRESHOLDS: PresenceThresholds = PresenceThresholds {
        in_use_cm: 60,
        near_cm: 120,
    };

    fn poller(reports: Vec<Option<DistanceReport>>) -> Arc<PresencePoller> {
        Arc::new(PresencePoller::new(
            Arc::new(SimulatedDistanceSensor::scripted(reports)),
            THRESHOLDS,
            Duration::from_millis(500),
        ))
    }

    #[test]
    fn closest_distance_decides() {
        assert_eq!(classify(&[200, 150, 80], THRESHOLDS), PresenceEvent::Nearby);
        assert_eq!(classify(&[200, 45], THRESHOLDS), PresenceEvent::InUse);
        assert_eq!(classify(&[60], THRESHOLDS), PresenceEvent::InUse);
        assert_eq!(classify(&[120], THRESHOLDS), PresenceEvent::Nearby);
        assert_eq!(classify(&[121, 300], THRESHOLDS), PresenceEvent::Absent);
        assert_eq!(classify(&[], THRESHOLDS), PresenceEvent::Absent);
    }

    #[tokio::test]
    async fn read_failure_is_absent() {
        let poller = poller(vec![None]);
        assert_eq!(poller.read_event().await, PresenceEvent::Absent);
    }

    #[tokio::test]
    async fn slow_sensor_times_out_as_absent() {
        let sensor = SimulatedDistanceSensor::scripted(vec![Some(DistanceReport::new(
            Some(30),
            None,
            None,
        ))])
        .with_latency(Duration::from_millis(300));
        let poller = PresencePoller::new(Arc::new(sensor), THRESHOLDS, Duration::from_millis(20));

        assert_eq!(poller.read_event().await, PresenceEvent::Absent);
    }

    #[tokio::test]
    async fn callback_fires_every_tick() {
        let poller = poller(vec![Some(DistanceReport::new(Some(40), None, None))]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let callback: PresenceCallback = Arc::new(move |event| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(event);
            })
        });
        assert!(poller.start(callback.clone(), Duration::from_millis(10)));
        assert!(!poller.start(callback, Duration::from_millis(10)));

        for _ in 0..3 {
            let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
            assert_eq!(event, Some(PresenceEvent::InUse));
        }

        poller.stop().await;
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn stop_from_inside_callback_does_not_deadlock() {
        let poller = poller(vec![Some(DistanceReport::new(Some(500), None, None))]);
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = poller.clone();
        let counter = calls.clone();
        let callback: PresenceCallback = Arc::new(move |_event| {
            let inner = inner.clone();
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                inner.stop().await;
            })
        });

        poller.start(callback, Duration::from_millis(5));

        timeout(Duration::from_secs(2), async {
            while poller.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("poller stopped itself");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_no_op() {
        let poller = poller(vec![None]);
        poller.stop().await;
        poller.stop().await;
        assert!(!poller.is_running());
    }
}
