use std::{
    sync::{Arc, Mutex as StdMutex, RwLock, Weak},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    config::AppConfig,
    db::Database,
    sensing::{PendingStop, PresenceCallback, PresenceEvent, PresencePoller, TagCallback, TagPoller, TagRead},
};

use super::{PresencePolicy, StageName, StageObserver, StageSnapshot};

#[derive(Debug, Clone, Copy)]
pub struct StageTimings {
    pub presence_interval: Duration,
    pub nearby_grace: Duration,
    pub scan_timeout: Duration,
    pub tag_poll_interval: Duration,
}

impl StageTimings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            presence_interval: config.presence.interval(),
            nearby_grace: config.presence.nearby_grace(),
            scan_timeout: config.tag_reader.scan_timeout(),
            tag_poll_interval: config.tag_reader.poll_interval(),
        }
    }
}

struct Inner {
    state: Mutex<StageSnapshot>,
    // Taken before `state` is released so observers see changes in order.
    notify_lock: Mutex<()>,
    observers: RwLock<Vec<Arc<dyn StageObserver>>>,
    db: Database,
    presence: PresencePoller,
    tags: TagPoller,
    policy: StdMutex<PresencePolicy>,
    timings: StageTimings,
}

/// Single owner of the workflow stage. Every change goes through
/// [`StageController::set_stage`], which also keeps both pollers in step
/// with the stage.
#[derive(Clone)]
pub struct StageController {
    inner: Arc<Inner>,
}

impl StageController {
    pub fn new(db: Database, presence: PresencePoller, tags: TagPoller, timings: StageTimings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StageSnapshot::new(StageName::Idle)),
                notify_lock: Mutex::new(()),
                observers: RwLock::new(Vec::new()),
                db,
                presence,
                tags,
                policy: StdMutex::new(PresencePolicy::new(timings.nearby_grace)),
                timings,
            }),
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn StageObserver>) {
        match self.inner.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    pub async fn current(&self) -> StageSnapshot {
        self.inner.state.lock().await.clone()
    }

    /// Parses a stage name coming from outside (display clients, tests).
    pub async fn set_stage_named(&self, name: &str, extra: Map<String, Value>) -> Result<StageSnapshot> {
        let stage = name.parse::<StageName>()?;
        self.set_stage(stage, extra).await
    }

    /// Moves to `stage`, merging `extra` into the auxiliary fields, notifies
    /// every observer once and starts or stops the pollers for the new stage.
    /// Observer failures are returned after the pollers have been reconciled.
    pub async fn set_stage(&self, stage: StageName, extra: Map<String, Value>) -> Result<StageSnapshot> {
        let state = self.inner.state.lock().await;
        self.commit(state, stage, extra).await
    }

    /// Like [`set_stage`](Self::set_stage), but only while the current stage
    /// is still `expected`. Returns `None` when the stage had already moved on.
    pub async fn set_stage_if(
        &self,
        expected: StageName,
        stage: StageName,
        extra: Map<String, Value>,
    ) -> Result<Option<StageSnapshot>> {
        let state = self.inner.state.lock().await;
        if state.stage != expected {
            debug!("Skipping {expected} -> {stage}; stage is now {}", state.stage);
            return Ok(None);
        }
        self.commit(state, stage, extra).await.map(Some)
    }

    /// Applies a change while `state` is held, then releases it before
    /// observers run and stopped pollers are joined.
    async fn commit(
        &self,
        mut state: MutexGuard<'_, StageSnapshot>,
        stage: StageName,
        extra: Map<String, Value>,
    ) -> Result<StageSnapshot> {
        state.apply(stage, extra);
        let snapshot = state.clone();
        let pending_stops = self.reconcile_pollers(snapshot.stage);
        let notify_guard = self.inner.notify_lock.lock().await;
        drop(state);

        let notified = self.notify_observers(&snapshot);
        drop(notify_guard);

        for pending in pending_stops {
            pending.join().await;
        }

        notified.map(|_| snapshot)
    }

    /// Stops both pollers and waits for them.
    pub async fn shutdown(&self) {
        self.inner.presence.stop().await;
        self.inner.tags.stop().await;
    }

    fn notify_observers(&self, snapshot: &StageSnapshot) -> Result<()> {
        let observers: Vec<Arc<dyn StageObserver>> = match self.inner.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut first_error = None;
        for observer in observers {
            if let Err(err) = observer.notify(snapshot) {
                error!("Stage observer failed on {}: {err:#}", snapshot.stage);
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(anyhow!("stage observer failed: {err:#}")),
            None => Ok(()),
        }
    }

    /// Starts what the stage needs and cancels the rest. Joins are returned to
    /// the caller so they happen after the stage locks are released.
    fn reconcile_pollers(&self, stage: StageName) -> Vec<PendingStop> {
        let timings = self.inner.timings;
        let mut pending = Vec::new();

        if stage.watches_presence() {
            if self
                .inner
                .presence
                .start(self.presence_callback(), timings.presence_interval)
            {
                self.lock_policy().reset();
            }
        } else {
            pending.push(self.inner.presence.begin_stop());
        }

        if stage.scans_tags() {
            if !self.inner.tags.is_running() {
                self.inner
                    .tags
                    .start_scan(timings.scan_timeout, timings.tag_poll_interval, self.tag_callback());
            }
        } else {
            pending.push(self.inner.tags.begin_stop());
        }

        pending
    }

    fn presence_callback(&self) -> PresenceCallback {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |event| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(controller) = upgrade(&weak) {
                    controller.on_presence(event).await;
                }
            })
        })
    }

    fn tag_callback(&self) -> TagCallback {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |tag| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(controller) = upgrade(&weak) {
                    controller.on_tag(tag).await;
                }
            })
        })
    }

    async fn on_presence(&self, event: PresenceEvent) {
        let current = self.inner.state.lock().await.stage;
        if !current.watches_presence() {
            return;
        }

        let next = self.lock_policy().on_event(event, Instant::now());
        if let Some(next) = next {
            info!("Presence {} during {current}, moving to {next}", event.as_str());
            if let Err(err) = self.set_stage_if(current, next, Map::new()).await {
                error!("Failed to apply presence transition: {err:#}");
            }
        }
    }

    /// Links the sample on screen to the tag's user and shows their history.
    /// The stage is re-checked under the state lock, so a tag read that
    /// finishes after the user walked away changes nothing.
    async fn on_tag(&self, tag: TagRead) {
        if self.current().await.stage != StageName::Results {
            debug!("Ignoring tag {} outside results", tag.uid);
            return;
        }

        let user_id = match self.inner.db.resolve_or_create_user(&tag.uid).await {
            Ok(user_id) => user_id,
            Err(err) => {
                error!("Failed to resolve user for tag {}: {err:#}", tag.uid);
                return;
            }
        };

        let state = self.inner.state.lock().await;
        if state.stage != StageName::Results {
            info!("Tag {} read after leaving results ({}); ignoring", tag.uid, state.stage);
            return;
        }

        match state.field_i64("sample_id") {
            Some(sample_id) => {
                if let Err(err) = self.inner.db.assign_sample_user(sample_id, user_id).await {
                    error!("Failed to link sample {sample_id} to user {user_id}: {err:#}");
                } else {
                    info!("Sample {sample_id} linked to user {user_id}");
                }
            }
            None => warn!("Tag {} read with no sample on screen", tag.uid),
        }

        let mut extra = Map::new();
        extra.insert("user_id".into(), json!(user_id));
        extra.insert("tag_uid".into(), json!(tag.uid));
        if let Err(err) = self.commit(state, StageName::History, extra).await {
            error!("Failed to show history for user {user_id}: {err:#}");
        }
    }

    fn lock_policy(&self) -> std::sync::MutexGuard<'_, PresencePolicy> {
        self.inner
            .policy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_presence_running(&self) -> bool {
        self.inner.presence.is_running()
    }

    pub fn is_tag_scan_running(&self) -> bool {
        self.inner.tags.is_running()
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<StageController> {
    weak.upgrade().map(|inner| StageController { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{DistanceReport, SimulatedDistanceSensor, SimulatedTagReader};
    use crate::sensing::PresenceThresholds;
    use tokio::time::timeout;

    struct Recording(StdMutex<Vec<StageSnapshot>>);

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Vec::new())))
        }

        fn stages(&self) -> Vec<StageName> {
            self.0.lock().unwrap().iter().map(|s| s.stage).collect()
        }
    }

    impl StageObserver for Recording {
        fn notify(&self, snapshot: &StageSnapshot) -> Result<()> {
            self.0.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    struct Failing;

    impl StageObserver for Failing {
        fn notify(&self, _snapshot: &StageSnapshot) -> Result<()> {
            Err(anyhow!("display offline"))
        }
    }

    fn timings() -> StageTimings {
        StageTimings {
            presence_interval: Duration::from_millis(20),
            nearby_grace: Duration::from_millis(60),
            scan_timeout: Duration::from_secs(2),
            tag_poll_interval: Duration::from_millis(100),
        }
    }

    fn controller(distance_cm: u16, tags: SimulatedTagReader) -> StageController {
        let sensor = SimulatedDistanceSensor::scripted(vec![Some(DistanceReport::new(
            Some(distance_cm),
            None,
            None,
        ))]);
        let presence = PresencePoller::new(
            Arc::new(sensor),
            PresenceThresholds {
                in_use_cm: 60,
                near_cm: 120,
            },
            Duration::from_millis(200),
        );
        let db = Database::open_in_memory().unwrap();
        StageController::new(db, presence, TagPoller::new(Arc::new(tags)), timings())
    }

    async fn wait_for(controller: &StageController, stage: StageName) {
        timeout(Duration::from_secs(3), async {
            while controller.current().await.stage != stage {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {stage}"));
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(3), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    #[tokio::test]
    async fn pollers_follow_the_stage() {
        let controller = controller(40, SimulatedTagReader::empty(Duration::from_millis(5)));

        controller.set_stage(StageName::Collecting, Map::new()).await.unwrap();
        assert!(!controller.is_presence_running());
        assert!(!controller.is_tag_scan_running());

        controller.set_stage(StageName::Results, Map::new()).await.unwrap();
        assert!(controller.is_presence_running());
        assert!(controller.is_tag_scan_running());

        controller.set_stage(StageName::History, Map::new()).await.unwrap();
        assert!(controller.is_presence_running());
        assert!(!controller.is_tag_scan_running());

        controller.set_stage(StageName::Goodbye, Map::new()).await.unwrap();
        assert!(!controller.is_presence_running());
        assert!(!controller.is_tag_scan_running());
    }

    #[tokio::test]
    async fn unknown_stage_is_rejected_without_change() {
        let controller = controller(40, SimulatedTagReader::empty(Duration::ZERO));
        let recording = Recording::new();
        controller.register_observer(recording.clone());

        assert!(controller.set_stage_named("finished", Map::new()).await.is_err());
        assert_eq!(controller.current().await.stage, StageName::Idle);
        assert!(recording.stages().is_empty());
    }

    #[tokio::test]
    async fn failing_observer_does_not_starve_the_others() {
        let controller = controller(40, SimulatedTagReader::empty(Duration::ZERO));
        let recording = Recording::new();
        controller.register_observer(Arc::new(Failing));
        controller.register_observer(recording.clone());

        let result = controller.set_stage(StageName::Welcome, Map::new()).await;

        assert!(result.is_err());
        assert_eq!(recording.stages(), vec![StageName::Welcome]);
        assert_eq!(controller.current().await.stage, StageName::Welcome);
    }

    #[tokio::test]
    async fn absent_user_sends_results_back_to_idle() {
        let controller = controller(400, SimulatedTagReader::empty(Duration::from_millis(5)));
        let recording = Recording::new();
        controller.register_observer(recording.clone());

        controller.set_stage(StageName::Results, Map::new()).await.unwrap();
        wait_for(&controller, StageName::Idle).await;
        eventually(|| recording.stages().len() == 2).await;

        assert_eq!(recording.stages(), vec![StageName::Results, StageName::Idle]);
        assert!(!controller.is_presence_running());
        assert!(!controller.is_tag_scan_running());
    }

    #[tokio::test]
    async fn lingering_nearby_moves_to_welcome() {
        let controller = controller(100, SimulatedTagReader::empty(Duration::from_millis(5)));

        controller.set_stage(StageName::History, Map::new()).await.unwrap();
        wait_for(&controller, StageName::Welcome).await;
        assert!(!controller.is_presence_running());
    }

    #[tokio::test]
    async fn tag_links_the_sample_and_shows_history() {
        let controller = controller(
            40,
            SimulatedTagReader::with_uid(vec![0x04, 0xA1, 0xB2, 0xC3], Duration::ZERO).present_after(2),
        );
        let db = controller.inner.db.clone();
        let device_id = db.register_device("AA:BB:CC:DD:EE:FF", None).await.unwrap();
        let sample_id = db.create_sample(device_id, chrono::Utc::now()).await.unwrap();

        let mut extra = Map::new();
        extra.insert("sample_id".into(), json!(sample_id));
        controller.set_stage(StageName::Results, extra).await.unwrap();
        wait_for(&controller, StageName::History).await;

        let snapshot = controller.current().await;
        assert_eq!(snapshot.extra["tag_uid"], json!("04A1B2C3"));
        let user_id = snapshot.field_i64("user_id").unwrap();

        let sample = db.get_sample(sample_id).await.unwrap().unwrap();
        assert_eq!(sample.user_id, Some(user_id));
        assert!(controller.is_presence_running());

        controller.shutdown().await;
        assert!(!controller.is_presence_running());
    }

    #[tokio::test]
    async fn conditional_change_is_skipped_once_the_stage_moved() {
        let controller = controller(40, SimulatedTagReader::empty(Duration::ZERO));
        controller.set_stage(StageName::Welcome, Map::new()).await.unwrap();

        let skipped = controller
            .set_stage_if(StageName::Results, StageName::History, Map::new())
            .await
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(controller.current().await.stage, StageName::Welcome);

        let applied = controller
            .set_stage_if(StageName::Welcome, StageName::Goodbye, Map::new())
            .await
            .unwrap();
        assert_eq!(applied.map(|s| s.stage), Some(StageName::Goodbye));
    }

    #[tokio::test]
    async fn tag_finishing_after_the_user_left_changes_nothing() {
        let controller = controller(40, SimulatedTagReader::empty(Duration::from_millis(5)));
        let recording = Recording::new();
        controller.register_observer(recording.clone());
        let db = controller.inner.db.clone();
        let device_id = db.register_device("AA:BB:CC:DD:EE:FF", None).await.unwrap();
        let sample_id = db.create_sample(device_id, chrono::Utc::now()).await.unwrap();

        let mut extra = Map::new();
        extra.insert("sample_id".into(), json!(sample_id));
        controller.set_stage(StageName::Results, extra).await.unwrap();

        // Hold the database thread so the user lookup is still pending when
        // the station goes idle.
        let busy = db.clone();
        let blocker = tokio::spawn(async move {
            busy.execute(|_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let tagging = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller.on_tag(TagRead::from_uid(&[0x04, 0xA1, 0xB2, 0xC3])).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.set_stage(StageName::Idle, Map::new()).await.unwrap();

        tagging.await.unwrap();
        blocker.await.unwrap().unwrap();

        assert_eq!(controller.current().await.stage, StageName::Idle);
        assert_eq!(recording.stages(), vec![StageName::Results, StageName::Idle]);
        assert!(!controller.is_presence_running());
        let sample = db.get_sample(sample_id).await.unwrap().unwrap();
        assert_eq!(sample.user_id, None);
    }
}
