use anyhow::Result;
use log::info;
use tokio::sync::broadcast;

use super::StageSnapshot;

/// Receives every stage change, in the order the changes were made.
/// Called without any controller lock held except the notification lock,
/// so an observer must not block on the controller itself.
pub trait StageObserver: Send + Sync {
    fn notify(&self, snapshot: &StageSnapshot) -> Result<()>;
}

pub struct LogObserver;

impl StageObserver for LogObserver {
    fn notify(&self, snapshot: &StageSnapshot) -> Result<()> {
        if snapshot.extra.is_empty() {
            info!("Stage -> {}", snapshot.stage);
        } else {
            info!(
                "Stage -> {} {}",
                snapshot.stage,
                serde_json::Value::Object(snapshot.extra.clone())
            );
        }
        Ok(())
    }
}

/// Fans snapshots out to display clients.
pub struct BroadcastObserver {
    sender: broadcast::Sender<StageSnapshot>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageSnapshot> {
        self.sender.subscribe()
    }
}

impl StageObserver for BroadcastObserver {
    fn notify(&self, snapshot: &StageSnapshot) -> Result<()> {
        // No display connected is not a failure.
        let _ = self.sender.send(snapshot.clone());
        Ok(())
    }
}
