use std::time::{Duration, Instant};

use crate::sensing::PresenceEvent;

use super::StageName;

/// Turns the raw per-tick presence stream into stage changes while results
/// or history are on screen.
#[derive(Debug)]
pub struct PresencePolicy {
    nearby_grace: Duration,
    nearby_since: Option<Instant>,
}

impl PresencePolicy {
    pub fn new(nearby_grace: Duration) -> Self {
        Self {
            nearby_grace,
            nearby_since: None,
        }
    }

    pub fn reset(&mut self) {
        self.nearby_since = None;
    }

    pub fn on_event(&mut self, event: PresenceEvent, now: Instant) -> Option<StageName> {
        match event {
            PresenceEvent::Absent => {
                self.nearby_since = None;
                Some(StageName::Idle)
            }
            PresenceEvent::InUse => {
                self.nearby_since = None;
                None
            }
            PresenceEvent::Nearby => {
                let since = *self.nearby_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.nearby_grace {
                    self.nearby_since = None;
                    Some(StageName::Welcome)
                } else {
                    None
                }
            }
        }
    }
}
