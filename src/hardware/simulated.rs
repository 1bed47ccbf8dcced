use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use rand::Rng;

use super::{DistanceReport, DistanceSensor, TagReader};

const WALK_MIN_CM: i32 = 20;
const WALK_MAX_CM: i32 = 300;
const WALK_STEP_CM: i32 = 15;

enum DistanceSource {
    /// `None` entries simulate a failed read. The last entry repeats forever.
    Scripted(VecDeque<Option<DistanceReport>>),
    RandomWalk { position_cm: i32 },
}

pub struct SimulatedDistanceSensor {
    source: Mutex<DistanceSource>,
    latency: Duration,
}

impl SimulatedDistanceSensor {
    pub fn scripted(reports: Vec<Option<DistanceReport>>) -> Self {
        Self {
            source: Mutex::new(DistanceSource::Scripted(reports.into())),
            latency: Duration::ZERO,
        }
    }

    pub fn random_walk(latency: Duration) -> Self {
        Self {
            source: Mutex::new(DistanceSource::RandomWalk { position_cm: 200 }),
            latency,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl DistanceSensor for SimulatedDistanceSensor {
    fn read_report(&self) -> Result<DistanceReport> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let mut source = self
            .source
            .lock()
            .map_err(|_| anyhow!("simulated sensor state poisoned"))?;

        match &mut *source {
            DistanceSource::Scripted(queue) => {
                let next = if queue.len() > 1 {
                    queue.pop_front().flatten()
                } else {
                    queue.front().copied().flatten()
                };
                next.ok_or_else(|| anyhow!("simulated read failure"))
            }
            DistanceSource::RandomWalk { position_cm } => {
                let step = rand::thread_rng().gen_range(-WALK_STEP_CM..=WALK_STEP_CM);
                *position_cm = (*position_cm + step).clamp(WALK_MIN_CM, WALK_MAX_CM);
                let distance = *position_cm as u16;
                Ok(DistanceReport::new(Some(distance), Some(distance), Some(distance)))
            }
        }
    }
}

/// Reports a fixed UID once `present_after` attempts have been made.
pub struct SimulatedTagReader {
    uid: Option<Vec<u8>>,
    latency: Duration,
    present_after: usize,
    attempts: AtomicUsize,
}

impl SimulatedTagReader {
    pub fn with_uid(uid: Vec<u8>, latency: Duration) -> Self {
        Self {
            uid: Some(uid),
            latency,
            present_after: 0,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_hex_uid(hex: &str, latency: Duration) -> Result<Self> {
        Ok(Self::with_uid(decode_hex(hex)?, latency))
    }

    /// A field nobody ever taps.
    pub fn empty(latency: Duration) -> Self {
        Self {
            uid: None,
            latency,
            present_after: 0,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn present_after(mut self, attempts: usize) -> Self {
        self.present_after = attempts;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl TagReader for SimulatedTagReader {
    fn read_passive_target(&self) -> Result<Option<Vec<u8>>> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let previous = self.attempts.fetch_add(1, Ordering::SeqCst);
        if previous < self.present_after {
            return Ok(None);
        }
        Ok(self.uid.clone())
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let cleaned: String = hex.chars().filter(|c| !matches!(c, ':' | ' ' | '-')).collect();
    if cleaned.is_empty() || cleaned.len() % 2 != 0 {
        bail!("tag uid '{hex}' must be an even number of hex digits");
    }

    (0..cleaned.len())
        .step_by(2)
        .map(|index| {
            u8::from_str_radix(&cleaned[index..index + 2], 16)
                .map_err(|err| anyhow!("invalid hex in tag uid '{hex}': {err}"))
        })
        .collect()
}
