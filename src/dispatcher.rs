use crate::types::RealtimeUsageMeasurement;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub type MeasurementCallback = Arc<dyn Fn(&RealtimeUsageMeasurement) + Send + Sync>;

/// Minimum spacing between forwarded measurements.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    next_send: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_send: None,
        }
    }

    /// Returns true if a message may go out at `now`, and if so moves the threshold forward.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if let Some(next_send) = self.next_send {
            if now < next_send {
                return false;
            }
        }
        let candidate = now + self.interval;
        // Never move the threshold backwards
        self.next_send = Some(match self.next_send {
            Some(previous) if previous > candidate => previous,
            _ => candidate,
        });
        true
    }
}

/// Registry of realtime subscribers with a throttled fan-out.
pub struct Dispatcher {
    subscribers: HashMap<String, MeasurementCallback>,
    throttle: Throttle,
}

impl Dispatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            subscribers: HashMap::new(),
            throttle: Throttle::new(interval),
        }
    }

    /// Registers `callback` under `key`. An existing registration is kept and `false` returned.
    pub fn subscribe(&mut self, key: &str, callback: MeasurementCallback) -> bool {
        if self.subscribers.contains_key(key) {
            warn!("Realtime subscriber '{}' is already registered", key);
            return false;
        }
        debug!("Registered realtime subscriber '{}'", key);
        self.subscribers.insert(key.to_string(), callback);
        true
    }

    pub fn unsubscribe(&mut self, key: &str) -> bool {
        let removed = self.subscribers.remove(key).is_some();
        if removed {
            debug!("Removed realtime subscriber '{}'", key);
        }
        removed
    }

    pub fn unsubscribe_all(&mut self) {
        if !self.subscribers.is_empty() {
            debug!("Removing {} realtime subscribers", self.subscribers.len());
        }
        self.subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Decides whether `measurement` goes out at `now` and returns the callbacks to invoke.
    ///
    /// The callbacks are returned rather than called so the caller can release its lock on the
    /// dispatcher first; a callback is then free to subscribe or unsubscribe.
    pub fn prepare(
        &mut self,
        measurement: &RealtimeUsageMeasurement,
        now: Instant,
    ) -> Option<Vec<MeasurementCallback>> {
        if !self.throttle.try_acquire(now) {
            debug!(
                "Throttling realtime measurement {} W at {}",
                measurement.usage, measurement.timestamp
            );
            return None;
        }
        Some(self.subscribers.values().cloned().collect())
    }
}
