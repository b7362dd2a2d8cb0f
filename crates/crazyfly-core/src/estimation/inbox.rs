//! Producer/consumer hand-off between sensor links and the control loop
//!
//! Interface threads push samples as they arrive; the loop drains every
//! queue once at the start of a tick. The mutex is held only for the push
//! or the drain itself.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;

use crate::estimation::{SensorMeasurement, SensorSource};

type Queues = BTreeMap<SensorSource, VecDeque<SensorMeasurement>>;

/// Cloneable handle to per-source, timestamp-ordered sample queues
#[derive(Debug, Clone)]
pub struct SensorInbox {
    queues: Arc<Mutex<Queues>>,
    capacity: usize,
}

impl Default for SensorInbox {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SensorInbox {
    /// `capacity` bounds each source's queue; the oldest sample is dropped
    /// when a full queue receives a new one
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Arc::new(Mutex::new(BTreeMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        // A producer that panicked mid-push cannot leave a queue half-written.
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, measurement: SensorMeasurement) {
        let mut queues = self.lock();
        let queue = queues.entry(measurement.source).or_default();
        let at = queue.partition_point(|m| m.timestamp <= measurement.timestamp);
        queue.insert(at, measurement);
        if queue.len() > self.capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    "{:?} queue full, dropping sample at t={:.3}",
                    dropped.source, dropped.timestamp
                );
            }
        }
    }

    pub fn push_all(&self, measurements: impl IntoIterator<Item = SensorMeasurement>) {
        for m in measurements {
            self.push(m);
        }
    }

    /// Take everything queued, merged across sources in timestamp order
    pub fn drain(&self) -> Vec<SensorMeasurement> {
        let mut merged: Vec<SensorMeasurement> = {
            let mut queues = self.lock();
            queues.values_mut().flat_map(|q| q.drain(..)).collect()
        };
        merged.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        merged
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
