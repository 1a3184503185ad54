//! Active session accounting.
//!
//! One process-wide map of gauges keyed by channel kind and instance. A
//! session holds a [`SessionGuard`] from the moment dialing starts; dropping
//! the guard decrements the gauge exactly once on every exit path, panics
//! and dropped futures included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::model::{ChannelKind, InstanceRef};

type Key = (ChannelKind, InstanceRef);

/// Concurrency-safe per-(kind, instance) session gauges. Cheap to clone.
#[derive(Clone, Default)]
pub struct ActiveSessions {
    gauges: Arc<Mutex<HashMap<Key, Arc<AtomicI64>>>>,
}

/// Held for the lifetime of one session.
#[must_use = "dropping the guard ends the session's accounting"]
pub struct SessionGuard {
    gauge: Arc<AtomicI64>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One gauge sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GaugeSample {
    pub metric: &'static str,
    pub kind: ChannelKind,
    pub namespace: String,
    pub name: String,
    pub value: i64,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Arc<AtomicI64>>> {
        // Counters stay consistent even if a holder panicked.
        self.gauges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a new session for `instance`.
    pub fn acquire(&self, kind: ChannelKind, instance: &InstanceRef) -> SessionGuard {
        let gauge = self
            .lock()
            .entry((kind, instance.clone()))
            .or_default()
            .clone();
        gauge.fetch_add(1, Ordering::AcqRel);
        SessionGuard { gauge }
    }

    /// Current value for one gauge; zero if never touched.
    pub fn get(&self, kind: ChannelKind, instance: &InstanceRef) -> i64 {
        self.lock()
            .get(&(kind, instance.clone()))
            .map_or(0, |g| g.load(Ordering::Acquire))
    }

    /// Sessions open across every kind and instance.
    pub fn total(&self) -> i64 {
        self.lock().values().map(|g| g.load(Ordering::Acquire)).sum()
    }

    /// All gauges, sorted by kind then instance.
    pub fn snapshot(&self) -> Vec<GaugeSample> {
        let mut samples: Vec<GaugeSample> = self
            .lock()
            .iter()
            .map(|((kind, instance), gauge)| GaugeSample {
                metric: kind.metric_name(),
                kind: *kind,
                namespace: instance.namespace.clone(),
                name: instance.name.clone(),
                value: gauge.load(Ordering::Acquire),
            })
            .collect();
        samples.sort_by(|a, b| {
            (a.kind, &a.namespace, &a.name).cmp(&(b.kind, &b.namespace, &b.name))
        });
        samples
    }

    /// Drop gauges that read zero and are not held by any guard. Returns how
    /// many were removed.
    pub fn prune(&self) -> usize {
        let mut gauges = self.lock();
        let before = gauges.len();
        gauges.retain(|_, g| Arc::strong_count(g) > 1 || g.load(Ordering::Acquire) != 0);
        before - gauges.len()
    }
}
