//! Resources a computer owns on behalf of its script (open files,
//! websockets), so they can be force-closed when the computer shuts down,
//! plus the per-computer usage counters.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tracing::{debug, info};

/// Something the tracker can close on shutdown.
pub trait Closeable: Send + Sync {
    /// Closes the resource. Must be idempotent.
    fn close(&self);

    fn registration(&self) -> &Registration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

/// A resource's link back to the tracker that owns it.
#[derive(Default)]
pub struct Registration {
    slot: OnceLock<(Weak<ResourceTracker>, ResourceId)>,
}

impl Registration {
    pub fn id(&self) -> Option<ResourceId> {
        self.slot.get().map(|(_, id)| *id)
    }

    /// Drops the tracker's reference. Safe to call repeatedly or when
    /// the resource was never tracked.
    pub fn release(&self) {
        if let Some((tracker, id)) = self.slot.get() {
            if let Some(tracker) = tracker.upgrade() {
                tracker.release(*id);
            }
        }
    }
}

#[derive(Default)]
pub struct ResourceTracker {
    next_id: AtomicU64,
    entries: Mutex<HashMap<ResourceId, Weak<dyn Closeable>>>,
}

impl ResourceTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ResourceId, Weak<dyn Closeable>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking `resource`. The tracker only holds a weak
    /// reference; the script's handle keeps the resource alive.
    pub fn track<T: Closeable + 'static>(self: &Arc<Self>, resource: &Arc<T>) -> ResourceId {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<dyn Closeable> = Arc::downgrade(resource) as Weak<dyn Closeable>;
        {
            let mut entries = self.entries();
            entries.retain(|_, r| r.strong_count() > 0);
            entries.insert(id, weak);
        }
        let _ = resource.registration().slot.set((Arc::downgrade(self), id));
        debug!("Tracking resource {id:?}");
        id
    }

    pub fn release(&self, id: ResourceId) {
        if self.entries().remove(&id).is_some() {
            debug!("Released resource {id:?}");
        }
    }

    /// Number of tracked resources still alive.
    pub fn open_count(&self) -> usize {
        self.entries().values().filter(|r| r.strong_count() > 0).count()
    }

    /// Closes every tracked resource. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Weak<dyn Closeable>> = self.entries().drain().map(|(_, r)| r).collect();
        let mut closed = 0;
        for resource in drained.iter().filter_map(Weak::upgrade) {
            resource.close();
            closed += 1;
        }
        if closed > 0 {
            info!("Closed {closed} open resource(s)");
        }
        closed
    }
}

// ── Usage tracking ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingField {
    FsOps,
    WebsocketIncoming,
    WebsocketOutgoing,
}

/// Per-computer usage counters.
#[derive(Debug, Default)]
pub struct Tracking {
    fs_ops: AtomicU64,
    websocket_incoming: AtomicU64,
    websocket_outgoing: AtomicU64,
}

impl Tracking {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counter(&self, field: TrackingField) -> &AtomicU64 {
        match field {
            TrackingField::FsOps => &self.fs_ops,
            TrackingField::WebsocketIncoming => &self.websocket_incoming,
            TrackingField::WebsocketOutgoing => &self.websocket_outgoing,
        }
    }

    pub fn add(&self, field: TrackingField, amount: u64) {
        self.counter(field).fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self, field: TrackingField) -> u64 {
        self.counter(field).load(Ordering::Relaxed)
    }
}
