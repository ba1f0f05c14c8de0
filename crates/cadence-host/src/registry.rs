use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::handle::{HostHandle, HostId, HostShared};

/// Set of live script hosts owned by the application.
///
/// Hosts register themselves when built and unregister when dropped; the
/// registry only keeps weak references, so it never extends a host's life.
pub struct ScriptRegistry {
    hosts: Mutex<HashMap<HostId, Weak<HostShared>>>,
    /// Number of `stop_all` calls in flight
    stopping_all: AtomicUsize,
    next_id: AtomicU64,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            stopping_all: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Whether a stop-all is in progress
    pub fn is_stopping_all(&self) -> bool {
        self.stopping_all.load(Ordering::SeqCst) > 0
    }

    /// Number of registered hosts
    pub fn len(&self) -> usize {
        self.hosts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.lock().is_empty()
    }

    pub fn contains(&self, id: HostId) -> bool {
        self.hosts.lock().contains_key(&id)
    }

    /// Handles to every registered host that is still alive
    pub fn handles(&self) -> Vec<HostHandle> {
        self.hosts
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .map(HostHandle::new)
            .collect()
    }

    pub(crate) fn allocate_id(&self) -> HostId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, shared: &Arc<HostShared>) {
        self.hosts.lock().insert(shared.id, Arc::downgrade(shared));
    }

    pub(crate) fn unregister(&self, id: HostId) {
        self.hosts.lock().remove(&id);
    }

    /// Stop every running host and wait for each to finish.
    ///
    /// For each host, in turn: wait for in-flight evaluations to drain, cut
    /// its events off from subscribers, request the stop, wait until its run
    /// loop has fully finished and drop it from the registry. While this runs,
    /// evaluations, timers, includes and new runs are all refused. Overlapping
    /// calls keep that state until the last of them returns or is dropped.
    pub async fn stop_all(&self) {
        let _stopping = StoppingAll::enter(&self.stopping_all);

        let snapshot: Vec<(HostId, Weak<HostShared>)> = self
            .hosts
            .lock()
            .iter()
            .map(|(id, host)| (*id, host.clone()))
            .collect();
        info!(target: "scripting", "Stopping {} script host(s)", snapshot.len());

        for (id, host) in snapshot {
            let Some(host) = host.upgrade() else {
                self.unregister(id);
                continue;
            };
            if !host.is_running() {
                continue;
            }

            if host.evaluations_pending() > 0 {
                debug!(target: "scripting", "Host {} has evaluations pending, waiting", id);
                host.wait_for_evaluations().await;
            }

            host.events.detach();
            host.request_stop();
            host.wait_till_done().await;

            debug!(target: "scripting", "Host {} stopped", id);
            self.unregister(id);
        }

        // Drop entries for hosts that went away while we were waiting
        self.hosts.lock().retain(|_, host| host.strong_count() > 0);
    }
}

/// Holds the registry in the stopping-all state for one `stop_all` call
struct StoppingAll<'a> {
    count: &'a AtomicUsize,
}

impl<'a> StoppingAll<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count }
    }
}

impl Drop for StoppingAll<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new()
    }
}
