use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use cadence_events::{EventEnvelope, EventSender, EventSource, HostEvent};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::avatar::{AvatarData, Sound};
use crate::callback::Callback;
use crate::context::ScriptContext;
use crate::error::StateFault;
use crate::loader::FetchResults;

/// Process-unique identifier of a script host
pub type HostId = u64;

/// Closure posted from another thread to run on a host's own thread
pub type HostTask = Box<dyn for<'a> FnOnce(&ScriptContext<'a>) + Send>;

/// Work delivered to a host's thread and drained during its event pump
pub(crate) enum HostCommand {
    NodeKilled(Uuid),
    IncludeReady {
        urls: Vec<Url>,
        callback: Callback,
        results: FetchResults,
    },
    SetAvatarData(Option<Weak<dyn AvatarData>>),
    SetAvatarSound(Option<Arc<Sound>>),
    Invoke(HostTask),
}

impl fmt::Debug for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostCommand::NodeKilled(id) => f.debug_tuple("NodeKilled").field(id).finish(),
            HostCommand::IncludeReady { urls, .. } => {
                f.debug_struct("IncludeReady").field("urls", urls).finish()
            }
            HostCommand::SetAvatarData(avatar) => f
                .debug_tuple("SetAvatarData")
                .field(&avatar.is_some())
                .finish(),
            HostCommand::SetAvatarSound(sound) => f
                .debug_tuple("SetAvatarSound")
                .field(&sound.as_ref().map(|s| s.len_bytes()))
                .finish(),
            HostCommand::Invoke(_) => f.write_str("Invoke(..)"),
        }
    }
}

/// State of one host that other threads may observe
pub(crate) struct HostShared {
    pub(crate) id: HostId,
    running: AtomicBool,
    /// Set when a stop was requested or the run loop ended
    finished: AtomicBool,
    /// Completion signal for this host only
    done: watch::Sender<bool>,
    evaluations_pending: watch::Sender<usize>,
    pub(crate) events: EventSender,
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl HostShared {
    pub(crate) fn new(
        id: HostId,
        events: EventSender,
        commands: mpsc::UnboundedSender<HostCommand>,
    ) -> Self {
        // A host that never ran counts as done
        let (done, _) = watch::channel(true);
        let (evaluations_pending, _) = watch::channel(0);
        Self {
            id,
            running: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            done,
            evaluations_pending,
            events,
            commands,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            debug!(target: "scripting", "Stop requested for host {}", self.id);
            self.events
                .publish(HostEvent::RunningStateChanged, EventSource::Host);
        }
    }

    pub(crate) fn begin_run(&self) {
        // A previous stop-all may have cut this host off
        self.events.attach();
        self.finished.store(false, Ordering::Release);
        self.done.send_replace(false);
        self.running.store(true, Ordering::SeqCst);
    }

    pub(crate) fn end_run(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn mark_done(&self) {
        self.done.send_replace(true);
    }

    pub(crate) fn begin_evaluation(&self) {
        self.evaluations_pending.send_modify(|pending| *pending += 1);
    }

    pub(crate) fn end_evaluation(&self) {
        self.evaluations_pending
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }

    pub(crate) fn evaluations_pending(&self) -> usize {
        *self.evaluations_pending.borrow()
    }

    pub(crate) fn send(&self, command: HostCommand) -> Result<(), StateFault> {
        self.commands
            .send(command)
            .map_err(|_| StateFault::HostGone)
    }

    pub(crate) async fn wait_till_done(&self) {
        let mut done = self.done.subscribe();
        // wait_for checks the current value first, so an already finished host returns at once
        let _ = done.wait_for(|done| *done).await;
    }

    pub(crate) async fn wait_for_evaluations(&self) {
        let mut pending = self.evaluations_pending.subscribe();
        let _ = pending.wait_for(|pending| *pending == 0).await;
    }
}

/// Cloneable, thread-safe view of a script host
///
/// The host itself lives on its own thread; the handle is how the application
/// stops it, waits for it, and feeds it work.
#[derive(Clone)]
pub struct HostHandle {
    pub(crate) shared: Arc<HostShared>,
}

impl HostHandle {
    pub(crate) fn new(shared: Arc<HostShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> HostId {
        self.shared.id
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Whether a stop was requested (or the last run ended)
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// Ask the run loop to exit at its next checkpoint
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn evaluations_pending(&self) -> usize {
        self.shared.evaluations_pending()
    }

    /// Resolve once this host's run loop has fully finished.
    ///
    /// Returns immediately for a host that never started or already finished.
    /// Other hosts finishing never wake this waiter.
    pub async fn wait_till_done(&self) {
        self.shared.wait_till_done().await;
    }

    /// Resolve once no evaluation is in flight on this host
    pub async fn wait_for_evaluations(&self) {
        self.shared.wait_for_evaluations().await;
    }

    /// Run a closure on the host's thread during its next event pump
    pub fn invoke<F>(&self, task: F) -> Result<(), StateFault>
    where
        F: for<'a> FnOnce(&ScriptContext<'a>) + Send + 'static,
    {
        self.shared.send(HostCommand::Invoke(Box::new(task)))
    }

    /// A peer disconnected; forget its audio sequence counter
    pub fn node_killed(&self, node_id: Uuid) -> Result<(), StateFault> {
        self.shared.send(HostCommand::NodeKilled(node_id))
    }

    /// Attach avatar data owned elsewhere; only a weak reference is kept
    pub fn set_avatar_data(&self, avatar: Option<&Arc<dyn AvatarData>>) -> Result<(), StateFault> {
        self.shared
            .send(HostCommand::SetAvatarData(avatar.map(Arc::downgrade)))
    }

    pub fn set_avatar_sound(&self, sound: Option<Arc<Sound>>) -> Result<(), StateFault> {
        self.shared.send(HostCommand::SetAvatarSound(sound))
    }

    /// Events from the bus this host publishes on
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.shared.events.subscribe()
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("id", &self.shared.id)
            .field("running", &self.shared.is_running())
            .field("finished", &self.shared.is_finished())
            .finish()
    }
}
