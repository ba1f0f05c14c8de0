use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_events::{EventSource, HostEvent, ScriptValue};
use tracing::debug;
use url::Url;

use crate::avatar::{AvatarData, Sound};
use crate::callback::Callback;
use crate::error::ScriptFault;
use crate::handle::{HostHandle, HostId};
use crate::host::ScriptHost;
use crate::timer::TimerId;

/// Host signals a script can connect callbacks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptSignal {
    /// Every tick, called with the delta time in seconds
    Update,
    /// Once, while the host shuts down
    ScriptEnding,
}

/// What a script sees of its host.
///
/// Handed to the evaluator on every call; only valid on the host's thread.
#[derive(Clone, Copy)]
pub struct ScriptContext<'a> {
    host: &'a ScriptHost,
}

impl<'a> ScriptContext<'a> {
    pub(crate) fn new(host: &'a ScriptHost) -> Self {
        Self { host }
    }

    pub fn host_id(&self) -> HostId {
        self.host.id()
    }

    pub fn handle(&self) -> HostHandle {
        self.host.handle()
    }

    // ===== Timer Methods =====

    /// Call `callback` once after `timeout_ms`
    pub fn set_timeout(&self, callback: impl Into<Callback>, timeout_ms: u64) -> Option<TimerId> {
        self.host
            .setup_timer(callback.into(), Duration::from_millis(timeout_ms), true)
    }

    /// Call `callback` every `interval_ms` until cleared or the host stops
    pub fn set_interval(&self, callback: impl Into<Callback>, interval_ms: u64) -> Option<TimerId> {
        self.host
            .setup_timer(callback.into(), Duration::from_millis(interval_ms), false)
    }

    /// Cancel a timeout or interval; stale handles are ignored
    pub fn clear_timer(&self, timer: TimerId) -> bool {
        self.host.stop_timer(timer)
    }

    pub fn active_timers(&self) -> usize {
        self.host.active_timers()
    }

    // ===== Loading =====

    pub fn resolve_path(&self, reference: &str) -> Option<Url> {
        self.host.resolve_path(reference)
    }

    /// See [`ScriptHost::include`]
    pub fn include(&self, references: &[&str], callback: Option<Callback>) {
        self.host.include(references, callback);
    }

    pub fn load(&self, reference: &str) {
        self.host.load(reference);
    }

    /// Evaluate more code through the host, with the usual fault reporting
    pub fn evaluate(
        &self,
        program: &str,
        origin: &str,
        start_line: u32,
    ) -> Result<ScriptValue, ScriptFault> {
        self.host.evaluate(program, origin, start_line)
    }

    // ===== Script Lifecycle =====

    pub fn print(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(target: "scripting", "script:print()<< {}", message);
        self.host
            .emit(HostEvent::PrintedMessage { message }, EventSource::Script);
    }

    pub fn stop(&self) {
        self.host.stop();
    }

    pub fn connect(&self, signal: ScriptSignal, callback: impl Into<Callback>) {
        self.host.connect(signal, callback.into());
    }

    pub fn origin(&self) -> String {
        self.host.origin()
    }

    pub fn filename(&self) -> String {
        self.host.filename()
    }

    pub fn is_running(&self) -> bool {
        self.host.is_running()
    }

    pub fn is_finished(&self) -> bool {
        self.host.is_finished()
    }

    // ===== Avatar =====

    pub fn set_is_avatar(&self, is_avatar: bool) {
        self.host
            .streamer
            .borrow_mut()
            .set_is_avatar(is_avatar, Instant::now());
    }

    pub fn is_avatar(&self) -> bool {
        self.host.streamer.borrow().is_avatar()
    }

    pub fn set_is_listening_to_audio_stream(&self, listening: bool) {
        self.host
            .streamer
            .borrow_mut()
            .set_listening_to_audio_stream(listening);
    }

    pub fn is_listening_to_audio_stream(&self) -> bool {
        self.host.streamer.borrow().is_listening_to_audio_stream()
    }

    pub fn set_avatar_sound(&self, sound: Option<Arc<Sound>>) {
        self.host.set_avatar_sound(sound);
    }

    pub fn is_playing_avatar_sound(&self) -> bool {
        self.host.streamer.borrow().has_sound()
    }

    pub fn set_avatar_data(&self, avatar: Option<&Arc<dyn AvatarData>>) {
        self.host.set_avatar_weak(avatar.map(Arc::downgrade));
    }

    pub fn avatar_data(&self) -> Option<Arc<dyn AvatarData>> {
        self.host.streamer.borrow().avatar_data()
    }
}
