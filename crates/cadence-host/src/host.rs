use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cadence_events::{EventBus, EventEnvelope, EventSource, HostEvent, ScriptValue};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::avatar::{AvatarData, AvatarStreamer, Sound};
use crate::callback::Callback;
use crate::config::HostConfig;
use crate::context::{ScriptContext, ScriptSignal};
use crate::error::{LoadFault, ScriptFault, StateFault};
use crate::evaluator::ScriptEvaluator;
use crate::handle::{HostCommand, HostHandle, HostId, HostShared};
use crate::loader::{io_fault, local_file_url, BatchFetcher};
use crate::net::{flush_entity_edits, EntityPacketSender, NodeDirectory};
use crate::registry::ScriptRegistry;
use crate::timer::{TimerId, TimerRegistry};

/// Source text and the label it is reported under
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptSource {
    pub(crate) contents: String,
    pub(crate) origin: String,
}

/// Collaborators provided by the embedding application
#[derive(Clone, Default)]
pub struct HostServices {
    pub fetcher: Option<Arc<dyn BatchFetcher>>,
    pub nodes: Option<Arc<dyn NodeDirectory>>,
    pub entity_sender: Option<Arc<dyn EntityPacketSender>>,
}

/// Builds a [`ScriptHost`] and registers it with a [`ScriptRegistry`]
pub struct ScriptHostBuilder {
    registry: Arc<ScriptRegistry>,
    evaluator: Box<dyn ScriptEvaluator>,
    config: HostConfig,
    source: ScriptSource,
    parent_url: Option<String>,
    event_bus: Option<EventBus>,
    services: HostServices,
}

impl ScriptHostBuilder {
    pub fn contents(mut self, contents: impl Into<String>) -> Self {
        self.source.contents = contents.into();
        self
    }

    /// File path or URL the script is reported under
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.source.origin = origin.into();
        self
    }

    /// Base for relative include/load references, in place of the origin
    pub fn parent_url(mut self, parent_url: impl Into<String>) -> Self {
        self.parent_url = Some(parent_url.into());
        self
    }

    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish on a shared bus instead of a bus of the host's own
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn BatchFetcher>) -> Self {
        self.services.fetcher = Some(fetcher);
        self
    }

    pub fn node_directory(mut self, nodes: Arc<dyn NodeDirectory>) -> Self {
        self.services.nodes = Some(nodes);
        self
    }

    pub fn entity_sender(mut self, sender: Arc<dyn EntityPacketSender>) -> Self {
        self.services.entity_sender = Some(sender);
        self
    }

    pub fn services(mut self, services: HostServices) -> Self {
        self.services = services;
        self
    }

    pub fn build(self) -> ScriptHost {
        let id = self.registry.allocate_id();
        let bus = self
            .event_bus
            .unwrap_or_else(|| EventBus::new(self.config.event_capacity).0);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(HostShared::new(id, bus.create_sender(id), command_tx));
        self.registry.register(&shared);

        debug!(target: "scripting", "Created script host {} for {}", id, self.source.origin);

        ScriptHost {
            streamer: RefCell::new(AvatarStreamer::new(&self.config)),
            shared,
            registry: self.registry,
            evaluator: self.evaluator,
            config: self.config,
            services: self.services,
            source: Arc::new(Mutex::new(self.source)),
            parent_url: RefCell::new(self.parent_url),
            initialized: Cell::new(false),
            timers: RefCell::new(TimerRegistry::new()),
            signals: RefCell::new(Vec::new()),
            commands: RefCell::new(command_rx),
        }
    }
}

/// Execution host for one script.
///
/// A host is driven from a single thread: it evaluates the script body once
/// and then ticks at a fixed rate, firing timers, draining cross-thread work,
/// flushing entity edits and streaming avatar state, until it is stopped.
/// Other threads talk to it through a [`HostHandle`].
pub struct ScriptHost {
    pub(crate) shared: Arc<HostShared>,
    pub(crate) registry: Arc<ScriptRegistry>,
    evaluator: Box<dyn ScriptEvaluator>,
    config: HostConfig,
    pub(crate) services: HostServices,
    source: Arc<Mutex<ScriptSource>>,
    pub(crate) parent_url: RefCell<Option<String>>,
    initialized: Cell<bool>,
    timers: RefCell<TimerRegistry<Callback>>,
    pub(crate) streamer: RefCell<AvatarStreamer>,
    signals: RefCell<Vec<(ScriptSignal, Callback)>>,
    commands: RefCell<mpsc::UnboundedReceiver<HostCommand>>,
}

impl ScriptHost {
    pub fn builder(
        registry: Arc<ScriptRegistry>,
        evaluator: Box<dyn ScriptEvaluator>,
    ) -> ScriptHostBuilder {
        ScriptHostBuilder {
            registry,
            evaluator,
            config: HostConfig::default(),
            source: ScriptSource::default(),
            parent_url: None,
            event_bus: None,
            services: HostServices::default(),
        }
    }

    pub fn id(&self) -> HostId {
        self.shared.id
    }

    pub fn handle(&self) -> HostHandle {
        HostHandle::new(self.shared.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn context(&self) -> ScriptContext<'_> {
        ScriptContext::new(self)
    }

    pub fn origin(&self) -> String {
        self.source.lock().origin.clone()
    }

    pub fn contents(&self) -> String {
        self.source.lock().contents.clone()
    }

    /// Last `/`-separated component of the origin
    pub fn filename(&self) -> String {
        let origin = self.source.lock();
        origin
            .origin
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn set_parent_url(&self, parent_url: Option<String>) {
        *self.parent_url.borrow_mut() = parent_url;
    }

    /// Replace the script text and origin. Refused while running.
    pub fn set_script_contents(
        &self,
        contents: impl Into<String>,
        origin: impl Into<String>,
    ) -> Result<(), StateFault> {
        if self.is_running() {
            return Err(StateFault::AlreadyRunning);
        }
        let mut source = self.source.lock();
        source.contents = contents.into();
        source.origin = origin.into();
        Ok(())
    }

    /// Replace the script with the contents of a file or URL. Refused while running.
    ///
    /// References whose scheme is at most one character (a bare path or a
    /// drive letter) are read from disk immediately. Anything else goes through
    /// the batch fetcher and lands later; either way `ScriptLoaded` or
    /// `ErrorLoadingScript` reports the outcome.
    pub fn load_url(&self, reference: &str) -> Result<(), StateFault> {
        if self.is_running() {
            return Err(StateFault::AlreadyRunning);
        }
        self.source.lock().origin = reference.to_string();

        let url = match Url::parse(reference) {
            Ok(url) if url.scheme().len() > 1 => Some(url),
            _ => local_file_url(reference),
        };
        let Some(url) = url else {
            warn!(target: "scripting", "ERROR Loading file: {}", reference);
            self.emit(
                HostEvent::ErrorLoadingScript {
                    origin: reference.to_string(),
                },
                EventSource::Loader,
            );
            return Ok(());
        };

        if url.scheme() == "file" {
            let Ok(path) = url.to_file_path() else {
                self.emit(
                    HostEvent::ErrorLoadingScript {
                        origin: reference.to_string(),
                    },
                    EventSource::Loader,
                );
                return Ok(());
            };
            let origin = path.display().to_string();
            self.source.lock().origin = origin.clone();

            match std::fs::read_to_string(&path) {
                Ok(contents) => {
                    debug!(target: "scripting", "Loading file: {}", origin);
                    self.source.lock().contents = contents;
                    self.emit(HostEvent::ScriptLoaded { origin }, EventSource::Loader);
                }
                Err(e) => {
                    warn!(target: "scripting", "ERROR Loading file: {}: {}", origin, io_fault(&origin, e));
                    self.emit(HostEvent::ErrorLoadingScript { origin }, EventSource::Loader);
                }
            }
            return Ok(());
        }

        let source = self.source.clone();
        let events = self.shared.events.clone();
        let requested = url.clone();
        self.fetch(
            vec![url],
            Box::new(move |mut results| {
                let origin = source.lock().origin.clone();
                match results.remove(&requested) {
                    Some(Ok(contents)) => {
                        source.lock().contents = contents;
                        events.publish(HostEvent::ScriptLoaded { origin }, EventSource::Loader);
                    }
                    failed => {
                        let fault = match failed {
                            Some(Err(fault)) => fault,
                            _ => LoadFault::Cancelled(requested.to_string()),
                        };
                        warn!(target: "scripting", "ERROR Loading file: {} ({})", requested, fault);
                        events.publish(
                            HostEvent::ErrorLoadingScript { origin },
                            EventSource::Loader,
                        );
                    }
                }
            }),
        );
        Ok(())
    }

    /// Attach avatar data directly, before the host is moved to its thread
    pub fn set_avatar_data(&self, avatar: Option<&Arc<dyn AvatarData>>) {
        self.streamer
            .borrow_mut()
            .set_avatar_data(avatar.map(Arc::downgrade));
    }

    pub fn node_killed(&self, node_id: &Uuid) {
        self.streamer.borrow_mut().node_killed(node_id);
    }

    /// Register host objects with the evaluator, once
    pub fn init(&self) {
        if self.initialized.replace(true) {
            return;
        }
        debug!(target: "scripting", "Initializing host {} ({})", self.id(), self.filename());
        if let Err(fault) = self.evaluator.register_host_api(&self.context()) {
            self.report_fault(&fault);
        }
    }

    /// Evaluate program text and report the outcome.
    ///
    /// Faults are logged and published as `ErrorMessage`; every evaluation,
    /// faulted or not, is followed by `EvaluationFinished`. During a stop-all
    /// nothing is evaluated and `Undefined` comes back.
    pub fn evaluate(
        &self,
        program: &str,
        origin: &str,
        start_line: u32,
    ) -> Result<ScriptValue, ScriptFault> {
        if self.registry.is_stopping_all() {
            debug!(
                target: "scripting",
                "evaluate() while shutting down is ignored... parent script: {}",
                self.filename()
            );
            return Ok(ScriptValue::Undefined);
        }
        self.init();

        self.shared.begin_evaluation();
        let outcome = self
            .evaluator
            .evaluate(program, origin, start_line, &self.context());
        self.shared.end_evaluation();

        let (result, had_exception) = match &outcome {
            Ok(value) => (value.clone(), false),
            Err(fault) => {
                self.report_fault(fault);
                (ScriptValue::String(fault.message.clone()), true)
            }
        };
        self.emit(
            HostEvent::EvaluationFinished {
                result,
                had_exception,
            },
            EventSource::Script,
        );
        outcome
    }

    /// Evaluate the script body, then tick until stopped.
    ///
    /// Returns once the loop has exited and every shutdown notification has
    /// been sent. Refused if already running or while a stop-all is underway.
    pub fn run(&self) -> Result<(), StateFault> {
        if self.registry.is_stopping_all() {
            warn!(target: "scripting", "Refusing to run {} while stopping all scripts", self.filename());
            return Err(StateFault::StoppingAll);
        }
        if self.is_running() {
            return Err(StateFault::AlreadyRunning);
        }
        self.init();

        self.shared.begin_run();
        // A stop-all that started after the check above must still see this host finish
        if self.registry.is_stopping_all() {
            self.shared.end_run();
            self.shared.mark_done();
            return Err(StateFault::StoppingAll);
        }
        self.emit(HostEvent::RunningStateChanged, EventSource::Host);
        info!(target: "scripting", "Running script {} (host {})", self.filename(), self.id());

        let (contents, origin) = {
            let source = self.source.lock();
            (source.contents.clone(), source.origin.clone())
        };
        let _ = self.evaluate(&contents, &origin, 1);

        self.run_loop();
        self.shutdown(&origin);
        Ok(())
    }

    /// Move the host onto a dedicated thread and run it there.
    ///
    /// The host is dropped on that thread once it finishes.
    pub fn spawn(self) -> std::io::Result<(HostHandle, JoinHandle<()>)> {
        let handle = self.handle();
        let name = format!("script-{}", self.id());
        let thread = thread::Builder::new().name(name).spawn(move || {
            if let Err(fault) = self.run() {
                warn!(target: "scripting", "Script {} did not run: {}", self.filename(), fault);
            }
        })?;
        Ok((handle, thread))
    }

    fn run_loop(&self) {
        let tick = self.config.tick_interval();
        let start = Instant::now();
        let mut last_update = start;
        let mut frame: u32 = 0;

        while !self.is_finished() {
            // Absolute schedule: tick N is due at start + N * tick
            let target = start + tick.saturating_mul(frame);
            frame = frame.saturating_add(1);
            let now = Instant::now();
            if now < target {
                thread::sleep(target - now);
            }
            if self.is_finished() {
                break;
            }

            self.pump_events();
            if self.is_finished() {
                break;
            }

            if let Some(sender) = &self.services.entity_sender {
                flush_entity_edits(sender.as_ref());
            }
            if self.is_finished() {
                break;
            }

            self.stream_avatar(Instant::now());

            let now = Instant::now();
            let delta = now.duration_since(last_update);
            last_update = now;
            if !self.is_finished() {
                self.send_update(delta);
            }
        }
    }

    fn shutdown(&self, origin: &str) {
        let cancelled = self.timers.borrow_mut().cancel_all();
        if cancelled > 0 {
            debug!(target: "scripting", "Cancelled {} timer(s) for {}", cancelled, self.filename());
        }

        self.emit(HostEvent::ScriptEnding, EventSource::Host);
        self.call_signal(ScriptSignal::ScriptEnding, &[]);

        if let Some(sender) = &self.services.entity_sender {
            flush_entity_edits(sender.as_ref());
        }

        self.emit(
            HostEvent::Finished {
                origin: origin.to_string(),
            },
            EventSource::Host,
        );
        self.shared.end_run();
        self.emit(HostEvent::RunningStateChanged, EventSource::Host);
        self.emit(HostEvent::DoneRunning, EventSource::Host);
        self.shared.mark_done();
        info!(target: "scripting", "Script {} finished (host {})", self.filename(), self.id());
    }

    fn send_update(&self, delta: Duration) {
        let delta_time = delta.as_secs_f32();
        self.emit(HostEvent::Update { delta_time }, EventSource::Host);
        self.call_signal(ScriptSignal::Update, &[ScriptValue::Number(delta_time as f64)]);
    }

    fn stream_avatar(&self, now: Instant) {
        let Some(nodes) = &self.services.nodes else {
            return;
        };
        self.streamer.borrow_mut().stream_tick(nodes.as_ref(), now);
    }

    /// Drain cross-thread commands, then fire due timers
    pub(crate) fn pump_events(&self) {
        while let Some(command) = self.next_command() {
            self.handle_command(command);
        }
        self.fire_due_timers();
    }

    fn next_command(&self) -> Option<HostCommand> {
        self.commands.borrow_mut().try_recv().ok()
    }

    fn handle_command(&self, command: HostCommand) {
        match command {
            HostCommand::NodeKilled(id) => self.node_killed(&id),
            HostCommand::IncludeReady {
                urls,
                callback,
                results,
            } => self.finish_include(&urls, &callback, &results),
            HostCommand::SetAvatarData(avatar) => {
                self.streamer.borrow_mut().set_avatar_data(avatar)
            }
            HostCommand::SetAvatarSound(sound) => self.streamer.borrow_mut().set_sound(sound),
            HostCommand::Invoke(task) => task(&self.context()),
        }
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        let due = self.timers.borrow().due(now);
        for id in due {
            if self.is_finished() {
                break;
            }
            let callback = self.timers.borrow_mut().fire(id, now);
            if let Some(callback) = callback {
                if let Err(fault) = self.call_callback(&callback, &[]) {
                    self.report_fault(&fault);
                }
            }
        }
    }

    /// Start a timer; `None` while stopping all scripts or once the host has stopped
    pub(crate) fn setup_timer(
        &self,
        callback: Callback,
        interval: Duration,
        single_shot: bool,
    ) -> Option<TimerId> {
        if self.registry.is_stopping_all() {
            debug!(
                target: "scripting",
                "Timer setup while shutting down is ignored... parent script: {}",
                self.filename()
            );
            return None;
        }
        if self.is_finished() {
            debug!(target: "scripting", "Timer setup after stop is ignored ({})", self.filename());
            return None;
        }
        let id = self
            .timers
            .borrow_mut()
            .schedule(callback, interval, single_shot, Instant::now());
        Some(id)
    }

    pub(crate) fn stop_timer(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().cancel(id)
    }

    pub(crate) fn active_timers(&self) -> usize {
        self.timers.borrow().active_count()
    }

    pub(crate) fn connect(&self, signal: ScriptSignal, callback: Callback) {
        self.signals.borrow_mut().push((signal, callback));
    }

    pub(crate) fn set_avatar_sound(&self, sound: Option<Arc<Sound>>) {
        self.streamer.borrow_mut().set_sound(sound);
    }

    pub(crate) fn set_avatar_weak(&self, avatar: Option<Weak<dyn AvatarData>>) {
        self.streamer.borrow_mut().set_avatar_data(avatar);
    }

    fn call_signal(&self, signal: ScriptSignal, args: &[ScriptValue]) {
        let connected: Vec<Callback> = self
            .signals
            .borrow()
            .iter()
            .filter(|(connected, _)| *connected == signal)
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in connected {
            if let Err(fault) = self.call_callback(&callback, args) {
                self.report_fault(&fault);
            }
        }
    }

    pub(crate) fn call_callback(
        &self,
        callback: &Callback,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, ScriptFault> {
        let ctx = self.context();
        match callback {
            Callback::Script(function) => self.evaluator.call(function, args, &ctx),
            Callback::Native(function) => function(&ctx, args),
        }
    }

    pub(crate) fn report_fault(&self, fault: &ScriptFault) {
        error!(target: "scripting", "[{}] {}", self.filename(), fault);
        self.emit(
            HostEvent::ErrorMessage {
                message: fault.to_string(),
            },
            EventSource::Script,
        );
    }

    pub(crate) fn emit(&self, event: HostEvent, source: EventSource) {
        self.shared.events.publish(event, source);
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        // stop_all removes the hosts it stops itself
        if !self.registry.is_stopping_all() {
            self.registry.unregister(self.id());
        }
    }
}
