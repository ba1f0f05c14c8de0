// Shared test doubles for the host integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cadence_host::{
    BatchFetcher, EntityPacketSender, EventEnvelope, FetchCallback, FetchResults, FunctionRef,
    HostConfig, HostEvent, LoadFault, Node, NodeDirectory, ScriptContext, ScriptEvaluator,
    ScriptFault, ScriptValue,
};
use tokio::sync::broadcast;
use url::Url;
use uuid::Uuid;

pub type Program =
    Arc<dyn for<'a> Fn(&ScriptContext<'a>) -> Result<ScriptValue, ScriptFault> + Send + Sync>;

/// Evaluator whose "programs" are Rust closures keyed by program text.
///
/// Unknown program text evaluates to `Undefined`; text starting with `throw `
/// raises a fault with the rest as message. Every evaluation and call is
/// recorded.
#[derive(Clone, Default)]
pub struct ScriptedEvaluator {
    programs: Arc<Mutex<HashMap<String, Program>>>,
    functions: Arc<Mutex<HashMap<String, Program>>>,
    evaluated: Arc<Mutex<Vec<String>>>,
    called: Arc<Mutex<Vec<String>>>,
    init_count: Arc<AtomicUsize>,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program<F>(self, text: &str, program: F) -> Self
    where
        F: for<'a> Fn(&ScriptContext<'a>) -> Result<ScriptValue, ScriptFault>
            + Send
            + Sync
            + 'static,
    {
        self.programs
            .lock()
            .unwrap()
            .insert(text.to_string(), Arc::new(program));
        self
    }

    pub fn function<F>(self, name: &str, function: F) -> Self
    where
        F: for<'a> Fn(&ScriptContext<'a>) -> Result<ScriptValue, ScriptFault>
            + Send
            + Sync
            + 'static,
    {
        self.functions
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(function));
        self
    }

    /// Origins of every evaluation, in order
    pub fn evaluated(&self) -> Vec<String> {
        self.evaluated.lock().unwrap().clone()
    }

    pub fn called(&self) -> Vec<String> {
        self.called.lock().unwrap().clone()
    }

    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::SeqCst)
    }

    pub fn boxed(&self) -> Box<dyn ScriptEvaluator> {
        Box::new(self.clone())
    }
}

impl ScriptEvaluator for ScriptedEvaluator {
    fn register_host_api(&self, _ctx: &ScriptContext<'_>) -> Result<(), ScriptFault> {
        self.init_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn evaluate(
        &self,
        program: &str,
        origin: &str,
        start_line: u32,
        ctx: &ScriptContext<'_>,
    ) -> Result<ScriptValue, ScriptFault> {
        self.evaluated.lock().unwrap().push(origin.to_string());

        if let Some(message) = program.strip_prefix("throw ") {
            return Err(ScriptFault::new(origin, start_line, message));
        }
        // Release the lock before running, programs may evaluate more code
        let found = self.programs.lock().unwrap().get(program).cloned();
        match found {
            Some(program) => program(ctx),
            None => Ok(ScriptValue::Undefined),
        }
    }

    fn call(
        &self,
        function: &FunctionRef,
        _args: &[ScriptValue],
        ctx: &ScriptContext<'_>,
    ) -> Result<ScriptValue, ScriptFault> {
        self.called.lock().unwrap().push(function.name().to_string());
        let found = self.functions.lock().unwrap().get(function.name()).cloned();
        match found {
            Some(function) => function(ctx),
            None => Err(ScriptFault::new(
                ctx.origin(),
                0,
                format!("ReferenceError: {} is not defined", function.name()),
            )),
        }
    }
}

/// Node directory that records every datagram
#[derive(Default)]
pub struct RecordingNodes {
    pub nodes: Mutex<Vec<Node>>,
    pub sent: Mutex<Vec<(Uuid, Vec<u8>)>>,
}

impl RecordingNodes {
    pub fn with_nodes(nodes: Vec<Node>) -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(nodes),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Packets sent to one peer whose first byte is `packet_type`
    pub fn packets_to(&self, id: Uuid, packet_type: u8) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, packet)| *to == id && packet[0] == packet_type)
            .map(|(_, packet)| packet.clone())
            .collect()
    }
}

impl NodeDirectory for RecordingNodes {
    fn each_node(&self, visitor: &mut dyn FnMut(&Node)) {
        for node in self.nodes.lock().unwrap().iter() {
            visitor(node);
        }
    }

    fn send_datagram(&self, bytes: &[u8], node: &Node) {
        self.sent.lock().unwrap().push((node.id, bytes.to_vec()));
    }
}

/// Unthreaded entity packet sender that counts flushes
#[derive(Default)]
pub struct CountingEntitySender {
    pub released: AtomicUsize,
    pub processed: AtomicUsize,
}

impl EntityPacketSender for CountingEntitySender {
    fn servers_exist(&self) -> bool {
        true
    }

    fn release_queued_messages(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn is_threaded(&self) -> bool {
        false
    }

    fn process(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fetcher backed by a map of URL to contents.
///
/// Completes on a background thread, resolving the URLs in reverse order.
#[derive(Default)]
pub struct MapFetcher {
    files: HashMap<String, String>,
    resolved: Arc<Mutex<Vec<Url>>>,
}

impl MapFetcher {
    pub fn new(files: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            files: files
                .iter()
                .map(|(url, contents)| (url.to_string(), contents.to_string()))
                .collect(),
            resolved: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// URLs in the order the fetcher resolved them
    pub fn resolved(&self) -> Vec<Url> {
        self.resolved.lock().unwrap().clone()
    }
}

impl BatchFetcher for MapFetcher {
    fn fetch(&self, urls: Vec<Url>, on_complete: FetchCallback) {
        let files = self.files.clone();
        let resolved = self.resolved.clone();
        thread::spawn(move || {
            let mut results = FetchResults::new();
            for url in urls.into_iter().rev() {
                thread::sleep(Duration::from_millis(2));
                let result = files
                    .get(url.as_str())
                    .cloned()
                    .ok_or_else(|| LoadFault::NotFound(url.to_string()));
                resolved.lock().unwrap().push(url.clone());
                results.insert(url, result);
            }
            on_complete(results);
        });
    }
}

/// Fast ticking config for tests
pub fn test_config() -> HostConfig {
    HostConfig::with_tick_interval(Duration::from_millis(5))
}

/// Everything currently buffered on a receiver
pub fn drain_events(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<HostEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}

pub fn position_of(events: &[HostEvent], wanted: &HostEvent) -> Option<usize> {
    events.iter().position(|event| event == wanted)
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Native callback that stops the host
pub fn stopper() -> cadence_host::Callback {
    cadence_host::Callback::native(|ctx, _args| {
        ctx.stop();
        Ok(ScriptValue::Undefined)
    })
}
