//! Embeddable per-script execution host
//!
//! Each script runs in its own [`ScriptHost`]: a single-threaded context with
//! its own run loop, timers and includes, which streams avatar state and audio
//! to the network every tick. A [`ScriptRegistry`] owned by the application
//! tracks the live hosts and stops them all in an orderly way.
//!
//! The language runtime is plugged in through [`ScriptEvaluator`]; networking
//! and asset fetching come in through the traits in [`net`] and [`loader`].
pub mod avatar;
pub mod callback;
pub mod config;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod handle;
pub mod host;
pub mod loader;
pub mod net;
pub mod registry;
pub mod timer;

pub use avatar::{AudioFrame, AvatarData, AvatarStreamer, Sound, TickReport};
pub use callback::Callback;
pub use config::{CadenceConfig, ConfigLoadError, HostConfig, ScriptsConfig};
pub use context::{ScriptContext, ScriptSignal};
pub use error::{LoadFault, ScriptFault, StateFault};
pub use evaluator::ScriptEvaluator;
pub use handle::{HostHandle, HostId, HostTask};
pub use host::{HostServices, ScriptHost, ScriptHostBuilder};
pub use loader::{resolve_path, BatchFetcher, FetchCallback, FetchResults, FileFetcher};
pub use net::{EntityPacketSender, Node, NodeDirectory, NodeType, PacketType};
pub use registry::ScriptRegistry;
pub use timer::{TimerId, TimerRegistry};

// Event vocabulary, so embedders need only one dependency
pub use cadence_events::{
    EventBus, EventConsumer, EventEnvelope, EventSender, EventSource, FunctionRef, HostEvent,
    ScriptValue,
};
