pub mod cadence_config;
pub mod host_config;

pub use cadence_config::{CadenceConfig, ConfigLoadError, ScriptsConfig, project_dirs};
pub use host_config::HostConfig;
