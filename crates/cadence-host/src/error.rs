use thiserror::Error;

/// An uncaught exception raised by script code.
///
/// Faults are recovered locally: the host logs them, reports them through an
/// `ErrorMessage` event and keeps running.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Uncaught exception at ({origin}) line {line}: {message}")]
pub struct ScriptFault {
    pub origin: String,
    pub line: u32,
    pub message: String,
}

impl ScriptFault {
    pub fn new(origin: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            line,
            message: message.into(),
        }
    }
}

/// Failure to obtain script source text
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadFault {
    #[error("script not found: {0}")]
    NotFound(String),
    #[error("failed to read {url}: {reason}")]
    Io { url: String, reason: String },
    #[error("unsupported URL scheme '{scheme}' for {url}")]
    UnsupportedScheme { scheme: String, url: String },
    #[error("invalid script URL '{0}'")]
    InvalidUrl(String),
    #[error("fetch for {0} was dropped before completing")]
    Cancelled(String),
}

/// Operation attempted in the wrong lifecycle state.
///
/// These are soft rejections: callers get them back as values, nothing is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateFault {
    #[error("operation not allowed while the script is running")]
    AlreadyRunning,
    #[error("operation ignored while all scripts are stopping")]
    StoppingAll,
    #[error("script host is no longer alive")]
    HostGone,
}
