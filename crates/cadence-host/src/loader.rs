//! Include/load URL resolution and batched fetching of script files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use cadence_events::{EventSource, HostEvent, ScriptValue};

use crate::callback::Callback;
use crate::error::LoadFault;
use crate::handle::HostCommand;
use crate::host::ScriptHost;

/// Outcome of one batch fetch, keyed by the requested URL
pub type FetchResults = HashMap<Url, Result<String, LoadFault>>;

/// Called exactly once when every URL of a batch has succeeded or failed
pub type FetchCallback = Box<dyn FnOnce(FetchResults) + Send + 'static>;

/// Asynchronous retrieval of several URLs with a single completion signal.
///
/// `on_complete` may be called from any thread, including synchronously from
/// inside `fetch`.
pub trait BatchFetcher: Send + Sync {
    fn fetch(&self, urls: Vec<Url>, on_complete: FetchCallback);

    /// Fetch a batch and wait for it on the calling thread.
    ///
    /// The default waits for [`fetch`](Self::fetch) to call back, so that
    /// completion must not depend on the calling thread making progress. On a
    /// multi-thread tokio runtime the wait is moved off the worker with
    /// `block_in_place`. A callback that is dropped unanswered leaves every URL
    /// `Cancelled`.
    fn fetch_blocking(&self, urls: Vec<Url>) -> FetchResults {
        let (tx, rx) = std_mpsc::sync_channel(1);
        self.fetch(
            urls.clone(),
            Box::new(move |results| {
                let _ = tx.send(results);
            }),
        );

        let wait = || rx.recv().ok();
        let received = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(wait)
            }
            _ => wait(),
        };
        received.unwrap_or_else(|| cancelled(urls))
    }
}

fn cancelled(urls: Vec<Url>) -> FetchResults {
    urls.into_iter()
        .map(|url| {
            let fault = LoadFault::Cancelled(url.to_string());
            (url, Err(fault))
        })
        .collect()
}

/// Fetches `file://` URLs on a tokio runtime
#[derive(Debug, Clone)]
pub struct FileFetcher {
    runtime: Handle,
}

impl FileFetcher {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Fetcher bound to the runtime of the calling task, if there is one
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl BatchFetcher for FileFetcher {
    fn fetch(&self, urls: Vec<Url>, on_complete: FetchCallback) {
        self.runtime.spawn(async move {
            let mut reads = JoinSet::new();
            for url in urls {
                reads.spawn(async move {
                    let result = read_file_url(&url).await;
                    (url, result)
                });
            }

            let mut results = FetchResults::new();
            while let Some(joined) = reads.join_next().await {
                match joined {
                    Ok((url, result)) => {
                        results.insert(url, result);
                    }
                    Err(e) => warn!(target: "scripting", "File read task failed: {}", e),
                }
            }
            on_complete(results);
        });
    }

    /// Reads the files on the calling thread, so a host driven from inside the
    /// fetcher's own runtime never waits on a task that cannot be polled
    fn fetch_blocking(&self, urls: Vec<Url>) -> FetchResults {
        urls.into_iter()
            .map(|url| {
                let result = file_path(&url).and_then(|path| {
                    std::fs::read_to_string(path).map_err(|e| io_fault(url.as_str(), e))
                });
                (url, result)
            })
            .collect()
    }
}

fn file_path(url: &Url) -> Result<PathBuf, LoadFault> {
    if url.scheme() != "file" {
        return Err(LoadFault::UnsupportedScheme {
            scheme: url.scheme().to_string(),
            url: url.to_string(),
        });
    }
    url.to_file_path()
        .map_err(|_| LoadFault::InvalidUrl(url.to_string()))
}

async fn read_file_url(url: &Url) -> Result<String, LoadFault> {
    let path = file_path(url)?;
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| io_fault(url.as_str(), e))
}

pub(crate) fn io_fault(url: &str, error: std::io::Error) -> LoadFault {
    if error.kind() == std::io::ErrorKind::NotFound {
        LoadFault::NotFound(url.to_string())
    } else {
        LoadFault::Io {
            url: url.to_string(),
            reason: error.to_string(),
        }
    }
}

/// `file://` URL for a local path, made absolute against the working directory
pub fn local_file_url(path: &str) -> Option<Url> {
    let path = Path::new(path);
    if path.is_absolute() {
        return Url::from_file_path(path).ok();
    }
    let cwd = std::env::current_dir().ok()?;
    Url::from_file_path(cwd.join(path)).ok()
}

/// Resolve an include/load reference.
///
/// A reference that already has a scheme is returned as-is. Anything else is
/// resolved against `parent_url` when set, otherwise against `origin`; a base
/// without a scheme is taken to be a local file named by `origin`.
pub fn resolve_path(reference: &str, parent_url: Option<&str>, origin: &str) -> Option<Url> {
    if let Ok(url) = Url::parse(reference) {
        return Some(url);
    }

    let base = parent_url.filter(|parent| !parent.is_empty()).unwrap_or(origin);
    let base = match Url::parse(base) {
        Ok(url) => url,
        Err(_) => local_file_url(origin)?,
    };
    base.join(reference).ok()
}

impl ScriptHost {
    /// Resolve a reference relative to this host's parent URL or origin
    pub fn resolve_path(&self, reference: &str) -> Option<Url> {
        let parent = self.parent_url.borrow().clone();
        let origin = self.origin();
        resolve_path(reference, parent.as_deref(), &origin)
    }

    /// Fetch and evaluate a list of scripts, in list order.
    ///
    /// With a callback the fetch completes in the background and the results
    /// are evaluated during a later event pump, after which the callback runs.
    /// Without one this blocks the host's thread until the whole batch is in.
    pub fn include(&self, references: &[&str], callback: Option<Callback>) {
        if self.registry.is_stopping_all() {
            debug!(
                target: "scripting",
                "include() while shutting down is ignored... includeFiles: {:?} parent script: {}",
                references,
                self.filename()
            );
            return;
        }

        let mut urls = Vec::with_capacity(references.len());
        for reference in references {
            match self.resolve_path(reference) {
                Some(url) => urls.push(url),
                None => {
                    warn!(target: "scripting", "Error loading file: cannot resolve '{}'", reference);
                    self.emit(
                        HostEvent::ErrorLoadingScript {
                            origin: reference.to_string(),
                        },
                        EventSource::Loader,
                    );
                }
            }
        }

        match callback {
            Some(callback) => {
                let shared = self.shared.clone();
                let batch = urls.clone();
                self.fetch(
                    urls,
                    Box::new(move |results| {
                        let ready = HostCommand::IncludeReady {
                            urls: batch,
                            callback,
                            results,
                        };
                        if shared.send(ready).is_err() {
                            debug!(target: "scripting", "Host {} went away before its include finished", shared.id);
                        }
                    }),
                );
            }
            None => {
                let results = match &self.services.fetcher {
                    Some(fetcher) => fetcher.fetch_blocking(urls.clone()),
                    None => unconfigured(urls.clone()),
                };
                self.evaluate_batch(&urls, &results);
            }
        }
    }

    /// Ask the application to start `reference` as a separate script
    pub fn load(&self, reference: &str) {
        if self.registry.is_stopping_all() {
            debug!(
                target: "scripting",
                "load() while shutting down is ignored... loadFile: {} parent script: {}",
                reference,
                self.filename()
            );
            return;
        }

        let Some(url) = self.resolve_path(reference) else {
            warn!(target: "scripting", "Cannot resolve script to load: {}", reference);
            return;
        };
        self.emit(
            HostEvent::LoadScriptRequest {
                url: url.to_string(),
                is_user_loaded: false,
            },
            EventSource::Script,
        );
    }

    /// Evaluate fetched sources in the order they were requested
    pub(crate) fn evaluate_batch(&self, urls: &[Url], results: &FetchResults) {
        for url in urls {
            match results.get(url) {
                Some(Ok(contents)) => {
                    debug!(target: "scripting", "Evaluating included file {}", url);
                    let _ = self.evaluate(contents, url.as_str(), 1);
                }
                Some(Err(fault)) => self.report_load_failure(url, &fault.to_string()),
                None => {
                    let fault = LoadFault::Cancelled(url.to_string());
                    self.report_load_failure(url, &fault.to_string());
                }
            }
        }
    }

    pub(crate) fn finish_include(&self, urls: &[Url], callback: &Callback, results: &FetchResults) {
        self.evaluate_batch(urls, results);
        if let Err(fault) = self.call_callback(callback, &[] as &[ScriptValue]) {
            self.report_fault(&fault);
        }
    }

    fn report_load_failure(&self, url: &Url, reason: &str) {
        warn!(target: "scripting", "Error loading file: {} ({})", url, reason);
        self.emit(
            HostEvent::ErrorLoadingScript {
                origin: url.to_string(),
            },
            EventSource::Loader,
        );
    }

    pub(crate) fn fetch(&self, urls: Vec<Url>, on_complete: FetchCallback) {
        match &self.services.fetcher {
            Some(fetcher) => fetcher.fetch(urls, on_complete),
            None => on_complete(unconfigured(urls)),
        }
    }
}

fn unconfigured(urls: Vec<Url>) -> FetchResults {
    urls.into_iter()
        .map(|url| {
            let fault = LoadFault::Io {
                url: url.to_string(),
                reason: "no fetcher configured".to_string(),
            };
            (url, Err(fault))
        })
        .collect()
}
