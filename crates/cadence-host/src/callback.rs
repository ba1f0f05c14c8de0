use std::fmt;
use std::sync::Arc;

use cadence_events::{FunctionRef, ScriptValue};

use crate::context::ScriptContext;
use crate::error::ScriptFault;

/// Host-side function callable in place of a script function
pub type NativeFn = dyn for<'a> Fn(&ScriptContext<'a>, &[ScriptValue]) -> Result<ScriptValue, ScriptFault>
    + Send
    + Sync;

/// Something the host calls back later: from a timer, a signal or a finished include
#[derive(Clone)]
pub enum Callback {
    /// A function living in the script's evaluator
    Script(FunctionRef),
    /// A Rust closure, used by embedders and tests
    Native(Arc<NativeFn>),
}

impl Callback {
    pub fn native<F>(f: F) -> Self
    where
        F: for<'a> Fn(&ScriptContext<'a>, &[ScriptValue]) -> Result<ScriptValue, ScriptFault>
            + Send
            + Sync
            + 'static,
    {
        Callback::Native(Arc::new(f))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Script(function) => f.debug_tuple("Script").field(function).finish(),
            Callback::Native(_) => f.write_str("Native(..)"),
        }
    }
}

impl From<FunctionRef> for Callback {
    fn from(function: FunctionRef) -> Self {
        Callback::Script(function)
    }
}
