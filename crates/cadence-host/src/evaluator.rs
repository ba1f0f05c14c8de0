use cadence_events::{FunctionRef, ScriptValue};

use crate::context::ScriptContext;
use crate::error::ScriptFault;

/// The language runtime a host drives.
///
/// Every method takes `&self`: script code may call back into the host (set a
/// timer, include a file, evaluate more code) while the evaluator is still on
/// the stack, so implementations keep their own interior mutability.
pub trait ScriptEvaluator: Send {
    /// Called once per host, before the first evaluation, to expose host objects
    fn register_host_api(&self, _ctx: &ScriptContext<'_>) -> Result<(), ScriptFault> {
        Ok(())
    }

    /// Evaluate program text. `origin` and `start_line` label faults.
    fn evaluate(
        &self,
        program: &str,
        origin: &str,
        start_line: u32,
        ctx: &ScriptContext<'_>,
    ) -> Result<ScriptValue, ScriptFault>;

    /// Call a function previously handed to the host
    fn call(
        &self,
        function: &FunctionRef,
        args: &[ScriptValue],
        ctx: &ScriptContext<'_>,
    ) -> Result<ScriptValue, ScriptFault>;
}
