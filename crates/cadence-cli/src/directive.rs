//! Line-oriented stand-in script language used by the soak tool.
//!
//! One directive per line; blank lines and `//` comments are skipped.
//!
//! ```text
//! print hello            emit a printed message
//! include a.js b.js      blocking include, relative to the script
//! load other.js          ask for a standalone script
//! every 100 print tick   run a directive on an interval
//! after 5000 stop        run a directive once, after a delay
//! avatar on              toggle avatar mode
//! value 42               result of the evaluation
//! throw message          raise a fault
//! stop
//! ```

use cadence_host::{
    Callback, FunctionRef, ScriptContext, ScriptEvaluator, ScriptFault, ScriptValue,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectiveEvaluator;

impl DirectiveEvaluator {
    fn run_line(
        &self,
        line: &str,
        origin: &str,
        line_number: u32,
        ctx: &ScriptContext<'_>,
    ) -> Result<ScriptValue, ScriptFault> {
        let (directive, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let fault = |message: String| ScriptFault::new(origin, line_number, message);

        match directive {
            "print" => ctx.print(rest),
            "include" => {
                let references: Vec<&str> = rest.split_whitespace().collect();
                ctx.include(&references, None);
            }
            "load" => ctx.load(rest),
            "every" | "after" => {
                let (delay, action) = rest.split_once(' ').ok_or_else(|| {
                    fault(format!("SyntaxError: {directive} needs a delay and a directive"))
                })?;
                let delay: u64 = delay
                    .parse()
                    .map_err(|_| fault(format!("TypeError: '{}' is not a delay in ms", delay)))?;
                let callback = Callback::Script(FunctionRef::new(action.trim()));
                if directive == "every" {
                    ctx.set_interval(callback, delay);
                } else {
                    ctx.set_timeout(callback, delay);
                }
            }
            "avatar" => ctx.set_is_avatar(rest == "on"),
            "stop" => ctx.stop(),
            "value" => {
                let value = rest
                    .parse::<f64>()
                    .map(ScriptValue::Number)
                    .unwrap_or_else(|_| ScriptValue::from(rest));
                return Ok(value);
            }
            "throw" => return Err(fault(rest.to_string())),
            other => return Err(fault(format!("SyntaxError: unknown directive '{}'", other))),
        }
        Ok(ScriptValue::Undefined)
    }
}

impl ScriptEvaluator for DirectiveEvaluator {
    fn evaluate(
        &self,
        program: &str,
        origin: &str,
        start_line: u32,
        ctx: &ScriptContext<'_>,
    ) -> Result<ScriptValue, ScriptFault> {
        let mut result = ScriptValue::Undefined;
        for (offset, line) in program.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            result = self.run_line(line, origin, start_line + offset as u32, ctx)?;
        }
        Ok(result)
    }

    /// Timer callbacks carry their directive as the function name
    fn call(
        &self,
        function: &FunctionRef,
        _args: &[ScriptValue],
        ctx: &ScriptContext<'_>,
    ) -> Result<ScriptValue, ScriptFault> {
        self.run_line(function.name(), &ctx.origin(), 0, ctx)
    }
}
