use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque reference to a function living inside a script evaluator.
///
/// The host never interprets the name; it only hands it back to the evaluator
/// that produced it when a timer, signal or include callback fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionRef(Arc<str>);

impl FunctionRef {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function {}", self.0)
    }
}

/// Value produced by evaluating script code
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum ScriptValue {
    /// No value (also returned when evaluation is skipped)
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Function values are never serialized across the event bus
    #[serde(skip)]
    Function(FunctionRef),
}

impl ScriptValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, ScriptValue::Undefined)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, ScriptValue::Function(_))
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            ScriptValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Undefined => write!(f, "undefined"),
            ScriptValue::Null => write!(f, "null"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Number(n) => write!(f, "{}", n),
            ScriptValue::String(s) => write!(f, "{}", s),
            ScriptValue::Function(func) => write!(f, "{}", func),
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::String(value.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::String(value)
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        ScriptValue::Number(value)
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Bool(value)
    }
}

impl From<FunctionRef> for ScriptValue {
    fn from(value: FunctionRef) -> Self {
        ScriptValue::Function(value)
    }
}
