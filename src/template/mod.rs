//! Pin template compiler.
//!
//! A pin value in a workflow can be a literal or a template mixing text with
//! `{{ expression }}` placeholders. Templates are compiled once per
//! (pin type, text) pair and the compiled evaluator is reused for every run
//! for the lifetime of the process.
//!
//! ## Example
//!
//! ```rust
//! use pinflow::template::{PinType, TemplateCompiler};
//! use serde_json::json;
//!
//! let compiler = TemplateCompiler::new();
//! let template = compiler.compile(&PinType::Number, "{{ a + b }}").unwrap();
//! assert_eq!(template.evaluate(&json!({"a": 1, "b": 2})).unwrap(), json!(3));
//! ```

mod expr;

use std::fmt;
use std::sync::{Arc, OnceLock};

use moka::sync::Cache;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use expr::{is_truthy, number_value, parse, to_display, to_number, Expr};

use crate::error::{Error, Result};

/// Get the regex for matching `{{ expr }}` placeholders.
fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_REGEX.get_or_init(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("valid regex"))
}

/// Declared type of a pin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PinType {
    String,
    Object,
    Number,
    Boolean,
    /// Any other declared type; values pass through uncoerced.
    Other(String),
}

impl PinType {
    pub fn as_str(&self) -> &str {
        match self {
            PinType::String => "string",
            PinType::Object => "object",
            PinType::Number => "number",
            PinType::Boolean => "boolean",
            PinType::Other(name) => name,
        }
    }
}

impl From<&str> for PinType {
    fn from(name: &str) -> Self {
        match name {
            "string" => PinType::String,
            "object" => PinType::Object,
            "number" => PinType::Number,
            "boolean" => PinType::Boolean,
            other => PinType::Other(other.to_string()),
        }
    }
}

impl From<String> for PinType {
    fn from(name: String) -> Self {
        PinType::from(name.as_str())
    }
}

impl From<PinType> for String {
    fn from(pin_type: PinType) -> Self {
        pin_type.as_str().to_string()
    }
}

impl fmt::Display for PinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An expression parsed on first use.
///
/// Parse errors surface when the template is first evaluated, and every
/// later evaluation reports the same error.
#[derive(Debug)]
struct LazyExpr {
    source: String,
    parsed: OnceLock<std::result::Result<Expr, String>>,
}

impl LazyExpr {
    fn new(source: &str) -> Self {
        Self {
            source: source.trim().to_string(),
            parsed: OnceLock::new(),
        }
    }

    fn evaluate(&self, data: &Value) -> Result<Value> {
        let parsed = self
            .parsed
            .get_or_init(|| parse(&self.source).map_err(|e| e.to_string()));
        match parsed {
            Ok(expr) => expr.evaluate(data),
            Err(message) => Err(Error::Template(format!(
                "Invalid expression '{}': {}",
                self.source, message
            ))),
        }
    }
}

#[derive(Debug)]
enum Part {
    Text(String),
    Expr(LazyExpr),
}

#[derive(Debug)]
enum Body {
    /// No placeholders; the value is fixed at compile time.
    Literal(Value),
    /// A single placeholder spanning the whole text.
    Expression(LazyExpr),
    /// Text with placeholders in between.
    Interpolated { parts: Vec<Part>, quote_strings: bool },
}

/// A compiled template: a function from data to a pin value.
#[derive(Debug)]
pub struct CompiledTemplate {
    pin_type: PinType,
    body: Body,
}

impl CompiledTemplate {
    fn build(pin_type: PinType, text: &str) -> Result<Self> {
        let regex = placeholder_regex();
        let matches: Vec<_> = regex.captures_iter(text).collect();

        let body = if matches.is_empty() {
            Body::Literal(parse_text(&pin_type, text)?)
        } else if matches.len() == 1 && matches[0].get(0).is_some_and(|m| m.as_str() == text) {
            Body::Expression(LazyExpr::new(&matches[0][1]))
        } else {
            let mut parts = Vec::new();
            let mut last = 0;
            for caps in &matches {
                let Some(whole) = caps.get(0) else {
                    continue;
                };
                if whole.start() > last {
                    parts.push(Part::Text(text[last..whole.start()].to_string()));
                }
                parts.push(Part::Expr(LazyExpr::new(&caps[1])));
                last = whole.end();
            }
            if last < text.len() {
                parts.push(Part::Text(text[last..].to_string()));
            }

            let quote_strings =
                pin_type == PinType::Object && (text.starts_with('{') || text.starts_with('['));
            Body::Interpolated {
                parts,
                quote_strings,
            }
        };

        Ok(Self { pin_type, body })
    }

    pub fn pin_type(&self) -> &PinType {
        &self.pin_type
    }

    /// Whether the output is independent of the supplied data.
    pub fn is_literal(&self) -> bool {
        matches!(self.body, Body::Literal(_))
    }

    /// Evaluate against `data`, whose top-level properties are in scope.
    pub fn evaluate(&self, data: &Value) -> Result<Value> {
        match &self.body {
            Body::Literal(value) => Ok(value.clone()),
            Body::Expression(expr) => coerce(&self.pin_type, expr.evaluate(data)?),
            Body::Interpolated {
                parts,
                quote_strings,
            } => {
                let mut rendered = String::new();
                for part in parts {
                    match part {
                        Part::Text(text) => rendered.push_str(text),
                        Part::Expr(expr) => {
                            let value = expr.evaluate(data)?;
                            if *quote_strings {
                                rendered.push_str(&value.to_string());
                            } else {
                                rendered.push_str(&to_display(&value));
                            }
                        }
                    }
                }
                parse_text(&self.pin_type, &rendered)
            }
        }
    }
}

/// Parse rendered text as a value of `pin_type`.
fn parse_text(pin_type: &PinType, text: &str) -> Result<Value> {
    match pin_type {
        PinType::Object => serde_json::from_str(text).map_err(|e| {
            Error::Template(format!("Invalid JSON for object pin '{}': {}", text, e))
        }),
        _ => coerce(pin_type, Value::String(text.to_string())),
    }
}

/// Coerce an evaluated value to `pin_type`.
pub fn coerce(pin_type: &PinType, value: Value) -> Result<Value> {
    match pin_type {
        PinType::String => Ok(Value::String(to_display(&value))),
        PinType::Number => match value {
            Value::Number(_) => Ok(value),
            other => {
                let n = to_number(&other);
                if n.is_finite() {
                    Ok(number_value(n))
                } else {
                    Err(Error::Template(format!(
                        "Cannot convert {} to a number",
                        other
                    )))
                }
            }
        },
        PinType::Boolean => Ok(match &value {
            Value::String(s) if s.trim() == "true" => Value::Bool(true),
            Value::String(s) if s.trim() == "false" => Value::Bool(false),
            other => Value::Bool(is_truthy(other)),
        }),
        PinType::Object | PinType::Other(_) => Ok(value),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TemplateKey {
    pin_type: PinType,
    text: String,
}

/// Process-lifetime cache of compiled templates.
///
/// Entries are never evicted: the key space is bounded by the pins of the
/// loaded workflow.
#[derive(Clone)]
pub struct TemplateCompiler {
    cache: Cache<TemplateKey, Arc<CompiledTemplate>>,
}

impl TemplateCompiler {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder().build(),
        }
    }

    /// Compile `text` for `pin_type`, reusing a cached evaluator when present.
    pub fn compile(&self, pin_type: &PinType, text: &str) -> Result<Arc<CompiledTemplate>> {
        let text = text.trim();
        let key = TemplateKey {
            pin_type: pin_type.clone(),
            text: text.to_string(),
        };

        self.cache
            .try_get_with(key, || {
                CompiledTemplate::build(pin_type.clone(), text)
                    .map(Arc::new)
                    .map_err(|e| e.to_string())
            })
            .map_err(|e: Arc<String>| Error::Template((*e).clone()))
    }

    /// Number of cached evaluators.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TemplateCompiler {
    fn default() -> Self {
        Self::new()
    }
}
