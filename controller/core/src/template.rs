//! Template rendering for resource names, namespaces, labels, annotations and
//! manifest bodies.
//!
//! Templates use Tera (Jinja2) syntax: `{{ uid }}-config`,
//! `{{ hostOrUrl | to_host }}`. Referencing an undefined variable is an
//! error. The `int`, `float` and `bool` filters mark a value so that, when it
//! makes up an entire string in a manifest body, it is emitted as a typed JSON
//! value instead of a string.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Renders a single template string.
pub trait Render {
    fn render(&self, template: &str, vars: &Variables) -> Result<String, RenderError>;

    /// Renders every string inside `value`, converting typed markers.
    fn render_value(&self, value: &Value, vars: &Variables) -> Result<Value, RenderError> {
        Ok(match value {
            Value::String(s) => typed(self.render(s, vars)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v, vars))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.render_value(v, vars)?)))
                    .collect::<Result<_, RenderError>>()?,
            ),
            other => other.clone(),
        })
    }
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("failed to render {template:?}: {message}")]
pub struct RenderError {
    template: String,
    message: String,
}

/// The values available to templates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Variables(BTreeMap<String, Value>);

/// The inputs a node contributes to its templates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeVariables {
    pub uid: String,
    pub template_ref: String,
    pub hub_id: String,
    pub activate: bool,
    pub host_or_url: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// Tera-backed [`Render`] with the controller's filters registered.
#[derive(Clone)]
pub struct Engine {
    tera: tera::Tera,
}

const INT_MARKER: &str = "__lynq_int__:";
const FLOAT_MARKER: &str = "__lynq_float__:";
const BOOL_MARKER: &str = "__lynq_bool__:";

// === impl RenderError ===

impl RenderError {
    pub fn new(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            message: message.into(),
        }
    }
}

// === impl Variables ===

impl Variables {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl From<NodeVariables> for Variables {
    fn from(node: NodeVariables) -> Self {
        let NodeVariables {
            uid,
            template_ref,
            hub_id,
            activate,
            host_or_url,
            extra,
        } = node;

        let mut vars = Variables::default();
        // Extra mappings first so they cannot shadow the built-in names.
        for (k, v) in extra {
            vars.insert(k, v);
        }
        vars.insert("uid", uid);
        vars.insert("templateRef", template_ref);
        vars.insert("hubId", hub_id);
        vars.insert("activate", activate);
        if let Some(host_or_url) = host_or_url {
            vars.insert("host", to_host(&host_or_url));
            vars.insert("hostOrUrl", host_or_url);
        }
        vars
    }
}

// === impl Engine ===

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new() -> Self {
        let mut tera = tera::Tera::default();
        tera.register_filter("trunc63", trunc63_filter);
        tera.register_filter("to_host", to_host_filter);
        tera.register_filter("int", int_filter);
        tera.register_filter("float", float_filter);
        tera.register_filter("bool", bool_filter);
        Self { tera }
    }

    /// Parses `template` without rendering it.
    pub fn check(&self, template: &str) -> Result<(), RenderError> {
        if !is_template(template) {
            return Ok(());
        }
        let mut tera = self.tera.clone();
        tera.add_raw_template("check", template)
            .map(|_| ())
            .map_err(|error| RenderError::new(template, describe(&error)))
    }

    /// Parses every string inside `value`.
    pub fn check_value(&self, value: &Value) -> Result<(), RenderError> {
        match value {
            Value::String(s) => self.check(s),
            Value::Array(items) => items.iter().try_for_each(|v| self.check_value(v)),
            Value::Object(map) => map.values().try_for_each(|v| self.check_value(v)),
            _ => Ok(()),
        }
    }
}

impl Render for Engine {
    fn render(&self, template: &str, vars: &Variables) -> Result<String, RenderError> {
        if !is_template(template) {
            return Ok(template.to_string());
        }

        let mut context = tera::Context::new();
        for (k, v) in vars.iter() {
            context.insert(k, v);
        }

        let mut tera = self.tera.clone();
        tera.render_str(template, &context)
            .map_err(|error| RenderError::new(template, describe(&error)))
    }
}

fn is_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%") || s.contains("{#")
}

/// Tera nests the useful detail in the error's sources.
fn describe(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Converts a fully-rendered marker string into its typed value.
fn typed(rendered: String) -> Value {
    let rendered_trimmed = rendered.trim();
    if let Some(n) = rendered_trimmed.strip_prefix(INT_MARKER) {
        if let Ok(n) = n.parse::<i64>() {
            return Value::from(n);
        }
    } else if let Some(n) = rendered_trimmed.strip_prefix(FLOAT_MARKER) {
        if let Some(n) = n.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return Value::Number(n);
        }
    } else if let Some(b) = rendered_trimmed.strip_prefix(BOOL_MARKER) {
        if let Ok(b) = b.parse::<bool>() {
            return Value::Bool(b);
        }
    }
    Value::String(rendered)
}

/// Truncates to the 63 characters allowed in DNS labels, without leaving a
/// trailing separator.
pub fn trunc63(s: &str) -> String {
    let truncated = s.chars().take(63).collect::<String>();
    truncated.trim_end_matches(['-', '.', '_']).to_string()
}

/// Extracts the host from a URL or bare host, dropping scheme, port, path and
/// credentials.
pub fn to_host(s: &str) -> String {
    let s = s.trim();
    let rest = s.split_once("://").map_or(s, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    if let Some(bracketed) = host.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or_default().to_string();
    }
    host.split(':').next().unwrap_or_default().to_string()
}

type FilterArgs = HashMap<String, Value>;

fn string_arg(name: &str, value: &Value) -> tera::Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(tera::Error::msg(format!("{name} expects a string, got {value}"))),
    }
}

fn trunc63_filter(value: &Value, _: &FilterArgs) -> tera::Result<Value> {
    Ok(Value::String(trunc63(&string_arg("trunc63", value)?)))
}

fn to_host_filter(value: &Value, _: &FilterArgs) -> tera::Result<Value> {
    Ok(Value::String(to_host(&string_arg("to_host", value)?)))
}

fn int_filter(value: &Value, _: &FilterArgs) -> tera::Result<Value> {
    let n = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| tera::Error::msg(format!("int: {n} is out of range")))?,
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| tera::Error::msg(format!("int: {s:?}: {e}")))?,
        Value::Bool(b) => i64::from(*b),
        _ => return Err(tera::Error::msg(format!("int: unsupported value {value}"))),
    };
    Ok(Value::String(format!("{INT_MARKER}{n}")))
}

fn float_filter(value: &Value, _: &FilterArgs) -> tera::Result<Value> {
    let f = match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| tera::Error::msg(format!("float: {n} is out of range")))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| tera::Error::msg(format!("float: {s:?}: {e}")))?,
        _ => return Err(tera::Error::msg(format!("float: unsupported value {value}"))),
    };
    Ok(Value::String(format!("{FLOAT_MARKER}{f}")))
}

fn bool_filter(value: &Value, _: &FilterArgs) -> tera::Result<Value> {
    let b = match value {
        Value::Bool(b) => *b,
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" | "" => false,
            other => return Err(tera::Error::msg(format!("bool: {other:?} is not a boolean"))),
        },
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => return Err(tera::Error::msg(format!("bool: unsupported value {value}"))),
    };
    Ok(Value::String(format!("{BOOL_MARKER}{b}")))
}
