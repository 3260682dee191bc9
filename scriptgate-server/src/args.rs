//! Builds the `--name "value"` flags of a command from the request data.

use std::fmt;

use axum::http::HeaderMap;
use scriptgate_api::api::ARG_HEADER_PREFIX;
use serde_json::Value;

use crate::request::RequestInput;

/// Separator between the segments of a flattened body key, `names.0`.
pub const KEY_SEPARATOR: &str = ".";

/// Ordered `--name [value]` flags.
///
/// Inserting a name twice keeps its first position but the last value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandFlags {
    flags: Vec<(String, Option<String>)>,
}

impl CommandFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the flags from every source of the request, lowest precedence
    /// first: headers, query, path parameters, body, uploaded files.
    pub fn from_request(input: &RequestInput) -> Self {
        let mut flags = Self::new();
        flags.extend_headers(&input.headers);
        for (name, value) in &input.query {
            flags.insert(name, Some(value.clone()));
        }
        for (name, value) in &input.params {
            flags.insert(name, Some(value.clone()));
        }
        for (name, leaf) in flatten(&input.body) {
            flags.insert(&name, leaf_to_string(leaf));
        }
        for upload in &input.files {
            flags.insert(
                &upload.field,
                Some(upload.path.to_string_lossy().into_owned()),
            );
        }
        flags
    }

    /// `None` gives a bare `--name`.
    pub fn insert(&mut self, name: &str, value: Option<String>) {
        match self.flags.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, existing)) => *existing = value,
            None => self.flags.push((name.to_owned(), value)),
        }
    }

    /// Headers named `X-Arg-<name>`, keyed by `<name>`.
    fn extend_headers(&mut self, headers: &HeaderMap) {
        for (name, value) in headers {
            // Header names are always lowercase.
            if let Some(flag) = name.as_str().strip_prefix(ARG_HEADER_PREFIX) {
                if flag.is_empty() {
                    continue;
                }
                let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                self.insert(flag, Some(value));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.flags
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.flags
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

/// The shell-escaped flags separated by spaces, ready to be appended to a command line.
impl fmt::Display for CommandFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.flags.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if is_plain_name(name) {
                write!(f, "--{name}")?;
            } else {
                f.write_str(&escape(&format!("--{name}")))?;
            }
            if let Some(value) = value {
                write!(f, " {}", escape(value))?;
            }
        }
        Ok(())
    }
}

fn is_plain_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Wraps the value in double quotes so the shell passes it as one argument.
///
/// Backslashes and double quotes are escaped, as well as `$` and backticks
/// which the shell would expand inside double quotes.
pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('"');
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('"');
    escaped
}

/// Every leaf of the value with its key, the path from the root joined by
/// [`KEY_SEPARATOR`]. Empty objects and arrays have no leaves, neither has a
/// bare scalar body.
pub fn flatten(value: &Value) -> Vec<(String, &Value)> {
    fn walk<'a>(value: &'a Value, path: &mut Vec<String>, leaves: &mut Vec<(String, &'a Value)>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    path.push(key.clone());
                    walk(child, path, leaves);
                    path.pop();
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    path.push(index.to_string());
                    walk(child, path, leaves);
                    path.pop();
                }
            }
            leaf => {
                if !path.is_empty() {
                    leaves.push((path.join(KEY_SEPARATOR), leaf));
                }
            }
        }
    }

    let mut leaves = Vec::new();
    walk(value, &mut Vec::new(), &mut leaves);
    leaves
}

/// `null` has no value and becomes a bare flag.
fn leaf_to_string(leaf: &Value) -> Option<String> {
    match leaf {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
