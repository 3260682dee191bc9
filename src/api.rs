use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The version of this protocol.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Response header telling whether the command succeeded, `true` or `false`.
pub const SUCCESS_HEADER: &str = "x-success";

/// Request headers starting with this prefix (case insensitive) are passed as flags.
pub const ARG_HEADER_PREFIX: &str = "x-arg-";

/// Query parameter or body field carrying the bearer token.
pub const ACCESS_TOKEN_FIELD: &str = "access_token";

/// The HTTP verb a command file answers to, taken from its base name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    /// Answers every method without a dedicated file.
    All,
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
}

impl Verb {
    /// Every verb, in the order files are looked up.
    pub const VARIANTS: [Verb; 7] = [
        Verb::All,
        Verb::Get,
        Verb::Post,
        Verb::Put,
        Verb::Delete,
        Verb::Head,
        Verb::Options,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::All => "all",
            Verb::Get => "get",
            Verb::Post => "post",
            Verb::Put => "put",
            Verb::Delete => "delete",
            Verb::Head => "head",
            Verb::Options => "options",
        }
    }

    /// Whether requests for this verb may carry multipart uploads.
    ///
    /// ```
    /// # use scriptgate_api::api::Verb;
    /// assert!(Verb::Post.accepts_uploads());
    /// assert!(!Verb::Get.accepts_uploads());
    /// ```
    pub fn accepts_uploads(self) -> bool {
        !matches!(self, Verb::Get | Verb::Head | Verb::Options)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a file base name is not one of the known verbs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVerb(pub String);

impl fmt::Display for UnknownVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown verb `{}`", self.0)
    }
}

impl std::error::Error for UnknownVerb {}

impl FromStr for Verb {
    type Err = UnknownVerb;

    /// Case insensitive, `GET` and `get` are the same verb.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::VARIANTS
            .into_iter()
            .find(|verb| verb.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVerb(s.to_owned()))
    }
}

/// How the exit code of a command is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCodePolicy {
    /// `0`: the output is the result.
    Success,
    /// `10`: the output is a path to a file to send back.
    File,
    /// `11`: a controlled failure, the output is still structured.
    HandledError,
    /// Any other code, or no code at all if the process was killed by a signal.
    Unhandled(Option<i32>),
}

impl ExitCodePolicy {
    pub const SUCCESS_CODE: i32 = 0;
    pub const FILE_CODE: i32 = 10;
    pub const HANDLED_ERROR_CODE: i32 = 11;

    /// Classifies an exit code as reported by [`std::process::ExitStatus::code`].
    ///
    /// ```
    /// # use scriptgate_api::api::ExitCodePolicy;
    /// assert_eq!(ExitCodePolicy::from_code(Some(10)), ExitCodePolicy::File);
    /// assert_eq!(ExitCodePolicy::from_code(Some(1)), ExitCodePolicy::Unhandled(Some(1)));
    /// assert_eq!(ExitCodePolicy::from_code(None), ExitCodePolicy::Unhandled(None));
    /// ```
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(Self::SUCCESS_CODE) => Self::Success,
            Some(Self::FILE_CODE) => Self::File,
            Some(Self::HANDLED_ERROR_CODE) => Self::HandledError,
            other => Self::Unhandled(other),
        }
    }
}

/// The two shapes a successful execution can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultKind {
    /// JSON output, always an object with a `success` field.
    Object,
    /// The output is a file path.
    File,
}

/// The typed outcome of running a command, produced once per request.
///
/// # Serialized Example
/// ```
/// # let ser = r#"
/// {
///     "type": "OBJECT",
///     "output": { "success": true, "result": "Hello World" },
///     "error": null
/// }
/// # "#;
/// # let deser: scriptgate_api::api::ExecutionResult
/// #    = serde_json::from_str(ser).expect("failed parsing");
/// # assert!(deser.success());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(rename = "type")]
    pub kind: ResultKind,
    pub output: Value,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn object(output: Value) -> Self {
        Self {
            kind: ResultKind::Object,
            output,
            error: None,
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::File,
            output: Value::String(path.into()),
            error: None,
        }
    }

    /// The value of the `X-Success` header for this result.
    ///
    /// Files are always successful, objects report their `success` field.
    pub fn success(&self) -> bool {
        match self.kind {
            ResultKind::File => true,
            ResultKind::Object => self.output.get("success").is_some_and(is_truthy),
        }
    }

    /// The path to send back, only for [`ResultKind::File`].
    pub fn file_path(&self) -> Option<&str> {
        match self.kind {
            ResultKind::File => self.output.as_str(),
            ResultKind::Object => None,
        }
    }
}

/// Builds the JSON body for a command that exited with `0` or `11`.
///
/// The output is parsed as JSON if possible. An object that already has a
/// `success` field is passed through untouched, anything else is wrapped,
/// as `result` on success and as `message` on a handled error.
///
/// ```
/// # use scriptgate_api::api::structured_output;
/// # use serde_json::json;
/// assert_eq!(
///     structured_output("Hello World", true),
///     json!({ "success": true, "result": "Hello World" })
/// );
/// assert_eq!(
///     structured_output(r#"{"success": false, "code": 3}"#, true),
///     json!({ "success": false, "code": 3 })
/// );
/// assert_eq!(
///     structured_output("[1, 2]", false),
///     json!({ "success": false, "message": [1, 2] })
/// );
/// ```
pub fn structured_output(captured: &str, success: bool) -> Value {
    let value = serde_json::from_str::<Value>(captured)
        .unwrap_or_else(|_| Value::String(captured.to_owned()));

    if value.get("success").is_some() {
        return value;
    }
    if success {
        json!({ "success": true, "result": value })
    } else {
        json!({ "success": false, "message": value })
    }
}

/// Truthiness of a JSON value: `null`, `false`, `0` and `""` are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
