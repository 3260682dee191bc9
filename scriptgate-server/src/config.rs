//! Startup configuration, parsed from the command line and environment.

use std::collections::BTreeMap;
use std::num::NonZeroU16;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueHint};

use crate::mount::Extension;
use crate::process::Environment;

/// Fatal errors in the startup configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("path {0:?} does not exist or doesn't have proper permissions")]
    PathMissing(PathBuf),
    #[error("path {0:?} is not a directory")]
    PathNotDirectory(PathBuf),
    #[error("shebang must be a non empty string")]
    EmptyShebang,
    #[error("bearer must be a non empty string")]
    EmptyBearer,
    #[error("env entry {0:?} must have the form KEY=VALUE")]
    MalformedEnv(String),
    #[error("directory {segment:?} of {target:?} is not a valid url segment")]
    InvalidSegment { segment: String, target: PathBuf },
    #[error("routes {first} and {second} overlap")]
    ConflictingRoutes { first: String, second: String },
    #[error("failed to scan {pattern}: {reason}")]
    Scan { pattern: String, reason: String },
}

#[derive(Parser, Debug)]
#[command(version, about = "Exposes a directory of command-line scripts as HTTP endpoints")]
pub struct CliArgs {
    /// The directory to scan for command files.
    #[arg(
        short = 'c',
        long,
        alias = "commands",
        value_name = "DIR",
        value_hint = ValueHint::DirPath,
        env = "SCRIPTGATE_PATH",
    )]
    pub path: PathBuf,
    /// Interpreter prepended to every command, e.g. `bash` or `node`.
    /// Without it, command files must be executable.
    #[arg(long, value_name = "CMD", env = "SCRIPTGATE_SHEBANG")]
    pub shebang: Option<String>,
    /// Access token that all requests must present.
    #[arg(long, value_name = "TOKEN", env = "SCRIPTGATE_BEARER", hide_env_values = true)]
    pub bearer: Option<String>,
    /// Timeout of every command in milliseconds, 0 means unbounded.
    #[arg(long, value_name = "MS", default_value = "0", env = "SCRIPTGATE_TIMEOUT")]
    pub timeout: u64,
    /// Extra environment variables for the commands, as KEY=VALUE.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
    /// The host address to listen on.
    #[arg(
        long,
        value_name = "URI",
        value_hint = ValueHint::Hostname,
        default_value = "0.0.0.0",
        env = "SCRIPTGATE_HOST",
    )]
    pub host: String,
    /// The port to listen on.
    #[arg(
        short,
        long,
        value_name = "PORT",
        value_hint = ValueHint::Other,
        default_value = "3000",
        env = "SCRIPTGATE_PORT",
    )]
    pub port: NonZeroU16,
    /// Show trace output of the route discovery and every execution.
    #[arg(short, long, env = "SCRIPTGATE_DEBUG")]
    pub debug: bool,
    /// Uploaded files older than this many seconds are swept.
    #[arg(long, value_name = "SECS", default_value = "3600")]
    pub upload_max_age: u64,
}

/// Validated configuration of the command routes.
#[derive(Clone)]
pub struct ServerConfig {
    /// Absolute path of the commands root.
    pub path: PathBuf,
    pub shebang: Option<String>,
    pub bearer: Option<String>,
    /// `None` for unbounded.
    pub timeout: Option<Duration>,
    pub environment: Environment,
    pub extensions: Vec<Arc<dyn Extension>>,
    /// Logs every command line and its output at `info`.
    pub debug: bool,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("path", &self.path)
            .field("shebang", &self.shebang)
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("extensions", &self.extensions.len())
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Validates the commands root and captures the current process environment.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = assert_is_directory(path.into())?;
        Ok(Self {
            path,
            shebang: None,
            bearer: None,
            timeout: None,
            environment: Environment::capture(),
            extensions: Vec::new(),
            debug: false,
        })
    }

    pub fn with_shebang(mut self, shebang: impl Into<String>) -> Result<Self, ConfigError> {
        let shebang = shebang.into();
        if shebang.trim().is_empty() {
            return Err(ConfigError::EmptyShebang);
        }
        self.shebang = Some(shebang);
        Ok(self)
    }

    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Result<Self, ConfigError> {
        let bearer = bearer.into();
        if bearer.is_empty() {
            return Err(ConfigError::EmptyBearer);
        }
        self.bearer = Some(bearer);
        Ok(self)
    }

    /// Sets the timeout in milliseconds, `0` disables it.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout = (timeout > 0).then(|| Duration::from_millis(timeout));
        self
    }

    /// Overrides environment variables of the commands.
    #[must_use]
    pub fn with_env(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.environment = self.environment.merged(overrides);
        self
    }

    /// Registers a hook that runs after every execution, in registration order.
    #[must_use]
    pub fn with_extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl TryFrom<&CliArgs> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: &CliArgs) -> Result<Self, Self::Error> {
        let mut config = ServerConfig::new(&args.path)?
            .with_timeout_ms(args.timeout)
            .with_env(parse_env(&args.env)?)
            .with_debug(args.debug);
        // Empty values from the environment are treated as unset.
        if let Some(shebang) = args.shebang.as_deref().filter(|s| !s.is_empty()) {
            config = config.with_shebang(shebang)?;
        }
        if let Some(bearer) = args.bearer.as_deref().filter(|s| !s.is_empty()) {
            config = config.with_bearer(bearer)?;
        }
        Ok(config)
    }
}

/// Parses `KEY=VALUE` entries, later entries win.
pub fn parse_env(entries: &[String]) -> Result<BTreeMap<String, String>, ConfigError> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
            _ => Err(ConfigError::MalformedEnv(entry.clone())),
        })
        .collect()
}

/// Resolves the path against the current directory and checks that it is a directory.
fn assert_is_directory(path: PathBuf) -> Result<PathBuf, ConfigError> {
    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map_err(|_| ConfigError::PathMissing(path.clone()))?
            .join(path)
    };
    match std::fs::metadata(&absolute) {
        Ok(meta) if meta.is_dir() => Ok(absolute),
        Ok(_) => {
            log::debug!(path:debug = absolute; "not a directory");
            Err(ConfigError::PathNotDirectory(absolute))
        }
        Err(e) => {
            log::debug!(path:debug = absolute, e:display; "cannot stat commands path");
            Err(ConfigError::PathMissing(absolute))
        }
    }
}
