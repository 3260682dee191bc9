//! Turns a directory of command files into a route table.
//!
//! `<root>/users/:id/get.sh` becomes `GET /users/:id`. Directory segments
//! written as `:name` or `{name}` are path parameters.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use glob::{glob_with, MatchOptions, Pattern};
use scriptgate_api::api::Verb;

use crate::config::ConfigError;

/// A discovered command file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoutePath {
    pub absolute: PathBuf,
    /// Relative to the commands root.
    pub relative: PathBuf,
}

/// A command file bound to a method and url pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Axum path, parameters as `:name`.
    pub url_pattern: String,
    pub verb: Verb,
    pub target: PathBuf,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.verb.as_str().to_ascii_uppercase(),
            self.url_pattern
        )
    }
}

impl Route {
    /// Derives the route from the location of the file. `None` if the base
    /// name is not a verb.
    pub fn from_path(path: &RoutePath) -> Option<Self> {
        let file_name = path.relative.file_name()?.to_str()?;
        // `get.sh.bak` is still a `get`
        let stem = file_name.split('.').next()?;
        let verb = stem.parse::<Verb>().ok()?;

        let segments = path
            .relative
            .parent()
            .into_iter()
            .flat_map(Path::components)
            .filter_map(|component| match component {
                Component::Normal(segment) => Some(url_segment(&segment.to_string_lossy())),
                _ => None,
            })
            .collect::<Vec<_>>();

        Some(Self {
            url_pattern: format!("/{}", segments.join("/")),
            verb,
            target: path.absolute.clone(),
        })
    }

    /// Names of the path parameters, in order.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.url_pattern
            .split('/')
            .filter_map(|segment| segment.strip_prefix(':'))
    }
}

/// Rewrites `{name}` to the `:name` placeholder, other segments are kept.
fn url_segment(segment: &str) -> String {
    match segment
        .strip_prefix('{')
        .and_then(|inner| inner.strip_suffix('}'))
    {
        Some(name) if !name.is_empty() => format!(":{name}"),
        _ => segment.to_owned(),
    }
}

/// Finds every file under `root` whose base name is a verb, ignoring case
/// and extension. Sorted by relative path.
pub fn find_route_paths(root: &Path) -> Result<Vec<RoutePath>, ConfigError> {
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let escaped_root = Pattern::escape(&root.to_string_lossy());

    let mut paths = Vec::new();
    for verb in Verb::VARIANTS {
        let pattern = format!("{escaped_root}/**/{verb}.*");
        let entries = glob_with(&pattern, options).map_err(|e| ConfigError::Scan {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        for entry in entries {
            let absolute = match entry {
                Ok(absolute) => absolute,
                Err(e) => {
                    log::warn!(e:display; "skipping unreadable path");
                    continue;
                }
            };
            if !absolute.is_file() {
                continue;
            }
            let Ok(relative) = absolute.strip_prefix(root).map(Path::to_path_buf) else {
                continue;
            };
            paths.push(RoutePath { absolute, relative });
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Whether the owner of the file may execute it.
#[cfg(unix)]
pub fn is_executable(path: &RoutePath) -> bool {
    use std::os::unix::fs::PermissionsExt;

    const MASK_EXEC: u32 = 0o100;
    let executable = std::fs::metadata(&path.absolute)
        .is_ok_and(|meta| meta.permissions().mode() & MASK_EXEC != 0);
    if !executable {
        log::info!(path:debug = path.absolute; "not executable, ignoring");
    }
    executable
}

#[cfg(not(unix))]
pub fn is_executable(_path: &RoutePath) -> bool {
    true
}

/// Builds the route table of `root`.
///
/// Without an interpreter the files must be executable on their own, the
/// others are left out.
pub fn discover(root: &Path, has_interpreter: bool) -> Result<Vec<Route>, ConfigError> {
    let routes = find_route_paths(root)?
        .into_iter()
        .filter(|path| has_interpreter || is_executable(path))
        .filter_map(|path| Route::from_path(&path))
        .collect::<Vec<_>>();
    for route in &routes {
        check_segments(route)?;
    }
    check_conflicts(&routes)?;
    Ok(routes)
}

/// `:` and `*` are only allowed as the prefix of a named parameter.
fn check_segments(route: &Route) -> Result<(), ConfigError> {
    for segment in route.url_pattern.split('/').filter(|s| !s.is_empty()) {
        let name = segment.strip_prefix(':').unwrap_or(segment);
        if name.is_empty() || name.contains([':', '*']) {
            return Err(ConfigError::InvalidSegment {
                segment: segment.to_owned(),
                target: route.target.clone(),
            });
        }
    }
    Ok(())
}

/// The router refuses two files for the same method and pattern, and two
/// differently named parameters at the same position.
fn check_conflicts(routes: &[Route]) -> Result<(), ConfigError> {
    let mut seen: HashMap<(&str, Verb), &Route> = HashMap::new();
    let mut param_names: HashMap<String, (&str, &Route)> = HashMap::new();

    for route in routes {
        if let Some(other) = seen.insert((route.url_pattern.as_str(), route.verb), route) {
            return Err(conflict(other, route));
        }

        let mut shape = String::new();
        for segment in route.url_pattern.split('/').filter(|s| !s.is_empty()) {
            if let Some(name) = segment.strip_prefix(':') {
                match param_names.get(&shape) {
                    Some((existing, other)) if *existing != name => {
                        return Err(conflict(other, route));
                    }
                    Some(_) => {}
                    None => {
                        param_names.insert(shape.clone(), (name, route));
                    }
                }
                shape.push_str("/:");
            } else {
                shape.push('/');
                shape.push_str(segment);
            }
        }
    }
    Ok(())
}

fn conflict(first: &Route, second: &Route) -> ConfigError {
    ConfigError::ConflictingRoutes {
        first: format!("{first} ({})", first.target.display()),
        second: format!("{second} ({})", second.target.display()),
    }
}
