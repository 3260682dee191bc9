//! Turns the outcome of an execution into the HTTP response.

use std::path::PathBuf;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use scriptgate_api::api::{ExecutionResult, ResultKind, SUCCESS_HEADER};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::process::ExecutionError;

/// What the execution step hands to the translator.
pub type Outcome = Result<ExecutionResult, ExecutionError>;

fn success_header(success: bool) -> (&'static str, HeaderValue) {
    (
        SUCCESS_HEADER,
        HeaderValue::from_static(if success { "true" } else { "false" }),
    )
}

/// Plain text `500` with the error message.
impl IntoResponse for ExecutionError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [success_header(false)],
            self.to_string(),
        )
            .into_response()
    }
}

pub async fn translate(id: u64, outcome: Outcome) -> Response {
    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            log::info!(id, e:display; "execution failed");
            return e.into_response();
        }
    };

    match result.kind {
        ResultKind::Object => {
            let success = result.success();
            log::debug!(id, success; "sending json result");
            (StatusCode::OK, [success_header(success)], Json(result.output)).into_response()
        }
        ResultKind::File => {
            let path = PathBuf::from(result.file_path().unwrap_or_default());
            log::debug!(id, path:debug = path; "sending file");
            match send_file(path).await {
                Ok(response) => response,
                Err(e) => {
                    log::warn!(id, e:display; "failed to send file");
                    e.into_response()
                }
            }
        }
    }
}

/// Streams the file as a download, keeping its name.
async fn send_file(path: PathBuf) -> Result<Response, ExecutionError> {
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|source| ExecutionError::File {
            path: path.clone(),
            source,
        })?;
    if !meta.is_file() {
        return Err(ExecutionError::File {
            path,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        });
    }

    let disposition = content_disposition(&path);
    let served = ServeFile::new(&path)
        .oneshot(Request::new(Body::empty()))
        .await
        .unwrap_or_else(|never| match never {});
    if !served.status().is_success() {
        return Err(ExecutionError::File {
            path,
            source: std::io::Error::other(format!("file server answered {}", served.status())),
        });
    }

    let mut response = served.map(Body::new);
    let headers = response.headers_mut();
    let (name, value) = success_header(true);
    headers.insert(name, value);
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

/// `attachment; filename="<name>"`, with an RFC 5987 variant for names that
/// are not plain ASCII.
fn content_disposition(path: &std::path::Path) -> HeaderValue {
    let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned()) else {
        return HeaderValue::from_static("attachment");
    };

    let value = if name.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        let quoted = name.replace('\\', "\\\\").replace('"', "\\\"");
        format!("attachment; filename=\"{quoted}\"")
    } else {
        let fallback: String = name
            .chars()
            .map(|c| if c.is_ascii_graphic() && c != '"' && c != '\\' { c } else { '_' })
            .collect();
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            urlencoding::encode(&name)
        )
    };
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
