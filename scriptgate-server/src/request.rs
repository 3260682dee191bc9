//! Collects everything a command receives from the request: headers, query,
//! path parameters, body fields and uploaded files.

use std::path::{Path as FsPath, PathBuf};

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Path, Request};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::RequestExt;
use scriptgate_api::api::SUCCESS_HEADER;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

/// Largest body read into memory or accepted as upload.
pub const BODY_LIMIT: usize = 16 * 1024 * 1024;

/// The directory where per-request scratch data is kept.
pub fn working_directory() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push("scriptgate");
    path
}

/// Root of the per-request upload directories.
pub fn upload_directory() -> PathBuf {
    let mut path = working_directory();
    path.push("uploads");
    path
}

/// The request data, before it is turned into flags.
#[derive(Debug, Default)]
pub struct RequestInput {
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    /// `Value::Null` without a body.
    pub body: Value,
    pub files: Vec<UploadedFile>,
}

/// An uploaded file, stored in the upload directory of its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Name of the form field.
    pub field: String,
    /// Name of the file on the client, if sent.
    pub file_name: Option<String>,
    pub path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("failed to read request body: {message}")]
    Body { status: StatusCode, message: String },
    #[error("malformed query string: {0}")]
    Query(serde_urlencoded::de::Error),
    #[error("malformed json body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed form body: {0}")]
    Form(serde_urlencoded::de::Error),
    #[error("malformed multipart body: {0}")]
    Multipart(String),
    #[error("failed to store upload: {0}")]
    Upload(#[from] std::io::Error),
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = match self {
            RequestError::Body { status, .. } => status,
            RequestError::Upload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        (
            status,
            [(SUCCESS_HEADER, HeaderValue::from_static("false"))],
            self.to_string(),
        )
            .into_response()
    }
}

/// The body formats that are turned into fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Json,
    Form,
    Multipart,
    Other,
}

impl BodyKind {
    pub fn of(headers: &HeaderMap) -> Self {
        let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        else {
            return Self::Other;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence == "application/json" || essence.ends_with("+json") {
            Self::Json
        } else if essence == "application/x-www-form-urlencoded" {
            Self::Form
        } else if essence == "multipart/form-data" {
            Self::Multipart
        } else {
            Self::Other
        }
    }
}

/// Parses a json or url encoded body, other kinds have no fields.
pub fn parse_body(kind: BodyKind, bytes: &[u8]) -> Result<Value, RequestError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    match kind {
        BodyKind::Json => Ok(serde_json::from_slice(bytes)?),
        BodyKind::Form => {
            let pairs: Vec<(String, String)> =
                serde_urlencoded::from_bytes(bytes).map_err(RequestError::Form)?;
            Ok(Value::Object(
                pairs
                    .into_iter()
                    .map(|(key, value)| (key, Value::String(value)))
                    .collect::<Map<_, _>>(),
            ))
        }
        BodyKind::Multipart | BodyKind::Other => Ok(Value::Null),
    }
}

/// Uploads of a single request. Nothing outside the request refers to it.
#[derive(Debug)]
pub struct UploadDir {
    path: PathBuf,
}

impl UploadDir {
    async fn create(id: u64) -> std::io::Result<Self> {
        let mut path = upload_directory();
        path.push(format!("{id:016x}"));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    /// Deletes the uploads, failures are only logged.
    pub async fn remove(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            log::warn!(path:debug = self.path, e:display; "failed to remove uploads");
        }
    }
}

/// Reads the request into a [`RequestInput`].
///
/// Multipart bodies are only read when `accept_uploads` is set, their files
/// are written to a fresh [`UploadDir`] the caller has to remove.
pub async fn collect(
    id: u64,
    mut request: Request,
    accept_uploads: bool,
) -> Result<(RequestInput, Option<UploadDir>), RequestError> {
    let headers = request.headers().clone();
    let query = match request.uri().query() {
        Some(query) => serde_urlencoded::from_str(query).map_err(RequestError::Query)?,
        None => Vec::new(),
    };
    // Routes without parameters have nothing to extract.
    let params = request
        .extract_parts::<Path<Vec<(String, String)>>>()
        .await
        .map(|Path(params)| params)
        .unwrap_or_default();

    let mut input = RequestInput {
        headers,
        query,
        params,
        body: Value::Null,
        files: Vec::new(),
    };

    let kind = BodyKind::of(&input.headers);
    let uploads = match kind {
        BodyKind::Multipart if accept_uploads => {
            let multipart = Multipart::from_request(request, &())
                .await
                .map_err(|e| RequestError::Multipart(e.body_text()))?;
            let dir = UploadDir::create(id).await?;
            match read_multipart(multipart, &dir, &mut input).await {
                Ok(()) => Some(dir),
                Err(e) => {
                    dir.remove().await;
                    return Err(e);
                }
            }
        }
        BodyKind::Json | BodyKind::Form => {
            let bytes = Bytes::from_request(request, &())
                .await
                .map_err(|e| RequestError::Body {
                    status: e.status(),
                    message: e.body_text(),
                })?;
            input.body = parse_body(kind, &bytes)?;
            None
        }
        BodyKind::Multipart | BodyKind::Other => None,
    };

    log::trace!(
        id,
        query = input.query.len(),
        params = input.params.len(),
        files = input.files.len();
        "collected request input"
    );
    Ok((input, uploads))
}

/// Text parts become body fields, file parts are written to `dir`.
async fn read_multipart(
    mut multipart: Multipart,
    dir: &UploadDir,
    input: &mut RequestInput,
) -> Result<(), RequestError> {
    let mut fields = Map::new();
    let mut index = 0usize;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| RequestError::Multipart(e.body_text()))?
    {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match field.file_name().map(str::to_owned) {
            Some(file_name) => {
                let path = dir.path().join(format!("{index}-{}", safe_file_name(&file_name)));
                index += 1;
                let mut file = tokio::fs::File::create(&path).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| RequestError::Multipart(e.body_text()))?
                {
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                log::debug!(field = name.as_str(), path:debug = path; "stored upload");
                input.files.push(UploadedFile {
                    field: name,
                    file_name: Some(file_name),
                    path,
                });
            }
            None => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| RequestError::Multipart(e.body_text()))?;
                fields.insert(name, Value::String(text));
            }
        }
    }
    if !fields.is_empty() {
        input.body = Value::Object(fields);
    }
    Ok(())
}

/// Keeps only the last component of a client supplied file name.
fn safe_file_name(file_name: &str) -> String {
    FsPath::new(file_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| String::from("upload"))
}
