use std::{collections::HashSet, path::Path, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{RawPathParams, State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, time::Duration};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    config::{Config, non_empty},
    engine::{FormatSelection, MediaEngine, MediaInfo},
    error::Error,
    expiry::{self, ExpiryScheduler},
    retrieval,
    sanitize::{FALLBACK_TITLE, sanitize_title},
    store::{Artifact, ArtifactStore},
};

const MAX_FORMAT_OPTIONS: usize = 6;
const LISTED_CONTAINER: &str = "mp4";
const DEFAULT_QUALITY: u32 = 1080;

#[derive(Clone)]
pub struct AppState {
    pub store: ArtifactStore,
    pub engine: Arc<dyn MediaEngine>,
    pub scheduler: ExpiryScheduler,
    pub download_semaphore: Arc<Semaphore>,
    pub retention: Duration,
    pub sweep_max_age: Duration,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: ArtifactStore,
        engine: Arc<dyn MediaEngine>,
        scheduler: ExpiryScheduler,
    ) -> Self {
        Self {
            store,
            engine,
            scheduler,
            download_semaphore: Arc::new(Semaphore::new(
                config.max_concurrent_downloads.min(Semaphore::MAX_PERMITS),
            )),
            retention: config.retention,
            sweep_max_age: config.sweep_max_age,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FormatsRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
struct FormatsResponse {
    formats: Vec<FormatOption>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct FormatOption {
    height: u32,
    width: Option<u32>,
    resolution: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QualityField {
    Text(String),
    Number(u64),
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: String,
    format: Option<String>,
    quality: Option<QualityField>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    filename: String,
    filepath: String,
    title: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: Error::NotFound.to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        match error {
            Error::InvalidInput(message) => Self::bad_request(message),
            Error::NotFound | Error::Rejected(_) => Self::not_found(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/get-formats", post(get_formats))
        .route("/download", post(download))
        .route("/get-file/{name}", get(get_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_formats(
    State(state): State<AppState>,
    payload: Result<Json<FormatsRequest>, JsonRejection>,
) -> Result<Json<FormatsResponse>, ApiError> {
    let Json(payload) = payload?;
    let url = validate_url(&payload.url)?;

    let info = state.engine.probe(url).await.map_err(|error| {
        warn!("Error getting formats for {:?}: {error}", url);
        ApiError::from(error)
    })?;

    Ok(Json(FormatsResponse {
        formats: build_format_options(&info),
    }))
}

async fn download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let Json(payload) = payload?;
    let url = validate_url(&payload.url)?;
    let selection = parse_selection(payload.format.as_deref(), payload.quality.as_ref())?;

    tokio::spawn({
        let store = state.store.clone();
        let max_age = state.sweep_max_age;
        async move {
            expiry::sweep_stale(&store, max_age).await;
        }
    });

    let info = state.engine.probe(url).await?;
    let raw_title = info.title.unwrap_or_else(|| FALLBACK_TITLE.to_string());
    let sanitized_title = sanitize_title(&raw_title);

    let _download_permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity."))?;

    let id = state.store.allocate_id().await?;
    let output = state.store.output_template(
        &id,
        &sanitized_title,
        selection.requested_extension(),
    );

    let produced = async {
        state
            .engine
            .materialize(url, selection, &output.template)
            .await?;
        state.store.resolve_by_id_prefix(&id).await
    }
    .await;

    let path = match produced {
        Ok(path) => path,
        Err(error) => {
            error!("Download of {:?} as {id} failed: {error}", url);
            state.store.discard(&id).await;
            return Err(error.into());
        }
    };

    let extras = state.store.discard_extras(&id, &path).await;
    if !extras.is_empty() {
        warn!("Artifact {id} left {} extra file(s), discarded", extras.len());
    }

    state
        .scheduler
        .schedule_deletion(path.clone(), state.retention);

    let stored_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .ok_or_else(|| ApiError::internal("Downloaded file has an unreadable name."))?;

    let artifact = Artifact {
        id: id.to_string(),
        raw_title,
        sanitized_title,
        stored_name,
        display_name: output.display_name,
        created_at: Utc::now(),
    };
    info!(
        id = %artifact.id,
        stored_name = %artifact.stored_name,
        raw_title = %artifact.raw_title,
        created_at = %artifact.created_at,
        "Downloaded: {}",
        artifact.display_name
    );

    Ok(Json(DownloadResponse {
        success: true,
        filename: artifact.display_name,
        filepath: artifact.stored_name,
        title: artifact.sanitized_title,
    }))
}

async fn get_file(
    State(state): State<AppState>,
    params: RawPathParams,
) -> Result<Response, ApiError> {
    let encoded_name = params
        .iter()
        .find(|(key, _)| *key == "name")
        .map(|(_, value)| value)
        .ok_or_else(ApiError::not_found)?;

    let resolved = retrieval::resolve(&state.store, encoded_name).await?;

    let file = match tokio::fs::File::open(&resolved.path).await {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found());
        }
        Err(error) => return Err(Error::Io(error).into()),
    };
    let metadata = file.metadata().await.map_err(Error::Io)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&resolved.display_name)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the content length."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&resolved.display_name))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn validate_url(input: &str) -> Result<&str, Error> {
    let url = non_empty(input).ok_or_else(|| Error::InvalidInput("No URL provided".to_string()))?;
    let valid = Url::parse(url)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some())
        .unwrap_or(false);
    if !valid {
        return Err(Error::InvalidInput(format!("Not a valid http(s) URL: {url}")));
    }
    Ok(url)
}

fn parse_selection(
    format: Option<&str>,
    quality: Option<&QualityField>,
) -> Result<FormatSelection, Error> {
    match format.and_then(non_empty).unwrap_or("mp4") {
        "mp3" => Ok(FormatSelection::Audio),
        "mp4" => {
            let max_height = match quality {
                None => DEFAULT_QUALITY,
                Some(QualityField::Number(value)) => u32::try_from(*value).unwrap_or(0),
                Some(QualityField::Text(value)) => match non_empty(value) {
                    None => DEFAULT_QUALITY,
                    Some(text) => text.parse::<u32>().unwrap_or(0),
                },
            };
            if max_height == 0 {
                return Err(Error::InvalidInput(
                    "Quality must be a positive pixel height".to_string(),
                ));
            }
            Ok(FormatSelection::Video { max_height })
        }
        other => Err(Error::InvalidInput(format!(
            "Unsupported format {other:?}, expected mp3 or mp4"
        ))),
    }
}

fn build_format_options(info: &MediaInfo) -> Vec<FormatOption> {
    let mut seen_heights = HashSet::new();
    let mut options: Vec<FormatOption> = info
        .formats
        .iter()
        .filter(|format| format.ext.as_deref().unwrap_or(LISTED_CONTAINER) == LISTED_CONTAINER)
        .filter_map(|format| {
            let height = format.height.filter(|height| *height > 0)?;
            seen_heights.insert(height).then(|| FormatOption {
                height,
                width: format.width,
                resolution: format!("{height}p"),
            })
        })
        .collect();

    options.sort_by(|a, b| b.height.cmp(&a.height));
    options.truncate(MAX_FORMAT_OPTIONS);
    options
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_fallback_filename(filename),
        urlencoding::encode(filename)
    )
}

fn ascii_fallback_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StreamDescriptor;

    fn stream(height: Option<u32>, width: Option<u32>, ext: &str) -> StreamDescriptor {
        StreamDescriptor {
            height,
            width,
            ext: Some(ext.to_string()),
        }
    }

    #[test]
    fn format_options_are_mp4_deduplicated_sorted_and_capped() {
        let info = MediaInfo {
            title: Some("t".to_string()),
            formats: vec![
                stream(Some(144), Some(256), "mp4"),
                stream(Some(1080), Some(1920), "webm"),
                stream(Some(360), Some(640), "mp4"),
                stream(Some(360), Some(480), "mp4"),
                stream(None, None, "mp4"),
                stream(Some(720), None, "mp4"),
                stream(Some(2160), Some(3840), "mp4"),
                stream(Some(1440), Some(2560), "mp4"),
                stream(Some(1080), Some(1920), "mp4"),
                stream(Some(240), Some(426), "mp4"),
            ],
        };

        let options = build_format_options(&info);
        let heights: Vec<u32> = options.iter().map(|option| option.height).collect();
        assert_eq!(heights, vec![2160, 1440, 1080, 720, 360, 240]);
        assert_eq!(options[3].width, None);
        assert_eq!(options[4].width, Some(640));
        assert_eq!(options[0].resolution, "2160p");
    }

    #[test]
    fn selection_defaults_to_1080p_mp4() {
        assert_eq!(
            parse_selection(None, None).unwrap(),
            FormatSelection::Video { max_height: 1080 }
        );
        assert_eq!(
            parse_selection(Some("mp4"), Some(&QualityField::Text("720".into()))).unwrap(),
            FormatSelection::Video { max_height: 720 }
        );
        assert_eq!(
            parse_selection(Some("mp4"), Some(&QualityField::Number(480))).unwrap(),
            FormatSelection::Video { max_height: 480 }
        );
        assert_eq!(
            parse_selection(Some("mp3"), Some(&QualityField::Text("junk".into()))).unwrap(),
            FormatSelection::Audio
        );
    }

    #[test]
    fn bad_selection_is_invalid_input() {
        for (format, quality) in [
            (Some("mp4"), Some(QualityField::Text("tall".into()))),
            (Some("mp4"), Some(QualityField::Number(0))),
            (Some("avi"), None),
        ] {
            assert!(matches!(
                parse_selection(format, quality.as_ref()),
                Err(Error::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn url_validation() {
        assert!(validate_url("  https://www.youtube.com/watch?v=x ").is_ok());
        assert!(matches!(validate_url("   "), Err(Error::InvalidInput(_))));
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("--exec rm").is_err());
    }

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (Error::ExtractionFailure("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                Error::PostProcessingFailure { id: "x".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (Error::NotFound, StatusCode::NOT_FOUND),
            (Error::Rejected("../x".into()), StatusCode::NOT_FOUND),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status, status);
        }
    }

    #[test]
    fn rejected_and_missing_share_a_message() {
        let rejected = ApiError::from(Error::Rejected("../../etc/passwd".into()));
        let missing = ApiError::from(Error::NotFound);
        assert_eq!(rejected.message, missing.message);
        assert!(!rejected.message.contains("passwd"));
    }

    #[test]
    fn content_disposition_carries_ascii_and_utf8_names() {
        assert_eq!(
            build_content_disposition("Café Song.mp3"),
            "attachment; filename=\"Caf_ Song.mp3\"; filename*=UTF-8''Caf%C3%A9%20Song.mp3"
        );
        assert_eq!(content_type_for_filename("a.MP3"), "audio/mpeg");
        assert_eq!(content_type_for_filename("a"), "application/octet-stream");
    }
}
