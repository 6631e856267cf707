use std::{collections::HashSet, path::PathBuf, sync::Arc};

use axum::http::{HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::{sync::Semaphore, time::Duration};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_RETENTION_SECONDS: u64 = 5 * 60;
pub const DEFAULT_SWEEP_MAX_AGE_SECONDS: u64 = 30 * 60;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 15 * 60;
pub const STORE_DIR_NAME: &str = "MediaVault_Temp";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub store_dir: PathBuf,
    pub retention: Duration,
    pub sweep_max_age: Duration,
    pub max_concurrent_downloads: usize,
    pub yt_dlp_bin: PathBuf,
    pub yt_dlp_timeout: Duration,
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            store_dir: std::env::temp_dir().join(STORE_DIR_NAME),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECONDS),
            sweep_max_age: Duration::from_secs(DEFAULT_SWEEP_MAX_AGE_SECONDS),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            yt_dlp_bin: PathBuf::from("yt-dlp"),
            yt_dlp_timeout: Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            bind_addr: resolve_bind_addr().unwrap_or(defaults.bind_addr),
            store_dir: std::env::var("MEDIAVAULT_DIR")
                .ok()
                .and_then(|value| non_empty(&value).map(PathBuf::from))
                .unwrap_or(defaults.store_dir),
            retention: read_u64_env("RETENTION_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            sweep_max_age: read_u64_env("SWEEP_MAX_AGE_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_max_age),
            max_concurrent_downloads: download_slots(
                read_u64_env("MAX_CONCURRENT_DOWNLOADS"),
                defaults.max_concurrent_downloads,
            ),
            yt_dlp_bin: std::env::var("YT_DLP_BIN")
                .ok()
                .and_then(|value| non_empty(&value).map(PathBuf::from))
                .unwrap_or(defaults.yt_dlp_bin),
            yt_dlp_timeout: read_u64_env("YT_DLP_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.yt_dlp_timeout),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };

        config.normalized()
    }

    /// The sweep is the last-resort net. A file's age counts from when the
    /// engine starts writing it, while its timer only starts once the download
    /// finishes, so the sweep must wait out both before it may touch a file.
    pub fn normalized(mut self) -> Self {
        let floor = self.retention.saturating_add(self.yt_dlp_timeout);
        if self.sweep_max_age < floor {
            warn!(
                "SWEEP_MAX_AGE_SECONDS={} is below retention plus engine timeout, raising it to {}",
                self.sweep_max_age.as_secs(),
                floor.as_secs()
            );
            self.sweep_max_age = floor;
        }
        self
    }
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// Zero falls back to the default; anything a semaphore cannot hold is clamped.
fn download_slots(configured: Option<u64>, default: usize) -> usize {
    configured
        .filter(|value| *value > 0)
        .map(|value| usize::try_from(value).unwrap_or(usize::MAX))
        .unwrap_or(default)
        .min(Semaphore::MAX_PERMITS)
}

fn resolve_bind_addr() -> Option<String> {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return Some(configured);
    }

    std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .map(|port| format!("0.0.0.0:{port}"))
}

pub fn build_cors_layer(configured: &[String]) -> Result<CorsLayer> {
    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to local development origins.");
        vec![
            "http://127.0.0.1:5000".to_string(),
            "http://localhost:5000".to_string(),
        ]
    } else {
        configured.to_vec()
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Expected values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_threshold_covers_download_time_plus_retention() {
        let config = Config {
            retention: Duration::from_secs(300),
            sweep_max_age: Duration::from_secs(60),
            yt_dlp_timeout: Duration::from_secs(900),
            ..Config::default()
        }
        .normalized();
        assert_eq!(config.sweep_max_age, Duration::from_secs(1200));

        let config = Config {
            retention: Duration::MAX,
            ..Config::default()
        }
        .normalized();
        assert_eq!(config.sweep_max_age, Duration::MAX);

        let config = Config::default().normalized();
        assert_eq!(
            config.sweep_max_age,
            Duration::from_secs(DEFAULT_SWEEP_MAX_AGE_SECONDS)
        );
    }

    #[tokio::test]
    async fn file_inside_retention_survives_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::ArtifactStore::open(dir.path()).await.unwrap();
        std::fs::write(store.root().join("ab12cd34_clip.mp4"), b"data").unwrap();
        let config = Config {
            retention: Duration::from_secs(300),
            sweep_max_age: Duration::from_secs(60),
            yt_dlp_timeout: Duration::from_secs(900),
            ..Config::default()
        }
        .normalized();

        // Written for the full engine timeout, then 100s into its retention.
        let now = chrono::Utc::now() + chrono::Duration::seconds(1000);
        let report = crate::expiry::sweep_stale_at(&store, config.sweep_max_age, now).await;
        assert!(report.removed.is_empty());
        assert_eq!(report.kept, 1);
    }

    #[test]
    fn download_slots_are_clamped_to_semaphore_capacity() {
        assert_eq!(download_slots(None, 3), 3);
        assert_eq!(download_slots(Some(0), 3), 3);
        assert_eq!(download_slots(Some(8), 3), 8);
        assert_eq!(download_slots(Some(u64::MAX), 3), Semaphore::MAX_PERMITS);

        let semaphore = Semaphore::new(download_slots(Some(u64::MAX), 3));
        assert_eq!(semaphore.available_permits(), Semaphore::MAX_PERMITS);
    }

    #[test]
    fn default_store_lives_in_temp_dir() {
        let config = Config::default();
        assert!(config.store_dir.starts_with(std::env::temp_dir()));
        assert!(config.store_dir.ends_with(STORE_DIR_NAME));
    }

    #[test]
    fn origins_are_normalized() {
        assert_eq!(
            normalize_origin("HTTPS://Example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5000").as_deref(),
            Some("http://localhost:5000")
        );
        assert_eq!(normalize_origin("http://example.com/path"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
    }

    #[test]
    fn invalid_origin_fails_cors_setup() {
        assert!(build_cors_layer(&["not a url".to_string()]).is_err());
        assert!(build_cors_layer(&[]).is_ok());
    }
}
