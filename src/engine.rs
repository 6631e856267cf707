//! The extraction engine seam and its yt-dlp process adapter.
//!
//! Contract with any engine: `materialize` writes exactly one file whose name
//! is the output template with `%(ext)s` replaced by the container extension
//! it produced. The store finds that file again by its id prefix.

use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaInfo {
    pub title: Option<String>,
    #[serde(default)]
    pub formats: Vec<StreamDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDescriptor {
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub ext: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatSelection {
    Audio,
    Video { max_height: u32 },
}

impl FormatSelection {
    pub fn requested_extension(&self) -> &'static str {
        match self {
            FormatSelection::Audio => "mp3",
            FormatSelection::Video { .. } => "mp4",
        }
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Reads title and stream list without downloading anything.
    async fn probe(&self, url: &str) -> Result<MediaInfo>;

    /// Downloads `url` to `output_template`.
    async fn materialize(
        &self,
        url: &str,
        selection: FormatSelection,
        output_template: &str,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output> {
        debug!("Running {:?} {:?}", self.binary, args);
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| {
                Error::ExtractionFailure(format!(
                    "yt-dlp did not finish within {} seconds",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    Error::ExtractionFailure(format!(
                        "{} is not installed or not on PATH",
                        self.binary.display()
                    ))
                } else {
                    Error::ExtractionFailure(format!("Could not run yt-dlp: {error}"))
                }
            })?;

        if !output.status.success() {
            return Err(Error::ExtractionFailure(run_error_message(&output.stderr)));
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaEngine for YtDlp {
    async fn probe(&self, url: &str) -> Result<MediaInfo> {
        let output = self.run(probe_args(url)).await?;
        serde_json::from_slice(&output.stdout).map_err(|error| {
            Error::ExtractionFailure(format!("Unreadable metadata from yt-dlp: {error}"))
        })
    }

    async fn materialize(
        &self,
        url: &str,
        selection: FormatSelection,
        output_template: &str,
    ) -> Result<()> {
        self.run(materialize_args(url, selection, output_template))
            .await
            .map(|_| ())
    }
}

fn probe_args(url: &str) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--".to_string(),
        url.to_string(),
    ]
}

fn materialize_args(url: &str, selection: FormatSelection, output_template: &str) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--no-mtime".to_string(),
        "-o".to_string(),
        output_template.to_string(),
    ];

    match selection {
        FormatSelection::Audio => {
            args.extend(
                [
                    "-f",
                    "bestaudio/best",
                    "-x",
                    "--audio-format",
                    "mp3",
                    "--audio-quality",
                    "192K",
                ]
                .map(String::from),
            );
        }
        FormatSelection::Video { max_height } => {
            args.push("-f".to_string());
            args.push(format!(
                "bestvideo[height<={max_height}][ext=mp4]+bestaudio[ext=m4a]/best[height<={max_height}][ext=mp4]/best[height<={max_height}]/best"
            ));
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }
    }

    args.push("--".to_string());
    args.push(url.to_string());
    args
}

fn run_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}
