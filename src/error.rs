//! Error taxonomy shared by the store, the engine adapter and the HTTP layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed request input. No engine call is made.
    #[error("{0}")]
    InvalidInput(String),

    /// The extraction engine could not probe or fetch the media.
    #[error("{0}")]
    ExtractionFailure(String),

    /// The engine exited cleanly but left no file behind for the artifact id.
    #[error("Download failed - file not created")]
    PostProcessingFailure { id: String },

    /// Every id drawn for a new artifact was already taken in the store.
    #[error("could not allocate an unused artifact id after {attempts} attempts")]
    IdExhausted { attempts: usize },

    #[error("File not found")]
    NotFound,

    /// A client-supplied name failed the store confinement check.
    #[error("rejected file name {0:?}")]
    Rejected(String),

    /// Deferred or sweep deletion failed. Only ever logged.
    #[error("could not remove {path}: {source}")]
    CleanupFailure {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the two variants a client must not be able to tell apart.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound | Error::Rejected(_))
    }
}
