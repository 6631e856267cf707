//! The artifact store: one flat directory holding every downloaded file.
//!
//! Stored names follow `{id}_{sanitized title}.{ext}`. The extension is chosen
//! by the extraction engine, so after a download the file is found again by
//! its id prefix rather than by an exact name.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    ident::{self, ArtifactId},
};

/// Placeholder the engine replaces with the container extension it produced.
pub const EXT_PLACEHOLDER: &str = "%(ext)s";

const MAX_ID_ATTEMPTS: usize = 16;

/// A completed download sitting in the store.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: String,
    pub raw_title: String,
    pub sanitized_title: String,
    pub stored_name: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Output location handed to the engine for one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTemplate {
    pub template: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Creates the directory if needed. The root is canonicalized so that
    /// confinement checks compare like with like.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        tokio::fs::create_dir_all(root.as_ref()).await?;
        let root = tokio::fs::canonicalize(root.as_ref()).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocates an id no current entry already uses as its prefix.
    pub async fn allocate_id(&self) -> Result<ArtifactId> {
        self.allocate_id_from(ident::allocate).await
    }

    async fn allocate_id_from(&self, mut draw: impl FnMut() -> ArtifactId) -> Result<ArtifactId> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = draw();
            if self.entries_with_prefix(&id).await?.is_empty() {
                return Ok(id);
            }
            debug!("Id {id} already present in store, drawing another");
        }
        Err(Error::IdExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    pub fn output_template(
        &self,
        id: &ArtifactId,
        sanitized_title: &str,
        requested_extension: &str,
    ) -> OutputTemplate {
        let stem = format!("{}{}", id.prefix(), sanitized_title.replace('%', "%%"));
        let template = self
            .root
            .join(format!("{stem}.{EXT_PLACEHOLDER}"))
            .to_string_lossy()
            .into_owned();

        OutputTemplate {
            template,
            display_name: format!("{sanitized_title}.{requested_extension}"),
        }
    }

    /// Finds the file the engine produced for `id`.
    ///
    /// Zero matches is a [`Error::PostProcessingFailure`]. Several matches are
    /// tolerated: the lexicographically smallest name wins.
    pub async fn resolve_by_id_prefix(&self, id: &ArtifactId) -> Result<PathBuf> {
        let matches = self.entries_with_prefix(id).await?;

        match matches.as_slice() {
            [] => {
                let listing = self.list_names().await.unwrap_or_default();
                warn!(
                    "No output for artifact {id} in {:?}. Store contents: {:?}",
                    self.root, listing
                );
                Err(Error::PostProcessingFailure { id: id.to_string() })
            }
            [only] => Ok(only.clone()),
            [first, ..] => {
                warn!(
                    "Artifact {id} produced {} files, serving {:?}",
                    matches.len(),
                    first
                );
                Ok(first.clone())
            }
        }
    }

    /// Directory-confined lookup of a client-supplied stored name.
    pub async fn resolve_by_stored_name(&self, name: &str) -> Result<PathBuf> {
        if !is_plain_file_name(name) {
            warn!("Rejected stored name {:?}", name);
            return Err(Error::Rejected(name.to_string()));
        }

        let candidate = self.root.join(name);
        let metadata = match tokio::fs::metadata(&candidate).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => return Err(Error::NotFound),
            Err(error) => return Err(Error::Io(error)),
        };
        if !metadata.is_file() {
            return Err(Error::NotFound);
        }

        let canonical = match tokio::fs::canonicalize(&candidate).await {
            Ok(path) => path,
            Err(error) if error.kind() == ErrorKind::NotFound => return Err(Error::NotFound),
            Err(error) => return Err(Error::Io(error)),
        };
        if canonical.parent() != Some(self.root.as_path()) {
            warn!(
                "Blocked {:?}: resolves outside the store to {:?}",
                name, canonical
            );
            return Err(Error::Rejected(name.to_string()));
        }

        Ok(canonical)
    }

    /// Deletes every entry belonging to `id`. Used when a download fails
    /// part-way and may have left fragments behind.
    pub async fn discard(&self, id: &ArtifactId) {
        let entries = match self.entries_with_prefix(id).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!("Could not list fragments of artifact {id}: {error}");
                return;
            }
        };

        for path in entries {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Discarded fragment {:?}", path),
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("Could not discard fragment {:?}: {error}", path),
            }
        }
    }

    /// Deletes every entry of `id` except `keep`. Used once the served file
    /// is chosen, so leftovers do not outlive its retention window.
    pub async fn discard_extras(&self, id: &ArtifactId, keep: &Path) -> Vec<PathBuf> {
        let entries = match self.entries_with_prefix(id).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!("Could not list extra outputs of artifact {id}: {error}");
                return Vec::new();
            }
        };

        let mut removed = Vec::new();
        for path in entries.into_iter().filter(|path| path != keep) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Discarded extra output {:?}", path);
                    removed.push(path);
                }
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!("Could not discard extra output {:?}: {error}", path),
            }
        }
        removed
    }

    /// Snapshot of the file names currently in the store.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut names = Vec::new();

        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!("Stopped listing {:?} early: {error}", self.root);
                    break;
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn entries_with_prefix(&self, id: &ArtifactId) -> Result<Vec<PathBuf>> {
        let prefix = id.prefix();
        let mut matches = Vec::new();

        for name in self.list_names().await? {
            if !name.starts_with(&prefix) {
                continue;
            }
            let path = self.root.join(&name);
            // Entries may vanish between the listing and this check.
            match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => matches.push(path),
                Ok(_) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(Error::Io(error)),
            }
        }

        Ok(matches)
    }
}

/// A single, non-special path component with no separators.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && Path::new(name).components().count() == 1
}
