//! Maps a client-supplied stored name back to a file and a save-as name.

use std::path::PathBuf;

use crate::{
    error::{Error, Result},
    store::ArtifactStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub display_name: String,
}

/// Resolves `encoded_name`, still percent-encoded as it appeared in the
/// request path, to a file inside the store.
pub async fn resolve(store: &ArtifactStore, encoded_name: &str) -> Result<ResolvedFile> {
    let name = urlencoding::decode(encoded_name)
        .map_err(|_| Error::Rejected(encoded_name.to_string()))?;
    let path = store.resolve_by_stored_name(&name).await?;

    Ok(ResolvedFile {
        path,
        display_name: display_name(&name).to_string(),
    })
}

/// Drops the `{id}_` prefix. Names without a separator come back unchanged.
pub fn display_name(stored_name: &str) -> &str {
    match stored_name.split_once('_') {
        Some((_, rest)) => rest,
        None => stored_name,
    }
}
