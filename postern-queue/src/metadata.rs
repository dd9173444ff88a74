//! Queue-level files: the storage format marker and the channel snapshot.

use std::path::Path;

use postern_common::internal;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    error::PersistError,
    journal::{replace_atomically, write_synced},
};

pub const FORMAT_FILE: &str = "FORMAT";
pub const FORMAT_VERSION: &str = "postern-queue 1";
pub const METADATA_FILE: &str = "metadata.bin";

/// Snapshot of which channels exist and how far their journals reach.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub channels: Vec<ChannelMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub topic: String,
    pub name: String,
    /// Messages not yet terminal when the snapshot was taken.
    pub depth: u64,
    pub dead_letters: u64,
    /// Records in the journal when the snapshot was taken.
    pub journal_records: u64,
}

/// Check the format marker of `root`, creating the directory and marker when
/// allowed.
///
/// # Errors
/// [`PersistError::SchemaMissing`] when absent and `auto_create` is false,
/// [`PersistError::SchemaMismatch`] when written by something else
pub async fn ensure_format(root: &Path, auto_create: bool) -> Result<(), PersistError> {
    let marker = root.join(FORMAT_FILE);

    match fs::read_to_string(&marker).await {
        Ok(found) => {
            let found = found.trim();
            if found == FORMAT_VERSION {
                Ok(())
            } else {
                Err(PersistError::SchemaMismatch {
                    found: found.to_string(),
                    expected: FORMAT_VERSION.to_string(),
                })
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if !auto_create {
                return Err(PersistError::SchemaMissing(root.to_path_buf()));
            }

            fs::create_dir_all(root)
                .await
                .map_err(PersistError::io(root))?;
            write_synced(&marker, format!("{FORMAT_VERSION}\n").as_bytes()).await?;
            internal!(level = INFO, "Initialised queue storage at {}", root.display());
            Ok(())
        }
        Err(source) => Err(PersistError::Io {
            path: marker,
            source,
        }),
    }
}

/// # Errors
/// If the snapshot exists but cannot be read or decoded
pub async fn load(root: &Path) -> Result<Option<Metadata>, PersistError> {
    let path = root.join(METADATA_FILE);

    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(PersistError::Io { path, source }),
    };

    let (metadata, _) =
        bincode::serde::decode_from_slice::<Metadata, _>(&bytes, bincode::config::standard())?;
    Ok(Some(metadata))
}

/// Atomically replace the snapshot.
///
/// # Errors
/// If the snapshot cannot be written and synced
pub async fn store(root: &Path, metadata: &Metadata) -> Result<(), PersistError> {
    let bytes = bincode::serde::encode_to_vec(metadata, bincode::config::standard())?;
    replace_atomically(&root.join(METADATA_FILE), &bytes).await
}
