//! Checkpoint module for resumable model pools.
//!
//! Provides:
//! - `CheckpointStore`: per-split model checkpoints keyed by split index
//! - Atomic JSON persistence shared with the signal cache

mod store;

pub use store::*;

use crate::models::{AuditError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Write `value` as JSON to a temp file next to `path`, then rename over it.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AuditError::io("creating output dir", e))?;
    }

    let temp_path = path.with_extension("tmp.json");
    {
        let file =
            File::create(&temp_path).map_err(|e| AuditError::io("creating temp file", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)
            .map_err(|e| AuditError::Internal(format!("Serializing {}: {e}", path.display())))?;
        writer
            .flush()
            .map_err(|e| AuditError::io("flushing temp file", e))?;
    }

    fs::rename(&temp_path, path).map_err(|e| AuditError::io("renaming temp file", e))?;
    Ok(())
}

/// Read a JSON file written by [`write_json_atomic`].
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let file = File::open(path).map_err(|e| AuditError::io(format!("opening {what}"), e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| AuditError::ParseError(format!("Invalid {what} {}: {e}", path.display())))
}

/// Short SHA-256 digest of a value's JSON encoding.
pub(crate) fn digest_json<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| AuditError::Internal(format!("Serializing for digest: {e}")))?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..16]))
}
