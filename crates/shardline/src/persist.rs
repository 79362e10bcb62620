//! JSON file persistence for small metadata documents.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ShardError, ShardResult};

/// Write `value` as pretty JSON, replacing the file atomically.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> ShardResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| ShardError::Storage(format!("create {}: {err}", parent.display())))?;
    }
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| ShardError::Storage(format!("serialize {}: {err}", path.display())))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)
        .map_err(|err| ShardError::Storage(format!("write {}: {err}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|err| ShardError::Storage(format!("rename {}: {err}", path.display())))?;
    Ok(())
}

/// Read a JSON file, returning `None` when it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> ShardResult<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ShardError::Storage(format!("read {}: {err}", path.display())));
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|err| ShardError::Storage(format!("decode {}: {err}", path.display())))
}
