//! Serialized metadata files (`catalog.db`, `statistics.db`) and the
//! commit-record envelope that keeps them recoverable between
//! checkpoints.
//!
//! File framing: an 8-byte magic, the CRC32 of the JSON body, its
//! length, then the body. A CRC mismatch marks the database corrupt.

use std::convert::TryInto;
use std::fs;
use std::path::Path;

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::catalog::CatalogData;
use crate::error::{QuiverError, Result};
use crate::statistics::StatisticsData;

const META_MAGIC: &[u8; 8] = b"QVRMETA\0";
const HEADER_LEN: usize = 16;

/// Catalog plus statistics, as carried by a commit's catalog record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaEnvelope {
    pub catalog: CatalogData,
    pub statistics: StatisticsData,
}

impl MetaEnvelope {
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| QuiverError::Internal(format!("cannot serialize metadata: {err}")))
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob)
            .map_err(|err| QuiverError::Corruption(format!("bad metadata record: {err}")))
    }
}

pub fn write_meta_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec(value)
        .map_err(|err| QuiverError::Internal(format!("cannot serialize {}: {err}", path.display())))?;
    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(META_MAGIC);
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &out)?;
    fs::rename(&tmp, path)?;
    let file = fs::File::open(path)?;
    file.sync_all()?;
    Ok(())
}

/// Reads a metadata file; `None` when it does not exist yet.
pub fn read_meta_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if bytes.len() < HEADER_LEN || &bytes[..8] != META_MAGIC {
        return Err(QuiverError::Corruption(format!(
            "{} has an invalid header",
            path.display()
        )));
    }
    let stored_crc = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes"));
    let len = u32::from_le_bytes(bytes[12..16].try_into().expect("4 bytes")) as usize;
    let body = bytes.get(HEADER_LEN..HEADER_LEN + len).ok_or_else(|| {
        QuiverError::Corruption(format!("{} is truncated", path.display()))
    })?;
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(QuiverError::Corruption(format!(
            "{} failed its checksum",
            path.display()
        )));
    }
    let value = serde_json::from_slice(body)
        .map_err(|err| QuiverError::Corruption(format!("{}: {err}", path.display())))?;
    Ok(Some(value))
}
