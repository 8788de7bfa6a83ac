//! Split Catalog - Checksummed snapshot and diff files
//!
//! File format:
//! ```text
//! +----------------+-------------------+-----------+
//! | Header (19B)   | Payload           | crc32 (4B)|
//! +----------------+-------------------+-----------+
//!
//! Header:
//! - magic: 4 bytes "SPLT"
//! - format version: 2 bytes
//! - kind: 1 byte (SNAPSHOT=1, DIFF=2)
//! - metadata version: 8 bytes
//! - payload_len: 4 bytes
//!
//! Payload: binary split metadata (store or replicated diff)
//! crc32: over header and payload
//! ```
//!
//! Files are written to a sibling temp file and renamed into place, so a
//! reader sees either the old file or the complete new one.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, error};

use super::codec::Writeable;
use super::replication::{ReplicatedDiff, VersionedSnapshot};
use super::store::SplitMetadataStore;
use crate::{Result, SplitError};

/// Catalog magic bytes
const CATALOG_MAGIC: &[u8; 4] = b"SPLT";
/// Catalog format version
const CATALOG_VERSION: u16 = 1;
/// Header size
const HEADER_SIZE: usize = 19;
/// Trailing checksum size
const CRC_SIZE: usize = 4;

/// What a catalog file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CatalogKind {
    Snapshot = 1,
    Diff = 2,
}

impl TryFrom<u8> for CatalogKind {
    type Error = SplitError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CatalogKind::Snapshot),
            2 => Ok(CatalogKind::Diff),
            _ => Err(SplitError::Decode(format!("invalid catalog kind {}", value))),
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Persist a full snapshot
pub fn save_snapshot(path: &Path, snapshot: &VersionedSnapshot) -> Result<()> {
    let payload = snapshot.store().to_bytes()?;
    write_framed(path, CatalogKind::Snapshot, snapshot.version(), &payload)
}

/// Load a snapshot written by `save_snapshot`
pub fn load_snapshot(path: &Path) -> Result<VersionedSnapshot> {
    let (version, payload) = read_framed(path, CatalogKind::Snapshot)?;
    let store = SplitMetadataStore::from_bytes(&payload)?;
    Ok(VersionedSnapshot::new(version, store))
}

/// Persist a replicated diff
pub fn save_diff(path: &Path, diff: &ReplicatedDiff) -> Result<()> {
    let payload = diff.to_bytes()?;
    write_framed(path, CatalogKind::Diff, diff.to_version, &payload)
}

/// Load a diff written by `save_diff`
pub fn load_diff(path: &Path) -> Result<ReplicatedDiff> {
    let (version, payload) = read_framed(path, CatalogKind::Diff)?;
    let diff = ReplicatedDiff::from_bytes(&payload)?;
    if diff.to_version != version {
        return Err(SplitError::Decode(format!(
            "diff file header says version {} but payload targets {}",
            version, diff.to_version
        )));
    }
    Ok(diff)
}

// ============================================================================
// Framing
// ============================================================================

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_framed(path: &Path, kind: CatalogKind, version: u64, payload: &[u8]) -> Result<()> {
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| SplitError::Decode(format!("payload of {} bytes too large", payload.len())))?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.put_slice(CATALOG_MAGIC);
    buf.put_u16_le(CATALOG_VERSION);
    buf.put_u8(kind as u8);
    buf.put_u64_le(version);
    buf.put_u32_le(payload_len);
    buf.put_slice(payload);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);

    let tmp = temp_path(path);
    if let Err(e) = write_file(&tmp, &buf) {
        error!("Failed to write split catalog {:?}: {}", tmp, e);
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    debug!(
        "Wrote split catalog {:?} ({:?}, version {}, {} bytes)",
        path,
        kind,
        version,
        buf.len()
    );
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn read_framed(path: &Path, expected: CatalogKind) -> Result<(u64, Vec<u8>)> {
    let bytes = fs::read(path)?;
    if bytes.len() < HEADER_SIZE + CRC_SIZE {
        return Err(SplitError::Decode(format!(
            "catalog file {:?} is truncated ({} bytes)",
            path,
            bytes.len()
        )));
    }

    let mut header = &bytes[..HEADER_SIZE];
    let mut magic = [0u8; 4];
    header.copy_to_slice(&mut magic);
    if &magic != CATALOG_MAGIC {
        return Err(SplitError::Decode(format!("{:?} is not a split catalog file", path)));
    }
    let format = header.get_u16_le();
    if format != CATALOG_VERSION {
        return Err(SplitError::Decode(format!(
            "unsupported catalog format version {}",
            format
        )));
    }
    let kind = CatalogKind::try_from(header.get_u8())?;
    let version = header.get_u64_le();
    let payload_len = header.get_u32_le() as usize;

    let body_end = HEADER_SIZE + payload_len;
    if bytes.len() != body_end + CRC_SIZE {
        return Err(SplitError::Decode(format!(
            "catalog file {:?} length {} does not match payload length {}",
            path,
            bytes.len(),
            payload_len
        )));
    }
    let mut trailer = &bytes[body_end..];
    let stored_crc = trailer.get_u32_le();
    if crc32fast::hash(&bytes[..body_end]) != stored_crc {
        error!("Checksum mismatch in split catalog {:?}", path);
        return Err(SplitError::ChecksumMismatch);
    }
    if kind != expected {
        return Err(SplitError::Decode(format!(
            "catalog file {:?} holds a {:?}, expected a {:?}",
            path, kind, expected
        )));
    }

    Ok((version, bytes[HEADER_SIZE..body_end].to_vec()))
}
