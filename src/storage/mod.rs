//! On-disk store layout
//!
//! A package store is a directory holding an append-only frame log
//! (`store.loupe`) plus a `blobs/` subdirectory for file-backed payloads. An
//! archive is a single sealed file: the same frames, fully compacted, with
//! every blob payload embedded and a CRC over the data section.

mod format;
mod reader;
mod writer;

pub use format::{
    FileHeader, FrameKind, FILE_MAGIC, FILE_VERSION, FLAG_ARCHIVE, FLAG_COMPRESSED_BLOBS,
    FRAME_HEADER_SIZE, FRAME_LEN_MAX, HEADER_SIZE,
};
pub use reader::{ArchiveFrames, ArchiveReader, Frame, LogReader, ReplayedLog};
pub use writer::LogWriter;

use bytes::Bytes;

use crate::blob::BlobRecord;
use crate::{LoupeError, Result};

/// File name of the frame log inside a package directory
pub const LOG_FILENAME: &str = "store.loupe";

/// Subdirectory of a package holding file-backed blobs
pub const BLOBS_DIRNAME: &str = "blobs";

/// Validate file magic, version, and header CRC
///
/// # Errors
///
/// Returns error if magic, version, or CRC is invalid
pub fn validate_header(header: &FileHeader) -> Result<()> {
    if header.magic != FILE_MAGIC {
        return Err(LoupeError::InvalidFormat(format!(
            "invalid magic bytes: expected {:?}, got {:?}",
            FILE_MAGIC, header.magic
        )));
    }

    if header.version != FILE_VERSION {
        return Err(LoupeError::InvalidFormat(format!(
            "unsupported version: {}, expected {}",
            header.version, FILE_VERSION
        )));
    }

    let expected = header.compute_crc();
    if header.header_crc != expected {
        return Err(LoupeError::Corrupted {
            offset: 0,
            expected: header.header_crc,
            actual: expected,
        });
    }

    Ok(())
}

/// Encode a blob frame body: metadata document, optionally followed by the
/// raw stored payload.
///
/// # Errors
///
/// Returns error if the metadata cannot be serialized
pub(crate) fn encode_blob_frame(record: &BlobRecord, data: Option<&[u8]>) -> Result<Vec<u8>> {
    let meta = serde_json::to_vec(record)?;
    let mut body = Vec::with_capacity(4 + meta.len() + data.map_or(0, <[u8]>::len));
    body.extend_from_slice(&(meta.len() as u32).to_le_bytes());
    body.extend_from_slice(&meta);
    if let Some(data) = data {
        body.extend_from_slice(data);
    }
    Ok(body)
}

/// Decode a blob frame body back into metadata and optional payload bytes.
///
/// # Errors
///
/// Returns error if the body is truncated or the metadata malformed
pub(crate) fn decode_blob_frame(body: &[u8]) -> Result<(BlobRecord, Option<Bytes>)> {
    if body.len() < 4 {
        return Err(LoupeError::InvalidFormat(
            "blob frame too short".to_string(),
        ));
    }
    let meta_len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let meta_end = 4 + meta_len;
    if body.len() < meta_end {
        return Err(LoupeError::InvalidFormat(
            "blob frame metadata truncated".to_string(),
        ));
    }

    let record: BlobRecord = serde_json::from_slice(&body[4..meta_end])?;
    let data = if body.len() > meta_end {
        Some(Bytes::copy_from_slice(&body[meta_end..]))
    } else {
        None
    };

    Ok((record, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobKey;

    #[test]
    fn test_blob_frame_roundtrip_with_data() {
        let record = BlobRecord {
            key: BlobKey::for_bytes(b"payload"),
            size: 7,
            decompressed_size: 7,
            compressed: false,
            inline: true,
        };

        let body = encode_blob_frame(&record, Some(b"payload")).unwrap();
        let (decoded, data) = decode_blob_frame(&body).unwrap();

        assert_eq!(decoded, record);
        assert_eq!(data.as_deref(), Some(b"payload".as_slice()));
    }

    #[test]
    fn test_blob_frame_roundtrip_without_data() {
        let record = BlobRecord {
            key: BlobKey::for_bytes(b"file-backed"),
            size: 4096,
            decompressed_size: 8192,
            compressed: true,
            inline: false,
        };

        let body = encode_blob_frame(&record, None).unwrap();
        let (decoded, data) = decode_blob_frame(&body).unwrap();

        assert_eq!(decoded, record);
        assert!(data.is_none());
    }

    #[test]
    fn test_blob_frame_truncated() {
        assert!(decode_blob_frame(&[1, 0]).is_err());
        assert!(decode_blob_frame(&100u32.to_le_bytes()).is_err());
    }
}
