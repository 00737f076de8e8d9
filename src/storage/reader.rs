//! Frame log and archive readers

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bytemuck::from_bytes;
use memmap2::Mmap;
use tracing::warn;

use super::format::{
    FileHeader, FrameKind, FLAG_ARCHIVE, FRAME_HEADER_SIZE, FRAME_LEN_MAX, HEADER_SIZE,
};
use crate::{LoupeError, Result};

/// A single decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Frame body bytes
    pub body: Vec<u8>,
}

/// The decodable contents of a frame log
#[derive(Debug)]
pub struct ReplayedLog {
    /// Validated file header
    pub header: FileHeader,
    /// Every frame up to the first undecodable byte
    pub frames: Vec<Frame>,
    /// Length of the valid prefix; the file may be longer after a torn write
    pub valid_len: u64,
}

/// Reader for package frame logs
pub struct LogReader;

impl LogReader {
    /// Read and validate an entire frame log.
    ///
    /// Frames after a torn or corrupt tail are dropped with a warning; the
    /// reported `valid_len` lets the writer truncate the damage away.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or its header is invalid
    pub fn read_all(path: &Path) -> Result<ReplayedLog> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|_| {
            LoupeError::InvalidFormat("file too small to contain header".to_string())
        })?;

        let header: FileHeader = bytemuck::pod_read_unaligned(&header_bytes);
        super::validate_header(&header)?;

        let mut frames = Vec::new();
        let mut offset = HEADER_SIZE as u64;

        loop {
            let mut frame_header = [0u8; FRAME_HEADER_SIZE];
            match read_exact_or_eof(&mut reader, &mut frame_header) {
                ReadOutcome::Eof => break,
                ReadOutcome::Partial | ReadOutcome::Failed => {
                    warn!("Torn frame header at offset {offset}, truncating log");
                    break;
                }
                ReadOutcome::Full => {}
            }

            let Some(kind) = FrameKind::from_u8(frame_header[0]) else {
                warn!(
                    "Unknown frame kind {} at offset {offset}, truncating log",
                    frame_header[0]
                );
                break;
            };

            let len = u32::from_le_bytes([
                frame_header[1],
                frame_header[2],
                frame_header[3],
                frame_header[4],
            ]);
            if len > FRAME_LEN_MAX {
                warn!("Frame length {len} out of bounds at offset {offset}, truncating log");
                break;
            }

            let mut body = vec![0u8; len as usize];
            if !matches!(read_exact_or_eof(&mut reader, &mut body), ReadOutcome::Full) {
                warn!("Torn frame body at offset {offset}, truncating log");
                break;
            }

            offset += (FRAME_HEADER_SIZE + len as usize) as u64;
            frames.push(Frame { kind, body });
        }

        Ok(ReplayedLog {
            header,
            frames,
            valid_len: offset,
        })
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
    Failed,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                }
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => return ReadOutcome::Failed,
        }
    }
    ReadOutcome::Full
}

/// Memory-mapped reader for finalized archives
pub struct ArchiveReader {
    _file: File,
    mmap: Mmap,
    header: FileHeader,
}

impl ArchiveReader {
    /// Open and fully validate an archive.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or mapped, the header is
    /// invalid, or the data CRC does not match
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE {
            return Err(LoupeError::InvalidFormat(
                "file too small to contain header".to_string(),
            ));
        }

        let header: FileHeader = *from_bytes(&mmap[..HEADER_SIZE]);
        super::validate_header(&header)?;

        if !header.has_flag(FLAG_ARCHIVE) {
            return Err(LoupeError::InvalidFormat(
                "not an archive: missing archive flag".to_string(),
            ));
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&mmap[HEADER_SIZE..]);
        let actual = hasher.finalize();
        if actual != header.data_crc {
            return Err(LoupeError::Corrupted {
                offset: HEADER_SIZE as u64,
                expected: header.data_crc,
                actual,
            });
        }

        Ok(Self {
            _file: file,
            mmap,
            header,
        })
    }

    /// The archive header.
    #[must_use]
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Iterate over archive frames without copying bodies.
    #[must_use]
    pub fn frames(&self) -> ArchiveFrames<'_> {
        ArchiveFrames {
            data: &self.mmap[HEADER_SIZE..],
        }
    }
}

/// Borrowing iterator over archive frames
pub struct ArchiveFrames<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for ArchiveFrames<'a> {
    type Item = Result<(FrameKind, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < FRAME_HEADER_SIZE {
            self.data = &[];
            return Some(Err(LoupeError::InvalidFormat(
                "truncated archive frame header".to_string(),
            )));
        }

        let Some(kind) = FrameKind::from_u8(self.data[0]) else {
            let value = self.data[0];
            self.data = &[];
            return Some(Err(LoupeError::InvalidFormat(format!(
                "unknown archive frame kind: {value}"
            ))));
        };

        let len =
            u32::from_le_bytes([self.data[1], self.data[2], self.data[3], self.data[4]]) as usize;
        let end = FRAME_HEADER_SIZE + len;
        if len as u32 > FRAME_LEN_MAX || self.data.len() < end {
            self.data = &[];
            return Some(Err(LoupeError::InvalidFormat(
                "truncated archive frame body".to_string(),
            )));
        }

        let body = &self.data[FRAME_HEADER_SIZE..end];
        self.data = &self.data[end..];
        Some(Ok((kind, body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::writer::LogWriter;
    use tempfile::NamedTempFile;

    #[test]
    fn test_rejects_bad_magic() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 128]).unwrap();

        let result = LogReader::read_all(file.path());
        assert!(matches!(result, Err(LoupeError::InvalidFormat(_))));
    }

    #[test]
    fn test_rejects_corrupt_header_crc() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut writer =
                LogWriter::create(file.path(), FileHeader::default(), true).unwrap();
            writer.append_frame(FrameKind::Message, b"x").unwrap();
        }

        // Flip a byte inside the header, past the CRC field
        let mut bytes = std::fs::read(file.path()).unwrap();
        bytes[20] ^= 0xFF;
        std::fs::write(file.path(), &bytes).unwrap();

        let result = LogReader::read_all(file.path());
        assert!(matches!(result, Err(LoupeError::Corrupted { .. })));
    }

    #[test]
    fn test_archive_roundtrip() {
        let file = NamedTempFile::new().unwrap();

        {
            let mut header = FileHeader::default();
            header.set_flag(FLAG_ARCHIVE);
            let mut writer = LogWriter::create(file.path(), header, false).unwrap();
            writer.append_frame(FrameKind::Session, b"session-body").unwrap();
            writer.append_frame(FrameKind::Blob, b"blob-body").unwrap();
            writer.finalize_archive().unwrap();
        }

        let archive = ArchiveReader::open(file.path()).unwrap();
        let frames: Vec<_> = archive.frames().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, FrameKind::Session);
        assert_eq!(frames[0].1, b"session-body");
        assert_eq!(frames[1].0, FrameKind::Blob);
    }

    #[test]
    fn test_archive_detects_data_corruption() {
        let file = NamedTempFile::new().unwrap();

        {
            let mut header = FileHeader::default();
            header.set_flag(FLAG_ARCHIVE);
            let mut writer = LogWriter::create(file.path(), header, false).unwrap();
            writer
                .append_frame(FrameKind::Message, b"payload-to-corrupt")
                .unwrap();
            writer.finalize_archive().unwrap();
        }

        let mut bytes = std::fs::read(file.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(file.path(), &bytes).unwrap();

        let result = ArchiveReader::open(file.path());
        assert!(matches!(result, Err(LoupeError::Corrupted { .. })));
    }

    #[test]
    fn test_archive_rejects_plain_log() {
        let file = NamedTempFile::new().unwrap();
        {
            let _writer =
                LogWriter::create(file.path(), FileHeader::default(), true).unwrap();
        }

        let result = ArchiveReader::open(file.path());
        assert!(matches!(result, Err(LoupeError::InvalidFormat(_))));
    }
}
