//! Append-only frame log writer

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use bytemuck::bytes_of;

use super::format::{FileHeader, FrameKind, FLAG_ARCHIVE, HEADER_SIZE};
use crate::Result;

/// Writer for a store frame log or archive.
///
/// A package store keeps the log open and appends frames as records arrive;
/// an archive is written in one pass and sealed with a data CRC.
pub struct LogWriter {
    file: BufWriter<File>,
    header: FileHeader,
    synchronous: bool,
    /// Running CRC over frame bytes; tracked for archives only
    data_hasher: Option<crc32fast::Hasher>,
}

impl LogWriter {
    /// Create a new log file, truncating anything present.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or the header written
    pub fn create(path: &Path, mut header: FileHeader, synchronous: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        header.seal();

        let mut writer = BufWriter::new(file);
        writer.write_all(bytes_of(&header))?;
        writer.flush()?;

        let data_hasher = header
            .has_flag(FLAG_ARCHIVE)
            .then(crc32fast::Hasher::new);

        Ok(Self {
            file: writer,
            header,
            synchronous,
            data_hasher,
        })
    }

    /// Reopen an existing log for appending.
    ///
    /// `valid_len` is the length of the decodable prefix as reported by the
    /// reader; anything past it (a torn tail write) is discarded.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or truncated
    pub fn open_append(
        path: &Path,
        header: FileHeader,
        valid_len: u64,
        synchronous: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.set_len(valid_len)?;

        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::End(0))?;

        Ok(Self {
            file: writer,
            header,
            synchronous,
            data_hasher: None,
        })
    }

    /// Append a frame to the log.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn append_frame(&mut self, kind: FrameKind, body: &[u8]) -> Result<()> {
        let len = body.len() as u32;

        if let Some(hasher) = &mut self.data_hasher {
            hasher.update(&[kind as u8]);
            hasher.update(&len.to_le_bytes());
            hasher.update(body);
        }

        self.file.write_all(&[kind as u8])?;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(body)?;

        if self.synchronous {
            self.flush()?;
        }

        Ok(())
    }

    /// Flush buffered frames to disk.
    ///
    /// # Errors
    ///
    /// Returns error if the flush or sync fails
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Seal an archive: record the data CRC and rewrite the header.
    ///
    /// # Errors
    ///
    /// Returns error if the header rewrite fails
    pub fn finalize_archive(mut self) -> Result<()> {
        if let Some(hasher) = self.data_hasher.take() {
            self.header.data_crc = hasher.finalize();
        }
        self.header.seal();

        self.file.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(bytes_of(&self.header))?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        Ok(())
    }

    /// The header this writer was created with.
    #[must_use]
    pub fn header(&self) -> &FileHeader {
        &self.header
    }
}
