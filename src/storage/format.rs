//! Binary format structures

use bytemuck::{Pod, Zeroable};

/// File magic bytes: "LOUPE" + format tag
pub const FILE_MAGIC: [u8; 8] = [0x4C, 0x4F, 0x55, 0x50, 0x45, 0x00, 0x01, 0x00];

/// Current format version
pub const FILE_VERSION: u32 = 1;

/// File header size (cache-aligned to 64 bytes)
pub const HEADER_SIZE: usize = 64;

/// Frame header size: kind byte + little-endian length
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum accepted frame body length
pub const FRAME_LEN_MAX: u32 = 64 * 1024 * 1024;

/// Header flag: file is a finalized single-file archive
pub const FLAG_ARCHIVE: u32 = 1 << 0;

/// Header flag: blobs were stored with compression enabled
pub const FLAG_COMPRESSED_BLOBS: u32 = 1 << 1;

/// Kind discriminant of a stored frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A session started; body is a `SessionStarted` row
    Session = 1,
    /// A message row
    Message = 2,
    /// The initial row of a network task
    TaskBegan = 3,
    /// A progress update for an in-flight task
    TaskProgress = 4,
    /// The final row of a completed task
    TaskCompleted = 5,
    /// A blob registration, optionally carrying the payload bytes
    Blob = 6,
}

impl FrameKind {
    /// Parse a frame kind byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Session),
            2 => Some(Self::Message),
            3 => Some(Self::TaskBegan),
            4 => Some(Self::TaskProgress),
            5 => Some(Self::TaskCompleted),
            6 => Some(Self::Blob),
            _ => None,
        }
    }
}

/// File header (64 bytes, cache-aligned)
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, align(64))]
pub struct FileHeader {
    /// Magic bytes for file format identification
    pub magic: [u8; 8],

    /// Format version
    pub version: u32,

    /// CRC32 of header (excluding this field)
    pub header_crc: u32,

    /// Store identity (UUID bytes)
    pub store_id: [u8; 16],

    /// Creation timestamp (Unix epoch nanoseconds)
    pub created_at: u64,

    /// Feature flags (bitfield)
    pub flags: u32,

    /// CRC32 of all frame bytes; only set for finalized archives
    pub data_crc: u32,

    /// Reserved for future use
    pub reserved: [u8; 16],
}

static_assertions::const_assert_eq!(std::mem::size_of::<FileHeader>(), HEADER_SIZE);
static_assertions::const_assert_eq!(std::mem::align_of::<FileHeader>(), 64);

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            header_crc: 0,
            store_id: [0; 16],
            created_at: 0,
            flags: 0,
            data_crc: 0,
            reserved: [0; 16],
        }
    }
}

impl FileHeader {
    /// Check if a flag is set
    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        (self.flags & flag) != 0
    }

    /// Set a flag
    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    /// Compute the header CRC over everything except the CRC field itself.
    #[must_use]
    pub fn compute_crc(&self) -> u32 {
        let bytes = bytemuck::bytes_of(self);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..12]); // magic + version
        hasher.update(&bytes[16..]); // rest of header after CRC
        hasher.finalize()
    }

    /// Recompute and store the header CRC.
    pub fn seal(&mut self) {
        self.header_crc = 0;
        self.header_crc = self.compute_crc();
    }
}
