//! Per-file log header.

use crate::error::{CodecError, CodecResult};
use bytes::{Buf, BufMut};

/// Magic bytes at the start of every log file.
pub const LOG_MAGIC: [u8; 4] = *b"TRLG";

/// Encoded header size.
/// magic (4) + format (1) + log version (8) + last committed tx (8) + crc32 (4)
pub const LOG_HEADER_SIZE: usize = 25;

/// On-disk format of the entries in a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FormatVersion {
    /// Entries carry a writer identifier and may interleave across
    /// transactions. No frame checksums, no leader term, no commit checksum.
    Legacy = 1,
    /// Entries of one transaction are contiguous and every frame is checksummed.
    Current = 2,
}

impl FormatVersion {
    /// Converts a byte to a format version.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Legacy),
            2 => Some(Self::Current),
            _ => None,
        }
    }

    /// Converts the format version to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Header written once at the start of each physical log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Format of every entry in this file.
    pub format_version: FormatVersion,
    /// Version of this file within the logical log.
    pub log_version: u64,
    /// Last transaction committed before this file was started.
    pub last_committed_tx_id: u64,
}

impl LogHeader {
    /// Creates a header for a current-format file.
    #[must_use]
    pub const fn current(log_version: u64, last_committed_tx_id: u64) -> Self {
        Self {
            format_version: FormatVersion::Current,
            log_version,
            last_committed_tx_id,
        }
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LOG_HEADER_SIZE);
        buf.put_slice(&LOG_MAGIC);
        buf.put_u8(self.format_version.as_byte());
        buf.put_u64_le(self.log_version);
        buf.put_u64_le(self.last_committed_tx_id);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Decodes a header from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// - `Truncated` if fewer than [`LOG_HEADER_SIZE`] bytes are available
    /// - `Corrupt` on bad magic
    /// - `ChecksumMismatch` if the header checksum does not match
    /// - `UnsupportedFormat` for an unknown format byte
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < LOG_HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: LOG_HEADER_SIZE,
                available: bytes.len(),
            });
        }

        if bytes[..4] != LOG_MAGIC {
            return Err(CodecError::corrupt("invalid log file magic"));
        }

        let mut crc_bytes = &bytes[LOG_HEADER_SIZE - 4..LOG_HEADER_SIZE];
        let expected = crc_bytes.get_u32_le();
        let actual = crc32fast::hash(&bytes[..LOG_HEADER_SIZE - 4]);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        let mut buf = &bytes[4..LOG_HEADER_SIZE - 4];
        let format_byte = buf.get_u8();
        let format_version =
            FormatVersion::from_byte(format_byte).ok_or(CodecError::UnsupportedFormat(format_byte))?;
        let log_version = buf.get_u64_le();
        let last_committed_tx_id = buf.get_u64_le();

        Ok(Self {
            format_version,
            log_version,
            last_committed_tx_id,
        })
    }
}
