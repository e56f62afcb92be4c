//! # Trellis Codec
//!
//! Binary encoding of the Trellis transaction log.
//!
//! A log is a sequence of versioned files. Each file begins with a
//! [`LogHeader`] naming its [`FormatVersion`], followed by framed
//! [`LogEntry`] values:
//!
//! - **Current** frames are checksummed and the entries of one transaction
//!   are contiguous.
//! - **Legacy** frames carry a writer identifier instead of a checksum, and
//!   entries of concurrent transactions may interleave.
//!
//! Decoding a frame that runs past the available bytes yields
//! [`CodecError::Truncated`]. That is how the end of a log written by a
//! crashed process looks, and callers treat it as end-of-log rather than
//! as damage.
//!
//! ## Usage
//!
//! ```
//! use trellis_codec::{decode_entry, FormatVersion, LogEntry};
//!
//! let entry = LogEntry::Commit { tx_id: 7, timestamp: 1_700_000_000_000, checksum: 42 };
//! let bytes = entry.encode().unwrap();
//!
//! let decoded = decode_entry(&bytes, FormatVersion::Current).unwrap();
//! assert_eq!(decoded.entry, entry);
//! assert_eq!(decoded.encoded_len, bytes.len());
//!
//! // A torn write is not corruption.
//! assert!(decode_entry(&bytes[..bytes.len() - 1], FormatVersion::Current)
//!     .unwrap_err()
//!     .is_truncated());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entry;
mod error;
mod frame;
mod header;
mod position;

pub use entry::{EntryType, LogEntry};
pub use error::{CodecError, CodecResult};
pub use frame::{decode_entry, encode_entry, encode_legacy_entry, DecodedEntry, MAX_PAYLOAD_SIZE};
pub use header::{FormatVersion, LogHeader, LOG_HEADER_SIZE, LOG_MAGIC};
pub use position::LogPosition;
