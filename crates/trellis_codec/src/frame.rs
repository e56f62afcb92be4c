//! Entry framing for both on-disk formats.
//!
//! ```text
//! current: | type (1) | length (4) | payload (length) | crc32 (4) |
//! legacy:  | type (1) | identifier (4) | length (4) | payload (length) |
//! ```
//!
//! All integers are little endian. The current-format CRC covers type,
//! length and payload.

use crate::entry::{EntryType, LogEntry};
use crate::error::{CodecError, CodecResult};
use crate::header::FormatVersion;
use crate::position::LogPosition;
use bytes::{Buf, BufMut};

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Bytes preceding the payload in a current-format frame.
const CURRENT_PREFIX: usize = 5;

/// Bytes following the payload in a current-format frame.
const CRC_SIZE: usize = 4;

/// Bytes preceding the payload in a legacy frame.
const LEGACY_PREFIX: usize = 9;

/// Longest checkpoint reason that can be encoded.
const MAX_REASON_LEN: usize = u16::MAX as usize;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntry {
    /// The decoded entry.
    pub entry: LogEntry,
    /// Writer identifier (legacy format only).
    pub identifier: Option<u32>,
    /// Number of bytes the frame occupied.
    pub encoded_len: usize,
}

/// Appends a current-format frame for `entry` to `buf`.
///
/// # Errors
///
/// Returns `PayloadTooLarge` if the payload or checkpoint reason cannot be framed.
pub fn encode_entry(entry: &LogEntry, buf: &mut Vec<u8>) -> CodecResult<()> {
    let payload = encode_payload(entry, FormatVersion::Current)?;
    let start = buf.len();
    buf.reserve(CURRENT_PREFIX + payload.len() + CRC_SIZE);
    buf.put_u8(entry.entry_type().as_byte());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    let crc = crc32fast::hash(&buf[start..]);
    buf.put_u32_le(crc);
    Ok(())
}

/// Appends a legacy frame for `entry`, tagged with the writer `identifier`.
///
/// Legacy frames drop the leader term and the commit checksum.
///
/// # Errors
///
/// Returns `PayloadTooLarge` if the payload or checkpoint reason cannot be framed.
pub fn encode_legacy_entry(entry: &LogEntry, identifier: u32, buf: &mut Vec<u8>) -> CodecResult<()> {
    let payload = encode_payload(entry, FormatVersion::Legacy)?;
    buf.reserve(LEGACY_PREFIX + payload.len());
    buf.put_u8(entry.entry_type().as_byte());
    buf.put_u32_le(identifier);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(())
}

/// Decodes the frame at the start of `bytes`.
///
/// # Errors
///
/// - `Truncated` when fewer bytes are available than the frame declares
/// - `Corrupt` for unknown tags, oversized or inconsistent lengths
/// - `ChecksumMismatch` when a complete current-format frame fails its CRC
pub fn decode_entry(bytes: &[u8], format: FormatVersion) -> CodecResult<DecodedEntry> {
    match format {
        FormatVersion::Current => decode_current(bytes),
        FormatVersion::Legacy => decode_legacy(bytes),
    }
}

impl LogEntry {
    /// Encodes this entry as a current-format frame.
    ///
    /// # Errors
    ///
    /// Returns `PayloadTooLarge` if the entry cannot be framed.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut buf = Vec::new();
        encode_entry(self, &mut buf)?;
        Ok(buf)
    }

    /// Decodes one entry from `bytes` in the given format.
    ///
    /// # Errors
    ///
    /// See [`decode_entry`].
    pub fn decode(bytes: &[u8], format: FormatVersion) -> CodecResult<Self> {
        decode_entry(bytes, format).map(|decoded| decoded.entry)
    }
}

fn decode_current(bytes: &[u8]) -> CodecResult<DecodedEntry> {
    if bytes.len() < CURRENT_PREFIX {
        return Err(CodecError::Truncated {
            needed: CURRENT_PREFIX,
            available: bytes.len(),
        });
    }

    let mut prefix = bytes;
    let entry_type = read_entry_type(prefix.get_u8())?;
    let len = checked_len(prefix.get_u32_le())?;

    let total = CURRENT_PREFIX + len + CRC_SIZE;
    if bytes.len() < total {
        return Err(CodecError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }

    let mut crc_bytes = &bytes[CURRENT_PREFIX + len..total];
    let expected = crc_bytes.get_u32_le();
    let actual = crc32fast::hash(&bytes[..CURRENT_PREFIX + len]);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    let entry = decode_payload(
        entry_type,
        &bytes[CURRENT_PREFIX..CURRENT_PREFIX + len],
        FormatVersion::Current,
    )?;

    Ok(DecodedEntry {
        entry,
        identifier: None,
        encoded_len: total,
    })
}

fn decode_legacy(bytes: &[u8]) -> CodecResult<DecodedEntry> {
    if bytes.len() < LEGACY_PREFIX {
        return Err(CodecError::Truncated {
            needed: LEGACY_PREFIX,
            available: bytes.len(),
        });
    }

    let mut prefix = bytes;
    let entry_type = read_entry_type(prefix.get_u8())?;
    let identifier = prefix.get_u32_le();
    let len = checked_len(prefix.get_u32_le())?;

    let total = LEGACY_PREFIX + len;
    if bytes.len() < total {
        return Err(CodecError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }

    let entry = decode_payload(entry_type, &bytes[LEGACY_PREFIX..total], FormatVersion::Legacy)?;

    Ok(DecodedEntry {
        entry,
        identifier: Some(identifier),
        encoded_len: total,
    })
}

fn read_entry_type(byte: u8) -> CodecResult<EntryType> {
    EntryType::from_byte(byte)
        .ok_or_else(|| CodecError::corrupt(format!("unknown entry type 0x{byte:02x}")))
}

fn checked_len(len: u32) -> CodecResult<usize> {
    let len = len as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(CodecError::corrupt(format!(
            "declared payload length {len} exceeds maximum {MAX_PAYLOAD_SIZE}"
        )));
    }
    Ok(len)
}

fn encode_payload(entry: &LogEntry, format: FormatVersion) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    match entry {
        LogEntry::Start {
            tx_id,
            last_committed_tx_id,
            timestamp,
            leader_term,
            additional_data,
        } => {
            buf.put_u64_le(*tx_id);
            buf.put_u64_le(*last_committed_tx_id);
            buf.put_u64_le(*timestamp);
            if format == FormatVersion::Current {
                buf.put_u64_le(*leader_term);
            }
            check_payload_len(additional_data.len())?;
            buf.put_u32_le(additional_data.len() as u32);
            buf.put_slice(additional_data);
        }
        LogEntry::Command { payload } => {
            buf.put_slice(payload);
        }
        LogEntry::Commit {
            tx_id,
            timestamp,
            checksum,
        } => {
            buf.put_u64_le(*tx_id);
            buf.put_u64_le(*timestamp);
            if format == FormatVersion::Current {
                buf.put_u64_le(*checksum);
            }
        }
        LogEntry::Checkpoint {
            position,
            last_tx_id,
            timestamp,
            reason,
        } => {
            if reason.len() > MAX_REASON_LEN {
                return Err(CodecError::PayloadTooLarge {
                    len: reason.len(),
                    max: MAX_REASON_LEN,
                });
            }
            buf.put_u64_le(position.log_version);
            buf.put_u64_le(position.byte_offset);
            buf.put_u64_le(*last_tx_id);
            buf.put_u64_le(*timestamp);
            buf.put_u16_le(reason.len() as u16);
            buf.put_slice(reason.as_bytes());
        }
    }
    check_payload_len(buf.len())?;
    Ok(buf)
}

fn check_payload_len(len: usize) -> CodecResult<()> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

/// Reads fixed-width fields out of a complete payload.
///
/// Running short inside a complete frame is corruption, never truncation.
struct PayloadReader<'a> {
    buf: &'a [u8],
    entry_type: EntryType,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8], entry_type: EntryType) -> Self {
        Self { buf, entry_type }
    }

    fn ensure(&self, len: usize, field: &str) -> CodecResult<()> {
        if self.buf.remaining() < len {
            return Err(CodecError::corrupt(format!(
                "{} payload too short for {field}",
                self.entry_type
            )));
        }
        Ok(())
    }

    fn u16(&mut self, field: &str) -> CodecResult<u16> {
        self.ensure(2, field)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, field: &str) -> CodecResult<u32> {
        self.ensure(4, field)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, field: &str) -> CodecResult<u64> {
        self.ensure(8, field)?;
        Ok(self.buf.get_u64_le())
    }

    fn bytes(&mut self, len: usize, field: &str) -> CodecResult<Vec<u8>> {
        self.ensure(len, field)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    fn finish(self) -> CodecResult<()> {
        if self.buf.has_remaining() {
            return Err(CodecError::corrupt(format!(
                "{} payload has {} trailing bytes",
                self.entry_type,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

fn decode_payload(entry_type: EntryType, payload: &[u8], format: FormatVersion) -> CodecResult<LogEntry> {
    let mut reader = PayloadReader::new(payload, entry_type);
    let entry = match entry_type {
        EntryType::Command => {
            return Ok(LogEntry::Command {
                payload: payload.to_vec(),
            })
        }
        EntryType::Start => {
            let tx_id = reader.u64("tx_id")?;
            let last_committed_tx_id = reader.u64("last_committed_tx_id")?;
            let timestamp = reader.u64("timestamp")?;
            let leader_term = match format {
                FormatVersion::Current => reader.u64("leader_term")?,
                FormatVersion::Legacy => 0,
            };
            let data_len = reader.u32("additional_data length")? as usize;
            let additional_data = reader.bytes(data_len, "additional_data")?;
            LogEntry::Start {
                tx_id,
                last_committed_tx_id,
                timestamp,
                leader_term,
                additional_data,
            }
        }
        EntryType::Commit => {
            let tx_id = reader.u64("tx_id")?;
            let timestamp = reader.u64("timestamp")?;
            let checksum = match format {
                FormatVersion::Current => reader.u64("checksum")?,
                FormatVersion::Legacy => 0,
            };
            LogEntry::Commit {
                tx_id,
                timestamp,
                checksum,
            }
        }
        EntryType::Checkpoint => {
            let log_version = reader.u64("log_version")?;
            let byte_offset = reader.u64("byte_offset")?;
            let last_tx_id = reader.u64("last_tx_id")?;
            let timestamp = reader.u64("timestamp")?;
            let reason_len = reader.u16("reason length")? as usize;
            let reason = String::from_utf8(reader.bytes(reason_len, "reason")?)
                .map_err(|_| CodecError::corrupt("checkpoint reason is not valid UTF-8"))?;
            LogEntry::Checkpoint {
                position: LogPosition::new(log_version, byte_offset),
                last_tx_id,
                timestamp,
                reason,
            }
        }
    };
    reader.finish()?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn start(tx_id: u64) -> LogEntry {
        LogEntry::Start {
            tx_id,
            last_committed_tx_id: tx_id - 1,
            timestamp: 1_000 + tx_id,
            leader_term: 3,
            additional_data: b"meta".to_vec(),
        }
    }

    #[test]
    fn current_frame_layout() {
        let entry = LogEntry::Command {
            payload: vec![0xAA; 10],
        };
        let bytes = entry.encode().unwrap();

        assert_eq!(bytes.len(), 5 + 10 + 4);
        assert_eq!(bytes[0], EntryType::Command.as_byte());
        assert_eq!(u32::from_le_bytes(bytes[1..5].try_into().unwrap()), 10);

        let decoded = decode_entry(&bytes, FormatVersion::Current).unwrap();
        assert_eq!(decoded.entry, entry);
        assert_eq!(decoded.identifier, None);
        assert_eq!(decoded.encoded_len, bytes.len());
    }

    #[test]
    fn legacy_start_drops_leader_term() {
        let mut bytes = Vec::new();
        encode_legacy_entry(&start(5), 42, &mut bytes).unwrap();

        let decoded = decode_entry(&bytes, FormatVersion::Legacy).unwrap();
        assert_eq!(decoded.identifier, Some(42));
        match decoded.entry {
            LogEntry::Start {
                tx_id, leader_term, ..
            } => {
                assert_eq!(tx_id, 5);
                assert_eq!(leader_term, 0);
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn legacy_commit_has_no_checksum() {
        let commit = LogEntry::Commit {
            tx_id: 9,
            timestamp: 77,
            checksum: 0xFFFF,
        };
        let mut bytes = Vec::new();
        encode_legacy_entry(&commit, 1, &mut bytes).unwrap();

        assert_eq!(bytes.len(), 9 + 16);
        let decoded = LogEntry::decode(&bytes, FormatVersion::Legacy).unwrap();
        assert_eq!(
            decoded,
            LogEntry::Commit {
                tx_id: 9,
                timestamp: 77,
                checksum: 0
            }
        );
    }

    #[test]
    fn checkpoint_roundtrip() {
        let entry = LogEntry::Checkpoint {
            position: LogPosition::new(2, 4096),
            last_tx_id: 17,
            timestamp: 123,
            reason: "database shutdown".to_string(),
        };
        let bytes = entry.encode().unwrap();
        assert_eq!(LogEntry::decode(&bytes, FormatVersion::Current).unwrap(), entry);
    }

    #[test]
    fn concatenated_frames_decode_one_at_a_time() {
        let mut bytes = Vec::new();
        encode_entry(&start(1), &mut bytes).unwrap();
        encode_entry(
            &LogEntry::Commit {
                tx_id: 1,
                timestamp: 5,
                checksum: 6,
            },
            &mut bytes,
        )
        .unwrap();

        let first = decode_entry(&bytes, FormatVersion::Current).unwrap();
        let second = decode_entry(&bytes[first.encoded_len..], FormatVersion::Current).unwrap();
        assert_eq!(second.entry.tx_id(), Some(1));
        assert_eq!(first.encoded_len + second.encoded_len, bytes.len());
    }

    #[test]
    fn unknown_type_is_corrupt() {
        let mut bytes = start(1).encode().unwrap();
        bytes[0] = 0x7F;
        assert!(matches!(
            decode_entry(&bytes, FormatVersion::Current),
            Err(CodecError::Corrupt { .. })
        ));
    }

    #[test]
    fn oversized_length_is_corrupt() {
        let mut bytes = vec![EntryType::Command.as_byte()];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_entry(&bytes, FormatVersion::Current),
            Err(CodecError::Corrupt { .. })
        ));
    }

    #[test]
    fn flipped_payload_bit_is_checksum_mismatch() {
        let mut bytes = start(3).encode().unwrap();
        bytes[8] ^= 0x10;
        assert!(matches!(
            decode_entry(&bytes, FormatVersion::Current),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn short_commit_payload_is_corrupt() {
        // A complete legacy frame whose payload is too short for a commit.
        let mut bytes = vec![EntryType::Commit.as_byte()];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 4]);

        assert!(matches!(
            decode_entry(&bytes, FormatVersion::Legacy),
            Err(CodecError::Corrupt { .. })
        ));
    }

    #[test]
    fn trailing_payload_bytes_are_corrupt() {
        let mut bytes = vec![EntryType::Commit.as_byte()];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&20u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 20]);

        assert!(matches!(
            decode_entry(&bytes, FormatVersion::Legacy),
            Err(CodecError::Corrupt { .. })
        ));
    }

    fn arb_entry() -> impl Strategy<Value = LogEntry> {
        prop_oneof![
            (
                1u64..u64::MAX,
                any::<u64>(),
                any::<u64>(),
                proptest::collection::vec(any::<u8>(), 0..64)
            )
                .prop_map(|(tx_id, timestamp, leader_term, additional_data)| {
                    LogEntry::Start {
                        tx_id,
                        last_committed_tx_id: tx_id - 1,
                        timestamp,
                        leader_term,
                        additional_data,
                    }
                }),
            proptest::collection::vec(any::<u8>(), 0..256)
                .prop_map(|payload| LogEntry::Command { payload }),
            (any::<u64>(), any::<u64>(), any::<u64>()).prop_map(|(tx_id, timestamp, checksum)| {
                LogEntry::Commit {
                    tx_id,
                    timestamp,
                    checksum,
                }
            }),
            (any::<u64>(), any::<u64>(), any::<u64>(), "[a-z ]{0,32}").prop_map(
                |(version, offset, last_tx_id, reason)| LogEntry::Checkpoint {
                    position: LogPosition::new(version, offset),
                    last_tx_id,
                    timestamp: 0,
                    reason,
                }
            ),
        ]
    }

    proptest! {
        #[test]
        fn every_strict_prefix_is_truncated(entry in arb_entry()) {
            let bytes = entry.encode().unwrap();
            for k in 0..bytes.len() {
                let err = decode_entry(&bytes[..k], FormatVersion::Current).unwrap_err();
                prop_assert!(err.is_truncated(), "prefix {} gave {:?}", k, err);
            }
            prop_assert_eq!(LogEntry::decode(&bytes, FormatVersion::Current).unwrap(), entry);
        }
    }
}
