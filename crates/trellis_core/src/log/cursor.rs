//! Streaming reader over the physical log entries.

use crate::error::{CoreError, CoreResult};
use crate::log::files::decode_header;
use crate::log::store::LogStore;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;
use trellis_codec::{
    decode_entry, CodecError, DecodedEntry, FormatVersion, LogEntry, LogPosition, LOG_HEADER_SIZE,
};
use trellis_storage::StorageBackend;

/// Smallest read-ahead window; enough for any frame prefix.
const MIN_BUFFER_SIZE: usize = 64;

/// A log entry together with where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionedEntry {
    /// The decoded entry.
    pub entry: LogEntry,
    /// Writer identifier, legacy files only.
    pub identifier: Option<u32>,
    /// Format of the file the entry came from.
    pub format: FormatVersion,
    /// Position of the first byte of the frame.
    pub position: LogPosition,
    /// Position of the byte after the frame.
    pub end: LogPosition,
}

struct OpenFile {
    version: u64,
    format: FormatVersion,
    backend: Box<dyn StorageBackend>,
    /// Readable size, capped by the cursor limit.
    size: u64,
    offset: u64,
    window: Vec<u8>,
    window_start: u64,
}

impl OpenFile {
    fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.offset)
    }

    /// Returns up to `len` bytes from the read offset, refilling the window
    /// when it does not cover them.
    fn peek(&mut self, len: usize, buffer_size: usize) -> CoreResult<&[u8]> {
        let len = len.min(self.remaining() as usize);
        let window_end = self.window_start + self.window.len() as u64;
        if self.offset < self.window_start || self.offset + len as u64 > window_end {
            let fetch = len.max(buffer_size).min(self.remaining() as usize);
            self.window = self
                .backend
                .read_at(self.offset, fetch)
                .map_err(|source| CoreError::LogRead {
                    position: LogPosition::new(self.version, self.offset),
                    source,
                })?;
            self.window_start = self.offset;
        }
        let start = (self.offset - self.window_start) as usize;
        Ok(&self.window[start..start + len])
    }

    fn decode_next(&mut self, buffer_size: usize) -> CoreResult<Result<DecodedEntry, CodecError>> {
        let format = self.format;
        let mut want = buffer_size;
        loop {
            let bytes = self.peek(want, buffer_size)?;
            let available = bytes.len();
            match decode_entry(bytes, format) {
                Err(CodecError::Truncated { needed, .. })
                    if needed > available && needed as u64 <= self.remaining() =>
                {
                    want = needed;
                }
                other => return Ok(other),
            }
        }
    }
}

/// Iterates over the entries of a log in physical order, across versions.
///
/// A frame cut off at the end of the newest file ends iteration cleanly;
/// [`LogEntryCursor::torn_tail`] reports where. Anything else that fails to
/// decode is returned as an error carrying the log position, after which
/// the cursor yields nothing more.
pub struct LogEntryCursor {
    store: Arc<dyn LogStore>,
    pending_versions: VecDeque<u64>,
    start_offset: Option<u64>,
    last_version: Option<u64>,
    current: Option<OpenFile>,
    limit: Option<LogPosition>,
    buffer_size: usize,
    torn_tail: Option<LogPosition>,
    finished: bool,
}

impl LogEntryCursor {
    /// Opens a cursor at `from`, stopping at `limit` if given.
    ///
    /// A position before the oldest file starts at the oldest file.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed or the file holding
    /// `from` is missing while later ones exist.
    pub fn new(
        store: Arc<dyn LogStore>,
        from: LogPosition,
        limit: Option<LogPosition>,
        buffer_size: usize,
    ) -> CoreResult<Self> {
        let versions: Vec<u64> = store
            .versions()?
            .into_iter()
            .filter(|v| limit.map_or(true, |l| *v <= l.log_version))
            .collect();

        let from = match versions.first() {
            Some(&first) if from.log_version < first => {
                LogPosition::new(first, LOG_HEADER_SIZE as u64)
            }
            _ => from,
        };

        let pending_versions: VecDeque<u64> = versions
            .into_iter()
            .filter(|v| *v >= from.log_version)
            .collect();

        if let Some(&first) = pending_versions.front() {
            if first != from.log_version {
                return Err(CoreError::corrupt_log(
                    from,
                    format!("log file for version {} is missing", from.log_version),
                ));
            }
        }

        Ok(Self {
            store,
            pending_versions,
            start_offset: Some(from.byte_offset),
            last_version: None,
            current: None,
            limit,
            buffer_size: buffer_size.max(MIN_BUFFER_SIZE),
            torn_tail: None,
            finished: false,
        })
    }

    /// Opens a cursor over the entries of a single version.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub fn single_version(
        store: Arc<dyn LogStore>,
        version: u64,
        buffer_size: usize,
    ) -> CoreResult<Self> {
        let exists = store.versions()?.contains(&version);
        Ok(Self {
            store,
            pending_versions: if exists {
                VecDeque::from([version])
            } else {
                VecDeque::new()
            },
            start_offset: None,
            last_version: None,
            current: None,
            limit: None,
            buffer_size: buffer_size.max(MIN_BUFFER_SIZE),
            torn_tail: None,
            finished: false,
        })
    }

    /// Where a frame cut off by a crash was found, once iteration reached it.
    #[must_use]
    pub fn torn_tail(&self) -> Option<LogPosition> {
        self.torn_tail
    }

    /// Position of the next frame to be read, if a file is open.
    #[must_use]
    pub fn position(&self) -> Option<LogPosition> {
        self.current
            .as_ref()
            .map(|file| LogPosition::new(file.version, file.offset))
    }

    /// Format of the file currently being read.
    #[must_use]
    pub fn current_format(&self) -> Option<FormatVersion> {
        self.current.as_ref().map(|file| file.format)
    }

    fn open_file(&mut self, version: u64, start: u64) -> CoreResult<Option<OpenFile>> {
        if let Some(previous) = self.last_version {
            if version != previous + 1 {
                return Err(CoreError::corrupt_log(
                    LogPosition::new(version, 0),
                    format!("log version {} is missing", previous + 1),
                ));
            }
        }
        self.last_version = Some(version);

        let header_position = LogPosition::new(version, 0);
        let backend = self.store.open(version)?;
        let mut size = backend.size().map_err(|source| CoreError::LogRead {
            position: header_position,
            source,
        })?;
        if let Some(limit) = self.limit {
            if limit.log_version == version {
                size = size.min(limit.byte_offset);
            }
        }

        if size < LOG_HEADER_SIZE as u64 {
            if self.pending_versions.is_empty() {
                if size > 0 {
                    self.torn_tail = Some(header_position);
                }
                return Ok(None);
            }
            return Err(CoreError::corrupt_log(
                header_position,
                "incomplete header in a log file that is not the newest",
            ));
        }

        let header = decode_header(backend.as_ref(), version).map_err(|err| match err {
            CoreError::Storage(source) => CoreError::LogRead {
                position: header_position,
                source,
            },
            other => other,
        })?;
        let offset = start.max(LOG_HEADER_SIZE as u64);
        if offset > size {
            return Err(CoreError::corrupt_log(
                LogPosition::new(version, start),
                format!("position is beyond the end of the file ({size} bytes)"),
            ));
        }

        Ok(Some(OpenFile {
            version,
            format: header.format_version,
            backend,
            size,
            offset,
            window: Vec::new(),
            window_start: offset,
        }))
    }

    /// Reads the next entry.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or damaged log contents.
    pub fn next_entry(&mut self) -> CoreResult<Option<PositionedEntry>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            if self.current.is_none() {
                let Some(version) = self.pending_versions.pop_front() else {
                    self.finished = true;
                    return Ok(None);
                };
                let start = self.start_offset.take().unwrap_or(LOG_HEADER_SIZE as u64);
                match self.open_file(version, start)? {
                    Some(file) => self.current = Some(file),
                    None => {
                        self.finished = true;
                        return Ok(None);
                    }
                }
            }

            let is_last = self.pending_versions.is_empty();
            let buffer_size = self.buffer_size;
            let Some(file) = self.current.as_mut() else {
                continue;
            };

            if file.remaining() == 0 {
                self.current = None;
                if is_last {
                    self.finished = true;
                    return Ok(None);
                }
                continue;
            }

            let position = LogPosition::new(file.version, file.offset);
            match file.decode_next(buffer_size)? {
                Ok(decoded) => {
                    file.offset += decoded.encoded_len as u64;
                    return Ok(Some(PositionedEntry {
                        entry: decoded.entry,
                        identifier: decoded.identifier,
                        format: file.format,
                        position,
                        end: LogPosition::new(file.version, file.offset),
                    }));
                }
                Err(err) if err.is_truncated() => {
                    if is_last {
                        debug!(%position, "log ends in a torn entry");
                        self.torn_tail = Some(position);
                        self.finished = true;
                        return Ok(None);
                    }
                    return Err(CoreError::corrupt_log(
                        position,
                        "truncated entry in a log file that is not the newest",
                    ));
                }
                Err(err) => return Err(CoreError::from_codec(err, position)),
            }
        }
    }
}

impl Iterator for LogEntryCursor {
    type Item = CoreResult<PositionedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
