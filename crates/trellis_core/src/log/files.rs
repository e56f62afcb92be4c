//! The durable channel: versioned log files with one active writer.

use crate::error::{CoreError, CoreResult};
use crate::log::cursor::LogEntryCursor;
use crate::log::store::LogStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};
use trellis_codec::{FormatVersion, LogHeader, LogPosition, LOG_HEADER_SIZE};
use trellis_storage::StorageBackend;

struct ActiveLog {
    version: u64,
    backend: Box<dyn StorageBackend>,
    size: u64,
}

impl ActiveLog {
    fn position(&self) -> LogPosition {
        LogPosition::new(self.version, self.size)
    }
}

/// Versioned transaction log files.
///
/// Reading is always possible. Writing requires [`LogFiles::activate`],
/// which happens once recovery has cut the log back to a clean frame
/// boundary.
///
/// `flush` is the only durability point: bytes appended since the last
/// flush may be lost in a crash, and read cursors opened while a writer is
/// active never see past the durable position. Files retired by
/// [`LogFiles::rotate`] are synced by the next flush, before it publishes
/// any later position.
pub struct LogFiles {
    store: Arc<dyn LogStore>,
    max_log_size: u64,
    read_buffer_size: usize,
    active: Mutex<Option<ActiveLog>>,
    retired: Mutex<Vec<ActiveLog>>,
    durable: Mutex<LogPosition>,
}

impl LogFiles {
    /// Creates log files on top of `store`.
    pub fn new(store: Arc<dyn LogStore>, max_log_size: u64, read_buffer_size: usize) -> Self {
        Self {
            store,
            max_log_size,
            read_buffer_size,
            active: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
            durable: Mutex::new(LogPosition::default()),
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Returns the versions present, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub fn versions(&self) -> CoreResult<Vec<u64>> {
        self.store.versions()
    }

    /// Reads the header of `version`.
    ///
    /// Returns `None` if the file is shorter than a header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is damaged or cannot be read.
    pub fn read_header(&self, version: u64) -> CoreResult<Option<LogHeader>> {
        read_header(self.store.as_ref(), version)
    }

    /// Position of the first entry in `version`.
    #[must_use]
    pub const fn first_entry_position(version: u64) -> LogPosition {
        LogPosition::new(version, LOG_HEADER_SIZE as u64)
    }

    /// Opens a cursor over all entries from `from` onwards.
    ///
    /// While a writer is active the cursor stops at the durable position.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub fn open_read_cursor(&self, from: LogPosition) -> CoreResult<LogEntryCursor> {
        let limit = if self.is_active() {
            Some(self.durable_position())
        } else {
            None
        };
        LogEntryCursor::new(Arc::clone(&self.store), from, limit, self.read_buffer_size)
    }

    /// Opens a cursor over the entries of one version only.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub fn open_version_cursor(&self, version: u64) -> CoreResult<LogEntryCursor> {
        LogEntryCursor::single_version(Arc::clone(&self.store), version, self.read_buffer_size)
    }

    /// Opens a cursor over the whole log.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub fn open_cursor_from_start(&self) -> CoreResult<LogEntryCursor> {
        let first = self.versions()?.first().copied().unwrap_or(0);
        self.open_read_cursor(Self::first_entry_position(first))
    }

    /// Returns true once [`LogFiles::activate`] has been called.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Prepares the newest file for appending and returns the tail position.
    ///
    /// A missing or header-less newest file gets a fresh header recording
    /// `last_committed_tx_id`. A legacy-format newest file is left alone and
    /// a new current-format version is started after it.
    ///
    /// # Errors
    ///
    /// Returns an error if the newest header is damaged or on I/O failure.
    pub fn activate(&self, last_committed_tx_id: u64) -> CoreResult<LogPosition> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(CoreError::invalid_operation("log files are already active"));
        }

        let versions = self.store.versions()?;
        let log = match versions.last().copied() {
            None => self.create_file(0, last_committed_tx_id)?,
            Some(version) => {
                let mut backend = self.store.open(version)?;
                let size = backend.size()?;
                if size < LOG_HEADER_SIZE as u64 {
                    debug!(version, size, "rewriting incomplete log header");
                    if size > 0 {
                        backend.truncate(0)?;
                    }
                    drop(backend);
                    self.create_file(version, last_committed_tx_id)?
                } else {
                    let header = decode_header(backend.as_ref(), version)?;
                    if header.format_version == FormatVersion::Legacy {
                        info!(version, "newest log file is legacy format, starting a new version");
                        drop(backend);
                        self.create_file(version + 1, last_committed_tx_id)?
                    } else {
                        backend.flush()?;
                        ActiveLog {
                            version,
                            backend,
                            size,
                        }
                    }
                }
            }
        };

        let position = log.position();
        *self.durable.lock() = position;
        *active = Some(log);
        debug!(%position, "log files active");
        Ok(position)
    }

    fn create_file(&self, version: u64, last_committed_tx_id: u64) -> CoreResult<ActiveLog> {
        let mut log = self.start_file(version, last_committed_tx_id)?;
        log.backend.sync()?;
        Ok(log)
    }

    /// Writes the header of a new version without forcing it.
    fn start_file(&self, version: u64, last_committed_tx_id: u64) -> CoreResult<ActiveLog> {
        let mut backend = self.store.open(version)?;
        if backend.size()? > 0 {
            backend.truncate(0)?;
        }
        let header = LogHeader::current(version, last_committed_tx_id).encode();
        backend.append(&header)?;
        Ok(ActiveLog {
            version,
            backend,
            size: header.len() as u64,
        })
    }

    /// Appends raw bytes to the active file.
    ///
    /// Returns the positions of the first byte written and of the byte after
    /// the last one.
    ///
    /// # Errors
    ///
    /// Returns an error if no writer is active or the write fails.
    pub fn append(&self, bytes: &[u8]) -> CoreResult<(LogPosition, LogPosition)> {
        let mut active = self.active.lock();
        let log = active
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("log files are not open for writing"))?;
        let offset = log.backend.append(bytes)?;
        log.size = offset + bytes.len() as u64;
        Ok((
            LogPosition::new(log.version, offset),
            LogPosition::new(log.version, log.size),
        ))
    }

    /// Forces everything appended so far to durable storage.
    ///
    /// Returns the new durable position.
    ///
    /// # Errors
    ///
    /// Returns an error if no writer is active or the flush fails.
    pub fn flush(&self) -> CoreResult<LogPosition> {
        self.sync_retired()?;
        let mut active = self.active.lock();
        let log = active
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("log files are not open for writing"))?;
        log.backend.flush()?;
        let position = log.position();
        let mut durable = self.durable.lock();
        if position > *durable {
            *durable = position;
        }
        Ok(position)
    }

    /// Position the next append will write at.
    #[must_use]
    pub fn current_position(&self) -> LogPosition {
        match self.active.lock().as_ref() {
            Some(log) => log.position(),
            None => *self.durable.lock(),
        }
    }

    /// Position up to which everything is durable.
    #[must_use]
    pub fn durable_position(&self) -> LogPosition {
        *self.durable.lock()
    }

    /// Returns true if the active file has reached the rotation size.
    #[must_use]
    pub fn should_rotate(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|log| log.size >= self.max_log_size)
    }

    /// Starts the next version and retires the active file.
    ///
    /// Nothing is forced here. The retired file is synced by the next
    /// [`LogFiles::flush`], so the durable position never moves past it
    /// before its bytes are on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if no writer is active or the new header cannot be
    /// written; the active file is unchanged then.
    pub fn rotate(&self, last_committed_tx_id: u64) -> CoreResult<u64> {
        let mut active = self.active.lock();
        let next_version = active
            .as_ref()
            .map(|log| log.version + 1)
            .ok_or_else(|| CoreError::invalid_operation("log files are not open for writing"))?;

        let next = self.start_file(next_version, last_committed_tx_id)?;
        if let Some(previous) = active.replace(next) {
            self.retired.lock().push(previous);
        }
        info!(version = next_version, last_committed_tx_id, "rotated transaction log");
        Ok(next_version)
    }

    /// Syncs retired files oldest first, publishing each one's end as it
    /// becomes durable.
    fn sync_retired(&self) -> CoreResult<()> {
        let mut retired = self.retired.lock();
        while let Some(log) = retired.first_mut() {
            log.backend.sync()?;
            let position = log.position();
            {
                let mut durable = self.durable.lock();
                if position > *durable {
                    *durable = position;
                }
            }
            debug!(version = log.version, "synced retired log file");
            retired.remove(0);
        }
        Ok(())
    }

    /// Cuts the log back to `position`, deleting every later version.
    ///
    /// Only allowed before the writer is activated.
    ///
    /// # Errors
    ///
    /// Returns an error if a writer is active or on I/O failure.
    pub fn truncate(&self, position: LogPosition) -> CoreResult<()> {
        if self.is_active() {
            return Err(CoreError::invalid_operation(
                "cannot truncate log files while a writer is active",
            ));
        }

        for version in self.store.versions()? {
            if version > position.log_version {
                info!(version, "removing log file past truncation point");
                self.store.remove(version)?;
            } else if version == position.log_version {
                let mut backend = self.store.open(version)?;
                let size = backend.size()?;
                // Cutting into the header leaves a file that activation rewrites.
                let keep = if position.byte_offset < LOG_HEADER_SIZE as u64 {
                    0
                } else {
                    position.byte_offset
                };
                if keep < size {
                    info!(%position, removed = size - keep, "truncating transaction log");
                    backend.truncate(keep)?;
                }
            }
        }
        Ok(())
    }

    /// Flushes and releases the active file.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn close(&self) -> CoreResult<()> {
        self.sync_retired()?;
        let mut active = self.active.lock();
        if let Some(mut log) = active.take() {
            log.backend.flush()?;
            let mut durable = self.durable.lock();
            *durable = log.position();
        }
        Ok(())
    }
}

impl std::fmt::Debug for LogFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFiles")
            .field("store", &self.store)
            .field("max_log_size", &self.max_log_size)
            .field("durable", &self.durable_position())
            .finish_non_exhaustive()
    }
}

pub(crate) fn read_header(store: &dyn LogStore, version: u64) -> CoreResult<Option<LogHeader>> {
    let backend = store.open(version)?;
    if backend.size()? < LOG_HEADER_SIZE as u64 {
        return Ok(None);
    }
    decode_header(backend.as_ref(), version).map(Some)
}

pub(crate) fn decode_header(backend: &dyn StorageBackend, version: u64) -> CoreResult<LogHeader> {
    let position = LogPosition::new(version, 0);
    let bytes = backend.read_at(0, LOG_HEADER_SIZE)?;
    let header = LogHeader::decode(&bytes).map_err(|e| CoreError::from_codec(e, position))?;
    if header.log_version != version {
        return Err(CoreError::corrupt_log(
            position,
            format!("header names version {}", header.log_version),
        ));
    }
    Ok(header)
}
