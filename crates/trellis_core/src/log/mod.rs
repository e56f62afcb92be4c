//! The transaction log.
//!
//! Physical files and their store live in [`files`] and [`store`]. Reading
//! is layered: [`LogEntryCursor`] yields raw entries,
//! [`ReorderingCursor`] regroups interleaved legacy transactions and
//! [`TransactionCursor`] assembles committed transactions.

pub mod appender;
pub mod cursor;
pub mod files;
pub mod reorder;
pub mod store;
pub mod transaction;

pub use appender::{Commitment, LogForcer, TransactionAppender};
pub use cursor::{LogEntryCursor, PositionedEntry};
pub use files::LogFiles;
pub use reorder::ReorderingCursor;
pub use store::{FileLogStore, LogStore, MemoryLogStore, LEGACY_SUFFIX, LOG_FILE_PREFIX};
pub use transaction::{
    transaction_checksum, CommittedTransaction, TransactionCursor, TransactionRepresentation,
};

use crate::error::CoreResult;
use trellis_codec::LogPosition;

/// Committed transactions from `from` onwards, in transaction order.
pub type TransactionStream = TransactionCursor<ReorderingCursor<LogEntryCursor>>;

/// Opens a stream of committed transactions starting at `from`.
///
/// # Errors
///
/// Returns an error if the log files cannot be listed.
pub fn read_transactions(files: &LogFiles, from: LogPosition) -> CoreResult<TransactionStream> {
    let cursor = files.open_read_cursor(from)?;
    Ok(TransactionCursor::new(ReorderingCursor::new(cursor)))
}
