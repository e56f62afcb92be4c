//! # Trellis Storage
//!
//! Byte stores under the Trellis transaction log and store snapshots.
//!
//! A backend holds bytes and a logical length and nothing else: framing,
//! checksums and positions belong to the log. The contract the log builds
//! its commit guarantee on is documented on [`StorageBackend`]; in short,
//! `flush` is the only point at which appended bytes become durable.
//!
//! - [`FileBackend`] keeps one file per log version.
//! - [`InMemoryBackend`] remembers how much was flushed, so tests can take
//!   the image a crash would leave behind.
//!
//! ```rust
//! use trellis_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.append(b"committed").unwrap();
//! backend.flush().unwrap();
//! backend.append(b" pending").unwrap();
//! assert_eq!(backend.crash_copy().data(), b"committed");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
