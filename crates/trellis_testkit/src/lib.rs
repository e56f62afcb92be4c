//! # Trellis Testkit
//!
//! Test utilities for Trellis.
//!
//! This crate provides:
//! - Test fixtures: databases over in-memory or temporary logs, and a
//!   builder for legacy-format log files
//! - A crash-injecting log store and a harness that sweeps crash points
//!   through a commit workload
//! - Property-based test generators using proptest
//! - Fuzz targets for the log decoder and recovery
//! - Stress testing utilities for group commit
//!
//! ## Usage
//!
//! ```rust,ignore
//! use trellis_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_database() {
//!     with_temp_db(|db| {
//!         db.create_node(&[1]);
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod fuzz;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::fuzz::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use fuzz::*;
pub use generators::*;
pub use stress::*;
