//! Commands understood by the graph store.

use crate::engine::ApplyError;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// A node as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node id.
    pub id: u64,
    /// Label tokens. Fixed at creation.
    pub labels: BTreeSet<u32>,
    /// Properties by key.
    pub properties: BTreeMap<String, PropertyValue>,
}

/// A relationship as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    /// Relationship id.
    pub id: u64,
    /// Relationship type token.
    pub rel_type: u32,
    /// Start node id.
    pub start: u64,
    /// End node id.
    pub end: u64,
    /// Properties by key.
    pub properties: BTreeMap<String, PropertyValue>,
}

/// One change to the graph store, as carried in a log command entry.
///
/// Record commands carry both images so that applying one only needs the
/// after-image; replaying it any number of times leaves the same record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphCommand {
    /// A node was created, changed or deleted.
    Node {
        /// Node id.
        id: u64,
        /// Record before the change, `None` on creation.
        before: Option<NodeRecord>,
        /// Record after the change, `None` on deletion.
        after: Option<NodeRecord>,
    },
    /// A relationship was created, changed or deleted.
    Relationship {
        /// Relationship id.
        id: u64,
        /// Record before the change, `None` on creation.
        before: Option<RelationshipRecord>,
        /// Record after the change, `None` on deletion.
        after: Option<RelationshipRecord>,
    },
    /// Change to a node count.
    NodeCount {
        /// Label token, or `NO_TOKEN` for all nodes.
        label: u32,
        /// Change.
        delta: i64,
    },
    /// Change to a relationship count.
    RelationshipCount {
        /// Start label token or `NO_TOKEN`.
        start: u32,
        /// Type token or `NO_TOKEN`.
        rel_type: u32,
        /// End label token or `NO_TOKEN`.
        end: u32,
        /// Change.
        delta: i64,
    },
}

impl GraphCommand {
    /// Encodes the command as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| CoreError::encoding(format!("graph command: {e}")))?;
        Ok(buf)
    }

    /// Decodes a command from CBOR.
    ///
    /// # Errors
    ///
    /// Returns `ApplyError::Decode` if the bytes are not a command.
    pub fn decode(bytes: &[u8]) -> Result<Self, ApplyError> {
        ciborium::de::from_reader(bytes).map_err(|e| ApplyError::Decode {
            message: e.to_string(),
        })
    }
}
