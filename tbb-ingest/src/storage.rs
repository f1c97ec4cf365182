//! Storage backends for ingested time series.
//!
//! An output is a tree: attributes on the root, named groups (one per
//! station), and inside each group extensible 1-D `i16` arrays (one per
//! channel) that carry their own attributes. The ingestion pipeline only
//! talks to the [`Storage`] trait, so the container format is swappable.

pub mod dir;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dir::{DirFactory, DirStorage};
pub use memory::{MemoryArray, MemoryFactory, MemoryGroup, MemoryOutput, MemoryStorage};

/// Chunk size hint for channel arrays, in samples.
pub const DEFAULT_CHUNK_SIZE: usize = 5000;

/// Handle to a group created by [`Storage::create_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(usize);

/// Handle to an array created by [`Storage::create_array`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayId(usize);

impl GroupId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0
    }
}

impl ArrayId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0
    }
}

/// Where an attribute lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Root,
    Group(GroupId),
    Array(ArrayId),
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    UInt(u64),
    Int(i64),
    Float(f64),
    Text(String),
    UIntVec(Vec<u64>),
    IntVec(Vec<i64>),
    FloatVec(Vec<f64>),
    TextVec(Vec<String>),
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<f64>> for AttrValue {
    fn from(v: Vec<f64>) -> Self {
        Self::FloatVec(v)
    }
}

impl From<Vec<&str>> for AttrValue {
    fn from(v: Vec<&str>) -> Self {
        Self::TextVec(v.into_iter().map(str::to_owned).collect())
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UInt(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::UIntVec(v) => write!(f, "{v:?}"),
            Self::IntVec(v) => write!(f, "{v:?}"),
            Self::FloatVec(v) => write!(f, "{v:?}"),
            Self::TextVec(v) => write!(f, "{v:?}"),
        }
    }
}

/// Attribute map as stored by the backends.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Storage-layer failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("attribute encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("output '{0}' already exists")]
    AlreadyExists(String),

    #[error("'{0}' already exists in this output")]
    DuplicateName(String),

    #[error("unknown group handle {0:?}")]
    UnknownGroup(GroupId),

    #[error("unknown array handle {0:?}")]
    UnknownArray(ArrayId),

    #[error("array is closed")]
    Closed,

    #[error("write of {count} samples at {offset} exceeds array length {len}")]
    OutOfBounds { offset: u64, count: usize, len: u64 },

    #[error("array of {requested} samples exceeds the backend limit of {limit}")]
    TooLarge { requested: u64, limit: u64 },
}

/// The operations the ingestion pipeline needs from a container.
pub trait Storage: Send {
    /// Creates a named group below the root.
    ///
    /// # Errors
    ///
    /// [`StorageError::DuplicateName`] if the group exists.
    fn create_group(&mut self, name: &str) -> Result<GroupId, StorageError>;

    /// Creates an empty extensible `i16` array inside `group`.
    ///
    /// # Errors
    ///
    /// Unknown group, duplicate name, or backend I/O failure.
    fn create_array(
        &mut self,
        group: GroupId,
        name: &str,
        chunk: usize,
    ) -> Result<ArrayId, StorageError>;

    /// Grows `array` to `new_len` samples, zero filled. Never shrinks.
    ///
    /// # Errors
    ///
    /// Unknown or closed array, or backend I/O failure.
    fn extend_array(&mut self, array: ArrayId, new_len: u64) -> Result<(), StorageError>;

    /// Writes `data` starting at sample `offset`.
    ///
    /// # Errors
    ///
    /// [`StorageError::OutOfBounds`] if the write runs past the array length.
    fn write_at(&mut self, array: ArrayId, offset: u64, data: &[i16]) -> Result<(), StorageError>;

    /// Current array length in samples.
    ///
    /// # Errors
    ///
    /// Unknown array.
    fn array_len(&self, array: ArrayId) -> Result<u64, StorageError>;

    /// Sets or replaces an attribute.
    ///
    /// # Errors
    ///
    /// Unknown node or backend failure.
    fn set_attribute(&mut self, node: Node, name: &str, value: AttrValue)
    -> Result<(), StorageError>;

    /// Reads an attribute back.
    ///
    /// # Errors
    ///
    /// Unknown node.
    fn attribute(&self, node: Node, name: &str) -> Result<Option<AttrValue>, StorageError>;

    /// Releases an array. Further writes to it fail with [`StorageError::Closed`].
    ///
    /// # Errors
    ///
    /// Unknown array or flush failure.
    fn close_array(&mut self, array: ArrayId) -> Result<(), StorageError>;

    /// Closes every open array and the output itself.
    ///
    /// # Errors
    ///
    /// Flush failure.
    fn close(&mut self) -> Result<(), StorageError>;
}

/// Creates fresh named outputs ("files").
pub trait StorageFactory {
    type Output: Storage;

    /// Whether `name` is already taken.
    fn exists(&self, name: &str) -> bool;

    /// Creates a new output called `name`.
    ///
    /// # Errors
    ///
    /// [`StorageError::AlreadyExists`] if `name` is taken, or backend failure.
    fn create(&self, name: &str) -> Result<Self::Output, StorageError>;
}

/// Checks that `count` samples at `offset` fit in an array of `len` samples.
pub(crate) fn check_bounds(offset: u64, count: usize, len: u64) -> Result<(), StorageError> {
    match offset.checked_add(count as u64) {
        Some(end) if end <= len => Ok(()),
        _ => Err(StorageError::OutOfBounds { offset, count, len }),
    }
}
