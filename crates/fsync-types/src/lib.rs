pub mod attributes;
pub mod encoding;
pub mod flags;
pub mod handle;
pub mod limits;

pub use attributes::ObjectAttributes;
pub use flags::{AccessMask, ObjectFlags};
pub use handle::{Handle, HandleIndex, handle_to_index, index_to_handle};

use std::fmt;

/// Kind of synchronization object stored in a shared state slot.
///
/// The discriminant is the type tag written into handle cache records and
/// sent to the authority; 0 is reserved for "no object".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
#[non_exhaustive]
pub enum ObjectType {
    Semaphore = 1,
}

impl ObjectType {
    /// Raw tag value as stored in records and on the wire.
    #[inline]
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        self as u32
    }

    /// Parse a raw tag. Returns `None` for 0 and for unknown kinds.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Semaphore),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Semaphore => f.write_str("semaphore"),
        }
    }
}

/// Position of an object's shared state within the backing file, in units
/// of [`limits::STATE_BLOCK_SIZE`].
///
/// Assigned by the authority at creation time and stable for the lifetime of
/// the handle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SlotIndex(u32);

impl SlotIndex {
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Byte offset of this slot within the backing file.
    #[inline]
    #[must_use]
    pub const fn byte_offset(self) -> u64 {
        self.0 as u64 * limits::STATE_BLOCK_SIZE as u64
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SlotIndex {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}
