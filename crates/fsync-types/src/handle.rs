//! Process handles and the authority's handle numbering convention.

use std::fmt;
use std::num::NonZeroU32;

/// Opaque per-process handle to a synchronization object.
///
/// Handles are issued by the coordinating authority. The value 0 is never a
/// valid handle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Handle(NonZeroU32);

impl Handle {
    /// Wrap a raw handle value. Returns `None` for 0.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0.get())
    }
}

/// Zero-based position of a handle in the authority's handle table.
pub type HandleIndex = u32;

/// Low bits of a handle value that carry no index information.
const HANDLE_SHIFT: u32 = 2;

/// Map a handle to its zero-based table index.
///
/// The authority hands out handles as `(index + 1) << 2`; the two low bits
/// are reserved. This convention belongs to the authority, so every place
/// that needs it goes through this function and [`index_to_handle`].
///
/// Returns `None` for handle values below 4, which no authority issues.
#[inline]
#[must_use]
pub const fn handle_to_index(handle: Handle) -> Option<HandleIndex> {
    match handle.get() >> HANDLE_SHIFT {
        0 => None,
        shifted => Some(shifted - 1),
    }
}

/// Inverse of [`handle_to_index`]. Returns `None` when the index does not
/// fit the handle encoding.
#[inline]
#[must_use]
pub const fn index_to_handle(index: HandleIndex) -> Option<Handle> {
    if index >= (u32::MAX >> HANDLE_SHIFT) {
        return None;
    }
    Handle::new((index + 1) << HANDLE_SHIFT)
}
