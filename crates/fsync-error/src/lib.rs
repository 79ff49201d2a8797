use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Status codes returned by the coordinating authority.
///
/// The numeric values are the NT status codes the authority speaks on the
/// wire. Anything the client does not recognise is preserved in
/// [`ServerStatus::Other`] so it can be handed back to the caller verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ServerStatus {
    Success,
    /// A named object with this name already exists; the reply carries the
    /// existing handle and slot.
    ObjectNameExists,
    NotImplemented,
    InvalidParameter,
    AccessDenied,
    NoMemory,
    ObjectNameInvalid,
    ObjectTypeMismatch,
    InvalidHandle,
    Other(u32),
}

impl ServerStatus {
    const SUCCESS: u32 = 0x0000_0000;
    const OBJECT_NAME_EXISTS: u32 = 0x4000_0000;
    const NOT_IMPLEMENTED: u32 = 0xC000_0002;
    const INVALID_HANDLE: u32 = 0xC000_0008;
    const INVALID_PARAMETER: u32 = 0xC000_000D;
    const NO_MEMORY: u32 = 0xC000_0017;
    const ACCESS_DENIED: u32 = 0xC000_0022;
    const OBJECT_TYPE_MISMATCH: u32 = 0xC000_0024;
    const OBJECT_NAME_INVALID: u32 = 0xC000_0033;

    /// Wire value.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::Success => Self::SUCCESS,
            Self::ObjectNameExists => Self::OBJECT_NAME_EXISTS,
            Self::NotImplemented => Self::NOT_IMPLEMENTED,
            Self::InvalidParameter => Self::INVALID_PARAMETER,
            Self::AccessDenied => Self::ACCESS_DENIED,
            Self::NoMemory => Self::NO_MEMORY,
            Self::ObjectNameInvalid => Self::OBJECT_NAME_INVALID,
            Self::ObjectTypeMismatch => Self::OBJECT_TYPE_MISMATCH,
            Self::InvalidHandle => Self::INVALID_HANDLE,
            Self::Other(raw) => raw,
        }
    }

    /// Parse a wire value. Never fails: unknown codes become `Other`.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            Self::SUCCESS => Self::Success,
            Self::OBJECT_NAME_EXISTS => Self::ObjectNameExists,
            Self::NOT_IMPLEMENTED => Self::NotImplemented,
            Self::INVALID_PARAMETER => Self::InvalidParameter,
            Self::ACCESS_DENIED => Self::AccessDenied,
            Self::NO_MEMORY => Self::NoMemory,
            Self::OBJECT_NAME_INVALID => Self::ObjectNameInvalid,
            Self::OBJECT_TYPE_MISMATCH => Self::ObjectTypeMismatch,
            Self::INVALID_HANDLE => Self::InvalidHandle,
            other => Self::Other(other),
        }
    }

    /// Whether a reply with this status carries a usable handle and slot.
    ///
    /// "Name exists" is informational: the caller gets the existing object.
    #[must_use]
    pub const fn yields_object(self) -> bool {
        matches!(self, Self::Success | Self::ObjectNameExists)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Success => "STATUS_SUCCESS",
            Self::ObjectNameExists => "STATUS_OBJECT_NAME_EXISTS",
            Self::NotImplemented => "STATUS_NOT_IMPLEMENTED",
            Self::InvalidParameter => "STATUS_INVALID_PARAMETER",
            Self::AccessDenied => "STATUS_ACCESS_DENIED",
            Self::NoMemory => "STATUS_NO_MEMORY",
            Self::ObjectNameInvalid => "STATUS_OBJECT_NAME_INVALID",
            Self::ObjectTypeMismatch => "STATUS_OBJECT_TYPE_MISMATCH",
            Self::InvalidHandle => "STATUS_INVALID_HANDLE",
            Self::Other(raw) => return write!(f, "status {raw:#010x}"),
        };
        f.write_str(label)
    }
}

/// Primary error type for the fsync crates.
///
/// Errors fall into three tiers:
/// - fatal configuration errors ([`FsyncError::is_fatal`]), which the host
///   process is expected to treat as unrecoverable;
/// - authority failures, which are handed back to the caller unchanged;
/// - everything else, which is an ordinary I/O or protocol failure.
///
/// Degraded conditions (cache overflow, a page that could not be mapped) are
/// not errors at all; they are logged and the call proceeds without the fast
/// path.
#[derive(Error, Debug)]
pub enum FsyncError {
    // === Configuration (fatal) ===
    /// The backing shared file does not exist. Only the authority may create
    /// it, so its absence means the authority runs without fsync support.
    #[error(
        "fsync shared memory file '{path}' is missing; make sure no stale authority is running without fsync"
    )]
    BackingFileMissing { path: PathBuf },

    /// The local feature gate and the authority disagree about whether fsync
    /// is in use.
    #[error("fsync configuration mismatch: {detail}")]
    ConfigMismatch { detail: String },

    // === Authority ===
    /// The authority refused a request. The status is returned verbatim.
    #[error("authority returned {status}")]
    Authority { status: ServerStatus },

    /// A frame from the authority violated the wire protocol.
    #[error("authority protocol error: {detail}")]
    Protocol { detail: String },

    /// Object attributes could not be serialized for the authority.
    #[error("invalid object attributes: {detail}")]
    InvalidAttributes { detail: String },

    // === Futex ===
    /// The kernel does not implement the requested futex operation.
    #[error("futex operation {op} is not implemented by this kernel")]
    FutexNotImplemented { op: i32 },

    // === Runtime ===
    /// The subsystem is disabled in this process; every entry point is inert.
    #[error("fsync is disabled in this process")]
    Disabled,

    /// OS-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsyncError {
    /// Whether this error signals an environment misconfiguration that the
    /// process cannot recover from.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BackingFileMissing { .. } | Self::ConfigMismatch { .. }
        )
    }

    /// The authority status carried by this error, if it came from the
    /// authority.
    #[must_use]
    pub const fn status(&self) -> Option<ServerStatus> {
        match self {
            Self::Authority { status } => Some(*status),
            _ => None,
        }
    }

    pub fn authority(status: ServerStatus) -> Self {
        Self::Authority { status }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }

    pub fn mismatch(detail: impl Into<String>) -> Self {
        Self::ConfigMismatch {
            detail: detail.into(),
        }
    }

    pub fn invalid_attributes(detail: impl Into<String>) -> Self {
        Self::InvalidAttributes {
            detail: detail.into(),
        }
    }

    /// Build an I/O error from a raw errno value.
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(errno))
    }
}

pub type Result<T> = std::result::Result<T, FsyncError>;
