//! Authority wire protocol: length-delimited frames with a big-endian header
//! and little-endian payloads.
//!
//! ```text
//! [len_be:u32][version_be:u16][kind_be:u16][request_id:u64_be][payload...]
//! ```
//!
//! `len_be` counts everything after itself (12 + payload length).

use std::fmt;
use std::io::{self, Read};

use fsync_error::{FsyncError, Result, ServerStatus};
use fsync_types::encoding::{
    Cursor, append_i32_le, append_u16_be, append_u32_be, append_u32_le, append_u64_be, read_u16_be,
    read_u32_be, read_u64_be,
};
use fsync_types::{AccessMask, Handle, ObjectAttributes, SlotIndex};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Minimum `len_be`: version(2) + kind(2) + request_id(8).
pub const FRAME_MIN_LEN_BE: u32 = 12;

/// Maximum `len_be`: 1 MiB, well above the largest attribute block.
pub const FRAME_MAX_LEN_BE: u32 = 1024 * 1024;

pub const PROTOCOL_VERSION: u16 = 1;

const FRAME_HEADER_WIRE_BYTES: usize = 16;

const CREATE_FIXED_BYTES: usize = 20;
const QUERY_BYTES: usize = 4;
const REPLY_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Client → authority: create (or open by name) a sync object.
    CreateFsync,
    /// Client → authority: look up an existing handle.
    QueryObject,
    /// Authority → client: answer to either request.
    Reply,
}

impl MessageKind {
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::CreateFsync => 1,
            Self::QueryObject => 2,
            Self::Reply => 3,
        }
    }

    #[must_use]
    pub const fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::CreateFsync),
            2 => Some(Self::QueryObject),
            3 => Some(Self::Reply),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::CreateFsync => "CREATE_FSYNC",
            Self::QueryObject => "QUERY_OBJECT",
            Self::Reply => "REPLY",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// FrameError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    TooShort,
    LenTooSmall(u32),
    LenTooLarge(u32),
    UnknownVersion(u16),
    UnknownKind(u16),
    PayloadTruncated { expected: u32, actual: usize },
    PayloadTooLarge(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => f.write_str("frame buffer too short for header"),
            Self::LenTooSmall(v) => write!(f, "len_be {v} below minimum {FRAME_MIN_LEN_BE}"),
            Self::LenTooLarge(v) => write!(f, "len_be {v} exceeds cap {FRAME_MAX_LEN_BE}"),
            Self::UnknownVersion(v) => write!(f, "unknown protocol version {v}"),
            Self::UnknownKind(v) => write!(f, "unknown message kind {v}"),
            Self::PayloadTruncated { expected, actual } => {
                write!(
                    f,
                    "payload truncated: expected {expected} bytes, got {actual}"
                )
            }
            Self::PayloadTooLarge(len) => write!(f, "payload of {len} bytes does not fit a frame"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for FsyncError {
    fn from(err: FrameError) -> Self {
        Self::protocol(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode to wire bytes.
    ///
    /// # Errors
    ///
    /// [`FrameError::PayloadTooLarge`] if the payload exceeds the frame cap.
    pub fn encode(&self) -> std::result::Result<Vec<u8>, FrameError> {
        let payload_len = self.payload.len();
        let len_be = u32::try_from(payload_len)
            .ok()
            .and_then(|len| len.checked_add(FRAME_MIN_LEN_BE))
            .filter(|len| *len <= FRAME_MAX_LEN_BE)
            .ok_or(FrameError::PayloadTooLarge(payload_len))?;
        let mut buf = Vec::with_capacity(FRAME_HEADER_WIRE_BYTES + payload_len);
        append_u32_be(&mut buf, len_be);
        append_u16_be(&mut buf, PROTOCOL_VERSION);
        append_u16_be(&mut buf, self.kind.to_u16());
        append_u64_be(&mut buf, self.request_id);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode one frame from the front of `buf`. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, FrameError> {
        if buf.len() < FRAME_HEADER_WIRE_BYTES {
            return Err(FrameError::TooShort);
        }
        let len_be = read_u32_be(&buf[0..4]).ok_or(FrameError::TooShort)?;
        check_len(len_be)?;
        let version = read_u16_be(&buf[4..6]).ok_or(FrameError::TooShort)?;
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnknownVersion(version));
        }
        let kind_raw = read_u16_be(&buf[6..8]).ok_or(FrameError::TooShort)?;
        let kind = MessageKind::from_u16(kind_raw).ok_or(FrameError::UnknownKind(kind_raw))?;
        let request_id = read_u64_be(&buf[8..16]).ok_or(FrameError::TooShort)?;

        let payload_len = (len_be - FRAME_MIN_LEN_BE) as usize;
        let remaining = &buf[FRAME_HEADER_WIRE_BYTES..];
        if remaining.len() < payload_len {
            return Err(FrameError::PayloadTruncated {
                expected: len_be - FRAME_MIN_LEN_BE,
                actual: remaining.len(),
            });
        }
        Ok(Self {
            kind,
            request_id,
            payload: remaining[..payload_len].to_vec(),
        })
    }
}

fn check_len(len_be: u32) -> std::result::Result<(), FrameError> {
    if len_be < FRAME_MIN_LEN_BE {
        return Err(FrameError::LenTooSmall(len_be));
    }
    if len_be > FRAME_MAX_LEN_BE {
        return Err(FrameError::LenTooLarge(len_be));
    }
    Ok(())
}

/// Read one frame from a stream.
///
/// Returns `Ok(None)` if the stream ends cleanly before the first byte of a
/// frame; a stream ending mid-frame is an error.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0_u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    let len_be = u32::from_be_bytes(len_buf);
    check_len(len_be)?;

    let mut buf = vec![0_u8; 4 + len_be as usize];
    buf[..4].copy_from_slice(&len_buf);
    reader.read_exact(&mut buf[4..])?;
    Ok(Some(Frame::decode(&buf)?))
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Request to create a sync object.
///
/// `object_type` is the raw tag so that unknown kinds (and the 0 used for
/// the authority support query) reach the authority unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub object_type: u32,
    pub access: AccessMask,
    /// First type-specific value (a semaphore's initial count).
    pub low: i32,
    /// Second type-specific value (a semaphore's maximum count).
    pub high: i32,
    pub attributes: Option<ObjectAttributes>,
}

impl CreateRequest {
    /// The request sent by the feature gate to learn whether the authority
    /// runs with fsync.
    #[must_use]
    pub const fn support_query() -> Self {
        Self {
            object_type: 0,
            access: AccessMask::empty(),
            low: 0,
            high: 0,
            attributes: None,
        }
    }

    /// Layout: `type:u32, access:u32, low:i32, high:i32, attr_len:u32, attrs`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let attrs = match &self.attributes {
            Some(attrs) => attrs.to_bytes()?,
            None => Vec::new(),
        };
        let attr_len = u32::try_from(attrs.len())
            .map_err(|_| FsyncError::invalid_attributes("attribute block too large"))?;
        let mut buf = Vec::with_capacity(CREATE_FIXED_BYTES + attrs.len());
        append_u32_le(&mut buf, self.object_type);
        append_u32_le(&mut buf, self.access.bits());
        append_i32_le(&mut buf, self.low);
        append_i32_le(&mut buf, self.high);
        append_u32_le(&mut buf, attr_len);
        buf.extend_from_slice(&attrs);
        Ok(buf)
    }

    #[must_use]
    pub fn from_bytes(src: &[u8]) -> Option<Self> {
        let mut cur = Cursor::new(src);
        let object_type = cur.u32_le()?;
        let access = AccessMask::from_bits_retain(cur.u32_le()?);
        let low = cur.i32_le()?;
        let high = cur.i32_le()?;
        let attr_len = usize::try_from(cur.u32_le()?).ok()?;
        let attributes = match attr_len {
            0 => None,
            n => Some(ObjectAttributes::from_bytes(cur.take(n)?)?),
        };
        if cur.remaining() != 0 {
            return None;
        }
        Some(Self {
            object_type,
            access,
            low,
            high,
            attributes,
        })
    }
}

/// Request to look up an existing handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryRequest {
    pub handle: Handle,
}

impl QueryRequest {
    #[must_use]
    pub fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(QUERY_BYTES);
        append_u32_le(&mut buf, self.handle.get());
        buf
    }

    #[must_use]
    pub fn from_bytes(src: &[u8]) -> Option<Self> {
        if src.len() != QUERY_BYTES {
            return None;
        }
        let handle = Handle::new(Cursor::new(src).u32_le()?)?;
        Some(Self { handle })
    }
}

/// Authority answer: `status:u32, handle:u32, shm_idx:u32, type:u32`.
///
/// `handle` and `slot` are meaningful only when the status yields an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub status: ServerStatus,
    pub handle: Option<Handle>,
    pub slot: SlotIndex,
    pub object_type: u32,
}

impl Reply {
    /// A reply carrying only a status.
    #[must_use]
    pub const fn bare(status: ServerStatus) -> Self {
        Self {
            status,
            handle: None,
            slot: SlotIndex::new(0),
            object_type: 0,
        }
    }

    #[must_use]
    pub fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REPLY_BYTES);
        append_u32_le(&mut buf, self.status.to_u32());
        append_u32_le(&mut buf, self.handle.map_or(0, Handle::get));
        append_u32_le(&mut buf, self.slot.get());
        append_u32_le(&mut buf, self.object_type);
        buf
    }

    #[must_use]
    pub fn from_bytes(src: &[u8]) -> Option<Self> {
        if src.len() != REPLY_BYTES {
            return None;
        }
        let mut cur = Cursor::new(src);
        Some(Self {
            status: ServerStatus::from_u32(cur.u32_le()?),
            handle: Handle::new(cur.u32_le()?),
            slot: SlotIndex::new(cur.u32_le()?),
            object_type: cur.u32_le()?,
        })
    }
}
