//! Object attributes (name, root directory, security) sent with creation
//! requests.
//!
//! Wire layout (all little-endian):
//!
//! ```text
//! [root:u32][attributes:u32][sd_len:u32][name_len:u32][sd bytes][name UTF-16LE]
//! ```
//!
//! `name_len` is in bytes and always even. A root of 0 means "no root".

use fsync_error::{FsyncError, Result};

use crate::encoding::{Cursor, append_u32_le};
use crate::flags::ObjectFlags;
use crate::handle::Handle;
use crate::limits::MAX_NAME_UNITS;

const FIXED_BYTES: usize = 16;

/// Attributes of an object being created or opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    /// Directory the name is relative to.
    pub root: Option<Handle>,
    pub flags: ObjectFlags,
    /// Object name; `None` creates an anonymous object.
    pub name: Option<String>,
    /// Opaque self-relative security descriptor, forwarded untouched.
    pub security_descriptor: Vec<u8>,
}

impl ObjectAttributes {
    /// Attributes for a named object with no root and default flags.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// The name for diagnostics, or `"<no name>"`.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<no name>")
    }

    /// Check the limits that hold no matter how the attributes travel.
    ///
    /// # Errors
    ///
    /// Returns [`FsyncError::InvalidAttributes`] if the name exceeds
    /// [`MAX_NAME_UNITS`] UTF-16 code units.
    pub fn validate(&self) -> Result<()> {
        let units = self.name.as_deref().map_or(0, |n| n.encode_utf16().count());
        if units > MAX_NAME_UNITS {
            return Err(FsyncError::invalid_attributes(format!(
                "name is {units} UTF-16 units, limit is {MAX_NAME_UNITS}"
            )));
        }
        Ok(())
    }

    /// Serialize for the authority.
    ///
    /// # Errors
    ///
    /// Returns [`FsyncError::InvalidAttributes`] if the name exceeds
    /// [`MAX_NAME_UNITS`] UTF-16 code units or the security descriptor does
    /// not fit a `u32` length.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let name_units: Vec<u16> = self
            .name
            .as_deref()
            .map(|n| n.encode_utf16().collect())
            .unwrap_or_default();
        let sd_len = u32::try_from(self.security_descriptor.len())
            .map_err(|_| FsyncError::invalid_attributes("security descriptor too large"))?;
        #[allow(clippy::cast_possible_truncation)]
        let name_len = (name_units.len() * 2) as u32;

        let capacity = FIXED_BYTES + self.security_descriptor.len() + name_units.len() * 2;
        let mut buf = Vec::with_capacity(capacity);
        append_u32_le(&mut buf, self.root.map_or(0, Handle::get));
        append_u32_le(&mut buf, self.flags.bits());
        append_u32_le(&mut buf, sd_len);
        append_u32_le(&mut buf, name_len);
        buf.extend_from_slice(&self.security_descriptor);
        for unit in name_units {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
        Ok(buf)
    }

    /// Parse attributes produced by [`ObjectAttributes::to_bytes`].
    ///
    /// An empty name decodes as `None`. Returns `None` on truncated input,
    /// an odd name length, or a name that is not valid UTF-16.
    #[must_use]
    pub fn from_bytes(src: &[u8]) -> Option<Self> {
        let mut cur = Cursor::new(src);
        let root = Handle::new(cur.u32_le()?);
        let flags = ObjectFlags::from_bits_retain(cur.u32_le()?);
        let sd_len = usize::try_from(cur.u32_le()?).ok()?;
        let name_len = usize::try_from(cur.u32_le()?).ok()?;
        if name_len % 2 != 0 {
            return None;
        }
        let security_descriptor = cur.take(sd_len)?.to_vec();
        let units: Vec<u16> = cur
            .take(name_len)?
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let name = if units.is_empty() {
            None
        } else {
            Some(String::from_utf16(&units).ok()?)
        };
        Some(Self {
            root,
            flags,
            name,
            security_descriptor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_attributes_are_fixed_size() {
        let bytes = ObjectAttributes::default().to_bytes().unwrap();
        assert_eq!(bytes.len(), FIXED_BYTES);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn name_is_utf16le() {
        let bytes = ObjectAttributes::named("Foo").to_bytes().unwrap();
        assert_eq!(&bytes[12..16], &6_u32.to_le_bytes());
        assert_eq!(&bytes[16..], &[b'F', 0, b'o', 0, b'o', 0]);
    }

    #[test]
    fn decode_restores_every_field() {
        let attrs = ObjectAttributes {
            root: Handle::new(0x24),
            flags: ObjectFlags::OPENIF | ObjectFlags::CASE_INSENSITIVE,
            name: Some("\\BaseNamedObjects\\Sém".to_owned()),
            security_descriptor: vec![1, 0, 4, 0x80],
        };
        let decoded = ObjectAttributes::from_bytes(&attrs.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, attrs);
    }

    #[test]
    fn overlong_name_is_rejected() {
        let attrs = ObjectAttributes::named("x".repeat(MAX_NAME_UNITS + 1));
        let err = attrs.to_bytes().unwrap_err();
        assert!(matches!(err, FsyncError::InvalidAttributes { .. }));

        let at_limit = ObjectAttributes::named("x".repeat(MAX_NAME_UNITS));
        assert!(at_limit.to_bytes().is_ok());
    }

    #[test]
    fn validate_counts_utf16_units() {
        // U+1F600 needs a surrogate pair.
        let pairs = "\u{1F600}".repeat(MAX_NAME_UNITS / 2);
        assert!(ObjectAttributes::named(pairs.clone()).validate().is_ok());

        let over = ObjectAttributes::named(pairs + "\u{1F600}");
        let err = over.validate().unwrap_err();
        assert!(matches!(err, FsyncError::InvalidAttributes { .. }));
        assert!(ObjectAttributes::default().validate().is_ok());
    }

    #[test]
    fn malformed_input_is_rejected() {
        let mut bytes = ObjectAttributes::named("Foo").to_bytes().unwrap();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(ObjectAttributes::from_bytes(truncated).is_none());
        bytes[12] = 5;
        assert!(ObjectAttributes::from_bytes(&bytes).is_none());
        assert!(ObjectAttributes::from_bytes(&[0; 3]).is_none());
    }

    #[test]
    fn display_name_falls_back() {
        assert_eq!(ObjectAttributes::default().display_name(), "<no name>");
        assert_eq!(ObjectAttributes::named("Foo").display_name(), "Foo");
    }
}
