//! On-disk xattr records: key/value pairs, the xattr-id table entry that
//! groups a block of pairs under one inode-facing index, and the small
//! header sitting at `xattr_id_table_start`.
//!
//! Grounded on `original_source/lib/sqfs/xattr_reader.c` and
//! `xattr/xattr_writer_flush.c`. Three prefixes are supported, matching
//! the standard tree (`user.*`, `trusted.*`, `security.*`); a value
//! referenced by more than one key can be hoisted out-of-line (`OOL`) and
//! replaced at each use site with an 8-byte back-reference.

use deku::prelude::*;

use crate::error::SquashfsError;

const PREFIX_MASK: u16 = 0x00ff;
const FLAG_OOL: u16 = 0x0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrPrefix {
    User,
    Trusted,
    Security,
}

impl XattrPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            XattrPrefix::User => "user",
            XattrPrefix::Trusted => "trusted",
            XattrPrefix::Security => "security",
        }
    }

    fn id(self) -> u16 {
        match self {
            XattrPrefix::User => 0,
            XattrPrefix::Trusted => 1,
            XattrPrefix::Security => 2,
        }
    }

    pub fn from_id(id: u16) -> Result<Self, SquashfsError> {
        match id {
            0 => Ok(XattrPrefix::User),
            1 => Ok(XattrPrefix::Trusted),
            2 => Ok(XattrPrefix::Security),
            _ => Err(SquashfsError::Unsupported("xattr prefix")),
        }
    }

    /// Splits a fully-qualified name like `user.foo` into its prefix and
    /// the remainder stored on disk (`foo`).
    pub fn split(full_name: &str) -> Result<(Self, &str), SquashfsError> {
        let (prefix, rest) = full_name
            .split_once('.')
            .ok_or(SquashfsError::Unsupported("xattr name has no prefix"))?;
        let prefix = match prefix {
            "user" => XattrPrefix::User,
            "trusted" => XattrPrefix::Trusted,
            "security" => XattrPrefix::Security,
            _ => return Err(SquashfsError::Unsupported("xattr prefix")),
        };
        Ok((prefix, rest))
    }
}

/// A key record: type (prefix id, optionally OR'd with [`FLAG_OOL`]) plus
/// the prefix-stripped name.
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct XattrKey {
    pub xattr_type: u16,
    pub size: u16,
    #[deku(count = "*size as usize")]
    pub name: Vec<u8>,
}

impl XattrKey {
    pub fn new(prefix: XattrPrefix, name: &str, out_of_line: bool) -> Self {
        let mut xattr_type = prefix.id();
        if out_of_line {
            xattr_type |= FLAG_OOL;
        }
        Self {
            xattr_type,
            size: name.len() as u16,
            name: name.as_bytes().to_vec(),
        }
    }

    pub fn prefix(&self) -> Result<XattrPrefix, SquashfsError> {
        XattrPrefix::from_id(self.xattr_type & PREFIX_MASK)
    }

    pub fn is_out_of_line(&self) -> bool {
        self.xattr_type & FLAG_OOL != 0
    }

    pub fn full_name(&self) -> Result<String, SquashfsError> {
        let prefix = self.prefix()?;
        let rest = String::from_utf8(self.name.clone()).map_err(SquashfsError::StringUtf8)?;
        Ok(format!("{}.{}", prefix.as_str(), rest))
    }
}

/// A value record: either the inline bytes (when `size` matches the
/// trailing payload) or, for an OOL value, `size == 8` and the trailing
/// payload is a [`MetadataRef`](crate::metadata::MetadataRef)-packed
/// location of the real value record elsewhere in the kv area.
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct XattrValue {
    pub size: u32,
    #[deku(count = "*size as usize")]
    pub value: Vec<u8>,
}

/// One descriptor in the xattr-id table: a block of kv pairs belonging
/// to one inode's xattr set.
#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct XattrIdEntry {
    /// packed meta-block reference where this block's pairs start
    pub xattr: u64,
    pub count: u32,
    pub size: u32,
}

pub const XATTR_ID_ENTRY_SIZE: usize = 16;

/// Header at `xattr_id_table_start`.
#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct XattrIdTable {
    pub xattr_table_start: u64,
    pub xattr_ids: u32,
    pub unused: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_round_trips_through_name() {
        let (prefix, rest) = XattrPrefix::split("user.comment").unwrap();
        assert_eq!(prefix, XattrPrefix::User);
        assert_eq!(rest, "comment");

        let key = XattrKey::new(prefix, rest, false);
        assert_eq!(key.full_name().unwrap(), "user.comment");
        assert!(!key.is_out_of_line());
    }

    #[test]
    fn ool_flag_survives_round_trip() {
        let key = XattrKey::new(XattrPrefix::Trusted, "overlay.opaque", true);
        let bytes = key.to_bytes().unwrap();
        let (_, back) = XattrKey::from_bytes((&bytes, 0)).unwrap();
        assert!(back.is_out_of_line());
        assert_eq!(back.prefix().unwrap(), XattrPrefix::Trusted);
    }
}
