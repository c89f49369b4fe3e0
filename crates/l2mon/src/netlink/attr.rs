//! Netlink attribute (nlattr) handling.
//!
//! Attributes are length-prefixed TLVs aligned to 4 bytes. Consumers
//! that need to trust payload sizes before dereferencing them validate
//! a whole attribute run against an [`AttrPolicy`] table first; the
//! iterator itself makes no guarantees beyond framing.

use crate::error::{Error, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Align a length to NLA_ALIGNTO boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4; // nla_align(size_of::<NlAttr>())

/// Netlink attribute header (mirrors struct nlattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including header.
    pub nla_len: u16,
    /// Attribute type.
    pub nla_type: u16,
}

/// Attribute type flags.
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

impl NlAttr {
    /// Create a new attribute header.
    pub fn new(attr_type: u16, data_len: usize) -> Self {
        Self {
            nla_len: (NLA_HDRLEN + data_len) as u16,
            nla_type: attr_type,
        }
    }

    /// Get the attribute type without flags.
    pub fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }

    /// Get the payload length (total length minus header).
    pub fn payload_len(&self) -> usize {
        (self.nla_len as usize).saturating_sub(NLA_HDRLEN)
    }

    /// Convert to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Iterator over netlink attributes in a buffer.
pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    /// Create a new attribute iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    /// Returns (attribute type, payload data).
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLA_HDRLEN {
            return None;
        }

        let attr = match NlAttr::from_bytes(self.data) {
            Ok(a) => a,
            Err(_) => return None,
        };

        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN || len > self.data.len() {
            return None;
        }

        let payload = &self.data[NLA_HDRLEN..len];
        let aligned_len = nla_align(len);

        // Move to next attribute
        if aligned_len >= self.data.len() {
            self.data = &[];
        } else {
            self.data = &self.data[aligned_len..];
        }

        Some((attr.kind(), payload))
    }
}

/// Expected shape of an attribute payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    U8,
    U16,
    U32,
    U64,
    /// Presence-only attribute, payload ignored.
    Flag,
    /// Null-terminated string.
    String,
    /// Raw bytes with a minimum length.
    Binary(usize),
    /// Container of further attributes.
    Nested,
}

impl AttrKind {
    fn min_len(self) -> usize {
        match self {
            AttrKind::U8 => 1,
            AttrKind::U16 => 2,
            AttrKind::U32 => 4,
            AttrKind::U64 => 8,
            AttrKind::Flag => 0,
            AttrKind::String => 0,
            AttrKind::Binary(n) => n,
            AttrKind::Nested => 0,
        }
    }
}

/// One policy row: attribute id and its expected kind.
pub type AttrPolicy = (u16, AttrKind);

/// Validate an attribute run against a policy and collect payloads.
///
/// Every attribute with id ≤ `max` is stored at its index in the result
/// (later occurrences win, matching kernel behavior). Attributes with a
/// policy row are length-checked; unknown attributes are stored
/// unchecked; ids above `max` are skipped.
pub fn parse_policy<'a>(
    data: &'a [u8],
    max: u16,
    policy: &[AttrPolicy],
) -> Result<Vec<Option<&'a [u8]>>> {
    let mut slots: Vec<Option<&'a [u8]>> = vec![None; max as usize + 1];
    for (kind, payload) in AttrIter::new(data) {
        if kind > max {
            continue;
        }
        if let Some((_, expected)) = policy.iter().find(|(id, _)| *id == kind)
            && payload.len() < expected.min_len()
        {
            return Err(Error::InvalidAttribute(format!(
                "attribute {} too short: {} < {}",
                kind,
                payload.len(),
                expected.min_len()
            )));
        }
        slots[kind as usize] = Some(payload);
    }
    Ok(slots)
}

/// Helper functions for extracting typed values from attribute payloads.
pub mod get {
    use super::*;

    /// Extract a u8 value.
    pub fn u8(data: &[u8]) -> Result<u8> {
        if data.is_empty() {
            return Err(Error::InvalidAttribute("empty u8 attribute".into()));
        }
        Ok(data[0])
    }

    /// Extract a u16 value (native endian).
    pub fn u16_ne(data: &[u8]) -> Result<u16> {
        if data.len() < 2 {
            return Err(Error::InvalidAttribute("truncated u16 attribute".into()));
        }
        Ok(u16::from_ne_bytes([data[0], data[1]]))
    }

    /// Extract a u32 value (native endian).
    pub fn u32_ne(data: &[u8]) -> Result<u32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated u32 attribute".into()));
        }
        Ok(u32::from_ne_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract a u64 value (native endian).
    pub fn u64_ne(data: &[u8]) -> Result<u64> {
        if data.len() < 8 {
            return Err(Error::InvalidAttribute("truncated u64 attribute".into()));
        }
        Ok(u64::from_ne_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]))
    }

    /// Extract an i32 value (native endian).
    pub fn i32_ne(data: &[u8]) -> Result<i32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated i32 attribute".into()));
        }
        Ok(i32::from_ne_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract a null-terminated string.
    pub fn string(data: &[u8]) -> Result<&str> {
        // Find null terminator or use whole buffer
        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..len])
            .map_err(|e| Error::InvalidAttribute(format!("invalid UTF-8: {}", e)))
    }

    /// Extract bytes (no interpretation).
    pub fn bytes(data: &[u8]) -> &[u8] {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_attr(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
        let attr = NlAttr::new(attr_type, data.len());
        buf.extend_from_slice(attr.as_bytes());
        buf.extend_from_slice(data);
        let aligned = nla_align(buf.len());
        buf.resize(aligned, 0);
    }

    #[test]
    fn test_iter_walks_attributes() {
        let mut buf = Vec::new();
        push_attr(&mut buf, 1, &42u32.to_ne_bytes());
        push_attr(&mut buf, 3, b"wlan0\0");

        let attrs: Vec<(u16, Vec<u8>)> = AttrIter::new(&buf)
            .map(|(t, p)| (t, p.to_vec()))
            .collect();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].0, 1);
        assert_eq!(get::u32_ne(&attrs[0].1).unwrap(), 42);
        assert_eq!(attrs[1].0, 3);
        assert_eq!(get::string(&attrs[1].1).unwrap(), "wlan0");
    }

    #[test]
    fn test_policy_accepts_valid() {
        let mut buf = Vec::new();
        push_attr(&mut buf, 1, &7u16.to_ne_bytes());
        push_attr(&mut buf, 2, b"nl80211\0");

        let policy = [(1u16, AttrKind::U16), (2, AttrKind::String)];
        let slots = parse_policy(&buf, 4, &policy).unwrap();
        assert_eq!(get::u16_ne(slots[1].unwrap()).unwrap(), 7);
        assert_eq!(get::string(slots[2].unwrap()).unwrap(), "nl80211");
        assert!(slots[3].is_none());
    }

    #[test]
    fn test_policy_rejects_short_payload() {
        let mut buf = Vec::new();
        push_attr(&mut buf, 1, &[0x01]); // one byte where a u32 is required

        let policy = [(1u16, AttrKind::U32)];
        assert!(parse_policy(&buf, 4, &policy).is_err());
    }

    #[test]
    fn test_policy_skips_out_of_range() {
        let mut buf = Vec::new();
        push_attr(&mut buf, 9, &1u32.to_ne_bytes());

        let slots = parse_policy(&buf, 4, &[]).unwrap();
        assert!(slots.iter().all(|s| s.is_none()));
    }

    #[test]
    fn test_nested_flag_masked() {
        let mut buf = Vec::new();
        push_attr(&mut buf, 8 | NLA_F_NESTED, &[]);
        let (kind, _) = AttrIter::new(&buf).next().unwrap();
        assert_eq!(kind, 8);
    }

    #[test]
    fn test_get_signal_as_signed() {
        // nl80211 reports signal as a u8 that is really an i8 dBm value.
        let raw = get::u8(&[0xc0]).unwrap(); // -64 dBm
        assert_eq!(raw as i8 as i32, -64);
    }
}
