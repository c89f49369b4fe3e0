//! Message builder for constructing netlink requests.
//!
//! Unlike a free-form byte buffer, the builder enforces the transport's
//! single-request ceiling: any append that would push the message past
//! [`MAX_REQUEST_SIZE`] fails without mutating the message, so a caller
//! can safely retry with a smaller payload.

use super::attr::{NLA_HDRLEN, NlAttr, nla_align};
use super::message::{NLMSG_HDRLEN, NlMsgHdr, nlmsg_align};
use crate::error::{Error, Result};

/// Ceiling for a single outbound request, one page.
pub const MAX_REQUEST_SIZE: usize = 4096;

/// Builder for constructing netlink messages.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
    max: usize,
}

impl MessageBuilder {
    /// Create a new message builder with the given type and flags.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let header = NlMsgHdr::new(msg_type, flags);
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[..std::mem::size_of::<NlMsgHdr>()].copy_from_slice(header.as_bytes());
        Self {
            buf,
            max: MAX_REQUEST_SIZE,
        }
    }

    /// Override the request ceiling. Used by tests; production callers
    /// keep the default.
    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    /// Get the current message length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if the message is empty (header only).
    pub fn is_empty(&self) -> bool {
        self.buf.len() == NLMSG_HDRLEN
    }

    fn ensure_room(&self, extra: usize) -> Result<()> {
        let size = nlmsg_align(self.buf.len()) + extra;
        if size > self.max {
            return Err(Error::MessageTooLarge {
                size,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Append raw bytes to the message (with alignment padding).
    pub fn append_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_room(nlmsg_align(data.len()))?;
        self.buf.extend_from_slice(data);
        let aligned = nlmsg_align(self.buf.len());
        self.buf.resize(aligned, 0);
        Ok(())
    }

    /// Append a fixed-size header struct to the message.
    pub fn append_header<T: zerocopy::IntoBytes + zerocopy::Immutable>(
        &mut self,
        data: &T,
    ) -> Result<()> {
        self.append_bytes(data.as_bytes())
    }

    /// Append an attribute with the given type and data.
    pub fn append_attr(&mut self, attr_type: u16, data: &[u8]) -> Result<()> {
        self.ensure_room(nla_align(NLA_HDRLEN + data.len()))?;
        let attr = NlAttr::new(attr_type, data.len());
        self.buf.extend_from_slice(attr.as_bytes());
        self.buf.extend_from_slice(data);
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
        Ok(())
    }

    /// Append a u8 attribute.
    pub fn append_attr_u8(&mut self, attr_type: u16, value: u8) -> Result<()> {
        self.append_attr(attr_type, &[value])
    }

    /// Append a u16 attribute (native endian).
    pub fn append_attr_u16(&mut self, attr_type: u16, value: u16) -> Result<()> {
        self.append_attr(attr_type, &value.to_ne_bytes())
    }

    /// Append a u32 attribute (native endian).
    pub fn append_attr_u32(&mut self, attr_type: u16, value: u32) -> Result<()> {
        self.append_attr(attr_type, &value.to_ne_bytes())
    }

    /// Append a null-terminated string attribute.
    pub fn append_attr_str(&mut self, attr_type: u16, value: &str) -> Result<()> {
        let mut data = value.as_bytes().to_vec();
        data.push(0); // null terminator
        self.append_attr(attr_type, &data)
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u32) {
        let bytes = seq.to_ne_bytes();
        self.buf[8..12].copy_from_slice(&bytes);
    }

    /// OR additional flags into the header.
    pub fn or_flags(&mut self, flags: u16) {
        let current = u16::from_ne_bytes([self.buf[6], self.buf[7]]);
        let bytes = (current | flags).to_ne_bytes();
        self.buf[6..8].copy_from_slice(&bytes);
    }

    /// Finalize and return the message bytes.
    pub fn finish(mut self) -> Vec<u8> {
        // Update message length in header
        let len = self.buf.len() as u32;
        let len_bytes = len.to_ne_bytes();
        self.buf[0..4].copy_from_slice(&len_bytes);
        self.buf
    }

    /// Get the current buffer for inspection.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::{MessageIter, NLM_F_REQUEST, NlMsgType};

    #[test]
    fn test_simple_message() {
        let msg = MessageBuilder::new(NlMsgType::RTM_GETLINK, NLM_F_REQUEST).finish();
        assert_eq!(msg.len(), NLMSG_HDRLEN);

        let header = NlMsgHdr::from_bytes(&msg).unwrap();
        assert_eq!(header.nlmsg_len as usize, NLMSG_HDRLEN);
        assert_eq!(header.nlmsg_type, NlMsgType::RTM_GETLINK);
        assert_eq!(header.nlmsg_flags, NLM_F_REQUEST);
    }

    #[test]
    fn test_attribute_roundtrip() {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETADDR, NLM_F_REQUEST);
        builder.append_attr_u32(1, 0x12345678).unwrap();
        builder.append_attr_str(3, "wlan0").unwrap();
        let msg = builder.finish();

        let (hdr, payload) = MessageIter::new(&msg).next().unwrap().unwrap();
        assert_eq!(hdr.nlmsg_len as usize, msg.len());
        let attrs: Vec<(u16, Vec<u8>)> = crate::netlink::attr::AttrIter::new(payload)
            .map(|(t, p)| (t, p.to_vec()))
            .collect();
        assert_eq!(attrs[0].0, 1);
        assert_eq!(attrs[1].0, 3);
    }

    #[test]
    fn test_or_flags_and_seq() {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETLINK, NLM_F_REQUEST);
        builder.or_flags(0x04); // ACK
        builder.set_seq(77);
        let msg = builder.finish();
        let hdr = NlMsgHdr::from_bytes(&msg).unwrap();
        assert_eq!(hdr.nlmsg_flags, NLM_F_REQUEST | 0x04);
        assert_eq!(hdr.nlmsg_seq, 77);
    }

    #[test]
    fn test_oversized_append_leaves_message_untouched() {
        let mut builder =
            MessageBuilder::new(NlMsgType::RTM_GETLINK, NLM_F_REQUEST).with_max(64);
        builder.append_attr_u32(1, 1).unwrap();
        let before = builder.as_bytes().to_vec();

        let err = builder.append_attr(2, &[0u8; 128]).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));
        assert_eq!(builder.as_bytes(), &before[..]);

        // Smaller appends still work afterwards.
        builder.append_attr_u8(2, 9).unwrap();
    }

    #[test]
    fn test_default_ceiling() {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETLINK, NLM_F_REQUEST);
        let big = vec![0u8; MAX_REQUEST_SIZE];
        assert!(builder.append_attr(1, &big).is_err());
    }
}
