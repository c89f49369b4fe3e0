//! Netlink wire format and transport.
//!
//! `message`, `attr` and `builder` cover the framing: headers,
//! length-prefixed aligned attributes and request construction. `genl`
//! adds the generic-netlink header and control-family constants. The
//! `transport` module owns the per-handler state machine (outbound
//! queue, sequence tracking, reply classification, timeouts) on top of
//! the socket scheduler.

pub mod attr;
pub mod builder;
pub mod genl;
pub mod message;
pub mod seq;
pub mod transport;

pub use attr::{AttrIter, AttrKind, NlAttr, parse_policy};
pub use builder::{MAX_REQUEST_SIZE, MessageBuilder};
pub use message::{MessageIter, NLMSG_HDRLEN, NlMsgError, NlMsgHdr, NlMsgType};
pub use transport::{NETLINK_TIMEOUT_MS, NetlinkConsumer, NetlinkHandle, Protocol};
