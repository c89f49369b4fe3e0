//! Netlink transport: per-handler request/reply state machine.
//!
//! A [`NetlinkHandle`] owns one raw kernel socket registered with the
//! socket scheduler. Outbound requests are queued in a byte buffer and
//! flushed in a single `sendmsg` when the socket becomes writable;
//! inbound datagrams are sized with a peek, read into a growable
//! buffer, and the enclosed headers are classified into data, done and
//! error events for the handler's consumer.
//!
//! The per-request lifecycle:
//!
//! ```text
//!  idle ──send──▶ queued ──flush ok──▶ waiting-reply ──done/error──▶ idle
//!    ▲                                      │                         │
//!    │                               timeout/more sends               │
//!    └──────────────────────────────────────┴─────────────────────────┘
//! ```
//!
//! For every sequence number handed out by [`NetlinkHandle::send`],
//! exactly one of `on_done`, `on_error` or `on_timeout` eventually
//! reaches the consumer (unless the handle is closed first), and all
//! `on_message` deliveries for a sequence precede its terminating
//! callback.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};
use tracing::{debug, warn};

use super::builder::MessageBuilder;
use super::message::{
    MessageIter, NLM_F_ACK, NLM_F_MULTI, NLMSG_HDRLEN, NlMsgError, NlMsgHdr, NlMsgType,
};
use super::seq;
use crate::error::{Error, Result};
use crate::scheduler::SocketEntry;
use crate::timer::{TimerClass, TimerEntry};
use crate::Core;

/// How long a flushed request may wait for its terminating reply.
pub const NETLINK_TIMEOUT_MS: u64 = 1000;

/// Netlink protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Routing/device hook (links, addresses, routes).
    Route,
    /// Generic netlink.
    Generic,
}

impl Protocol {
    fn as_isize(self) -> isize {
        match self {
            Protocol::Route => protocols::NETLINK_ROUTE,
            Protocol::Generic => protocols::NETLINK_GENERIC,
        }
    }
}

/// Callbacks a transport consumer provides.
///
/// All methods run on the scheduler thread; none may block. The
/// transport holds the consumer weakly, so dropping the consumer
/// silently stops delivery.
pub trait NetlinkConsumer {
    /// A data message (anything that is not NOOP/DONE/ERROR).
    fn on_message(&self, hdr: &NlMsgHdr, payload: &[u8]);

    /// A request finished successfully (explicit ack or end of dump).
    fn on_done(&self, _seq: u32) {}

    /// The kernel refused a request; `error` is the positive errno.
    fn on_error(&self, _seq: u32, _error: i32) {}

    /// No terminating reply arrived in time; all outstanding requests
    /// on this handler are abandoned.
    fn on_timeout(&self) {}
}

/// Classified reply event produced by [`ReplyWalker`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReplyEvent<'a> {
    /// Data message for the consumer.
    Message(&'a NlMsgHdr, &'a [u8]),
    /// A request terminated successfully.
    Done(u32),
    /// A request was refused; positive errno.
    Failed(u32, i32),
}

/// Header walk over one received message block.
///
/// `NLMSG_DONE` is not reported immediately: the decision is deferred
/// until a header with a different sequence arrives or the block ends,
/// which guarantees that all data messages of a dump are delivered
/// before its terminating event. A nonzero error cancels a pending
/// deferral for its sequence.
pub(crate) struct ReplyWalker;

impl ReplyWalker {
    pub(crate) fn walk(block: &[u8], mut sink: impl FnMut(ReplyEvent<'_>)) {
        let mut current_seq: Option<u32> = None;
        let mut deferred_done = false;

        for item in MessageIter::new(block) {
            let (hdr, payload) = match item {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("stopping reply walk on malformed header: {}", err);
                    break;
                }
            };

            match current_seq {
                Some(seq) if seq != hdr.nlmsg_seq => {
                    if deferred_done {
                        sink(ReplyEvent::Done(seq));
                        deferred_done = false;
                    }
                    current_seq = Some(hdr.nlmsg_seq);
                }
                None => current_seq = Some(hdr.nlmsg_seq),
                _ => {}
            }

            match hdr.nlmsg_type {
                NlMsgType::NOOP => {}
                NlMsgType::DONE => deferred_done = true,
                NlMsgType::ERROR => {
                    deferred_done = false;
                    match NlMsgError::from_bytes(payload) {
                        Ok(err) if err.is_ack() => sink(ReplyEvent::Done(err.msg.nlmsg_seq)),
                        Ok(err) => sink(ReplyEvent::Failed(err.msg.nlmsg_seq, -err.error)),
                        Err(parse_err) => {
                            warn!("malformed error message dropped: {}", parse_err);
                        }
                    }
                }
                _ => sink(ReplyEvent::Message(hdr, payload)),
            }
        }

        if deferred_done && let Some(seq) = current_seq {
            sink(ReplyEvent::Done(seq));
        }
    }
}

fn page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret > 0 { ret as usize } else { 4096 }
}

/// One netlink handler: socket, buffers, request accounting.
pub struct NetlinkHandle {
    name: &'static str,
    socket: RefCell<Option<Socket>>,
    fd: RawFd,
    entry: Rc<SocketEntry>,
    core: Rc<Core>,
    out: RefCell<BytesMut>,
    out_first_seq: Cell<u32>,
    in_buf: RefCell<Vec<u8>>,
    in_transit: Cell<u32>,
    timeout_class: Rc<TimerClass>,
    timeout: Rc<TimerEntry>,
    consumer: RefCell<Option<Weak<dyn NetlinkConsumer>>>,
    closed: Cell<bool>,
}

impl NetlinkHandle {
    /// Open a raw kernel socket of the given family, bind it with a
    /// kernel-assigned id and register it with the scheduler with read
    /// interest. The reply timeout starts disarmed.
    pub fn open(core: &Rc<Core>, protocol: Protocol, name: &'static str) -> Result<Rc<Self>> {
        let mut socket = Socket::new(protocol.as_isize())?;
        socket.set_non_blocking(true)?;
        socket.bind(&SocketAddr::new(0, 0))?;
        let fd = socket.as_raw_fd();

        let entry = SocketEntry::new(fd, Box::new(|_, _| {}));
        entry.set_read(true);

        let timeout_class = core.timers.add_class("netlink feedback", false);
        let timeout = core.timers.entry(&timeout_class, 0, Box::new(|| {}));

        let handle = Rc::new(Self {
            name,
            socket: RefCell::new(Some(socket)),
            fd,
            entry,
            core: core.clone(),
            out: RefCell::new(BytesMut::new()),
            out_first_seq: Cell::new(0),
            in_buf: RefCell::new(vec![0u8; page_size()]),
            in_transit: Cell::new(0),
            timeout_class,
            timeout,
            consumer: RefCell::new(None),
            closed: Cell::new(false),
        });

        let weak = Rc::downgrade(&handle);
        handle.entry.set_handler(Box::new(move |readable, writable| {
            if let Some(nl) = weak.upgrade() {
                nl.handle_socket_event(readable, writable);
            }
        }));
        let weak = Rc::downgrade(&handle);
        handle.timeout.replace_callback(Box::new(move || {
            if let Some(nl) = weak.upgrade() {
                nl.handle_timeout();
            }
        }));

        core.sockets.add(&handle.entry);
        debug!(handler = name, fd, "netlink handler opened");
        Ok(handle)
    }

    /// Logging tag of the owning subsystem.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of flushed request batches still awaiting their
    /// terminating reply.
    pub fn in_transit(&self) -> u32 {
        self.in_transit.get()
    }

    /// Whether the reply timeout is currently armed.
    pub fn timeout_armed(&self) -> bool {
        self.core.timers.is_active(&self.timeout)
    }

    /// Bind the consumer that receives this handler's callbacks.
    pub fn set_consumer<C: NetlinkConsumer + 'static>(&self, consumer: &Rc<C>) {
        let consumer: Rc<dyn NetlinkConsumer> = consumer.clone();
        let weak: Weak<dyn NetlinkConsumer> = Rc::downgrade(&consumer);
        *self.consumer.borrow_mut() = Some(weak);
    }

    fn consumer(&self) -> Option<Rc<dyn NetlinkConsumer>> {
        self.consumer.borrow().as_ref()?.upgrade()
    }

    /// Deregister the socket and close it. Pending in-transit requests
    /// never receive callbacks; the owner must have cancelled any
    /// user-level waiters first.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.core.sockets.remove(&self.entry);
        self.core.timers.stop(&self.timeout);
        self.core.timers.remove_class(&self.timeout_class);
        *self.consumer.borrow_mut() = None;
        self.out.borrow_mut().clear();
        // Dropping the socket closes the descriptor.
        *self.socket.borrow_mut() = None;
        debug!(handler = self.name, "netlink handler closed");
    }

    /// Join a list of multicast groups. The first failure aborts the
    /// batch.
    pub fn join_multicast(&self, groups: &[u32]) -> Result<()> {
        let mut socket = self.socket.borrow_mut();
        let socket = socket
            .as_mut()
            .ok_or_else(|| Error::Io(io::ErrorKind::NotConnected.into()))?;
        for &group in groups {
            socket.add_membership(group).map_err(|e| {
                warn!(handler = self.name, group, "could not join multicast group");
                Error::Io(e)
            })?;
        }
        Ok(())
    }

    /// Leave a list of multicast groups. The first failure aborts the
    /// batch.
    pub fn drop_multicast(&self, groups: &[u32]) -> Result<()> {
        let mut socket = self.socket.borrow_mut();
        let socket = socket
            .as_mut()
            .ok_or_else(|| Error::Io(io::ErrorKind::NotConnected.into()))?;
        for &group in groups {
            socket.drop_membership(group).map_err(|e| {
                warn!(handler = self.name, group, "could not drop multicast group");
                Error::Io(e)
            })?;
        }
        Ok(())
    }

    /// Queue a request for transmission and return its sequence number.
    ///
    /// The message is stamped with the next process-wide sequence and
    /// the ACK and MULTI flags; it leaves for the kernel on the next
    /// writable event.
    pub fn send(&self, mut msg: MessageBuilder) -> u32 {
        let seq = seq::next_seq();
        msg.set_seq(seq);
        msg.or_flags(NLM_F_ACK | NLM_F_MULTI);
        let bytes = msg.finish();
        debug!(
            handler = self.name,
            seq,
            len = bytes.len(),
            "queueing netlink request"
        );

        let mut out = self.out.borrow_mut();
        if out.is_empty() {
            self.out_first_seq.set(seq);
        }
        out.extend_from_slice(&bytes);
        drop(out);

        self.entry.set_write(true);
        seq
    }

    fn handle_socket_event(&self, readable: bool, writable: bool) {
        if self.closed.get() {
            return;
        }
        if writable {
            self.flush();
        }
        if readable {
            self.receive();
        }
    }

    /// Send the entire outbound buffer plus a trailing DONE sentinel in
    /// one sendmsg.
    fn flush(&self) {
        let out = self.out.borrow();
        if out.is_empty() {
            self.entry.set_write(false);
            return;
        }

        let sentinel = NlMsgHdr {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: NlMsgType::DONE,
            ..Default::default()
        };

        let mut nladdr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        nladdr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        let mut iov = [
            libc::iovec {
                iov_base: out.as_ptr() as *mut libc::c_void,
                iov_len: out.len(),
            },
            libc::iovec {
                iov_base: sentinel.as_bytes().as_ptr() as *mut libc::c_void,
                iov_len: NLMSG_HDRLEN,
            },
        ];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut nladdr as *mut libc::sockaddr_nl as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = 2;

        let sent = out.len();
        let ret = unsafe { libc::sendmsg(self.fd, &msg, 0) };
        drop(out);

        if ret <= 0 {
            let err = io::Error::last_os_error();
            warn!(
                handler = self.name,
                "cannot send data to netlink socket: {}", err
            );
            let failed_seq = self.out_first_seq.get();
            self.out.borrow_mut().clear();
            self.entry.set_write(false);
            if let Some(consumer) = self.consumer() {
                consumer.on_error(failed_seq, err.raw_os_error().unwrap_or(libc::EIO));
            }
            return;
        }

        debug!(
            handler = self.name,
            sent,
            seq = self.out_first_seq.get(),
            "flushed outbound netlink buffer"
        );
        self.out.borrow_mut().clear();
        self.entry.set_write(false);

        self.in_transit.set(self.in_transit.get() + 1);
        self.core
            .timers
            .set(&self.timeout, self.core.clock.absolute(NETLINK_TIMEOUT_MS));
    }

    /// Read one datagram, growing the inbound buffer on truncation, and
    /// dispatch the enclosed headers.
    fn receive(&self) {
        let len = {
            let mut buf = self.in_buf.borrow_mut();
            // Size the datagram with a peek; MSG_TRUNC makes recv report
            // the real length even when the buffer is too small.
            loop {
                let ret = unsafe {
                    libc::recv(
                        self.fd,
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        libc::MSG_PEEK | libc::MSG_TRUNC | libc::MSG_DONTWAIT,
                    )
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EAGAIN) {
                        warn!(handler = self.name, "netlink recv error: {}", err);
                    }
                    return;
                }
                let needed = ret as usize;
                if needed > buf.len() {
                    let page = page_size();
                    let new_len = needed.div_ceil(page) * page;
                    debug!(
                        handler = self.name,
                        from = buf.len(),
                        to = new_len,
                        "growing netlink input buffer"
                    );
                    buf.resize(new_len, 0);
                    continue;
                }
                break;
            }

            let ret = unsafe {
                libc::recv(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EAGAIN) {
                    warn!(handler = self.name, "netlink recv error: {}", err);
                }
                return;
            }
            ret as usize
        };

        let buf = self.in_buf.borrow();
        debug!(handler = self.name, len, "received netlink message block");
        self.dispatch_block(&buf[..len]);
        drop(buf);

        // Incoming traffic extends the deadline of whatever is still
        // outstanding.
        if self.core.timers.is_active(&self.timeout) {
            self.core
                .timers
                .set(&self.timeout, self.core.clock.absolute(NETLINK_TIMEOUT_MS));
        }
    }

    fn dispatch_block(&self, block: &[u8]) {
        ReplyWalker::walk(block, |event| {
            if self.closed.get() {
                return;
            }
            match event {
                ReplyEvent::Message(hdr, payload) => {
                    if let Some(consumer) = self.consumer() {
                        consumer.on_message(hdr, payload);
                    }
                }
                ReplyEvent::Done(seq) => {
                    debug!(handler = self.name, seq, "netlink request finished");
                    if let Some(consumer) = self.consumer() {
                        consumer.on_done(seq);
                    }
                    self.job_finished();
                }
                ReplyEvent::Failed(seq, errno) => {
                    debug!(
                        handler = self.name,
                        seq,
                        errno,
                        "netlink request refused: {}",
                        Error::from_errno(-errno)
                    );
                    if let Some(consumer) = self.consumer() {
                        consumer.on_error(seq, errno);
                    }
                    self.job_finished();
                }
            }
        });
    }

    fn job_finished(&self) {
        let transit = self.in_transit.get();
        if transit > 0 {
            self.in_transit.set(transit - 1);
        }
        if self.in_transit.get() == 0 {
            self.core.timers.stop(&self.timeout);
        }
        debug!(
            handler = self.name,
            in_transit = self.in_transit.get(),
            "netlink job finished"
        );
    }

    fn handle_timeout(&self) {
        if self.closed.get() {
            return;
        }
        warn!(
            handler = self.name,
            abandoned = self.in_transit.get(),
            "netlink request timed out"
        );
        if let Some(consumer) = self.consumer() {
            consumer.on_timeout();
        }
        self.in_transit.set(0);
    }
}

impl Drop for NetlinkHandle {
    fn drop(&mut self) {
        if !self.closed.get() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::NLM_F_REQUEST;
    use zerocopy::IntoBytes;

    fn data_msg(msg_type: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut hdr = NlMsgHdr::new(msg_type, NLM_F_MULTI);
        hdr.nlmsg_seq = seq;
        hdr.nlmsg_len = (NLMSG_HDRLEN + payload.len()) as u32;
        let mut out = hdr.as_bytes().to_vec();
        out.extend_from_slice(payload);
        let aligned = super::super::message::nlmsg_align(out.len());
        out.resize(aligned, 0);
        out
    }

    fn done_msg(seq: u32) -> Vec<u8> {
        let mut hdr = NlMsgHdr::new(NlMsgType::DONE, NLM_F_MULTI);
        hdr.nlmsg_seq = seq;
        hdr.as_bytes().to_vec()
    }

    fn error_msg(seq: u32, code: i32) -> Vec<u8> {
        let mut outer = NlMsgHdr::new(NlMsgType::ERROR, 0);
        outer.nlmsg_seq = seq;
        let mut inner = NlMsgHdr::new(NlMsgType::RTM_NEWADDR, NLM_F_REQUEST);
        inner.nlmsg_seq = seq;
        let err = NlMsgError {
            error: code,
            msg: inner,
        };
        outer.nlmsg_len = (NLMSG_HDRLEN + std::mem::size_of::<NlMsgError>()) as u32;
        let mut out = outer.as_bytes().to_vec();
        out.extend_from_slice(<NlMsgError as IntoBytes>::as_bytes(&err));
        out
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Ev {
        Msg(u32),
        Done(u32),
        Failed(u32, i32),
    }

    fn collect(block: &[u8]) -> Vec<Ev> {
        let mut events = Vec::new();
        ReplyWalker::walk(block, |event| {
            events.push(match event {
                ReplyEvent::Message(hdr, _) => Ev::Msg(hdr.nlmsg_seq),
                ReplyEvent::Done(seq) => Ev::Done(seq),
                ReplyEvent::Failed(seq, errno) => Ev::Failed(seq, errno),
            });
        });
        events
    }

    #[test]
    fn test_ack_reply_is_done() {
        let block = error_msg(12, 0);
        assert_eq!(collect(&block), vec![Ev::Done(12)]);
    }

    #[test]
    fn test_error_reply_negates_errno() {
        let block = error_msg(13, -17); // EEXIST in kernel convention
        assert_eq!(collect(&block), vec![Ev::Failed(13, 17)]);
    }

    #[test]
    fn test_multipart_dump_messages_precede_done() {
        let mut block = Vec::new();
        for _ in 0..3 {
            block.extend_from_slice(&data_msg(0x13, 21, &[0u8; 8]));
        }
        block.extend_from_slice(&done_msg(21));

        assert_eq!(
            collect(&block),
            vec![Ev::Msg(21), Ev::Msg(21), Ev::Msg(21), Ev::Done(21)]
        );
    }

    #[test]
    fn test_deferred_done_flushed_by_seq_change() {
        let mut block = Vec::new();
        block.extend_from_slice(&data_msg(0x13, 5, &[]));
        block.extend_from_slice(&done_msg(5));
        block.extend_from_slice(&data_msg(0x13, 6, &[]));
        block.extend_from_slice(&done_msg(6));

        assert_eq!(
            collect(&block),
            vec![Ev::Msg(5), Ev::Done(5), Ev::Msg(6), Ev::Done(6)]
        );
    }

    #[test]
    fn test_error_cancels_deferred_done() {
        let mut block = Vec::new();
        block.extend_from_slice(&done_msg(7));
        block.extend_from_slice(&error_msg(7, -22)); // EINVAL

        assert_eq!(collect(&block), vec![Ev::Failed(7, 22)]);
    }

    #[test]
    fn test_noop_ignored() {
        let mut hdr = NlMsgHdr::new(NlMsgType::NOOP, 0);
        hdr.nlmsg_seq = 9;
        let mut block = hdr.as_bytes().to_vec();
        block.extend_from_slice(&data_msg(0x13, 9, &[]));

        assert_eq!(collect(&block), vec![Ev::Msg(9)]);
    }

    #[test]
    fn test_walk_stops_on_malformed_header() {
        let mut block = data_msg(0x13, 4, &[]);
        let mut bad = NlMsgHdr::new(0x13, 0);
        bad.nlmsg_len = 7; // shorter than the header
        block.extend_from_slice(bad.as_bytes());

        assert_eq!(collect(&block), vec![Ev::Msg(4)]);
    }
}
