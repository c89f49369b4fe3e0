//! RTNETLINK watcher: interface change fan-out and address mutation.
//!
//! One transport handler bound to the routing protocol, joined to the
//! link and v4/v6 address multicast groups. Unsolicited link/address
//! events are fanned out to registered interface listeners; address
//! set/remove requests are tracked per sequence number so their
//! completion callback fires exactly once: errno 0 on success, the
//! positive kernel errno on refusal, -1 on timeout or interrupt.

pub mod types;

use std::cell::{Cell, RefCell};
use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::Core;
use crate::error::{Error, Result};
use crate::netlink::builder::MessageBuilder;
use crate::netlink::message::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_REPLACE, NLM_F_REQUEST, NlMsgHdr, NlMsgType,
};
use crate::netlink::transport::{NetlinkConsumer, NetlinkHandle, Protocol};
use self::types::rtnetlink_groups::{RTNLGRP_IPV4_IFADDR, RTNLGRP_IPV6_IFADDR, RTNLGRP_LINK};
use self::types::{IFA_LOCAL, IFF_UP, IfAddrMsg, IfInfoMsg};

/// Callback invoked on interface state changes.
pub type ListenerFn = Box<dyn FnMut(u32, bool)>;

/// Handle returned by [`RtnlWatcher::listener_add`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

/// Insertion-ordered listener list that tolerates add/remove during
/// fan-out.
#[derive(Default)]
pub(crate) struct ListenerSet {
    list: RefCell<Vec<(u64, Rc<RefCell<ListenerFn>>)>>,
    next_id: Cell<u64>,
}

impl ListenerSet {
    fn add(&self, listener: ListenerFn) -> ListenerHandle {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        self.list
            .borrow_mut()
            .push((id, Rc::new(RefCell::new(listener))));
        ListenerHandle(id)
    }

    fn remove(&self, handle: ListenerHandle) {
        self.list.borrow_mut().retain(|(id, _)| *id != handle.0);
    }

    fn notify(&self, if_index: u32, went_down: bool) {
        // Snapshot so listeners can add/remove listeners while we
        // iterate; removed ones are skipped via the membership check.
        let snapshot: Vec<(u64, Rc<RefCell<ListenerFn>>)> = self.list.borrow().clone();
        for (id, listener) in snapshot {
            let still_registered = self.list.borrow().iter().any(|(i, _)| *i == id);
            if still_registered {
                (*listener.borrow_mut())(if_index, went_down);
            }
        }
    }

    fn len(&self) -> usize {
        self.list.borrow().len()
    }
}

/// Completion callback of an address operation. The second argument is
/// 0 on success, a positive errno on kernel refusal, -1 on timeout or
/// interrupt.
pub type AddressCallback = Box<dyn FnOnce(&AddressOp, i32)>;

/// A pending or submitted interface-address mutation.
pub struct AddressOp {
    pub if_index: u32,
    pub address: IpAddr,
    pub prefix_len: u8,
    pub scope: u8,
    /// true = set the address, false = remove it.
    pub set: bool,
    on_finished: RefCell<Option<AddressCallback>>,
    seq: Cell<u32>,
    pending: Cell<bool>,
}

impl AddressOp {
    /// Build an operation that sets an address.
    pub fn add(
        if_index: u32,
        address: IpAddr,
        prefix_len: u8,
        scope: u8,
        on_finished: Option<AddressCallback>,
    ) -> Rc<Self> {
        Self::new(true, if_index, address, prefix_len, scope, on_finished)
    }

    /// Build an operation that removes an address.
    pub fn remove(
        if_index: u32,
        address: IpAddr,
        prefix_len: u8,
        scope: u8,
        on_finished: Option<AddressCallback>,
    ) -> Rc<Self> {
        Self::new(false, if_index, address, prefix_len, scope, on_finished)
    }

    fn new(
        set: bool,
        if_index: u32,
        address: IpAddr,
        prefix_len: u8,
        scope: u8,
        on_finished: Option<AddressCallback>,
    ) -> Rc<Self> {
        Rc::new(Self {
            if_index,
            address,
            prefix_len,
            scope,
            set,
            on_finished: RefCell::new(on_finished),
            seq: Cell::new(0),
            pending: Cell::new(false),
        })
    }

    /// Sequence number assigned on submit; 0 before.
    pub fn seq(&self) -> u32 {
        self.seq.get()
    }

    /// Whether the operation is waiting for its completion event.
    pub fn is_pending(&self) -> bool {
        self.pending.get()
    }

    fn has_callback(&self) -> bool {
        self.on_finished.borrow().is_some()
    }
}

/// Tracks submitted address operations by sequence number.
#[derive(Default)]
pub(crate) struct FeedbackTracker {
    pending: RefCell<Vec<Rc<AddressOp>>>,
}

impl FeedbackTracker {
    fn register(&self, op: &Rc<AddressOp>, seq: u32) {
        op.seq.set(seq);
        op.pending.set(true);
        self.pending.borrow_mut().push(op.clone());
    }

    /// Detach the op, then invoke its callback. Detaching first makes
    /// recursive interrupts from inside the callback safe, and the
    /// taken callback slot guarantees exactly-once.
    fn finish(&self, op: &Rc<AddressOp>, error: i32) {
        if !op.pending.replace(false) {
            return;
        }
        self.pending.borrow_mut().retain(|p| !Rc::ptr_eq(p, op));
        let callback = op.on_finished.borrow_mut().take();
        if let Some(callback) = callback {
            callback(op, error);
        }
    }

    fn complete_seq(&self, seq: u32, error: i32) {
        let found = self
            .pending
            .borrow()
            .iter()
            .find(|p| p.seq.get() == seq)
            .cloned();
        if let Some(op) = found {
            self.finish(&op, error);
        }
    }

    fn complete_all(&self, error: i32) {
        let ops: Vec<Rc<AddressOp>> = self.pending.borrow().clone();
        for op in ops {
            self.finish(&op, error);
        }
    }

    fn len(&self) -> usize {
        self.pending.borrow().len()
    }
}

/// Derive an interface event from a link message payload.
pub(crate) fn link_event(payload: &[u8]) -> Result<(u32, bool)> {
    let info = IfInfoMsg::from_bytes(payload)?;
    Ok((info.ifi_index as u32, info.ifi_flags & IFF_UP == 0))
}

/// Derive an interface event from an address message payload.
pub(crate) fn addr_event(payload: &[u8]) -> Result<(u32, bool)> {
    let info = IfAddrMsg::from_bytes(payload)?;
    Ok((info.ifa_index, (info.ifa_flags as u32) & IFF_UP == 0))
}

/// Build the request message for an address operation.
pub(crate) fn build_addr_request(op: &AddressOp) -> Result<MessageBuilder> {
    let mut msg = if op.set {
        MessageBuilder::new(
            NlMsgType::RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_CREATE | NLM_F_REPLACE | NLM_F_ACK,
        )
    } else {
        MessageBuilder::new(NlMsgType::RTM_DELADDR, NLM_F_REQUEST | NLM_F_ACK)
    };

    let family = match op.address {
        IpAddr::V4(_) => libc::AF_INET as u8,
        IpAddr::V6(_) => libc::AF_INET6 as u8,
    };
    let hdr = IfAddrMsg {
        ifa_family: family,
        ifa_prefixlen: op.prefix_len,
        ifa_flags: 0,
        ifa_scope: op.scope,
        ifa_index: op.if_index,
    };
    msg.append_header(&hdr)?;

    match op.address {
        IpAddr::V4(addr) => msg.append_attr(IFA_LOCAL, &addr.octets())?,
        IpAddr::V6(addr) => msg.append_attr(IFA_LOCAL, &addr.octets())?,
    }
    Ok(msg)
}

/// The built-in routing protocol watcher.
pub struct RtnlWatcher {
    nl: Rc<NetlinkHandle>,
    listeners: ListenerSet,
    feedback: FeedbackTracker,
    ioctl_fd: OwnedFd,
}

impl RtnlWatcher {
    /// Open the routing socket and join the link and address multicast
    /// groups.
    pub fn new(core: &Rc<Core>) -> Result<Rc<Self>> {
        let nl = NetlinkHandle::open(core, Protocol::Route, "rtnl")?;
        nl.join_multicast(&[RTNLGRP_LINK, RTNLGRP_IPV4_IFADDR, RTNLGRP_IPV6_IFADDR])
            .inspect_err(|_| nl.close())?;

        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if raw < 0 {
            let err = io::Error::last_os_error();
            warn!("cannot open ioctl socket: {}", err);
            nl.close();
            return Err(Error::Io(err));
        }
        let ioctl_fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let watcher = Rc::new(Self {
            nl,
            listeners: ListenerSet::default(),
            feedback: FeedbackTracker::default(),
            ioctl_fd,
        });
        watcher.nl.set_consumer(&watcher);
        Ok(watcher)
    }

    /// The underlying transport handle.
    pub fn netlink(&self) -> &Rc<NetlinkHandle> {
        &self.nl
    }

    /// Interrupt all pending address operations and close the socket.
    pub fn close(&self) {
        self.feedback.complete_all(-1);
        self.nl.close();
    }

    /// Register an interface listener. Fan-out preserves registration
    /// order.
    pub fn listener_add(&self, listener: ListenerFn) -> ListenerHandle {
        self.listeners.add(listener)
    }

    /// Remove an interface listener.
    pub fn listener_remove(&self, handle: ListenerHandle) {
        self.listeners.remove(handle);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Number of address operations waiting for completion.
    pub fn pending_ops(&self) -> usize {
        self.feedback.len()
    }

    /// Set an interface administratively up or down via ioctl. Already
    /// being in the requested state is not an error.
    pub fn set_interface_state(&self, name: &str, up: bool) -> Result<()> {
        crate::util::ifname::validate(name)
            .map_err(|_| Error::InterfaceNotFound { name: name.into() })?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }

        let fd = self.ioctl_fd.as_raw_fd();
        if unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr) } < 0 {
            let err = io::Error::last_os_error();
            warn!(device = name, "ioctl SIOCGIFFLAGS failed: {}", err);
            return Err(Error::Io(err));
        }

        let old_flags = unsafe { ifr.ifr_ifru.ifru_flags };
        let new_flags = if up {
            old_flags | IFF_UP as libc::c_short
        } else {
            old_flags & !(IFF_UP as libc::c_short)
        };
        if new_flags == old_flags {
            // Interface is already in the requested state.
            return Ok(());
        }

        ifr.ifr_ifru.ifru_flags = new_flags;
        if unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &ifr) } < 0 {
            let err = io::Error::last_os_error();
            warn!(
                device = name,
                up, "ioctl SIOCSIFFLAGS failed: {}", err
            );
            return Err(Error::Io(err));
        }
        Ok(())
    }

    /// Submit an address set/remove request. When the op carries a
    /// completion callback it is tracked until its terminating event.
    pub fn addr_set(&self, op: &Rc<AddressOp>) -> Result<()> {
        let msg = build_addr_request(op)?;
        debug!(
            if_index = op.if_index,
            address = %op.address,
            set = op.set,
            "submitting interface address request"
        );
        let seq = self.nl.send(msg);
        if op.has_callback() {
            self.feedback.register(op, seq);
        }
        Ok(())
    }

    /// Cancel a pending address operation; its callback fires with -1.
    /// Safe to call for ops that already completed.
    pub fn addr_interrupt(&self, op: &Rc<AddressOp>) {
        self.feedback.finish(op, -1);
    }
}

impl NetlinkConsumer for RtnlWatcher {
    fn on_message(&self, hdr: &NlMsgHdr, payload: &[u8]) {
        let event = match hdr.nlmsg_type {
            NlMsgType::RTM_NEWLINK | NlMsgType::RTM_DELLINK => link_event(payload),
            NlMsgType::RTM_NEWADDR | NlMsgType::RTM_DELADDR => addr_event(payload),
            other => {
                debug!(msg_type = other, "unhandled routing message");
                return;
            }
        };
        match event {
            Ok((if_index, went_down)) => {
                debug!(if_index, went_down, "interface state event");
                self.listeners.notify(if_index, went_down);
            }
            Err(err) => warn!("malformed routing message dropped: {}", err),
        }
    }

    fn on_done(&self, seq: u32) {
        self.feedback.complete_seq(seq, 0);
    }

    fn on_error(&self, seq: u32, error: i32) {
        self.feedback.complete_seq(seq, error);
    }

    fn on_timeout(&self) {
        self.feedback.complete_all(-1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::AttrIter;
    use crate::netlink::message::{MessageIter, NLM_F_CREATE};
    use std::net::Ipv4Addr;
    use zerocopy::IntoBytes;

    #[test]
    fn test_link_event_up_down() {
        let up = IfInfoMsg {
            ifi_index: 3,
            ifi_flags: IFF_UP,
            ..Default::default()
        };
        let (idx, down) = link_event(<IfInfoMsg as IntoBytes>::as_bytes(&up)).unwrap();
        assert_eq!(idx, 3);
        assert!(!down);

        let dead = IfInfoMsg {
            ifi_index: 3,
            ifi_flags: 0,
            ..Default::default()
        };
        let (_, down) = link_event(<IfInfoMsg as IntoBytes>::as_bytes(&dead)).unwrap();
        assert!(down);
    }

    #[test]
    fn test_addr_event() {
        let msg = IfAddrMsg {
            ifa_family: libc::AF_INET as u8,
            ifa_index: 7,
            ifa_flags: IFF_UP as u8,
            ..Default::default()
        };
        let (idx, down) = addr_event(<IfAddrMsg as IntoBytes>::as_bytes(&msg)).unwrap();
        assert_eq!(idx, 7);
        assert!(!down);
    }

    #[test]
    fn test_listener_order_preserved() {
        let set = ListenerSet::default();
        let order = Rc::new(RefCell::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let o = order.clone();
            set.add(Box::new(move |_, _| o.borrow_mut().push(label)));
        }
        set.notify(1, false);
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_listener_removed_mid_fanout_is_skipped() {
        let set = Rc::new(ListenerSet::default());
        let hits = Rc::new(Cell::new(0u32));

        // The first listener removes the second during fan-out.
        let slot: Rc<Cell<Option<ListenerHandle>>> = Rc::new(Cell::new(None));
        let s = set.clone();
        let victim = slot.clone();
        set.add(Box::new(move |_, _| {
            if let Some(handle) = victim.take() {
                s.remove(handle);
            }
        }));
        let h = hits.clone();
        let handle = set.add(Box::new(move |_, _| h.set(h.get() + 1)));
        slot.set(Some(handle));

        set.notify(1, false);
        assert_eq!(hits.get(), 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_feedback_fires_exactly_once() {
        let tracker = FeedbackTracker::default();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let f = fired.clone();
        let op = AddressOp::add(
            3,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            24,
            types::scope::UNIVERSE,
            Some(Box::new(move |_, err| f.borrow_mut().push(err))),
        );

        tracker.register(&op, 41);
        tracker.complete_seq(41, 0);
        tracker.complete_seq(41, 0);
        tracker.complete_all(-1);
        assert_eq!(*fired.borrow(), vec![0]);
        assert!(!op.is_pending());
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_feedback_error_code_passthrough() {
        let tracker = FeedbackTracker::default();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        let op = AddressOp::add(
            3,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            24,
            types::scope::UNIVERSE,
            Some(Box::new(move |_, err| f.set(err))),
        );

        tracker.register(&op, 42);
        tracker.complete_seq(42, 17); // EEXIST
        assert_eq!(fired.get(), 17);
    }

    #[test]
    fn test_timeout_completes_all_with_minus_one() {
        let tracker = FeedbackTracker::default();
        let fired = Rc::new(RefCell::new(Vec::new()));
        for seq in [50u32, 51] {
            let f = fired.clone();
            let op = AddressOp::remove(
                3,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                24,
                types::scope::UNIVERSE,
                Some(Box::new(move |op, err| f.borrow_mut().push((op.seq(), err)))),
            );
            tracker.register(&op, seq);
        }

        tracker.complete_all(-1);
        assert_eq!(*fired.borrow(), vec![(50, -1), (51, -1)]);
    }

    #[test]
    fn test_recursive_interrupt_is_safe() {
        let tracker = Rc::new(FeedbackTracker::default());
        let fired = Rc::new(Cell::new(0u32));

        let slot: Rc<RefCell<Option<Rc<AddressOp>>>> = Rc::new(RefCell::new(None));
        let t = tracker.clone();
        let s = slot.clone();
        let f = fired.clone();
        let op = AddressOp::add(
            3,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            24,
            types::scope::UNIVERSE,
            Some(Box::new(move |_, _| {
                f.set(f.get() + 1);
                // Interrupting ourselves from within the completion
                // callback must be a no-op.
                if let Some(me) = s.borrow().as_ref() {
                    t.finish(me, -1);
                }
            })),
        );
        *slot.borrow_mut() = Some(op.clone());

        tracker.register(&op, 60);
        tracker.finish(&op, -1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_build_addr_request_set() {
        let op = AddressOp::add(
            9,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)),
            24,
            types::scope::UNIVERSE,
            None,
        );
        let bytes = build_addr_request(&op).unwrap().finish();

        let (hdr, payload) = MessageIter::new(&bytes).next().unwrap().unwrap();
        assert_eq!(hdr.nlmsg_type, NlMsgType::RTM_NEWADDR);
        assert!(hdr.nlmsg_flags & NLM_F_CREATE != 0);

        let addr_hdr = IfAddrMsg::from_bytes(payload).unwrap();
        assert_eq!(addr_hdr.ifa_index, 9);
        assert_eq!(addr_hdr.ifa_prefixlen, 24);

        let attrs: Vec<(u16, Vec<u8>)> = AttrIter::new(&payload[IfAddrMsg::SIZE..])
            .map(|(t, p)| (t, p.to_vec()))
            .collect();
        assert_eq!(attrs, vec![(IFA_LOCAL, vec![192, 168, 1, 5])]);
    }

    #[test]
    fn test_build_addr_request_remove() {
        let op = AddressOp::remove(
            9,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)),
            24,
            types::scope::UNIVERSE,
            None,
        );
        let bytes = build_addr_request(&op).unwrap().finish();
        let (hdr, _) = MessageIter::new(&bytes).next().unwrap().unwrap();
        assert_eq!(hdr.nlmsg_type, NlMsgType::RTM_DELADDR);
        assert!(hdr.nlmsg_flags & NLM_F_CREATE == 0);
    }
}
