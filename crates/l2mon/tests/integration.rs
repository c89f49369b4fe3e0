//! Integration tests against the running kernel.
//!
//! These need a Linux kernel with AF_NETLINK (any container will do;
//! no root required for dumps) and are therefore gated behind the
//! `integration` feature:
//!
//! ```sh
//! cargo test --test integration --features integration
//! ```

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use l2mon::Core;
use l2mon::netlink::message::{NLM_F_DUMP, NLM_F_REQUEST, NlMsgHdr, NlMsgType};
use l2mon::netlink::{MessageBuilder, NetlinkConsumer, NetlinkHandle, Protocol};
use l2mon::rtnl::{AddressOp, RtnlWatcher, types};

#[derive(Default)]
struct Recorder {
    messages: Cell<u32>,
    done: RefCell<Vec<u32>>,
    errors: RefCell<Vec<(u32, i32)>>,
    timeouts: Cell<u32>,
}

impl NetlinkConsumer for Recorder {
    fn on_message(&self, _hdr: &NlMsgHdr, _payload: &[u8]) {
        self.messages.set(self.messages.get() + 1);
    }

    fn on_done(&self, seq: u32) {
        self.done.borrow_mut().push(seq);
    }

    fn on_error(&self, seq: u32, error: i32) {
        self.errors.borrow_mut().push((seq, error));
    }

    fn on_timeout(&self) {
        self.timeouts.set(self.timeouts.get() + 1);
    }
}

/// RTM_GETLINK dump request: a zeroed ifinfomsg selects all interfaces.
fn getlink_request() -> MessageBuilder {
    let mut msg = MessageBuilder::new(NlMsgType::RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP);
    msg.append_bytes(&[0u8; 16]).unwrap();
    msg
}

#[test]
fn link_dump_roundtrip() {
    let core = Core::new();
    let nl = NetlinkHandle::open(&core, Protocol::Route, "test").unwrap();
    let recorder = Rc::new(Recorder::default());
    nl.set_consumer(&recorder);

    let seq = nl.send(getlink_request());
    assert_ne!(seq, 0);

    let r = recorder.clone();
    let stopped = core
        .run(
            move || !r.done.borrow().is_empty() || !r.errors.borrow().is_empty(),
            Some(core.clock.absolute(5000)),
        )
        .unwrap();
    assert_eq!(stopped, l2mon::Stopped::Predicate);

    // At least the loopback interface must have been reported, then
    // the terminating event for our sequence.
    assert!(recorder.messages.get() >= 1);
    assert_eq!(recorder.done.borrow().as_slice(), &[seq]);
    assert!(recorder.errors.borrow().is_empty());

    // Terminated request accounting: nothing outstanding, timeout off.
    assert_eq!(nl.in_transit(), 0);
    assert!(!nl.timeout_armed());

    nl.close();
}

#[test]
fn in_transit_tracks_timeout_arming() {
    let core = Core::new();
    let nl = NetlinkHandle::open(&core, Protocol::Route, "test").unwrap();
    let recorder = Rc::new(Recorder::default());
    nl.set_consumer(&recorder);

    nl.send(getlink_request());
    assert_eq!(nl.in_transit(), 0); // queued, not yet flushed
    assert!(!nl.timeout_armed());

    // One pass flushes; invariant: in-transit > 0 iff timeout armed.
    let r = recorder.clone();
    core.run(
        move || !r.done.borrow().is_empty(),
        Some(core.clock.absolute(5000)),
    )
    .unwrap();
    assert_eq!(nl.in_transit() > 0, nl.timeout_armed());

    nl.close();
}

#[test]
fn no_callbacks_after_close() {
    let core = Core::new();
    let nl = NetlinkHandle::open(&core, Protocol::Route, "test").unwrap();
    let recorder = Rc::new(Recorder::default());
    nl.set_consumer(&recorder);

    nl.send(getlink_request());
    nl.close();

    core.run(|| false, Some(core.clock.absolute(300))).unwrap();
    assert_eq!(recorder.messages.get(), 0);
    assert!(recorder.done.borrow().is_empty());
    assert!(recorder.errors.borrow().is_empty());
}

#[test]
fn watcher_address_op_completes_exactly_once() {
    let core = Core::new();
    let watcher = RtnlWatcher::new(&core).unwrap();

    let fired: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let f = fired.clone();
    let op = AddressOp::add(
        1, // loopback
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
        8,
        types::scope::HOST,
        Some(Box::new(move |_, errno| f.borrow_mut().push(errno))),
    );
    watcher.addr_set(&op).unwrap();
    assert_eq!(watcher.pending_ops(), 1);

    let f = fired.clone();
    core.run(
        move || !f.borrow().is_empty(),
        Some(core.clock.absolute(5000)),
    )
    .unwrap();

    // Exactly one completion: 0 when running privileged, a positive
    // errno (EPERM) otherwise.
    assert_eq!(fired.borrow().len(), 1);
    let errno = fired.borrow()[0];
    assert!(errno >= 0, "unexpected completion code {}", errno);
    assert_eq!(watcher.pending_ops(), 0);
    assert!(!op.is_pending());

    // Clean up the address if the set actually succeeded.
    if errno == 0 {
        let removed = Rc::new(Cell::new(false));
        let r = removed.clone();
        let op = AddressOp::remove(
            1,
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
            8,
            types::scope::HOST,
            Some(Box::new(move |_, _| r.set(true))),
        );
        watcher.addr_set(&op).unwrap();
        let r = removed.clone();
        core.run(move || r.get(), Some(core.clock.absolute(5000)))
            .unwrap();
    }

    watcher.close();
}

#[test]
fn interrupt_completes_with_minus_one() {
    let core = Core::new();
    let watcher = RtnlWatcher::new(&core).unwrap();

    let fired: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let f = fired.clone();
    let op = AddressOp::add(
        1,
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)),
        8,
        types::scope::HOST,
        Some(Box::new(move |_, errno| f.borrow_mut().push(errno))),
    );
    watcher.addr_set(&op).unwrap();
    watcher.addr_interrupt(&op);

    assert_eq!(fired.borrow().as_slice(), &[-1]);
    assert_eq!(watcher.pending_ops(), 0);

    // Whatever terminating event still arrives for the sequence must
    // not re-fire the callback.
    core.run(|| false, Some(core.clock.absolute(1000))).unwrap();
    assert_eq!(fired.borrow().len(), 1);

    watcher.close();
}
