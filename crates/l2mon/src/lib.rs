//! Event-driven link-layer monitoring core.
//!
//! This crate is the engine of a long-running, single-process daemon:
//! a cooperative socket scheduler, a timer wheel, and a netlink
//! transport on top of them, plus the two built-in netlink consumers:
//! an RTNETLINK watcher for interface/address events and an nl80211
//! driver that periodically polls per-interface station and scan dumps
//! into a link-layer data model.
//!
//! # Threading model
//!
//! Everything runs on one thread. A single caller enters
//! [`Core::run`]; every timer callback, socket handler and netlink
//! consumer callback executes on that thread, so no locks exist
//! anywhere in the crate and handles are shared via `Rc`.
//!
//! # Example
//!
//! ```ignore
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use l2mon::{Core, layer2::Layer2Registry, ifmap::InterfaceRegistry};
//! use l2mon::nl80211::{Nl80211Config, Nl80211Driver};
//! use l2mon::rtnl::RtnlWatcher;
//!
//! let core = Core::new();
//! let interfaces = Rc::new(InterfaceRegistry::new());
//! let layer2 = Rc::new(RefCell::new(Layer2Registry::new()));
//!
//! let watcher = RtnlWatcher::new(&core)?;
//! watcher.listener_add(Box::new(|if_index, went_down| {
//!     println!("interface {} {}", if_index, if went_down { "down" } else { "up" });
//! }));
//!
//! let driver = Nl80211Driver::new(&core, &interfaces, &layer2, &Nl80211Config::default())?;
//!
//! core.run(|| false, None)?;
//! # Ok::<(), l2mon::Error>(())
//! ```

pub mod clock;
pub mod error;
pub mod ifmap;
pub mod layer2;
pub mod netlink;
pub mod nl80211;
pub mod rtnl;
pub mod scheduler;
pub mod subsystem;
pub mod timer;
pub mod util;

#[cfg(test)]
pub(crate) mod fixtures;

use std::rc::Rc;

pub use clock::Clock;
pub use error::{Error, Result};
pub use scheduler::{SocketEntry, SocketScheduler, Stopped};
pub use subsystem::{LifecycleState, Subsystem, SubsystemRegistry};
pub use timer::TimerWheel;

/// The shared event-loop state: clock, timer wheel and socket
/// scheduler. Passed around as `Rc<Core>`; all members use interior
/// mutability under the single-thread contract.
pub struct Core {
    pub clock: Clock,
    pub timers: TimerWheel,
    pub sockets: SocketScheduler,
}

impl Core {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            clock: Clock::new(),
            timers: TimerWheel::new(),
            sockets: SocketScheduler::new(),
        })
    }

    /// Drive the event loop until `stop` returns true, the absolute
    /// `deadline` (ms, from [`Core::clock`]) passes, or a fatal wait
    /// error occurs.
    pub fn run(&self, stop: impl FnMut() -> bool, deadline: Option<u64>) -> Result<Stopped> {
        self.sockets.run(&self.clock, &self.timers, stop, deadline)
    }
}
