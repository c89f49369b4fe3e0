//! nl80211 driver: periodic station/scan dumps into the layer-2 model.
//!
//! The driver owns one generic-netlink transport handle. At startup it
//! asks the control family for the nl80211 family id and joins the
//! "mlme" multicast group when the reply lists one. A periodic timer
//! then walks the interface registry, issuing one dump request per
//! firing; the walk also advances on every done/error/timeout event, so
//! polling liveness is coupled to reply completion and slow interfaces
//! cannot pile up requests.

pub mod attrs;
pub(crate) mod parse;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::Core;
use crate::error::Result;
use crate::ifmap::{Interface, InterfaceRegistry};
use crate::layer2::{Layer2Registry, NetField};
use crate::netlink::builder::MessageBuilder;
use crate::netlink::genl::{CtrlCmd, GENL_HDRLEN, GENL_ID_CTRL, GenlMsgHdr};
use crate::netlink::message::{NLM_F_DUMP, NLM_F_REQUEST, NlMsgHdr};
use crate::netlink::transport::{NetlinkConsumer, NetlinkHandle, Protocol};
use crate::timer::{TimerClass, TimerEntry};
use crate::util::addr::MacAddr;
use self::attrs::{FAMILY_NAME, MLME_GROUP, cmd};

/// Smallest accepted polling interval.
pub const MIN_INTERVAL_MS: u64 = 100;

/// Default polling interval.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct Nl80211Config {
    /// Interval between two link-layer information updates, in ms.
    /// Values below [`MIN_INTERVAL_MS`] are clamped up.
    pub interval_ms: u64,
    /// Additional interface names to observe.
    pub interfaces: Vec<String>,
}

impl Default for Nl80211Config {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            interfaces: Vec::new(),
        }
    }
}

impl Nl80211Config {
    /// The polling interval with the minimum applied.
    pub fn effective_interval(&self) -> u64 {
        if self.interval_ms < MIN_INTERVAL_MS {
            warn!(
                requested = self.interval_ms,
                minimum = MIN_INTERVAL_MS,
                "polling interval clamped"
            );
        }
        self.interval_ms.max(MIN_INTERVAL_MS)
    }
}

/// Kind of per-interface dump the iterator issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    StationDump,
    ScanDump,
}

impl QueryType {
    const FIRST: QueryType = QueryType::StationDump;

    fn next(self) -> Option<QueryType> {
        match self {
            QueryType::StationDump => Some(QueryType::ScanDump),
            QueryType::ScanDump => None,
        }
    }
}

/// Iterator state over (interface, query type) pairs.
///
/// Each call to [`QueryIterator::advance`] yields the next pair: the
/// smallest interface name strictly greater than the last one queried,
/// rolling over to the next query type at the end of the registry, and
/// going idle once every type has covered every interface.
pub(crate) struct QueryIterator {
    last_queried: RefCell<String>,
    query_type: Cell<QueryType>,
}

impl QueryIterator {
    fn new() -> Self {
        Self {
            last_queried: RefCell::new(String::new()),
            query_type: Cell::new(QueryType::FIRST),
        }
    }

    fn reset(&self) {
        self.last_queried.borrow_mut().clear();
        self.query_type.set(QueryType::FIRST);
    }

    fn advance(&self, interfaces: &InterfaceRegistry) -> Option<(Interface, QueryType)> {
        if interfaces.is_empty() {
            self.reset();
            return None;
        }

        let last = self.last_queried.borrow().clone();
        let mut query_type = self.query_type.get();
        let mut next = if last.is_empty() {
            interfaces.first()
        } else {
            interfaces.next_after(&last)
        };

        let interface = loop {
            match next {
                Some(interface) => break interface,
                None => match query_type.next() {
                    Some(advanced) => {
                        query_type = advanced;
                        next = interfaces.first();
                    }
                    None => {
                        self.reset();
                        return None;
                    }
                },
            }
        };

        *self.last_queried.borrow_mut() = interface.name.clone();
        self.query_type.set(query_type);
        Some((interface, query_type))
    }
}

/// The nl80211 listener driver.
pub struct Nl80211Driver {
    core: Rc<Core>,
    nl: Rc<NetlinkHandle>,
    interfaces: Rc<InterfaceRegistry>,
    layer2: Rc<RefCell<Layer2Registry>>,
    family_id: Cell<Option<u16>>,
    mc_joined: Cell<bool>,
    iter: QueryIterator,
    l2_origin: u32,
    timer_class: Rc<TimerClass>,
    timer: Rc<TimerEntry>,
}

impl Nl80211Driver {
    /// Open the generic netlink socket, arm the transmission timer and
    /// request the family table.
    pub fn new(
        core: &Rc<Core>,
        interfaces: &Rc<InterfaceRegistry>,
        layer2: &Rc<RefCell<Layer2Registry>>,
        config: &Nl80211Config,
    ) -> Result<Rc<Self>> {
        let nl = NetlinkHandle::open(core, Protocol::Generic, "nl80211")?;
        let l2_origin = layer2.borrow_mut().register_origin();

        let interval = config.effective_interval();
        let timer_class = core.timers.add_class("nl80211 listener timer", true);
        let timer = core.timers.entry(&timer_class, interval, Box::new(|| {}));

        let driver = Rc::new(Self {
            core: core.clone(),
            nl,
            interfaces: interfaces.clone(),
            layer2: layer2.clone(),
            family_id: Cell::new(None),
            mc_joined: Cell::new(false),
            iter: QueryIterator::new(),
            l2_origin,
            timer_class,
            timer,
        });

        let weak = Rc::downgrade(&driver);
        driver.timer.replace_callback(Box::new(move || {
            if let Some(driver) = weak.upgrade() {
                driver.transmission_event();
            }
        }));
        driver.nl.set_consumer(&driver);

        core.timers
            .set(&driver.timer, core.clock.absolute(interval));
        driver.send_getfamily();
        Ok(driver)
    }

    /// Stop the timer, expire this driver's records and close the
    /// socket.
    pub fn close(&self) {
        self.core.timers.stop(&self.timer);
        self.core.timers.remove_class(&self.timer_class);
        self.layer2.borrow_mut().cleanup_origin(self.l2_origin);
        self.nl.close();
    }

    /// Discovered nl80211 family id, once the control reply arrived.
    pub fn family_id(&self) -> Option<u16> {
        self.family_id.get()
    }

    /// Whether the mlme multicast group was joined.
    pub fn multicast_joined(&self) -> bool {
        self.mc_joined.get()
    }

    /// Origin token this driver writes layer-2 records under.
    pub fn origin(&self) -> u32 {
        self.l2_origin
    }

    /// Request the generic family table from the control family.
    fn send_getfamily(&self) {
        let mut msg = MessageBuilder::new(GENL_ID_CTRL, NLM_F_REQUEST | NLM_F_DUMP);
        if let Err(err) = msg.append_header(&GenlMsgHdr::new(CtrlCmd::GetFamily as u8, 1)) {
            warn!("cannot build family request: {}", err);
            return;
        }
        self.nl.send(msg);
    }

    fn send_dump(&self, family: u16, dump_cmd: u8, if_index: u32) {
        let mut msg = MessageBuilder::new(family, NLM_F_REQUEST | NLM_F_DUMP);
        let built = msg
            .append_header(&GenlMsgHdr::new(dump_cmd, 0))
            .and_then(|_| msg.append_attr_u32(attrs::attr::IFINDEX, if_index));
        if let Err(err) = built {
            warn!(if_index, "cannot build dump request: {}", err);
            return;
        }
        self.nl.send(msg);
    }

    /// Issue the next per-interface query, if any. Triggered by the
    /// periodic timer and by every reply completion.
    fn transmission_event(&self) {
        // Nothing to ask until family discovery answered.
        let Some(family) = self.family_id.get() else {
            return;
        };
        let Some((interface, query_type)) = self.iter.advance(&self.interfaces) else {
            return;
        };
        debug!(
            query = ?query_type,
            interface = %interface.name,
            if_index = interface.index,
            "sending nl80211 query"
        );
        let dump_cmd = match query_type {
            QueryType::StationDump => cmd::GET_STATION,
            QueryType::ScanDump => cmd::GET_SCAN,
        };
        self.send_dump(family, dump_cmd, interface.index);
    }

    fn handle_family(&self, data: &[u8]) {
        let family = match parse::parse_family(data) {
            Ok(family) => family,
            Err(err) => {
                warn!("cannot parse family record: {}", err);
                return;
            }
        };
        if family.name != FAMILY_NAME {
            // Some other family in the dump.
            return;
        }
        debug!(id = family.id, "found nl80211 family");
        self.family_id.set(Some(family.id));

        if self.mc_joined.get() {
            return;
        }
        if let Some((_, group)) = family
            .mcast_groups
            .iter()
            .find(|(name, _)| name == MLME_GROUP)
        {
            match self.nl.join_multicast(&[*group]) {
                Ok(()) => {
                    debug!(group, "joined mlme multicast group");
                    self.mc_joined.set(true);
                }
                Err(err) => {
                    warn!(group, "could not join mlme multicast group: {}", err);
                }
            }
        }
    }

    /// Look up the local interface a reply refers to. Replies for
    /// interfaces we do not track (or whose MAC is unknown) are
    /// dropped.
    fn reply_interface(&self, if_index: u32) -> Option<(Interface, MacAddr)> {
        let interface = self.interfaces.by_index(if_index)?;
        let Some(mac) = interface.mac else {
            debug!(
                interface = %interface.name,
                "dropping reply for interface without hardware address"
            );
            return None;
        };
        Some((interface, mac))
    }

    fn handle_new_station(&self, data: &[u8]) {
        let record = match parse::parse_station(data) {
            Ok(record) => record,
            Err(err) => {
                warn!("malformed station entry dropped: {}", err);
                return;
            }
        };
        let Some((interface, if_mac)) = self.reply_interface(record.if_index) else {
            return;
        };

        let mut layer2 = self.layer2.borrow_mut();
        let net = layer2.net_entry(if_mac, interface.index, &interface.name);
        let neigh = net.neigh_entry(record.mac);
        neigh.reset_all();
        if let Some(inactive) = record.inactive_ms {
            neigh.last_seen = self.core.clock.now().saturating_sub(inactive as u64);
        }
        for (field, value) in &record.values {
            neigh.set_value(*field, self.l2_origin, *value);
        }
        layer2.commit();
        debug!(
            station = %record.mac,
            interface = %interface.name,
            "updated neighbor"
        );
    }

    fn handle_del_station(&self, data: &[u8]) {
        let (if_index, mac) = match parse::parse_station_key(data) {
            Ok(key) => key,
            Err(err) => {
                warn!("malformed station removal dropped: {}", err);
                return;
            }
        };
        let Some((interface, if_mac)) = self.reply_interface(if_index) else {
            return;
        };

        let mut layer2 = self.layer2.borrow_mut();
        if let Some(net) = layer2.net_get_mut(&if_mac) {
            net.neigh_remove(&mac, self.l2_origin);
            layer2.commit();
            debug!(station = %mac, interface = %interface.name, "removed neighbor");
        }
    }

    fn handle_scan_result(&self, data: &[u8]) {
        let record = match parse::parse_scan(data) {
            Ok(record) => record,
            Err(err) => {
                warn!("malformed scan entry dropped: {}", err);
                return;
            }
        };
        let Some((interface, if_mac)) = self.reply_interface(record.if_index) else {
            return;
        };

        let mut layer2 = self.layer2.borrow_mut();
        let net = layer2.net_entry(if_mac, interface.index, &interface.name);
        net.reset_values();
        if record.bssid.is_some() {
            net.net_id = record.bssid;
        }
        if let Some(ssid) = &record.ssid {
            net.if_ident = ssid.clone();
        }
        if let Some(frequency) = record.frequency_hz {
            net.set_value(NetField::Frequency, self.l2_origin, frequency);
        }
        if let Some(max_bitrate) = record.max_bitrate {
            net.set_value(NetField::MaxBitrate, self.l2_origin, max_bitrate);
        }
        if let Some(seen_ms) = record.seen_ms_ago {
            net.last_seen = self.core.clock.now().saturating_sub(seen_ms as u64);
        }
        layer2.commit();
        debug!(interface = %interface.name, "updated radio network");
    }
}

impl NetlinkConsumer for Nl80211Driver {
    fn on_message(&self, hdr: &NlMsgHdr, payload: &[u8]) {
        let Some(genl) = GenlMsgHdr::from_bytes(payload) else {
            warn!("generic netlink message without header dropped");
            return;
        };
        let data = &payload[GENL_HDRLEN..];

        if hdr.nlmsg_type == GENL_ID_CTRL && genl.cmd == CtrlCmd::NewFamily as u8 {
            self.handle_family(data);
            return;
        }
        if Some(hdr.nlmsg_type) == self.family_id.get() {
            match genl.cmd {
                c if c == cmd::NEW_STATION => self.handle_new_station(data),
                c if c == cmd::DEL_STATION => self.handle_del_station(data),
                c if c == cmd::NEW_SCAN_RESULTS => self.handle_scan_result(data),
                other => debug!(cmd = other, "unhandled nl80211 command"),
            }
            return;
        }
        debug!(
            msg_type = hdr.nlmsg_type,
            cmd = genl.cmd,
            "unhandled generic netlink message"
        );
    }

    fn on_done(&self, seq: u32) {
        debug!(seq, "nl80211 query finished");
        self.transmission_event();
    }

    fn on_error(&self, seq: u32, error: i32) {
        debug!(seq, error, "nl80211 query failed, advancing");
        self.transmission_event();
    }

    fn on_timeout(&self) {
        debug!("nl80211 query timed out, advancing");
        self.transmission_event();
    }
}
