//! Link-layer data model: networks and neighbors.
//!
//! Every value written into the model is tagged with an origin token so
//! that records from different producers can be told apart and expired
//! together. Producers obtain a token once at startup via
//! [`Layer2Registry::register_origin`].

use std::collections::BTreeMap;

use crate::util::addr::MacAddr;

/// Per-neighbor value slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum NeighField {
    RxBytes = 0,
    RxFrames,
    TxBytes,
    TxFrames,
    TxRetries,
    TxFailed,
    /// Milli-dBm.
    Signal,
    /// Bits per second.
    RxBitrate,
    /// Bits per second.
    TxBitrate,
}

/// Number of per-neighbor value slots.
pub const NEIGH_FIELD_COUNT: usize = 9;

/// Per-network value slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum NetField {
    /// Hz.
    Frequency = 0,
    /// Bits per second.
    MaxBitrate,
}

/// Number of per-network value slots.
pub const NET_FIELD_COUNT: usize = 2;

/// One tagged value slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Value {
    value: i64,
    origin: u32,
    set: bool,
}

impl L2Value {
    /// Store a value under an origin token.
    pub fn set(&mut self, origin: u32, value: i64) {
        self.value = value;
        self.origin = origin;
        self.set = true;
    }

    /// Clear the slot.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// The stored value, if any.
    pub fn get(&self) -> Option<i64> {
        self.set.then_some(self.value)
    }

    /// The origin token of the stored value, if any.
    pub fn origin(&self) -> Option<u32> {
        self.set.then_some(self.origin)
    }
}

/// A neighbor (station) on a layer-2 network.
#[derive(Debug, Default)]
pub struct L2Neighbor {
    /// Absolute ms timestamp of the last observation; 0 when unknown.
    pub last_seen: u64,
    data: [L2Value; NEIGH_FIELD_COUNT],
}

impl L2Neighbor {
    pub fn value(&self, field: NeighField) -> &L2Value {
        &self.data[field as usize]
    }

    pub fn set_value(&mut self, field: NeighField, origin: u32, value: i64) {
        self.data[field as usize].set(origin, value);
    }

    pub fn reset_value(&mut self, field: NeighField) {
        self.data[field as usize].reset();
    }

    /// Clear every value slot and the last-seen timestamp.
    pub fn reset_all(&mut self) {
        for slot in &mut self.data {
            slot.reset();
        }
        self.last_seen = 0;
    }
}

/// A layer-2 network, keyed by the MAC of the local interface.
#[derive(Debug)]
pub struct L2Net {
    /// Interface index of the local interface.
    pub if_index: u32,
    /// Interface name of the local interface.
    pub if_name: String,
    /// Network identifier (BSSID for infrastructure networks).
    pub net_id: Option<MacAddr>,
    /// Human-readable network identity (SSID).
    pub if_ident: String,
    /// Absolute ms timestamp of the last observation; 0 when unknown.
    pub last_seen: u64,
    data: [L2Value; NET_FIELD_COUNT],
    neighbors: BTreeMap<MacAddr, L2Neighbor>,
}

impl L2Net {
    fn new(if_index: u32, if_name: &str) -> Self {
        Self {
            if_index,
            if_name: if_name.to_string(),
            net_id: None,
            if_ident: String::new(),
            last_seen: 0,
            data: Default::default(),
            neighbors: BTreeMap::new(),
        }
    }

    pub fn value(&self, field: NetField) -> &L2Value {
        &self.data[field as usize]
    }

    pub fn set_value(&mut self, field: NetField, origin: u32, value: i64) {
        self.data[field as usize].set(origin, value);
    }

    pub fn reset_value(&mut self, field: NetField) {
        self.data[field as usize].reset();
    }

    /// Clear every network value slot and the last-seen timestamp.
    /// Neighbors are untouched.
    pub fn reset_values(&mut self) {
        for slot in &mut self.data {
            slot.reset();
        }
        self.last_seen = 0;
    }

    /// Add-or-get a neighbor entry.
    pub fn neigh_entry(&mut self, mac: MacAddr) -> &mut L2Neighbor {
        self.neighbors.entry(mac).or_default()
    }

    pub fn neigh_get(&self, mac: &MacAddr) -> Option<&L2Neighbor> {
        self.neighbors.get(mac)
    }

    /// Remove a neighbor if its data belongs to `origin` (or it has no
    /// data at all).
    pub fn neigh_remove(&mut self, mac: &MacAddr, origin: u32) {
        let owned = self.neighbors.get(mac).is_some_and(|n| {
            n.data
                .iter()
                .all(|v| v.origin().is_none_or(|o| o == origin))
        });
        if owned {
            self.neighbors.remove(mac);
        }
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self) -> impl Iterator<Item = (&MacAddr, &L2Neighbor)> {
        self.neighbors.iter()
    }
}

/// The registry of layer-2 networks plus origin-token allocation.
#[derive(Debug, Default)]
pub struct Layer2Registry {
    nets: BTreeMap<MacAddr, L2Net>,
    next_origin: u32,
    generation: u64,
}

impl Layer2Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an origin token for a producer.
    pub fn register_origin(&mut self) -> u32 {
        self.next_origin += 1;
        self.next_origin
    }

    /// Add-or-get the network for a local interface MAC.
    pub fn net_entry(&mut self, key: MacAddr, if_index: u32, if_name: &str) -> &mut L2Net {
        self.nets
            .entry(key)
            .or_insert_with(|| L2Net::new(if_index, if_name))
    }

    pub fn net_get(&self, key: &MacAddr) -> Option<&L2Net> {
        self.nets.get(key)
    }

    pub fn net_get_mut(&mut self, key: &MacAddr) -> Option<&mut L2Net> {
        self.nets.get_mut(key)
    }

    /// Drop every value written under `origin` and prune entries that
    /// end up empty.
    pub fn cleanup_origin(&mut self, origin: u32) {
        for net in self.nets.values_mut() {
            for slot in &mut net.data {
                if slot.origin() == Some(origin) {
                    slot.reset();
                }
            }
            net.neighbors.retain(|_, neigh| {
                for slot in &mut neigh.data {
                    if slot.origin() == Some(origin) {
                        slot.reset();
                    }
                }
                neigh.data.iter().any(|v| v.get().is_some())
            });
        }
        self.nets.retain(|_, net| {
            !net.neighbors.is_empty() || net.data.iter().any(|v| v.get().is_some())
        });
    }

    /// Publish pending writes. Observable as a generation bump.
    pub fn commit(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Current generation counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn net_count(&self) -> usize {
        self.nets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_origin_tokens_are_distinct() {
        let mut reg = Layer2Registry::new();
        let a = reg.register_origin();
        let b = reg.register_origin();
        assert_ne!(a, b);
    }

    #[test]
    fn test_set_and_reset_value() {
        let mut reg = Layer2Registry::new();
        let origin = reg.register_origin();
        let net = reg.net_entry(mac(1), 3, "wlan0");
        let neigh = net.neigh_entry(mac(2));

        neigh.set_value(NeighField::TxBytes, origin, 1234);
        assert_eq!(neigh.value(NeighField::TxBytes).get(), Some(1234));
        assert_eq!(neigh.value(NeighField::TxBytes).origin(), Some(origin));

        neigh.reset_value(NeighField::TxBytes);
        assert_eq!(neigh.value(NeighField::TxBytes).get(), None);
    }

    #[test]
    fn test_commit_bumps_generation() {
        let mut reg = Layer2Registry::new();
        let before = reg.generation();
        reg.commit();
        assert_eq!(reg.generation(), before + 1);
    }

    #[test]
    fn test_neigh_remove_respects_origin() {
        let mut reg = Layer2Registry::new();
        let mine = reg.register_origin();
        let other = reg.register_origin();
        let net = reg.net_entry(mac(1), 3, "wlan0");

        net.neigh_entry(mac(2)).set_value(NeighField::Signal, other, -60_000);
        net.neigh_remove(&mac(2), mine);
        assert!(net.neigh_get(&mac(2)).is_some());

        net.neigh_remove(&mac(2), other);
        assert!(net.neigh_get(&mac(2)).is_none());
    }

    #[test]
    fn test_cleanup_origin_prunes_empty() {
        let mut reg = Layer2Registry::new();
        let origin = reg.register_origin();
        {
            let net = reg.net_entry(mac(1), 3, "wlan0");
            net.set_value(NetField::Frequency, origin, 2_412_000_000);
            net.neigh_entry(mac(2)).set_value(NeighField::RxBytes, origin, 5);
        }
        assert_eq!(reg.net_count(), 1);

        reg.cleanup_origin(origin);
        assert_eq!(reg.net_count(), 0);
    }
}
