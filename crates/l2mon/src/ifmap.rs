//! Registry of observed interfaces, ordered by name.
//!
//! The ordering matters: the periodic query iterator walks interfaces
//! by "smallest name strictly greater than the last one queried", so
//! the registry is a name-keyed ordered map rather than an index-keyed
//! table.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::util::addr::MacAddr;
use crate::util::ifname;

/// One observed interface.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    /// Hardware address, when known. Consumers that key data by MAC
    /// skip interfaces without one.
    pub mac: Option<MacAddr>,
}

/// Ordered interface registry.
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    map: RefCell<BTreeMap<String, Interface>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an interface. The name is validated.
    pub fn add(&self, interface: Interface) -> Result<(), ifname::IfError> {
        ifname::validate(&interface.name)?;
        self.map
            .borrow_mut()
            .insert(interface.name.clone(), interface);
        Ok(())
    }

    /// Remove an interface by name.
    pub fn remove(&self, name: &str) {
        self.map.borrow_mut().remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Interface> {
        self.map.borrow().get(name).cloned()
    }

    pub fn by_index(&self, index: u32) -> Option<Interface> {
        self.map
            .borrow()
            .values()
            .find(|i| i.index == index)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    /// First interface in name order.
    pub fn first(&self) -> Option<Interface> {
        self.map.borrow().values().next().cloned()
    }

    /// Smallest interface whose name is strictly greater than `name`.
    pub fn next_after(&self, name: &str) -> Option<Interface> {
        self.map
            .borrow()
            .range::<str, _>((Bound::Excluded(name), Bound::Unbounded))
            .next()
            .map(|(_, i)| i.clone())
    }

    /// All names in order.
    pub fn names(&self) -> Vec<String> {
        self.map.borrow().keys().cloned().collect()
    }
}
