//! Subsystem registry: ordered init/cleanup with declared dependencies.
//!
//! Subsystems declare the names of other subsystems they depend on;
//! the registry initializes leaves first and cleans up in reverse.
//! A typed lifecycle marker makes repeated init/cleanup idempotent, so
//! partial-failure unwinding never double-cleans.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Lifecycle of a registered subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Down,
    Up,
}

/// One unit of daemon functionality with a managed lifecycle.
pub trait Subsystem {
    /// Unique name, referenced by dependents.
    fn name(&self) -> &'static str;

    /// Names of subsystems that must be up before this one.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Bring the subsystem up. Called at most once per Down→Up edge.
    fn init(&self) -> Result<()>;

    /// Tear the subsystem down. Called at most once per Up→Down edge.
    fn cleanup(&self);

    /// Optional soft enable; only invoked while up.
    fn enable(&self) {}

    /// Optional soft disable; only invoked while up.
    fn disable(&self) {}
}

struct Entry {
    subsystem: Rc<dyn Subsystem>,
    state: Cell<LifecycleState>,
}

/// Registry driving subsystem lifecycles.
#[derive(Default)]
pub struct SubsystemRegistry {
    entries: RefCell<Vec<Entry>>,
    // Names in the order they were brought up, for reverse cleanup.
    init_order: RefCell<Vec<&'static str>>,
}

impl SubsystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subsystem. Registration order is the tie-breaker
    /// within one dependency rank.
    pub fn register(&self, subsystem: Rc<dyn Subsystem>) {
        self.entries.borrow_mut().push(Entry {
            subsystem,
            state: Cell::new(LifecycleState::Down),
        });
    }

    /// Current lifecycle state of a subsystem, if registered.
    pub fn state(&self, name: &str) -> Option<LifecycleState> {
        self.entries
            .borrow()
            .iter()
            .find(|e| e.subsystem.name() == name)
            .map(|e| e.state.get())
    }

    /// Resolve a stable dependency order, leaves first.
    fn topo_order(&self) -> Result<Vec<&'static str>> {
        fn placed(order: &[&str], name: &str) -> bool {
            order.iter().any(|n| *n == name)
        }

        let entries = self.entries.borrow();
        let mut order: Vec<&'static str> = Vec::with_capacity(entries.len());

        loop {
            let mut progressed = false;
            for entry in entries.iter() {
                let name = entry.subsystem.name();
                if placed(&order, name) {
                    continue;
                }
                let mut ready = true;
                for dep in entry.subsystem.dependencies() {
                    if !entries.iter().any(|e| e.subsystem.name() == *dep) {
                        return Err(Error::Dependency {
                            subsystem: name.to_string(),
                            dependency: dep.to_string(),
                        });
                    }
                    if !placed(&order, dep) {
                        ready = false;
                        break;
                    }
                }
                if ready {
                    order.push(name);
                    progressed = true;
                }
            }
            if order.len() == entries.len() {
                return Ok(order);
            }
            if !progressed {
                // Everything left participates in a cycle; report the
                // first one for diagnosis.
                let stuck = entries
                    .iter()
                    .map(|e| e.subsystem.name())
                    .find(|n| !order.contains(n))
                    .unwrap_or("?");
                return Err(Error::Dependency {
                    subsystem: stuck.to_string(),
                    dependency: "<cycle>".to_string(),
                });
            }
        }
    }

    fn init_one(&self, name: &str) -> Result<()> {
        let entries = self.entries.borrow();
        let entry = entries
            .iter()
            .find(|e| e.subsystem.name() == name)
            .expect("name from topo order");
        if entry.state.get() == LifecycleState::Up {
            debug!(subsystem = name, "already initialized, skipping");
            return Ok(());
        }
        entry.subsystem.init()?;
        entry.state.set(LifecycleState::Up);
        let subsystem_name = entry.subsystem.name();
        drop(entries);
        self.init_order.borrow_mut().push(subsystem_name);
        debug!(subsystem = name, "initialized");
        Ok(())
    }

    fn cleanup_one(&self, name: &str) {
        let entries = self.entries.borrow();
        if let Some(entry) = entries.iter().find(|e| e.subsystem.name() == name) {
            if entry.state.get() == LifecycleState::Down {
                debug!(subsystem = name, "already down, skipping cleanup");
                return;
            }
            entry.subsystem.cleanup();
            entry.state.set(LifecycleState::Down);
            debug!(subsystem = name, "cleaned up");
        }
        drop(entries);
        self.init_order.borrow_mut().retain(|n| *n != name);
    }

    /// Initialize every registered subsystem in dependency order. On
    /// failure, already-initialized subsystems are unwound in reverse
    /// and the error is returned.
    pub fn init_all(&self) -> Result<()> {
        let order = self.topo_order()?;
        for name in &order {
            if let Err(err) = self.init_one(name) {
                warn!(subsystem = name, "init failed: {}, unwinding", err);
                self.cleanup_all();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Clean up every subsystem in reverse init order. Idempotent.
    pub fn cleanup_all(&self) {
        let order: Vec<&'static str> = self.init_order.borrow().clone();
        for name in order.iter().rev() {
            self.cleanup_one(name);
        }
    }

    /// Soft-enable a subsystem; no-op unless it is up.
    pub fn enable(&self, name: &str) {
        let entries = self.entries.borrow();
        if let Some(entry) = entries.iter().find(|e| e.subsystem.name() == name)
            && entry.state.get() == LifecycleState::Up
        {
            entry.subsystem.enable();
        }
    }

    /// Soft-disable a subsystem; no-op unless it is up.
    pub fn disable(&self, name: &str) {
        let entries = self.entries.borrow();
        if let Some(entry) = entries.iter().find(|e| e.subsystem.name() == name)
            && entry.state.get() == LifecycleState::Up
        {
            entry.subsystem.disable();
        }
    }
}
