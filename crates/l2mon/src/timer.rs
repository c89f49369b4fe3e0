//! Timer wheel: an ordered set of one-shot and periodic deadlines.
//!
//! Timers are grouped into classes. A [`TimerClass`] carries the shared
//! metadata (name, periodic flag); a [`TimerEntry`] is one armed or
//! disarmed instance with its own callback and period. The wheel itself
//! only orders deadlines; the event loop asks for
//! [`TimerWheel::next_deadline`] before blocking and calls
//! [`TimerWheel::process`] afterwards.
//!
//! Everything here runs on the single scheduler thread. Callbacks may
//! freely arm, re-arm or stop timers (including their own entry): due
//! entries are detached from the wheel before any callback runs.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Shared metadata for a group of timer entries.
#[derive(Debug)]
pub struct TimerClass {
    name: &'static str,
    periodic: bool,
}

impl TimerClass {
    /// Name of the class, used as a logging tag.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether entries of this class re-arm themselves after firing.
    pub fn is_periodic(&self) -> bool {
        self.periodic
    }
}

/// One timer instance.
///
/// While running, exactly one pending firing exists in the wheel;
/// stopping removes that firing.
pub struct TimerEntry {
    class: Rc<TimerClass>,
    callback: RefCell<Box<dyn FnMut()>>,
    deadline: Cell<u64>,
    period: Cell<u64>,
    running: Cell<bool>,
    id: u64,
}

impl TimerEntry {
    /// The class this entry belongs to.
    pub fn class(&self) -> &Rc<TimerClass> {
        &self.class
    }

    /// Period in milliseconds; 0 for one-shot entries.
    pub fn period(&self) -> u64 {
        self.period.get()
    }

    /// Change the period of a periodic entry. Takes effect on the next
    /// re-arm.
    pub fn set_period(&self, period_ms: u64) {
        self.period.set(period_ms);
    }

    /// Replace the callback. Used by owners that need the entry to
    /// exist before the final callback can capture a reference back to
    /// them.
    pub fn replace_callback(&self, callback: Box<dyn FnMut()>) {
        *self.callback.borrow_mut() = callback;
    }
}

impl std::fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEntry")
            .field("class", &self.class.name)
            .field("deadline", &self.deadline.get())
            .field("period", &self.period.get())
            .field("running", &self.running.get())
            .finish()
    }
}

/// Ordered collection of armed timer entries.
pub struct TimerWheel {
    classes: RefCell<Vec<Rc<TimerClass>>>,
    // Keyed by (deadline, entry id); the id breaks ties between entries
    // sharing a deadline while keeping insertion order stable.
    queue: RefCell<BTreeMap<(u64, u64), Rc<TimerEntry>>>,
    next_id: Cell<u64>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            classes: RefCell::new(Vec::new()),
            queue: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
        }
    }

    /// Register a timer class.
    pub fn add_class(&self, name: &'static str, periodic: bool) -> Rc<TimerClass> {
        let class = Rc::new(TimerClass { name, periodic });
        self.classes.borrow_mut().push(class.clone());
        class
    }

    /// Unregister a class, stopping every running entry that belongs
    /// to it.
    pub fn remove_class(&self, class: &Rc<TimerClass>) {
        let stale: Vec<(u64, u64)> = self
            .queue
            .borrow()
            .iter()
            .filter(|(_, e)| Rc::ptr_eq(&e.class, class))
            .map(|(k, _)| *k)
            .collect();
        let mut queue = self.queue.borrow_mut();
        for key in stale {
            if let Some(entry) = queue.remove(&key) {
                entry.running.set(false);
            }
        }
        drop(queue);
        self.classes.borrow_mut().retain(|c| !Rc::ptr_eq(c, class));
    }

    /// Create a new, disarmed entry of the given class.
    ///
    /// `period_ms` is only meaningful for periodic classes; pass 0 for
    /// one-shot entries.
    pub fn entry(
        &self,
        class: &Rc<TimerClass>,
        period_ms: u64,
        callback: Box<dyn FnMut()>,
    ) -> Rc<TimerEntry> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        Rc::new(TimerEntry {
            class: class.clone(),
            callback: RefCell::new(callback),
            deadline: Cell::new(0),
            period: Cell::new(period_ms),
            running: Cell::new(false),
            id,
        })
    }

    /// Arm an entry at an absolute deadline, re-arming if it is already
    /// running.
    pub fn set(&self, entry: &Rc<TimerEntry>, deadline: u64) {
        let mut queue = self.queue.borrow_mut();
        if entry.running.get() {
            queue.remove(&(entry.deadline.get(), entry.id));
        }
        entry.deadline.set(deadline);
        entry.running.set(true);
        queue.insert((deadline, entry.id), entry.clone());
    }

    /// Disarm an entry. No-op when it is not running.
    pub fn stop(&self, entry: &Rc<TimerEntry>) {
        if entry.running.get() {
            self.queue
                .borrow_mut()
                .remove(&(entry.deadline.get(), entry.id));
            entry.running.set(false);
        }
    }

    /// Whether the entry currently has a pending firing.
    pub fn is_active(&self, entry: &Rc<TimerEntry>) -> bool {
        entry.running.get()
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.borrow().keys().next().map(|(d, _)| *d)
    }

    /// Fire every entry whose deadline is at or before `now`.
    ///
    /// Periodic entries are re-armed to `now + period` before their
    /// callback runs, so a callback-side `stop` wins over the re-arm.
    pub fn process(&self, now: u64) {
        let mut due: Vec<Rc<TimerEntry>> = Vec::new();
        {
            let mut queue = self.queue.borrow_mut();
            while let Some((key, entry)) = queue.pop_first() {
                if key.0 > now {
                    queue.insert(key, entry);
                    break;
                }
                entry.running.set(false);
                if entry.class.periodic && entry.period.get() > 0 {
                    let next = now + entry.period.get();
                    entry.deadline.set(next);
                    entry.running.set(true);
                    queue.insert((next, entry.id), entry.clone());
                }
                due.push(entry);
            }
        }
        for entry in due {
            (*entry.callback.borrow_mut())();
        }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_entry(
        wheel: &TimerWheel,
        class: &Rc<TimerClass>,
        period: u64,
    ) -> (Rc<TimerEntry>, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0u32));
        let c = count.clone();
        let entry = wheel.entry(class, period, Box::new(move || c.set(c.get() + 1)));
        (entry, count)
    }

    #[test]
    fn test_one_shot_fires_once() {
        let wheel = TimerWheel::new();
        let class = wheel.add_class("test", false);
        let (entry, count) = counter_entry(&wheel, &class, 0);

        wheel.set(&entry, 100);
        assert!(wheel.is_active(&entry));
        assert_eq!(wheel.next_deadline(), Some(100));

        wheel.process(99);
        assert_eq!(count.get(), 0);

        wheel.process(100);
        assert_eq!(count.get(), 1);
        assert!(!wheel.is_active(&entry));
        assert_eq!(wheel.next_deadline(), None);

        wheel.process(200);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_periodic_rearms() {
        let wheel = TimerWheel::new();
        let class = wheel.add_class("tick", true);
        let (entry, count) = counter_entry(&wheel, &class, 50);

        wheel.set(&entry, 50);
        wheel.process(50);
        assert_eq!(count.get(), 1);
        assert!(wheel.is_active(&entry));
        assert_eq!(wheel.next_deadline(), Some(100));

        wheel.process(100);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_stop_disarms() {
        let wheel = TimerWheel::new();
        let class = wheel.add_class("test", false);
        let (entry, count) = counter_entry(&wheel, &class, 0);

        wheel.set(&entry, 10);
        wheel.stop(&entry);
        assert!(!wheel.is_active(&entry));
        wheel.process(10);
        assert_eq!(count.get(), 0);

        // Stopping again is a no-op.
        wheel.stop(&entry);
    }

    #[test]
    fn test_rearm_moves_deadline() {
        let wheel = TimerWheel::new();
        let class = wheel.add_class("test", false);
        let (entry, count) = counter_entry(&wheel, &class, 0);

        wheel.set(&entry, 10);
        wheel.set(&entry, 500);
        assert_eq!(wheel.next_deadline(), Some(500));
        wheel.process(10);
        assert_eq!(count.get(), 0);
        wheel.process(500);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let wheel = TimerWheel::new();
        let class = wheel.add_class("test", false);
        let order = Rc::new(RefCell::new(Vec::new()));

        for (label, deadline) in [("b", 20u64), ("a", 10), ("c", 30)] {
            let o = order.clone();
            let entry = wheel.entry(&class, 0, Box::new(move || o.borrow_mut().push(label)));
            wheel.set(&entry, deadline);
        }

        wheel.process(100);
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_callback_stop_beats_periodic_rearm() {
        let wheel = Rc::new(TimerWheel::new());
        let class = wheel.add_class("tick", true);

        let slot: Rc<RefCell<Option<Rc<TimerEntry>>>> = Rc::new(RefCell::new(None));
        let w = wheel.clone();
        let s = slot.clone();
        let entry = wheel.entry(
            &class,
            50,
            Box::new(move || {
                if let Some(me) = s.borrow().as_ref() {
                    w.stop(me);
                }
            }),
        );
        *slot.borrow_mut() = Some(entry.clone());

        wheel.set(&entry, 50);
        wheel.process(50);
        assert!(!wheel.is_active(&entry));
        assert_eq!(wheel.next_deadline(), None);
    }

    #[test]
    fn test_remove_class_stops_instances() {
        let wheel = TimerWheel::new();
        let class = wheel.add_class("doomed", false);
        let (entry, count) = counter_entry(&wheel, &class, 0);

        wheel.set(&entry, 10);
        wheel.remove_class(&class);
        assert!(!wheel.is_active(&entry));
        wheel.process(10);
        assert_eq!(count.get(), 0);
    }
}
