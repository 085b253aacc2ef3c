//! Per-class replay gates
//!
//! A request against a table must not run before that table's class has
//! been replayed. Each class has a one-way gate: once set it stays set,
//! and setting it again is a no-op. Waiters block on a condition variable
//! until their gate opens or an absolute deadline passes. A timeout is
//! returned to the caller; there is no internal retry.

use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::observability::{Event, Logger};
use crate::range::{RangeSpec, TableClass, TableIdentifier, END_ROOT_ROW};

use super::errors::{RecoveryError, RecoveryResult};

#[derive(Debug, Default)]
struct Gates {
    open: [bool; 4],
    /// Classes in the order their gates opened
    order: Vec<TableClass>,
}

#[derive(Debug, Default)]
pub struct LogReplayBarrier {
    gates: Mutex<Gates>,
    opened: Condvar,
}

impl LogReplayBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate of `class`. Returns false if it was already open.
    pub fn set(&self, class: TableClass) -> bool {
        let mut gates = self.gates.lock().unwrap();
        if gates.open[class.index()] {
            return false;
        }
        gates.open[class.index()] = true;
        gates.order.push(class);
        drop(gates);
        self.opened.notify_all();
        Logger::event(Event::BarrierOpened, &[("class", class.as_str())]);
        true
    }

    pub fn is_set(&self, class: TableClass) -> bool {
        self.gates.lock().unwrap().open[class.index()]
    }

    /// Classes whose gates have opened, in opening order.
    pub fn open_order(&self) -> Vec<TableClass> {
        self.gates.lock().unwrap().order.clone()
    }

    /// Waits for the gate guarding requests on `table`.
    ///
    /// For the metadata table the gate depends on the range: the root range
    /// waits on the root gate, every other metadata range on the metadata
    /// gate. Without a range, metadata requests wait on the metadata gate.
    pub fn wait(
        &self,
        deadline: Instant,
        table: &TableIdentifier,
        range: Option<&RangeSpec>,
    ) -> RecoveryResult<()> {
        self.wait_for(deadline, Self::class_for(table, range))
    }

    fn class_for(table: &TableIdentifier, range: Option<&RangeSpec>) -> TableClass {
        if table.is_metadata() {
            match range {
                Some(range) if range.end_row == END_ROOT_ROW => TableClass::Root,
                _ => TableClass::Metadata,
            }
        } else if table.is_system() {
            TableClass::System
        } else {
            TableClass::User
        }
    }

    pub fn wait_for_root(&self, deadline: Instant) -> RecoveryResult<()> {
        self.wait_for(deadline, TableClass::Root)
    }

    pub fn wait_for_metadata(&self, deadline: Instant) -> RecoveryResult<()> {
        self.wait_for(deadline, TableClass::Metadata)
    }

    pub fn wait_for_system(&self, deadline: Instant) -> RecoveryResult<()> {
        self.wait_for(deadline, TableClass::System)
    }

    pub fn wait_for_user(&self, deadline: Instant) -> RecoveryResult<()> {
        self.wait_for(deadline, TableClass::User)
    }

    fn wait_for(&self, deadline: Instant, class: TableClass) -> RecoveryResult<()> {
        let mut gates = self.gates.lock().unwrap();
        while !gates.open[class.index()] {
            let now = Instant::now();
            if now >= deadline {
                return Err(RecoveryError::Timeout { class });
            }
            let (guard, _) = self.opened.wait_timeout(gates, deadline - now).unwrap();
            gates = guard;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn test_set_is_idempotent() {
        let barrier = LogReplayBarrier::new();
        assert!(barrier.set(TableClass::Root));
        assert!(!barrier.set(TableClass::Root));
        assert_eq!(barrier.open_order(), vec![TableClass::Root]);
    }

    #[test]
    fn test_wait_times_out_on_closed_gate() {
        let barrier = LogReplayBarrier::new();
        barrier.set(TableClass::Root);
        let err = barrier.wait_for_user(soon(20)).unwrap_err();
        assert!(matches!(err, RecoveryError::Timeout { class: TableClass::User }));
        barrier.wait_for_root(soon(20)).unwrap();
    }

    #[test]
    fn test_wait_wakes_when_gate_opens() {
        let barrier = Arc::new(LogReplayBarrier::new());
        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait_for_system(soon(5_000)))
        };
        thread::sleep(Duration::from_millis(20));
        barrier.set(TableClass::System);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_metadata_gate_selection() {
        let barrier = LogReplayBarrier::new();
        barrier.set(TableClass::Root);
        let metadata = TableIdentifier::metadata();

        let root_range = RangeSpec::new("", END_ROOT_ROW);
        barrier.wait(soon(20), &metadata, Some(&root_range)).unwrap();

        let other = RangeSpec::new(END_ROOT_ROW, "5:zzz");
        assert!(barrier.wait(soon(20), &metadata, Some(&other)).is_err());
        assert!(barrier.wait(soon(20), &metadata, None).is_err());
    }

    #[test]
    fn test_system_and_user_tables() {
        let barrier = LogReplayBarrier::new();
        barrier.set(TableClass::System);
        barrier
            .wait(soon(20), &TableIdentifier::new("0/1", 1), None)
            .unwrap();
        assert!(barrier
            .wait(soon(20), &TableIdentifier::new("7", 1), None)
            .is_err());
    }
}
