//! Lock bookkeeping and execution tickets.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Identifies a [`Locker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockerId(pub(crate) u64);

impl fmt::Display for LockerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "locker:{}", self.0)
    }
}

/// Lock strength, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Intent shared.
    IntentShared,
    /// Intent exclusive.
    IntentExclusive,
    /// Shared.
    Shared,
    /// Exclusive.
    Exclusive,
}

/// Something that can be locked.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceId {
    /// The whole engine.
    Global,
    /// A single namespace.
    Collection(String),
}

/// Whether a locker currently counts against the ticket pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Holding an execution ticket.
    Active,
    /// Not holding a ticket.
    Inactive,
}

/// Fixed pool of execution tickets.
///
/// Waiting for a ticket is interruptible: the wait wakes every
/// `wait_slice` to look at the caller's kill flag.
pub struct TicketHolder {
    available: Mutex<usize>,
    freed: Condvar,
    capacity: usize,
}

impl TicketHolder {
    /// Creates a pool with `capacity` tickets.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity),
            freed: Condvar::new(),
            capacity,
        }
    }

    /// Total tickets.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tickets not currently held.
    #[must_use]
    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Blocks until a ticket is free or `killed` is set.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Interrupted`] if `killed` is observed while waiting.
    pub fn acquire(
        self: &Arc<Self>,
        killed: &AtomicBool,
        wait_slice: Duration,
    ) -> CoreResult<Ticket> {
        let mut available = self.available.lock();
        loop {
            if killed.load(Ordering::Acquire) {
                return Err(CoreError::Interrupted);
            }
            if *available > 0 {
                *available -= 1;
                return Ok(Ticket {
                    holder: Arc::clone(self),
                });
            }
            self.freed.wait_for(&mut available, wait_slice);
        }
    }

    fn release(&self) {
        let mut available = self.available.lock();
        *available += 1;
        self.freed.notify_one();
    }
}

/// A held execution ticket; returned to its pool on drop.
pub struct Ticket {
    holder: Arc<TicketHolder>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.holder.release();
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket").finish_non_exhaustive()
    }
}

/// Per-operation lock state.
///
/// Records held locks, write-unit-of-work nesting and the execution ticket.
/// A multi-statement transaction keeps one locker for its whole life; it
/// moves between operation contexts through the transaction stash.
#[derive(Debug)]
pub struct Locker {
    id: LockerId,
    held: BTreeMap<ResourceId, LockMode>,
    wuow_nesting: u32,
    ticket: Option<Ticket>,
}

impl Locker {
    pub(crate) fn new(id: LockerId) -> Self {
        Self {
            id,
            held: BTreeMap::new(),
            wuow_nesting: 0,
            ticket: None,
        }
    }

    /// Identity of this locker.
    #[must_use]
    pub const fn id(&self) -> LockerId {
        self.id
    }

    /// Records a lock; an existing weaker hold is upgraded.
    pub(crate) fn lock(&mut self, resource: ResourceId, mode: LockMode) {
        trace!(locker = %self.id, ?resource, ?mode, "lock");
        let entry = self.held.entry(resource).or_insert(mode);
        if mode > *entry {
            *entry = mode;
        }
    }

    /// Drops a lock; returns whether it was held.
    pub fn unlock(&mut self, resource: &ResourceId) -> bool {
        self.held.remove(resource).is_some()
    }

    /// Drops every lock.
    pub fn unlock_all(&mut self) {
        self.held.clear();
    }

    /// True if any lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.held.is_empty()
    }

    /// Mode held on `resource`.
    #[must_use]
    pub fn held_mode(&self, resource: &ResourceId) -> Option<LockMode> {
        self.held.get(resource).copied()
    }

    pub(crate) fn begin_write_unit_of_work(&mut self) {
        self.wuow_nesting += 1;
    }

    pub(crate) fn end_write_unit_of_work(&mut self) {
        self.wuow_nesting = self.wuow_nesting.saturating_sub(1);
        if self.wuow_nesting == 0 {
            self.held.retain(|_, mode| *mode < LockMode::IntentExclusive);
        }
    }

    pub(crate) fn abandon_write_unit_of_work(&mut self) {
        self.wuow_nesting = 0;
        self.held.retain(|_, mode| *mode < LockMode::IntentExclusive);
    }

    /// Write-unit-of-work nesting depth.
    #[must_use]
    pub const fn write_unit_of_work_depth(&self) -> u32 {
        self.wuow_nesting
    }

    /// Whether this locker holds a ticket.
    #[must_use]
    pub const fn client_state(&self) -> ClientState {
        if self.ticket.is_some() {
            ClientState::Active
        } else {
            ClientState::Inactive
        }
    }

    pub(crate) fn acquire_ticket(
        &mut self,
        holder: &Arc<TicketHolder>,
        killed: &AtomicBool,
        wait_slice: Duration,
    ) -> CoreResult<()> {
        if self.ticket.is_none() {
            self.ticket = Some(holder.acquire(killed, wait_slice)?);
        }
        Ok(())
    }

    pub(crate) fn release_ticket(&mut self) {
        self.ticket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn upgrade_keeps_strongest() {
        let mut locker = Locker::new(LockerId(1));
        locker.lock(ResourceId::Global, LockMode::IntentExclusive);
        locker.lock(ResourceId::Global, LockMode::IntentShared);
        assert_eq!(
            locker.held_mode(&ResourceId::Global),
            Some(LockMode::IntentExclusive)
        );
        assert!(locker.unlock(&ResourceId::Global));
        assert!(!locker.is_locked());
    }

    #[test]
    fn write_locks_released_at_outermost_end() {
        let mut locker = Locker::new(LockerId(1));
        locker.begin_write_unit_of_work();
        locker.lock(ResourceId::Global, LockMode::IntentExclusive);
        locker.lock(ResourceId::Collection("t.c".into()), LockMode::IntentShared);
        locker.begin_write_unit_of_work();
        locker.end_write_unit_of_work();
        assert!(locker.held_mode(&ResourceId::Global).is_some());
        locker.end_write_unit_of_work();
        assert!(locker.held_mode(&ResourceId::Global).is_none());
        assert!(locker.is_locked());
    }

    #[test]
    fn tickets_are_returned_on_drop() {
        let holder = Arc::new(TicketHolder::new(1));
        let killed = AtomicBool::new(false);
        let ticket = holder.acquire(&killed, Duration::from_millis(5)).unwrap();
        assert_eq!(holder.available(), 0);
        drop(ticket);
        assert_eq!(holder.available(), 1);
    }

    #[test]
    fn waiting_for_ticket_is_interruptible() {
        let holder = Arc::new(TicketHolder::new(1));
        let killed = Arc::new(AtomicBool::new(false));
        let _held = holder.acquire(&killed, Duration::from_millis(5)).unwrap();

        let waiter = {
            let holder = Arc::clone(&holder);
            let killed = Arc::clone(&killed);
            thread::spawn(move || holder.acquire(&killed, Duration::from_millis(5)).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        killed.store(true, Ordering::Release);
        assert!(matches!(waiter.join().unwrap(), Err(CoreError::Interrupted)));
    }

    #[test]
    fn waiter_wakes_when_ticket_freed() {
        let holder = Arc::new(TicketHolder::new(1));
        let killed = Arc::new(AtomicBool::new(false));
        let held = holder.acquire(&killed, Duration::from_millis(5)).unwrap();

        let waiter = {
            let holder = Arc::clone(&holder);
            let killed = Arc::clone(&killed);
            thread::spawn(move || holder.acquire(&killed, Duration::from_secs(5)).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(10));
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
    }
}
