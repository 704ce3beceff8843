//! Epoch Ledger and Info Page
//!
//! Three monotonic counters describe revocation progress:
//! - `current`: passes completed so far; the identity of the next pass
//! - `dequeue`: memory painted while `current` was `e` is guaranteed
//!   revoked once `dequeue >= e + 2`
//! - `init`: identity of the last completed full pass
//!
//! Invariant: `init <= dequeue <= current`, and none of them ever moves
//! backwards. Only the pass orchestrator writes the ledger.
//!
//! # Info Page
//! The ledger is copied to an [`InfoPage`] mapped read-only into user space.
//! Readers poll it without trapping, so the publication order is part of
//! the user-visible protocol: `init`, then `dequeue`, then `current`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// A revocation epoch.
pub type Epoch = u64;

/// Check if memory painted while `current == then` is guaranteed revoked.
#[inline]
pub const fn clears(dequeue: Epoch, then: Epoch) -> bool {
    dequeue >= then.saturating_add(2)
}

/// Orchestrator-private epoch counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EpochLedger {
    init: Epoch,
    dequeue: Epoch,
    current: Epoch,
}

impl EpochLedger {
    /// Fresh ledger, all zero.
    pub const fn new() -> Self {
        Self {
            init: 0,
            dequeue: 0,
            current: 0,
        }
    }

    /// Identity of the last completed full pass.
    pub fn init(&self) -> Epoch {
        self.init
    }

    /// Painted memory is revoked once this reaches its epoch + 2.
    pub fn dequeue(&self) -> Epoch {
        self.dequeue
    }

    /// Passes completed so far.
    pub fn current(&self) -> Epoch {
        self.current
    }

    /// Record the completion of the pass opened as `identity`.
    ///
    /// # Panics
    /// Panics if the ledger moved while the pass was open or if the
    /// counters end up out of order.
    pub fn complete(&mut self, identity: Epoch, full: bool) {
        assert_eq!(
            identity, self.current,
            "epoch ledger moved under an open pass"
        );

        self.current += 1;
        if full {
            self.init = identity;
            self.dequeue = self.current;
        }

        assert!(
            self.init <= self.dequeue && self.dequeue <= self.current,
            "epoch ledger out of order: {:?}",
            self
        );
    }

    /// Check if memory painted while `current == then` is guaranteed revoked.
    pub fn clears(&self, then: Epoch) -> bool {
        clears(self.dequeue, then)
    }
}

/// User-visible copy of the ledger.
///
/// Layout is three native-endian machine words in `init, dequeue, current`
/// order and never changes for the life of the address space.
#[repr(C)]
#[derive(Default)]
pub struct InfoPage {
    init: AtomicU64,
    dequeue: AtomicU64,
    current: AtomicU64,
}

/// Shared handle to an address space's info page.
pub type InfoPageRef = Arc<InfoPage>;

impl InfoPage {
    /// A zeroed info page.
    pub const fn new() -> Self {
        Self {
            init: AtomicU64::new(0),
            dequeue: AtomicU64::new(0),
            current: AtomicU64::new(0),
        }
    }

    /// Copy the ledger out.
    ///
    /// Single writer: the caller holds the orchestrator's lock.
    ///
    /// # Panics
    /// Panics if any published counter would regress.
    pub fn publish(&self, ledger: &EpochLedger) {
        let old = self.snapshot();
        assert!(
            ledger.init >= old.init && ledger.dequeue >= old.dequeue && ledger.current >= old.current,
            "info page regression: {:?} -> {:?}",
            old,
            ledger
        );

        self.init.store(ledger.init, Ordering::Release);
        self.dequeue.store(ledger.dequeue, Ordering::Release);
        self.current.store(ledger.current, Ordering::Release);
    }

    /// Read the published counters.
    ///
    /// `current` is read first, so the other two are at least as new as it.
    /// A publish racing the read can make them newer; they are clamped,
    /// which only ever makes `clears` more conservative.
    pub fn snapshot(&self) -> InfoSnapshot {
        let current = self.current.load(Ordering::Acquire);
        let dequeue = self.dequeue.load(Ordering::Acquire).min(current);
        let init = self.init.load(Ordering::Acquire).min(dequeue);
        InfoSnapshot {
            init,
            dequeue,
            current,
        }
    }
}

impl core::fmt::Debug for InfoPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "InfoPage({:?})", self.snapshot())
    }
}

/// A consistent reading of the info page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InfoSnapshot {
    /// Identity of the last completed full pass.
    pub init: Epoch,
    /// Painted memory is revoked once this reaches its epoch + 2.
    pub dequeue: Epoch,
    /// Passes completed so far.
    pub current: Epoch,
}

impl InfoSnapshot {
    /// Check if memory painted while `current == then` is guaranteed revoked.
    pub fn clears(&self, then: Epoch) -> bool {
        clears(self.dequeue, then)
    }
}
