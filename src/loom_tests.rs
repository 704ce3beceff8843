//! Loom models of the lock-free protocols the engine relies on.
//!
//! Loom explores every interleaving of the modelled threads, so the models
//! are small copies of the real protocols written against loom's atomics:
//! the capability word's sequence lock, the store/sweep handshake on a
//! page's capdirty bit and the one on its sweep sequence.
//!
//! # Running Loom Tests
//!
//! ```bash
//! cargo test --features loom -- --test-threads=1 loom
//! ```

use loom::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use loom::sync::Arc;
use loom::thread;

/// Two-field capability word with the same sequence protocol as `CapCell`.
struct LoomCell {
    seq: AtomicU64,
    base: AtomicU64,
    meta: AtomicU64,
}

impl LoomCell {
    fn new(base: u64, meta: u64) -> Self {
        Self {
            seq: AtomicU64::new(0),
            base: AtomicU64::new(base),
            meta: AtomicU64::new(meta),
        }
    }

    fn load(&self) -> (u64, u64) {
        loop {
            let seq1 = self.seq.load(Ordering::Acquire);
            if seq1 & 1 == 0 {
                let base = self.base.load(Ordering::Relaxed);
                let meta = self.meta.load(Ordering::Relaxed);
                fence(Ordering::Acquire);
                if self.seq.load(Ordering::Relaxed) == seq1 {
                    return (base, meta);
                }
            }
            thread::yield_now();
        }
    }

    fn lock(&self) -> u64 {
        loop {
            let seq = self.seq.load(Ordering::Relaxed);
            if seq & 1 == 0
                && self
                    .seq
                    .compare_exchange(seq, seq + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                fence(Ordering::Release);
                return seq + 1;
            }
            thread::yield_now();
        }
    }

    fn store(&self, value: (u64, u64)) {
        let held = self.lock();
        self.base.store(value.0, Ordering::Relaxed);
        self.meta.store(value.1, Ordering::Relaxed);
        self.seq.store(held + 1, Ordering::Release);
    }

    fn compare_and_replace(&self, expected: (u64, u64), new: (u64, u64)) -> bool {
        let held = self.lock();
        let current = (
            self.base.load(Ordering::Relaxed),
            self.meta.load(Ordering::Relaxed),
        );
        let matched = current == expected;
        if matched {
            self.base.store(new.0, Ordering::Relaxed);
            self.meta.store(new.1, Ordering::Relaxed);
        }
        self.seq.store(held + 1, Ordering::Release);
        matched
    }
}

const OLD: (u64, u64) = (0x8000, 0xff);
const NEW: (u64, u64) = (0x9000, 0x0f);
const REVOKED: (u64, u64) = (0x8000, 0x00);

/// A reader never observes fields from two different stores.
#[test]
fn loom_cell_reads_are_not_torn() {
    loom::model(|| {
        let cell = Arc::new(LoomCell::new(OLD.0, OLD.1));

        let writer = {
            let cell = cell.clone();
            thread::spawn(move || cell.store(NEW))
        };

        let seen = cell.load();
        assert!(seen == OLD || seen == NEW, "torn read: {:?}", seen);
        writer.join().unwrap();
        assert_eq!(cell.load(), NEW);
    });
}

/// The sweeper's replacement never overwrites a mutator's newer store.
#[test]
fn loom_revocation_never_clobbers_store() {
    loom::model(|| {
        let cell = Arc::new(LoomCell::new(OLD.0, OLD.1));

        let mutator = {
            let cell = cell.clone();
            thread::spawn(move || cell.store(NEW))
        };

        let observed = cell.load();
        let replaced = observed == OLD && cell.compare_and_replace(OLD, REVOKED);
        mutator.join().unwrap();

        // the store lands last either way
        assert_eq!(cell.load(), NEW);
        if replaced {
            assert_eq!(observed, OLD);
        }
    });
}

/// A store racing a sweep is either seen by the sweep or leaves capdirty set.
#[test]
fn loom_capdirty_handshake() {
    loom::model(|| {
        let word = Arc::new(AtomicU64::new(0));
        let capdirty = Arc::new(AtomicBool::new(false));

        let mutator = {
            let word = word.clone();
            let capdirty = capdirty.clone();
            thread::spawn(move || {
                word.store(1, Ordering::Release);
                capdirty.store(true, Ordering::Release);
            })
        };

        capdirty.swap(false, Ordering::AcqRel);
        let swept = word.load(Ordering::Acquire);
        mutator.join().unwrap();

        assert!(swept == 1 || capdirty.load(Ordering::Acquire));
    });
}

/// A store through a translation filled before a sweep started is either
/// seen by the sweep or voids the sweep's stamp.
#[test]
fn loom_sweep_sequence_handshake() {
    loom::model(|| {
        let word = Arc::new(AtomicU64::new(0));
        let sweep_seq = Arc::new(AtomicU64::new(0));

        let mutator = {
            let word = word.clone();
            let sweep_seq = sweep_seq.clone();
            thread::spawn(move || {
                let filled = 0;
                word.store(1, Ordering::Release);
                fence(Ordering::SeqCst);
                if sweep_seq.load(Ordering::SeqCst) != filled {
                    sweep_seq.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let seq = sweep_seq.fetch_add(1, Ordering::SeqCst) + 1;
        fence(Ordering::SeqCst);
        let swept = word.load(Ordering::Acquire);
        mutator.join().unwrap();

        let stamp_valid = sweep_seq.load(Ordering::SeqCst) == seq;
        assert!(swept == 1 || !stamp_valid);
    });
}
