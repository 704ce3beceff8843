//! Capability Memory Words
//!
//! A `CapCell` is one capability-sized, capability-aligned word of memory.
//! Mutators store into it, the sweeper and the fault path revoke it in
//! place, and every reader observes either the whole old capability or the
//! whole new one.
//!
//! # Protocol
//! The word is a sequence lock over four atomic fields. The sequence is even
//! when stable and odd while a writer holds the word. Writers take the word
//! by moving the sequence from even to odd with a CAS; readers sample the
//! sequence before and after reading the fields and retry on any change.
//!
//! # Security Properties
//! - No reader ever sees a tag together with a mix of old and new fields
//! - Revocation is a compare-and-replace: a word a mutator rewrote after the
//!   sweeper read it is never overwritten with a stale revoked image

use core::hint::spin_loop;
use core::sync::atomic::{fence, AtomicU64, Ordering};

use super::capability::{Capability, Otype, Perms};

/// Tag bit in the metadata field.
const META_TAG: u64 = 1 << 63;
/// Object type field: `otype + 1`, zero when unsealed.
const META_OTYPE_SHIFT: u32 = 32;
const META_OTYPE_MASK: u64 = 0x00FF_FFFF;
const META_PERMS_MASK: u64 = 0xFFFF_FFFF;

#[inline]
fn encode_meta(cap: &Capability) -> u64 {
    let mut meta = u64::from(cap.perms().bits());
    if let Some(otype) = cap.otype() {
        meta |= (u64::from(otype.value()) + 1) << META_OTYPE_SHIFT;
    }
    if cap.is_tagged() {
        meta |= META_TAG;
    }
    meta
}

#[inline]
fn decode(address: u64, base: u64, length: u64, meta: u64) -> Capability {
    let otype_field = ((meta >> META_OTYPE_SHIFT) & META_OTYPE_MASK) as u32;
    let otype = match otype_field {
        0 => None,
        n => Otype::new(n - 1),
    };
    Capability::from_raw_parts(
        meta & META_TAG != 0,
        address,
        base,
        length,
        Perms::from_bits_truncate((meta & META_PERMS_MASK) as u32),
        otype,
    )
}

/// One capability word of memory.
pub struct CapCell {
    seq: AtomicU64,
    address: AtomicU64,
    base: AtomicU64,
    length: AtomicU64,
    meta: AtomicU64,
}

impl CapCell {
    /// Create a word holding the null capability.
    pub const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            address: AtomicU64::new(0),
            base: AtomicU64::new(0),
            length: AtomicU64::new(0),
            meta: AtomicU64::new(0),
        }
    }

    /// Read a consistent snapshot of the word.
    pub fn load(&self) -> Capability {
        loop {
            let seq1 = self.seq.load(Ordering::Acquire);
            if seq1 & 1 == 1 {
                spin_loop();
                continue;
            }

            let address = self.address.load(Ordering::Relaxed);
            let base = self.base.load(Ordering::Relaxed);
            let length = self.length.load(Ordering::Relaxed);
            let meta = self.meta.load(Ordering::Relaxed);

            fence(Ordering::Acquire);
            let seq2 = self.seq.load(Ordering::Relaxed);
            if seq1 == seq2 {
                return decode(address, base, length, meta);
            }
            spin_loop();
        }
    }

    /// Check the tag.
    #[inline]
    pub fn is_tagged(&self) -> bool {
        self.load().is_tagged()
    }

    /// Store a capability.
    pub fn store(&self, cap: Capability) {
        let seq = self.lock();
        self.write_fields(&cap);
        self.unlock(seq);
    }

    /// Store plain data: the word's address field takes `value`, the tag is cleared.
    pub fn store_data(&self, value: u64) {
        self.store(Capability::null().with_address(value));
    }

    /// Replace the word with `new` only if it still holds `expected`.
    ///
    /// Returns the current contents on mismatch.
    pub fn compare_and_replace(
        &self,
        expected: &Capability,
        new: &Capability,
    ) -> Result<(), Capability> {
        let seq = self.lock();
        let current = decode(
            self.address.load(Ordering::Relaxed),
            self.base.load(Ordering::Relaxed),
            self.length.load(Ordering::Relaxed),
            self.meta.load(Ordering::Relaxed),
        );
        if current != *expected {
            self.unlock(seq);
            return Err(current);
        }
        self.write_fields(new);
        self.unlock(seq);
        Ok(())
    }

    /// Zero the word.
    pub fn clear(&self) {
        self.store(Capability::null());
    }

    /// Take the word for writing. Returns the odd sequence value held.
    fn lock(&self) -> u64 {
        loop {
            let seq = self.seq.load(Ordering::Relaxed);
            if seq & 1 == 0
                && self
                    .seq
                    .compare_exchange_weak(seq, seq + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                fence(Ordering::Release);
                return seq + 1;
            }
            spin_loop();
        }
    }

    fn unlock(&self, held: u64) {
        self.seq.store(held + 1, Ordering::Release);
    }

    fn write_fields(&self, cap: &Capability) {
        self.address.store(cap.address(), Ordering::Relaxed);
        self.base.store(cap.base(), Ordering::Relaxed);
        self.length.store(cap.length(), Ordering::Relaxed);
        self.meta.store(encode_meta(cap), Ordering::Relaxed);
    }
}

impl Default for CapCell {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CapCell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CapCell({:?})", self.load())
    }
}
