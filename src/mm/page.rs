//! Physical Page Metadata
//!
//! A `Page` is one resident page of a user address space: its capability
//! words plus the bookkeeping the revocation engine relies on.
//!
//! # Metadata
//! - MI flags (`PageFlags`): HASCAPS and DIRTY, sticky, set by the
//!   store-path instrumentation and consulted by the sweeper
//! - Hardware capdirty: set on every capability store that is not already
//!   latched in a cached translation
//! - Cap-store enable: clear until the first capability store traps
//! - Load generation: the capability-load generation the page was last
//!   visited in
//! - Sweep sequence: bumped when a sweep starts and when a capability is
//!   stored through a translation filled before the latest sweep started
//! - Sweep stamp: the sequence and shadow generation of the last clean
//!   sweep; it only vouches for the page while the sequence is unchanged
//!
//! # Security Properties
//! - HASCAPS is never cleared by the sweeper, only by `discard`
//! - DIRTY is cleared with an atomic read-modify-write so a concurrently
//!   set bit is never lost
//! - A capability store either lands before a sweep reads its word or
//!   bumps the sweep sequence; capdirty latched in an old translation
//!   cannot hide it from the stamp

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

use super::address::WORDS_PER_PAGE;
use crate::cap::CapCell;

bitflags::bitflags! {
    /// Machine-independent capability metadata of a page.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct PageFlags: u8 {
        /// The page holds, or has held, a tagged capability.
        const HASCAPS = 0x01;
        /// A capability word was written since the page was last swept.
        const DIRTY = 0x02;
    }
}

/// One resident page.
pub struct Page {
    words: Box<[CapCell]>,
    flags: AtomicU8,
    capdirty: AtomicBool,
    capstore: AtomicBool,
    writable: AtomicBool,
    busy: AtomicBool,
    load_gen: AtomicU64,
    sweep_seq: AtomicU64,
    swept: Mutex<Option<SweepStamp>>,
}

/// A clean sweep: where it started in the sweep sequence and the shadow
/// generation it swept against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SweepStamp {
    seq: u64,
    shadow_gen: u64,
}

impl Page {
    /// Create a zeroed page.
    pub fn new(writable: bool, load_gen: u64) -> Self {
        let words: Vec<CapCell> = (0..WORDS_PER_PAGE).map(|_| CapCell::new()).collect();
        Self {
            words: words.into_boxed_slice(),
            flags: AtomicU8::new(0),
            capdirty: AtomicBool::new(false),
            capstore: AtomicBool::new(false),
            writable: AtomicBool::new(writable),
            busy: AtomicBool::new(false),
            load_gen: AtomicU64::new(load_gen),
            sweep_seq: AtomicU64::new(0),
            swept: Mutex::new(None),
        }
    }

    /// Get a capability word by index.
    #[inline]
    pub fn word(&self, index: usize) -> Option<&CapCell> {
        self.words.get(index)
    }

    /// Iterate over all capability words.
    pub fn words(&self) -> impl Iterator<Item = &CapCell> {
        self.words.iter()
    }

    /// Current MI flags.
    #[inline]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set MI flags.
    #[inline]
    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear DIRTY, returning whether it was set.
    #[inline]
    pub fn take_dirty(&self) -> bool {
        let prior = self.flags.fetch_and(!PageFlags::DIRTY.bits(), Ordering::AcqRel);
        prior & PageFlags::DIRTY.bits() != 0
    }

    /// Set DIRTY.
    #[inline]
    pub fn mark_dirty(&self) {
        self.set_flags(PageFlags::DIRTY);
    }

    /// Check the HASCAPS flag.
    #[inline]
    pub fn has_caps(&self) -> bool {
        self.flags().contains(PageFlags::HASCAPS)
    }

    /// Check for DIRTY or a hardware capdirty bit not yet folded into it.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageFlags::DIRTY) || self.capdirty()
    }

    /// Hardware capdirty bit.
    #[inline]
    pub fn capdirty(&self) -> bool {
        self.capdirty.load(Ordering::Acquire)
    }

    /// Set the hardware capdirty bit.
    #[inline]
    pub fn set_capdirty(&self) {
        self.capdirty.store(true, Ordering::Release);
    }

    /// Clear the hardware capdirty bit, returning whether it was set.
    #[inline]
    pub fn take_capdirty(&self) -> bool {
        self.capdirty.swap(false, Ordering::AcqRel)
    }

    /// Check if capability stores proceed without trapping.
    #[inline]
    pub fn capstore_enabled(&self) -> bool {
        self.capstore.load(Ordering::Acquire)
    }

    /// Let capability stores proceed without trapping.
    #[inline]
    pub fn enable_capstore(&self) {
        self.capstore.store(true, Ordering::Release);
    }

    /// Check if the page is mapped writable.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Map the page writable.
    #[inline]
    pub fn make_writable(&self) {
        self.writable.store(true, Ordering::Release);
    }

    /// Check if the page is being unmapped.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Mark the page as being unmapped.
    #[inline]
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// Capability-load generation the page was last visited in.
    #[inline]
    pub fn load_gen(&self) -> u64 {
        self.load_gen.load(Ordering::Acquire)
    }

    /// Record a visit in load generation `gen`.
    #[inline]
    pub fn set_load_gen(&self, gen: u64) {
        self.load_gen.store(gen, Ordering::Release);
    }

    /// Current sweep sequence.
    ///
    /// Ordered after any word store that precedes the call.
    #[inline]
    pub fn sweep_seq(&self) -> u64 {
        fence(Ordering::SeqCst);
        self.sweep_seq.load(Ordering::SeqCst)
    }

    /// Start a sweep, returning its place in the sweep sequence.
    ///
    /// Must be called after capdirty and DIRTY are cleared and before any
    /// word is read.
    #[inline]
    pub fn begin_sweep(&self) -> u64 {
        let seq = self.sweep_seq.fetch_add(1, Ordering::SeqCst) + 1;
        fence(Ordering::SeqCst);
        seq
    }

    /// A capability went in through a translation older than the latest
    /// sweep: no sweep stamp vouches for the page any more.
    #[inline]
    pub fn void_sweep(&self) {
        self.sweep_seq.fetch_add(1, Ordering::SeqCst);
    }

    /// Shadow generation the page was last swept clean against, if nothing
    /// has voided that sweep since it started.
    pub fn swept_gen(&self) -> Option<u64> {
        let stamp = (*self.swept.lock())?;
        (stamp.seq == self.sweep_seq()).then_some(stamp.shadow_gen)
    }

    /// Record a clean sweep started at `seq` against shadow generation `gen`.
    ///
    /// Of two overlapping sweeps, the one that started later wins.
    pub fn record_swept(&self, seq: u64, gen: u64) {
        let mut stamp = self.swept.lock();
        if stamp.map_or(true, |old| seq > old.seq) {
            *stamp = Some(SweepStamp {
                seq,
                shadow_gen: gen,
            });
        }
    }

    /// Reuse the page for non-capability data: zero every word and drop all
    /// capability metadata.
    pub fn discard(&self) {
        for word in self.words() {
            word.clear();
        }
        self.capstore.store(false, Ordering::Release);
        self.capdirty.store(false, Ordering::Release);
        self.flags.store(0, Ordering::Release);
        *self.swept.lock() = None;
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("flags", &self.flags())
            .field("capdirty", &self.capdirty())
            .field("capstore", &self.capstore_enabled())
            .field("writable", &self.is_writable())
            .field("busy", &self.is_busy())
            .field("load_gen", &self.load_gen())
            .field("swept_gen", &self.swept_gen())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_take_dirty_keeps_hascaps() {
        let page = Page::new(true, 0);
        page.set_flags(PageFlags::HASCAPS | PageFlags::DIRTY);
        assert!(page.take_dirty());
        assert!(!page.take_dirty());
        assert_eq!(page.flags(), PageFlags::HASCAPS);
    }

    #[test]
    fn test_discard_drops_metadata() {
        let page = Page::new(true, 0);
        page.set_flags(PageFlags::HASCAPS);
        page.enable_capstore();
        page.set_capdirty();
        page.discard();
        assert_eq!(page.flags(), PageFlags::empty());
        assert!(!page.is_dirty());
        assert!(!page.capstore_enabled());
    }

    #[test]
    fn test_later_sweep_wins() {
        let page = Page::new(true, 0);
        assert_eq!(page.swept_gen(), None);

        let first = page.begin_sweep();
        let second = page.begin_sweep();
        page.record_swept(second, 5);
        page.record_swept(first, 3);
        assert_eq!(page.swept_gen(), Some(5));
    }

    #[test]
    fn test_void_drops_stamp_until_next_sweep() {
        let page = Page::new(true, 0);
        let seq = page.begin_sweep();
        page.record_swept(seq, 2);
        assert_eq!(page.swept_gen(), Some(2));

        page.void_sweep();
        assert_eq!(page.swept_gen(), None);

        let seq = page.begin_sweep();
        page.record_swept(seq, 2);
        assert_eq!(page.swept_gen(), Some(2));
        page.discard();
        assert_eq!(page.swept_gen(), None);
    }

    /// A sweep still running has not vouched for anything yet.
    #[test]
    fn test_sweep_in_progress_hides_older_stamp() {
        let page = Page::new(true, 0);
        let seq = page.begin_sweep();
        page.record_swept(seq, 1);
        page.begin_sweep();
        assert_eq!(page.swept_gen(), None);
    }

    /// Clearing DIRTY never loses a DIRTY set concurrently by a store.
    #[test]
    fn test_concurrent_dirty_not_lost() {
        let page = Arc::new(Page::new(true, 0));
        let mut sets = 0usize;
        let mut takes = 0usize;
        for _ in 0..1000 {
            let setter = {
                let page = Arc::clone(&page);
                thread::spawn(move || page.mark_dirty())
            };
            if page.take_dirty() {
                takes += 1;
            }
            setter.join().unwrap();
            sets += 1;
            if page.take_dirty() {
                takes += 1;
            }
        }
        assert_eq!(sets, takes);
    }
}
