//! Translation Cache
//!
//! Per-address-space model of cached translations. An entry caches what the
//! MMU remembered about a page when it was last filled: the page's
//! capability-load generation, its sweep sequence and whether capdirty was
//! already latched.
//!
//! # Why Shootdown Matters
//! - A latched capdirty lets capability stores skip re-marking the page
//!   after a sweep cleared capdirty, hiding them from incremental passes
//! - A stale load generation makes a visited page keep trapping
//!
//! `invalidate_page` and `invalidate_all` drop entries; the next access
//! refills them from the page.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::page::Page;

/// A cached translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    /// Load generation of the page when the entry was filled.
    pub load_gen: u64,
    /// Sweep sequence of the page when the entry was filled.
    pub sweep_seq: u64,
    /// Capdirty already set through this entry.
    pub capdirty_latched: bool,
}

/// Translation cache for one address space.
pub struct Tlb {
    entries: Mutex<BTreeMap<u64, TlbEntry>>,
    shootdowns: AtomicU64,
    page_invalidations: AtomicU64,
}

impl Tlb {
    /// Create an empty cache.
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            shootdowns: AtomicU64::new(0),
            page_invalidations: AtomicU64::new(0),
        }
    }

    /// Look up the entry for `vpn`, filling it from `page` on a miss.
    pub fn translate(&self, vpn: u64, page: &Page) -> TlbEntry {
        *self.entries.lock().entry(vpn).or_insert_with(|| TlbEntry {
            load_gen: page.load_gen(),
            sweep_seq: page.sweep_seq(),
            capdirty_latched: page.capdirty(),
        })
    }

    /// Cached entry for `vpn`, if any.
    pub fn cached(&self, vpn: u64) -> Option<TlbEntry> {
        self.entries.lock().get(&vpn).copied()
    }

    /// Record that a store through the entry for `vpn` set capdirty.
    pub fn latch_capdirty(&self, vpn: u64) {
        if let Some(entry) = self.entries.lock().get_mut(&vpn) {
            entry.capdirty_latched = true;
        }
    }

    /// Drop the cached translation for one page.
    pub fn invalidate_page(&self, vpn: u64) {
        self.entries.lock().remove(&vpn);
        self.page_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop every cached translation.
    pub fn invalidate_all(&self) {
        self.entries.lock().clear();
        self.shootdowns.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of full shootdowns performed.
    pub fn shootdowns(&self) -> u64 {
        self.shootdowns.load(Ordering::Relaxed)
    }

    /// Number of single-page invalidations performed.
    pub fn page_invalidations(&self) -> u64 {
        self.page_invalidations.load(Ordering::Relaxed)
    }

    /// Number of cached translations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Tlb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tlb")
            .field("entries", &self.len())
            .field("shootdowns", &self.shootdowns())
            .finish()
    }
}
