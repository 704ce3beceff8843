//! Address Space
//!
//! A `VmSpace` owns the resident pages of one user address space, its
//! translation cache and its revocation state.
//!
//! # Mutator Paths
//! The `load_cap`/`store_cap`/`store_data` methods model what the MMU does
//! on a user access, including the traps the revocation engine depends on:
//! - Capability loads through a translation whose load generation is stale
//!   raise a capability-load-generation fault
//! - Capability stores to a page not yet enabled for them raise a
//!   capability-store fault, which sets HASCAPS|DIRTY first
//! - Stores to read-only pages raise a write fault (copy-on-write upgrade)
//!
//! Faults are routed through [`crate::trap::handle_fault`] and the access is
//! retried a bounded number of times.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::RwLock;

use super::address::VirtAddr;
use super::page::{Page, PageFlags};
use super::tlb::Tlb;
use crate::cap::Capability;
use crate::revoke::{RevokeConfig, RevokeState};
use crate::trap::{self, AccessFault, FaultKind};

/// Faults a single access may take before giving up.
const MAX_FAULT_RETRIES: usize = 4;

/// Errors from page-set operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The virtual address is already mapped.
    AlreadyMapped,
    /// The virtual address is not mapped.
    NotMapped,
    /// The address is not properly aligned.
    MisalignedAddress,
}

impl core::fmt::Display for MappingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "virtual address already mapped"),
            Self::NotMapped => write!(f, "virtual address not mapped"),
            Self::MisalignedAddress => write!(f, "address not properly aligned"),
        }
    }
}

/// One user address space.
pub struct VmSpace {
    pages: RwLock<BTreeMap<u64, Arc<Page>>>,
    tlb: Tlb,
    load_gen: AtomicU64,
    dying: AtomicBool,
    revoke: RevokeState,
}

impl VmSpace {
    /// Create an empty address space.
    pub fn new(config: RevokeConfig) -> Arc<Self> {
        Arc::new(Self {
            pages: RwLock::new(BTreeMap::new()),
            tlb: Tlb::new(),
            load_gen: AtomicU64::new(0),
            dying: AtomicBool::new(false),
            revoke: RevokeState::new(config),
        })
    }

    /// Map a fresh zeroed page at `addr`.
    pub fn map_page(&self, addr: VirtAddr, writable: bool) -> Result<Arc<Page>, MappingError> {
        if !addr.is_aligned() {
            return Err(MappingError::MisalignedAddress);
        }

        let mut pages = self.pages.write();
        let vpn = addr.page_number();
        if pages.contains_key(&vpn) {
            return Err(MappingError::AlreadyMapped);
        }

        let page = Arc::new(Page::new(writable, self.load_gen()));
        pages.insert(vpn, Arc::clone(&page));
        Ok(page)
    }

    /// Mark the page at `addr` as being unmapped.
    ///
    /// Busy pages are skipped by passes and the fault resolver until
    /// `unmap_page` removes them.
    pub fn begin_unmap(&self, addr: VirtAddr) -> Result<Arc<Page>, MappingError> {
        let page = self
            .page(addr.page_number())
            .ok_or(MappingError::NotMapped)?;
        page.set_busy(true);
        Ok(page)
    }

    /// Remove the page at `addr`.
    pub fn unmap_page(&self, addr: VirtAddr) -> Result<Arc<Page>, MappingError> {
        if !addr.is_aligned() {
            return Err(MappingError::MisalignedAddress);
        }

        let vpn = addr.page_number();
        let page = self
            .pages
            .write()
            .remove(&vpn)
            .ok_or(MappingError::NotMapped)?;
        self.tlb.invalidate_page(vpn);
        Ok(page)
    }

    /// Look up a resident page by virtual page number.
    pub fn page(&self, vpn: u64) -> Option<Arc<Page>> {
        self.pages.read().get(&vpn).cloned()
    }

    /// Snapshot of the page set in address order.
    pub fn page_snapshot(&self) -> Vec<(u64, Arc<Page>)> {
        self.pages
            .read()
            .iter()
            .map(|(vpn, page)| (*vpn, Arc::clone(page)))
            .collect()
    }

    /// Number of resident pages.
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Start tearing the address space down. Open passes abort at the next page.
    pub fn begin_teardown(&self) {
        self.dying.store(true, Ordering::Release);
    }

    /// Check if the address space is being torn down.
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    /// Current capability-load generation.
    pub fn load_gen(&self) -> u64 {
        self.load_gen.load(Ordering::Acquire)
    }

    /// Move to the next capability-load generation, returning it.
    ///
    /// Generations never repeat, so a page skipped by any number of passes
    /// keeps trapping. Every cached translation must be shot down afterwards.
    pub(crate) fn advance_load_gen(&self) -> u64 {
        self.load_gen.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Translation cache.
    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Revocation state.
    pub fn revoke_state(&self) -> &RevokeState {
        &self.revoke
    }

    /// Copy-on-write upgrade: map the page writable and drop its stale
    /// read-only translation.
    pub(crate) fn upgrade_for_write(&self, vpn: u64) -> Result<(), MappingError> {
        let page = self.page(vpn).ok_or(MappingError::NotMapped)?;
        page.make_writable();
        self.tlb.invalidate_page(vpn);
        Ok(())
    }

    /// First capability store to a page: mark it capability-bearing, then
    /// let capability stores through.
    pub(crate) fn capstore_fault(&self, vpn: u64) -> Result<(), MappingError> {
        let page = self.page(vpn).ok_or(MappingError::NotMapped)?;
        page.set_flags(PageFlags::HASCAPS | PageFlags::DIRTY);
        page.enable_capstore();
        self.tlb.invalidate_page(vpn);
        Ok(())
    }

    /// Load the capability word at `addr`.
    pub fn load_cap(self: &Arc<Self>, addr: VirtAddr) -> Result<Capability, AccessFault> {
        if !addr.is_cap_aligned() {
            return Err(AccessFault::Misaligned);
        }

        let vpn = addr.page_number();
        for _ in 0..MAX_FAULT_RETRIES {
            let page = match self.page(vpn) {
                Some(page) => page,
                None => {
                    trap::handle_fault(self, addr, FaultKind::Translation)?;
                    continue;
                }
            };
            let entry = self.tlb.translate(vpn, &page);
            let word = page.word(addr.word_index()).ok_or(AccessFault::Misaligned)?;

            let cap = word.load();
            if cap.is_tagged() && entry.load_gen != self.load_gen() {
                trap::handle_fault(self, addr, FaultKind::CapLoadGen)?;
                continue;
            }
            return Ok(cap);
        }

        Err(AccessFault::Unhandled)
    }

    /// Store a capability (tagged or not) at `addr`.
    pub fn store_cap(self: &Arc<Self>, addr: VirtAddr, cap: Capability) -> Result<(), AccessFault> {
        if !addr.is_cap_aligned() {
            return Err(AccessFault::Misaligned);
        }

        let vpn = addr.page_number();
        for _ in 0..MAX_FAULT_RETRIES {
            let page = match self.page(vpn) {
                Some(page) => page,
                None => {
                    trap::handle_fault(self, addr, FaultKind::Translation)?;
                    continue;
                }
            };
            if !page.is_writable() {
                trap::handle_fault(self, addr, FaultKind::Write)?;
                continue;
            }
            if cap.is_tagged() && !page.capstore_enabled() {
                trap::handle_fault(self, addr, FaultKind::CapStore)?;
                continue;
            }

            let entry = self.tlb.translate(vpn, &page);
            let word = page.word(addr.word_index()).ok_or(AccessFault::Misaligned)?;
            word.store(cap);

            // capdirty goes up after the word so a sweep clearing it first
            // sees either the new word or the bit.
            if cap.is_tagged() && !entry.capdirty_latched {
                page.set_capdirty();
                self.tlb.latch_capdirty(vpn);
            }
            // a latched entry may predate the page's last sweep
            if cap.is_tagged() && entry.sweep_seq != page.sweep_seq() {
                page.void_sweep();
            }
            return Ok(());
        }

        Err(AccessFault::Unhandled)
    }

    /// Store plain data at `addr`, clearing the word's tag.
    pub fn store_data(self: &Arc<Self>, addr: VirtAddr, value: u64) -> Result<(), AccessFault> {
        if !addr.is_cap_aligned() {
            return Err(AccessFault::Misaligned);
        }

        let vpn = addr.page_number();
        for _ in 0..MAX_FAULT_RETRIES {
            let page = match self.page(vpn) {
                Some(page) => page,
                None => {
                    trap::handle_fault(self, addr, FaultKind::Translation)?;
                    continue;
                }
            };
            if !page.is_writable() {
                trap::handle_fault(self, addr, FaultKind::Write)?;
                continue;
            }

            self.tlb.translate(vpn, &page);
            let word = page.word(addr.word_index()).ok_or(AccessFault::Misaligned)?;
            word.store_data(value);
            return Ok(());
        }

        Err(AccessFault::Unhandled)
    }

    /// Allocator reuse of a page as non-capability data: zero it and drop
    /// HASCAPS/DIRTY.
    pub fn discard_caps(&self, addr: VirtAddr) -> Result<(), MappingError> {
        let vpn = addr.page_number();
        let page = self.page(vpn).ok_or(MappingError::NotMapped)?;
        page.discard();
        self.tlb.invalidate_page(vpn);
        Ok(())
    }
}

impl core::fmt::Debug for VmSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmSpace")
            .field("pages", &self.page_count())
            .field("load_gen", &self.load_gen())
            .field("dying", &self.is_dying())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::Perms;
    use crate::mm::PAGE_SIZE;

    const BASE: u64 = 0x10_0000;

    fn space() -> Arc<VmSpace> {
        VmSpace::new(RevokeConfig::new())
    }

    #[test]
    fn test_map_unmap() {
        let vm = space();
        vm.map_page(VirtAddr::new(BASE), true).unwrap();
        assert_eq!(
            vm.map_page(VirtAddr::new(BASE), true).unwrap_err(),
            MappingError::AlreadyMapped
        );
        assert_eq!(
            vm.map_page(VirtAddr::new(BASE + 8), true).unwrap_err(),
            MappingError::MisalignedAddress
        );
        vm.unmap_page(VirtAddr::new(BASE)).unwrap();
        assert_eq!(
            vm.unmap_page(VirtAddr::new(BASE)).unwrap_err(),
            MappingError::NotMapped
        );
    }

    #[test]
    fn test_first_cap_store_sets_hascaps() {
        let vm = space();
        let page = vm.map_page(VirtAddr::new(BASE), true).unwrap();
        let cap = Capability::new(0x4000, 0x40, Perms::LOAD);

        vm.store_data(VirtAddr::new(BASE), 7).unwrap();
        assert_eq!(page.flags(), PageFlags::empty());
        assert!(!page.capstore_enabled());

        vm.store_cap(VirtAddr::new(BASE + 0x20), cap).unwrap();
        assert_eq!(page.flags(), PageFlags::HASCAPS | PageFlags::DIRTY);
        assert!(page.capstore_enabled());
        assert!(page.capdirty());
        assert_eq!(vm.load_cap(VirtAddr::new(BASE + 0x20)).unwrap(), cap);
    }

    #[test]
    fn test_store_to_read_only_page_upgrades() {
        let vm = space();
        let page = vm.map_page(VirtAddr::new(BASE), false).unwrap();
        vm.store_data(VirtAddr::new(BASE + 0x10), 1).unwrap();
        assert!(page.is_writable());
    }

    #[test]
    fn test_unmapped_access_faults() {
        let vm = space();
        assert_eq!(
            vm.load_cap(VirtAddr::new(BASE)).unwrap_err(),
            AccessFault::NotMapped
        );
        assert_eq!(
            vm.store_data(VirtAddr::new(BASE + 4), 0).unwrap_err(),
            AccessFault::Misaligned
        );
    }

    #[test]
    fn test_discard_clears_hascaps() {
        let vm = space();
        let page = vm.map_page(VirtAddr::new(BASE), true).unwrap();
        vm.store_cap(VirtAddr::new(BASE), Capability::new(0x4000, 0x40, Perms::LOAD))
            .unwrap();
        vm.discard_caps(VirtAddr::new(BASE)).unwrap();
        assert_eq!(page.flags(), PageFlags::empty());
        assert!(!vm.load_cap(VirtAddr::new(BASE)).unwrap().is_tagged());
    }

    #[test]
    fn test_store_through_old_translation_voids_sweep() {
        let vm = space();
        let page = vm.map_page(VirtAddr::new(BASE), true).unwrap();
        let cap = Capability::new(0x4000, 0x40, Perms::LOAD);
        vm.store_cap(VirtAddr::new(BASE), cap).unwrap();

        page.take_capdirty();
        page.take_dirty();
        let seq = page.begin_sweep();
        page.record_swept(seq, 0);
        assert_eq!(page.swept_gen(), Some(0));

        // the cached entry still has capdirty latched and predates the sweep
        vm.store_cap(VirtAddr::new(BASE + 0x10), cap).unwrap();
        assert!(!page.is_dirty());
        assert_eq!(page.swept_gen(), None);

        // plain data cannot bring a capability in
        let seq = page.begin_sweep();
        page.record_swept(seq, 0);
        vm.store_data(VirtAddr::new(BASE + 0x20), 9).unwrap();
        assert_eq!(page.swept_gen(), Some(0));
    }

    #[test]
    fn test_snapshot_in_address_order() {
        let vm = space();
        for i in [3u64, 1, 2] {
            vm.map_page(VirtAddr::new(BASE + i * PAGE_SIZE), true).unwrap();
        }
        let vpns: Vec<u64> = vm.page_snapshot().iter().map(|(vpn, _)| *vpn).collect();
        let first = BASE / PAGE_SIZE;
        assert_eq!(vpns, [first + 1, first + 2, first + 3]);
    }
}
