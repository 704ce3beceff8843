//! Fault Resolver
//!
//! Called from the page-fault path when a mutator traps on a page that may
//! be mid-sweep. The resolver never blocks on a pass; it either fixes the
//! page itself or routes the fault.
//!
//! # Resolution
//! - Page not yet visited in the current load generation: sweep it here,
//!   mark it visited, drop its stale translation -> `Resolved`
//! - The word at the faulting address is revocable: revoke it -> `Resolved`;
//!   if every attempt loses to a concurrent store the page is left DIRTY
//!   and the retried access faults again
//! - Either of the above needs a write to a read-only page -> `Capstore`
//! - A stale cached translation: drop it -> `Resolved`
//! - Otherwise the fault is not ours -> `Unresolved`

use alloc::sync::Arc;

use log::trace;

use super::cookie::RevokeCookie;
use super::scan::{Scanner, WordOutcome};
use super::stats::stat_inc;
use super::tester::TestResult;
use crate::mm::{VirtAddr, VmSpace};

/// Routing decision for a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// The resolver made the page consistent; retry the access.
    Resolved,
    /// Not a revocation fault; continue with default handling.
    Unresolved,
    /// Handle as a capability-store fault, then retry.
    Capstore,
}

/// Resolve a fault at `addr` against revocation in flight on `vm`.
pub fn fault_visit(vm: &Arc<VmSpace>, addr: VirtAddr) -> FaultResolution {
    let cookie = match RevokeCookie::init(vm) {
        Ok(cookie) => cookie,
        Err(_) => return FaultResolution::Unresolved,
    };
    let state = vm.revoke_state();
    stat_inc!(state.stats(), fault_visits);

    let vpn = addr.page_number();
    let page = match vm.page(vpn) {
        Some(page) if !page.is_busy() => page,
        _ => return FaultResolution::Unresolved,
    };

    let load_gen = vm.load_gen();
    let shadow_gen = cookie.shadow().bitmap().generation();
    let scanner = Scanner::new(&cookie, shadow_gen);

    if page.load_gen() != load_gen {
        let scan = if page.is_writable() {
            scanner.page_rw(&page)
        } else {
            let ro = scanner.page_ro(&page);
            if ro.needs_write() {
                stat_inc!(state.stats(), fault_capstore);
                trace!("[REVOKE] fault {}: unvisited read-only page needs write", addr);
                return FaultResolution::Capstore;
            }
            ro
        };
        page.set_load_gen(load_gen);
        vm.tlb().invalidate_page(vpn);
        stat_inc!(state.stats(), fault_fixes);
        trace!("[REVOKE] fault {}: swept unvisited page, revoked {}", addr, scan.revoked);
        return FaultResolution::Resolved;
    }

    let word = match page.word(addr.word_index()) {
        Some(word) => word,
        None => return FaultResolution::Unresolved,
    };
    if scanner.tester().test(&word.load()) == TestResult::MustRevoke {
        if !page.is_writable() {
            stat_inc!(state.stats(), fault_capstore);
            return FaultResolution::Capstore;
        }
        match scanner.revoke_word(word) {
            Some(WordOutcome::Revoked) => {
                stat_inc!(state.stats(), fault_fixes);
                trace!("[REVOKE] fault {}: revoked faulting word", addr);
            }
            Some(WordOutcome::Raced) => {
                page.mark_dirty();
                trace!("[REVOKE] fault {}: faulting word kept changing", addr);
            }
            None => trace!("[REVOKE] fault {}: faulting word replaced", addr),
        }
        return FaultResolution::Resolved;
    }

    if let Some(entry) = vm.tlb().cached(vpn) {
        if entry.load_gen != load_gen {
            vm.tlb().invalidate_page(vpn);
            stat_inc!(state.stats(), fault_fixes);
            return FaultResolution::Resolved;
        }
    }

    FaultResolution::Unresolved
}
