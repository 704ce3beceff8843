//! Pass Orchestrator
//!
//! Drives one sweep of an address space:
//!
//! ```text
//! IDLE -> OPENED -> SCANNING -> [BARRIER] -> CLOSING -> IDLE
//!            \_________\______________________________/
//!                      abort (teardown, cancellation)
//! ```
//!
//! - OPENED: snapshot the epoch as the pass identity and the shadow
//!   generation; a load-side pass flips the load generation and shoots down
//!   every cached translation
//! - SCANNING: visit the page set in address order; the scheduler may stop
//!   the pass between pages
//! - BARRIER: mutators are stopped by the caller; re-check every swept page
//! - CLOSING: fold capdirty into DIRTY, shoot down translations, advance and
//!   publish the ledger
//!
//! An aborted pass leaves every per-page result in place and the ledger
//! untouched. Passes on one address space are serialised by its
//! orchestrator lock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, trace, warn};

use super::cookie::RevokeCookie;
use super::epoch::{Epoch, InfoSnapshot};
use super::scan::Scanner;
use super::state::RevokeState;
use super::stats::{stat_add, stat_inc};
use super::RevokeError;
use crate::mm::Page;

/// Configuration of one pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassFlags {
    /// Sweep only pages dirtied since they were last swept.
    pub incremental: bool,
    /// Mutators are stopped; verify the result before closing.
    pub barriered: bool,
    /// Open a new capability-load generation.
    pub load_side: bool,
    /// Shoot down every cached translation when closing.
    pub tlb_flush: bool,
    /// Fold hardware capdirty bits into DIRTY when closing.
    pub sync_capdirty: bool,
}

impl PassFlags {
    /// Full store-side pass with no closing actions.
    pub const FULL: Self = Self {
        incremental: false,
        barriered: false,
        load_side: false,
        tlb_flush: false,
        sync_capdirty: false,
    };

    /// Incremental store-side pass with no closing actions.
    pub const INCREMENTAL: Self = Self {
        incremental: true,
        ..Self::FULL
    };

    /// Verify the swept pages with mutators stopped.
    pub const fn barriered(mut self) -> Self {
        self.barriered = true;
        self
    }

    /// Also open a new capability-load generation.
    pub const fn load_side(mut self) -> Self {
        self.load_side = true;
        self
    }

    /// Shoot down every cached translation when closing.
    pub const fn tlb_flush(mut self) -> Self {
        self.tlb_flush = true;
        self
    }

    /// Fold capdirty bits into DIRTY when closing.
    pub const fn sync_capdirty(mut self) -> Self {
        self.sync_capdirty = true;
        self
    }
}

/// Orchestrator phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PassPhase {
    /// No pass open.
    Idle = 0,
    /// Identity and shadow generation taken.
    Opened = 1,
    /// Visiting pages.
    Scanning = 2,
    /// Re-checking swept pages with mutators stopped.
    Barrier = 3,
    /// Closing actions and ledger publication.
    Closing = 4,
}

impl PassPhase {
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Opened,
            2 => Self::Scanning,
            3 => Self::Barrier,
            4 => Self::Closing,
            _ => Self::Idle,
        }
    }
}

/// Summary of a completed pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Epoch the pass was opened in.
    pub identity: Epoch,
    /// No paint happened since the previous completed pass opened.
    pub quick_successor: bool,
    /// Pages swept.
    pub pages_visited: u64,
    /// Pages skipped as not needing a sweep.
    pub pages_skipped: u64,
    /// Pages skipped as already swept against this shadow.
    pub pages_fast: u64,
    /// Pages left for a later pass (mid-unmap).
    pub pages_deferred: u64,
    /// Capabilities revoked.
    pub caps_revoked: u64,
    /// Epochs published at close.
    pub epochs: InfoSnapshot,
}

/// Scheduler hook consulted between pages.
pub trait PassSchedule {
    /// Return false to abort the pass before page `index` at `vpn`.
    fn proceed(&self, index: usize, vpn: u64) -> bool;
}

impl<F: Fn(usize, u64) -> bool> PassSchedule for F {
    fn proceed(&self, index: usize, vpn: u64) -> bool {
        self(index, vpn)
    }
}

/// Run one pass to completion.
pub fn pass(cookie: &RevokeCookie, flags: PassFlags) -> Result<PassReport, RevokeError> {
    pass_with(cookie, flags, &run_to_completion)
}

fn run_to_completion(_index: usize, _vpn: u64) -> bool {
    true
}

/// Run one pass, asking `schedule` before every page.
pub fn pass_with(
    cookie: &RevokeCookie,
    flags: PassFlags,
    schedule: &dyn PassSchedule,
) -> Result<PassReport, RevokeError> {
    let vm = cookie.map();
    let state = vm.revoke_state();
    let mut engine = state.engine.lock();

    if vm.is_dying() {
        return Err(RevokeError::AddressSpaceDying);
    }

    // OPENED
    let identity = engine.ledger.current();
    let shadow_gen = cookie.shadow().bitmap().generation();
    let quick = engine.last_open_gen == Some(shadow_gen);
    state.set_phase(PassPhase::Opened);
    debug!(
        "[REVOKE] open epoch={} {:?} shadow_gen={} quick={}",
        identity, flags, shadow_gen, quick
    );

    if flags.load_side {
        if !flags.tlb_flush {
            warn!("[REVOKE] load-side pass without closing TLB flush");
        }
        let gen = vm.advance_load_gen();
        vm.tlb().invalidate_all();
        trace!("[REVOKE] load generation now {}", gen);
    }

    let scanner = Scanner::new(cookie, shadow_gen);
    let mut report = PassReport {
        identity,
        quick_successor: quick,
        ..PassReport::default()
    };

    // SCANNING
    state.set_phase(PassPhase::Scanning);
    let load_gen = vm.load_gen();
    let pages = vm.page_snapshot();
    let mut swept: Vec<&Arc<Page>> = Vec::new();

    for (index, (vpn, page)) in pages.iter().enumerate() {
        if vm.is_dying() {
            return Err(abort(state, identity, RevokeError::AddressSpaceDying));
        }
        if !schedule.proceed(index, *vpn) {
            return Err(abort(state, identity, RevokeError::Cancelled));
        }

        if page.is_busy() {
            page.mark_dirty();
            report.pages_deferred += 1;
            stat_inc!(state.stats(), pages_skip_busy);
            warn!("[REVOKE] page {:#x} mid-unmap, left dirty", vpn);
            continue;
        }

        let dirty = page.is_dirty();
        let eligible = if flags.incremental {
            dirty
        } else {
            dirty || page.has_caps()
        };
        if !eligible {
            report.pages_skipped += 1;
            stat_inc!(state.stats(), pages_skip);
            // a capability-bearing page skipped here may still hold stale
            // capabilities and must keep trapping loads
            if !page.has_caps() {
                page.set_load_gen(load_gen);
            }
            continue;
        }

        if quick && !dirty && page.swept_gen().is_some_and(|g| g >= shadow_gen) {
            report.pages_fast += 1;
            stat_inc!(state.stats(), pages_skip_fast);
            page.set_load_gen(load_gen);
            swept.push(page);
            continue;
        }

        let scan = if page.is_writable() && !flags.load_side {
            scanner.page_rw(page)
        } else {
            let ro = scanner.page_ro(page);
            if ro.needs_write() {
                if !page.is_writable() {
                    if vm.upgrade_for_write(*vpn).is_err() {
                        // unmapped since the snapshot
                        continue;
                    }
                    stat_inc!(state.stats(), pages_upgraded);
                }
                scanner.page_rw(page)
            } else {
                ro
            }
        };
        trace!("[REVOKE] page {:#x} {:?}", vpn, scan);

        page.set_load_gen(load_gen);
        report.pages_visited += 1;
        report.caps_revoked += scan.revoked;
        swept.push(page);
    }

    // BARRIER
    if flags.barriered {
        state.set_phase(PassPhase::Barrier);
        debug!("[REVOKE] barrier verification of {} pages", swept.len());
        for page in &swept {
            if let Some(index) = scanner.find_revocable(page) {
                panic!(
                    "revocable capability survived barriered pass: word {} of {:?}",
                    index, page
                );
            }
        }
    }

    // CLOSING
    state.set_phase(PassPhase::Closing);
    if flags.sync_capdirty {
        let mut synced = 0u64;
        for (_, page) in &pages {
            if page.take_capdirty() {
                page.mark_dirty();
                synced += 1;
            }
        }
        stat_add!(state.stats(), capdirty_syncs, synced);
    }
    if flags.tlb_flush {
        vm.tlb().invalidate_all();
    }

    engine.ledger.complete(identity, !flags.incremental);
    state.info().publish(&engine.ledger);
    engine.last_open_gen = Some(shadow_gen);
    report.epochs = state.epochs();

    state.set_phase(PassPhase::Idle);
    stat_inc!(state.stats(), passes_completed);
    debug!(
        "[REVOKE] close epoch={} visited={} revoked={} -> {:?}",
        identity, report.pages_visited, report.caps_revoked, report.epochs
    );

    Ok(report)
}

fn abort(state: &RevokeState, identity: Epoch, err: RevokeError) -> RevokeError {
    state.set_phase(PassPhase::Idle);
    stat_inc!(state.stats(), passes_aborted);
    warn!("[REVOKE] pass for epoch {} aborted: {}", identity, err);
    err
}
