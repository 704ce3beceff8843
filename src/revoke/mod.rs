//! Capability Revocation
//!
//! The engine proper: shadow bitmap, cookies, the capability tester, the
//! page scanner, the pass orchestrator, the fault resolver, the epoch
//! ledger and statistics.
//!
//! # Entry Points
//! - `install_shadow(map)`: allocate the map's shadow (allocator side)
//! - `shadow_cap(map, selector, base, size, perms)`: bounded shadow access
//! - `cookie_init(map)` / `cookie_release(cookie)`: scan sessions
//! - `pass(cookie, flags)`: one sweep
//! - `fault_visit(map, addr)`: page-fault routing
//! - `set_test_flags(map, flags)`: immunity classes for later passes
//! - `info_page(map)`: the user-visible epoch page
//!
//! # Error Policy
//! Configuration problems are returned as [`RevokeError`]. Invariant
//! violations (epoch disorder, double revocation, a revocable capability
//! surviving a barriered pass) panic.

pub mod cookie;
pub mod epoch;
pub mod fault;
pub mod pass;
pub mod scan;
pub mod shadow;
pub mod state;
pub mod stats;
pub mod tester;

use alloc::sync::Arc;

use log::{debug, trace};

use crate::mm::VmSpace;

pub use cookie::RevokeCookie;
pub use epoch::{Epoch, EpochLedger, InfoPage, InfoPageRef, InfoSnapshot};
pub use fault::{fault_visit, FaultResolution};
pub use pass::{pass, pass_with, PassFlags, PassPhase, PassReport, PassSchedule};
pub use scan::{scan_page_ro, scan_page_rw, PageScan, Scanner};
pub use shadow::{
    ShadowBitmap, ShadowCap, ShadowError, ShadowLayout, ShadowPerms, ShadowSelector, GRANULE_SIZE,
};
pub use state::{RevokeConfig, RevokeState, DEFAULT_COARSE_THRESHOLD};
pub use stats::{RevokeStats, StatsSnapshot};
pub use tester::{CapTester, TestFlags, TestResult};

/// Revocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeError {
    /// The address space has no shadow installed.
    NoShadow,
    /// A shadow is already installed.
    ShadowAlreadyInstalled,
    /// The address space is being torn down.
    AddressSpaceDying,
    /// The scheduler stopped the pass.
    Cancelled,
    /// A shadow capability request was refused.
    Shadow(ShadowError),
}

impl core::fmt::Display for RevokeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoShadow => write!(f, "no shadow installed"),
            Self::ShadowAlreadyInstalled => write!(f, "shadow already installed"),
            Self::AddressSpaceDying => write!(f, "address space is being torn down"),
            Self::Cancelled => write!(f, "pass cancelled"),
            Self::Shadow(e) => write!(f, "shadow: {}", e),
        }
    }
}

impl From<ShadowError> for RevokeError {
    fn from(e: ShadowError) -> Self {
        Self::Shadow(e)
    }
}

/// Allocate `map`'s shadow and return a read-write capability over all of it.
pub fn install_shadow(map: &VmSpace) -> Result<ShadowCap, RevokeError> {
    let bitmap = map.revoke_state().install_shadow()?;
    debug!("[REVOKE] shadow installed, {:?}", bitmap.layout());
    Ok(bitmap.cap(
        ShadowSelector::Entire,
        0,
        0,
        ShadowPerms::LOAD | ShadowPerms::STORE,
    )?)
}

/// Build a bounded capability over part of `map`'s shadow.
pub fn shadow_cap(
    map: &VmSpace,
    selector: ShadowSelector,
    base: u64,
    size: u64,
    perms: ShadowPerms,
) -> Result<ShadowCap, RevokeError> {
    let bitmap = map.revoke_state().shadow().ok_or(RevokeError::NoShadow)?;
    Ok(bitmap.cap(selector, base, size, perms)?)
}

/// Open a revocation session on `map`.
pub fn cookie_init(map: &Arc<VmSpace>) -> Result<Arc<RevokeCookie>, RevokeError> {
    let cookie = RevokeCookie::init(map)?;
    trace!(
        "[REVOKE] cookie opened, {} live",
        map.revoke_state().cookie_count()
    );
    Ok(cookie)
}

/// Release a session opened by [`cookie_init`].
pub fn cookie_release(cookie: Arc<RevokeCookie>) {
    drop(cookie);
}

/// The page `map` publishes its epochs to.
pub fn info_page(map: &VmSpace) -> InfoPageRef {
    Arc::clone(map.revoke_state().info())
}

/// Set the immunity classes for passes that open after this call.
pub fn set_test_flags(map: &VmSpace, flags: TestFlags) {
    debug!("[REVOKE] test flags {:?}", flags);
    map.revoke_state().set_test_flags(flags);
}
