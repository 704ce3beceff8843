//! PantherOS Capability Revocation Engine
//!
//! Finds every live copy of a capability that points into memory the
//! allocator has reclaimed and invalidates it in place, so a dangling
//! capability can never be dereferenced once its memory is reused.
//!
//! # Components
//! - Shadow bitmap: one bit per granule of reclaimed address space
//! - Revocation cookie: session handle binding a scan to one address space
//! - Epoch ledger: pass counters published to a user-visible info page
//! - Capability tester: shadow-intersection predicate with immunity classes
//! - Page scanner: sweeps a page's capability words, revoking matches
//! - Pass orchestrator: drives one full or incremental sweep
//! - Fault resolver: closes races between mutators and the sweeper
//!
//! # Security Properties
//! - A completed pass never leaves a tagged, authority-bearing capability
//!   into its shadow snapshot on any capability-bearing page
//! - Epochs only advance on a fully completed pass
//! - Revoking a capability word is a single atomic replacement
//!
//! # Memory Model
//! The engine runs against the address-space model in [`mm`]: pages of
//! capability words with HASCAPS/DIRTY metadata, a hardware capdirty bit,
//! capability-load generations and a translation cache.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod cap;
pub mod mm;
pub mod revoke;
pub mod syscall;
pub mod trap;

#[cfg(all(test, feature = "loom"))]
mod loom_tests;

#[cfg(test)]
pub(crate) mod testutil;

pub use cap::{CapCell, Capability, Otype, Perms, RevokeImage};
pub use mm::{Page, PageFlags, VirtAddr, VmSpace};
pub use revoke::{
    cookie_init, cookie_release, fault_visit, info_page, install_shadow, pass, set_test_flags,
    shadow_cap, FaultResolution, PassFlags, RevokeConfig, RevokeCookie, RevokeError,
};
