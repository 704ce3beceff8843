//! System Call Interface
//!
//! The user-facing surface of the revocation engine.
//!
//! # Security Model
//! - Whitelist approach: only explicitly implemented syscalls are allowed
//! - All parameters are validated before use
//! - Invalid inputs return errors, never panic
//!
//! # Current Syscalls
//! - 0: cheri_revoke(flags, start_epoch) - revoke until `start_epoch` clears
//! - 1: cheri_revoke_get_shadow(selector, base, size) - shadow capability or info page
//! - 2: cheri_revoke_set_test(flags) - immunity classes for later passes

mod handler;
mod validate;

pub use handler::{
    cheri_revoke, dispatch, get_shadow, numbers, set_test, RevokeSyscallInfo, ShadowGrant,
    SyscallArgs, SyscallError, SyscallOutput, SyscallReturn,
};
pub use validate::{revoke_bits, selectors, test_bits, ShadowRequest};
