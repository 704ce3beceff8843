//! System Call Handler
//!
//! Dispatches the revocation system calls.
//!
//! # Security Considerations
//! - All syscall numbers are validated against the whitelist
//! - Unknown syscalls return ENOSYS
//! - Every argument word goes through `validate` before use

use alloc::sync::Arc;

use log::{debug, warn};

use super::validate::{self, ShadowRequest};
use crate::mm::VmSpace;
use crate::revoke::{
    self, cookie_init, pass, Epoch, InfoPageRef, InfoSnapshot, RevokeError, ShadowCap,
    ShadowError, StatsSnapshot,
};

/// System call numbers
pub mod numbers {
    /// Revoke until an epoch clears.
    pub const SYS_CHERI_REVOKE: usize = 0;
    /// Shadow capability or info page.
    pub const SYS_CHERI_REVOKE_GET_SHADOW: usize = 1;
    /// Immunity classes for later passes.
    pub const SYS_CHERI_REVOKE_SET_TEST: usize = 2;
}

/// Passes a single revoke call may run before giving up.
const MAX_PASSES: usize = 3;

/// System call error codes
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Operation not permitted
    Eperm = -1,
    /// Try again
    Eagain = -11,
    /// Bad address
    Efault = -14,
    /// Invalid argument
    Einval = -22,
    /// Invalid system call number
    Enosys = -38,
}

impl From<RevokeError> for SyscallError {
    fn from(e: RevokeError) -> Self {
        match e {
            RevokeError::NoShadow => Self::Eperm,
            RevokeError::ShadowAlreadyInstalled => Self::Einval,
            RevokeError::AddressSpaceDying | RevokeError::Cancelled => Self::Eagain,
            RevokeError::Shadow(ShadowError::OutOfBounds) => Self::Efault,
            RevokeError::Shadow(ShadowError::PermissionDenied) => Self::Eperm,
            RevokeError::Shadow(ShadowError::Misaligned | ShadowError::SelectorMismatch) => {
                Self::Einval
            }
        }
    }
}

/// Argument registers (x0-x5).
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    /// Raw register values.
    pub regs: [u64; 6],
}

/// What `cheri_revoke` hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevokeSyscallInfo {
    /// Epochs after the call.
    pub epochs: InfoSnapshot,
    /// Engine counters after the call.
    pub stats: StatsSnapshot,
}

/// What `cheri_revoke_get_shadow` hands back.
#[derive(Debug, Clone)]
pub enum ShadowGrant {
    /// Bounded capability over a shadow region.
    Shadow(ShadowCap),
    /// Read-only epoch info page.
    Info(InfoPageRef),
}

/// Out-of-band results copied back to the caller.
#[derive(Debug, Clone)]
pub enum SyscallOutput {
    /// Nothing beyond the return value.
    None,
    /// From `cheri_revoke`.
    Revoke(RevokeSyscallInfo),
    /// From `cheri_revoke_get_shadow`.
    Grant(ShadowGrant),
}

/// Result of a dispatched call.
#[derive(Debug, Clone)]
pub struct SyscallReturn {
    /// Value for x0: zero or a negative errno.
    pub value: i64,
    /// Data copied back on success.
    pub output: SyscallOutput,
}

impl SyscallReturn {
    fn ok(output: SyscallOutput) -> Self {
        Self { value: 0, output }
    }

    fn err(e: SyscallError) -> Self {
        Self {
            value: e as i64,
            output: SyscallOutput::None,
        }
    }
}

/// Dispatch a system call on behalf of `vm`.
///
/// # Security
/// - Unknown syscall numbers are rejected with ENOSYS
/// - Each handler validates its own arguments
pub fn dispatch(vm: &Arc<VmSpace>, syscall_num: usize, args: &SyscallArgs) -> SyscallReturn {
    let regs = &args.regs;
    let result = match syscall_num {
        numbers::SYS_CHERI_REVOKE => {
            cheri_revoke(vm, regs[0], regs[1]).map(SyscallOutput::Revoke)
        }
        numbers::SYS_CHERI_REVOKE_GET_SHADOW => {
            get_shadow(vm, regs[0], regs[1], regs[2]).map(SyscallOutput::Grant)
        }
        numbers::SYS_CHERI_REVOKE_SET_TEST => set_test(vm, regs[0]).map(|()| SyscallOutput::None),
        _ => {
            warn!("[SYSCALL] Unknown syscall: {}", syscall_num);
            Err(SyscallError::Enosys)
        }
    };

    match result {
        Ok(output) => SyscallReturn::ok(output),
        Err(e) => SyscallReturn::err(e),
    }
}

/// Revoke until memory painted during `start_epoch` is cleared.
///
/// Returns at once if it already is. Otherwise runs passes with `flags_raw`,
/// switching to full passes after the first, since only full passes move
/// the dequeue epoch.
///
/// # Security
/// - `start_epoch` may not lie in the future
/// - Quick-successor and unknown flag bits are rejected
pub fn cheri_revoke(
    vm: &Arc<VmSpace>,
    flags_raw: u64,
    start_epoch: Epoch,
) -> Result<RevokeSyscallInfo, SyscallError> {
    let mut flags = validate::pass_flags(flags_raw)?;
    let state = vm.revoke_state();

    let epochs = state.epochs();
    if start_epoch > epochs.current {
        return Err(SyscallError::Einval);
    }
    if epochs.clears(start_epoch) {
        return Ok(info(vm, epochs));
    }

    let cookie = cookie_init(vm)?;
    for _ in 0..MAX_PASSES {
        let report = pass(&cookie, flags)?;
        if report.epochs.clears(start_epoch) {
            debug!(
                "[SYSCALL] cheri_revoke: epoch {} cleared at {:?}",
                start_epoch, report.epochs
            );
            return Ok(info(vm, report.epochs));
        }
        flags.incremental = false;
    }

    warn!("[SYSCALL] cheri_revoke: epoch {} not cleared", start_epoch);
    Err(SyscallError::Eagain)
}

fn info(vm: &VmSpace, epochs: InfoSnapshot) -> RevokeSyscallInfo {
    RevokeSyscallInfo {
        epochs,
        stats: vm.revoke_state().stats().snapshot(),
    }
}

/// Hand out a bounded shadow capability or the info page.
pub fn get_shadow(
    vm: &VmSpace,
    selector: u64,
    base: u64,
    size: u64,
) -> Result<ShadowGrant, SyscallError> {
    match validate::shadow_request(selector, base, size)? {
        ShadowRequest::Info => Ok(ShadowGrant::Info(revoke::info_page(vm))),
        ShadowRequest::Region {
            selector,
            base,
            size,
            perms,
        } => {
            let cap = revoke::shadow_cap(vm, selector, base, size, perms)?;
            Ok(ShadowGrant::Shadow(cap))
        }
    }
}

/// Set the immunity classes for later passes.
pub fn set_test(vm: &VmSpace, flags_raw: u64) -> Result<(), SyscallError> {
    let flags = validate::test_flags(flags_raw)?;
    revoke::set_test_flags(vm, flags);
    Ok(())
}
