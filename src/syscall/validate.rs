//! System Call Input Validation
//!
//! Decodes raw argument words into engine types before anything else sees
//! them.
//!
//! # Security Principles
//! - Deny by default: unknown flag bits and selectors are rejected
//! - Internal-only bits (quick successor) cannot be requested from user space
//! - Ranges are overflow-checked here; bounds against the shadow are checked
//!   by the shadow itself

use super::handler::SyscallError;
use crate::revoke::{PassFlags, ShadowPerms, ShadowSelector, TestFlags};

/// Wire bit values for the revocation flag word.
pub mod revoke_bits {
    /// Sweep only dirty pages.
    pub const INCREMENTAL: u64 = 0x04;
    /// Verify with mutators stopped.
    pub const BARRIERED: u64 = 0x08;
    /// Open a new capability-load generation.
    pub const LOAD_SIDE: u64 = 0x10;
    /// Computed by the engine at pass open; never accepted from callers.
    pub const QUICK_SUCCESSOR: u64 = 0x20;
    /// Shoot down translations when closing.
    pub const TLB_FLUSH: u64 = 0x40;
    /// Fold capdirty into DIRTY when closing.
    pub const SYNC_CD: u64 = 0x80;

    /// Bits a caller may set.
    pub const ACCEPTED: u64 = INCREMENTAL | BARRIERED | LOAD_SIDE | TLB_FLUSH | SYNC_CD;
}

/// Wire bit values for the test-flag word.
pub mod test_bits {
    /// Coarse capabilities are immune to memory paint.
    pub const NO_COARSE_MEM: u64 = 0x01;
    /// Sealing authority is immune to otype revocation.
    pub const NO_OTYPES: u64 = 0x02;
    /// Compartment-id authority is immune to cid revocation.
    pub const NO_CIDS: u64 = 0x04;

    /// Bits a caller may set.
    pub const ACCEPTED: u64 = NO_COARSE_MEM | NO_OTYPES | NO_CIDS;
}

/// Wire selector values for the shadow request.
pub mod selectors {
    /// Memory shadow.
    pub const MEMORY: u64 = 0;
    /// Object-type shadow.
    pub const OTYPE: u64 = 1;
    /// Epoch info page.
    pub const INFO_STRUCT: u64 = 2;
    /// Whole shadow, read-only.
    pub const ENTIRE: u64 = 3;
    /// Compartment-id shadow.
    pub const CID: u64 = 4;
}

/// What a validated shadow request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowRequest {
    /// A bounded capability over one shadow region.
    Region {
        /// Shadow region.
        selector: ShadowSelector,
        /// First address or index covered.
        base: u64,
        /// Extent in the region's units.
        size: u64,
        /// Access granted.
        perms: ShadowPerms,
    },
    /// The epoch info page.
    Info,
}

/// Decode a revocation flag word.
pub fn pass_flags(raw: u64) -> Result<PassFlags, SyscallError> {
    if raw & !revoke_bits::ACCEPTED != 0 {
        return Err(SyscallError::Einval);
    }
    Ok(PassFlags {
        incremental: raw & revoke_bits::INCREMENTAL != 0,
        barriered: raw & revoke_bits::BARRIERED != 0,
        load_side: raw & revoke_bits::LOAD_SIDE != 0,
        tlb_flush: raw & revoke_bits::TLB_FLUSH != 0,
        sync_capdirty: raw & revoke_bits::SYNC_CD != 0,
    })
}

/// Decode a test-flag word.
pub fn test_flags(raw: u64) -> Result<TestFlags, SyscallError> {
    if raw & !test_bits::ACCEPTED != 0 {
        return Err(SyscallError::Einval);
    }
    Ok(TestFlags {
        no_coarse_mem: raw & test_bits::NO_COARSE_MEM != 0,
        no_otypes: raw & test_bits::NO_OTYPES != 0,
        no_cids: raw & test_bits::NO_CIDS != 0,
    })
}

/// Decode a shadow request.
///
/// # Security Checks
/// 1. Selector is one of the known values
/// 2. Whole-shadow and info requests carry no range
/// 3. Region requests are non-empty and do not overflow
pub fn shadow_request(selector: u64, base: u64, size: u64) -> Result<ShadowRequest, SyscallError> {
    let region = match selector {
        selectors::INFO_STRUCT => {
            check_empty(base, size)?;
            return Ok(ShadowRequest::Info);
        }
        selectors::ENTIRE => {
            check_empty(base, size)?;
            return Ok(ShadowRequest::Region {
                selector: ShadowSelector::Entire,
                base: 0,
                size: 0,
                perms: ShadowPerms::LOAD,
            });
        }
        selectors::MEMORY => ShadowSelector::Memory,
        selectors::OTYPE => ShadowSelector::Otype,
        selectors::CID => ShadowSelector::Cid,
        _ => return Err(SyscallError::Einval),
    };

    check_range(base, size)?;
    Ok(ShadowRequest::Region {
        selector: region,
        base,
        size,
        perms: ShadowPerms::LOAD | ShadowPerms::STORE,
    })
}

fn check_empty(base: u64, size: u64) -> Result<(), SyscallError> {
    if base != 0 || size != 0 {
        return Err(SyscallError::Einval);
    }
    Ok(())
}

fn check_range(base: u64, size: u64) -> Result<(), SyscallError> {
    if size == 0 {
        return Err(SyscallError::Einval);
    }
    base.checked_add(size).ok_or(SyscallError::Efault)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_flag_bits() {
        let flags = pass_flags(revoke_bits::INCREMENTAL | revoke_bits::TLB_FLUSH).unwrap();
        assert_eq!(flags, PassFlags::INCREMENTAL.tlb_flush());
        assert_eq!(pass_flags(0).unwrap(), PassFlags::FULL);
    }

    #[test]
    fn test_quick_successor_rejected() {
        assert_eq!(
            pass_flags(revoke_bits::QUICK_SUCCESSOR).unwrap_err(),
            SyscallError::Einval
        );
        assert_eq!(pass_flags(0x1).unwrap_err(), SyscallError::Einval);
        assert_eq!(pass_flags(0x100).unwrap_err(), SyscallError::Einval);
    }

    #[test]
    fn test_test_flag_bits() {
        let flags = test_flags(test_bits::NO_OTYPES | test_bits::NO_CIDS).unwrap();
        assert!(!flags.no_coarse_mem && flags.no_otypes && flags.no_cids);
        assert_eq!(test_flags(0x08).unwrap_err(), SyscallError::Einval);
    }

    #[test]
    fn test_shadow_requests() {
        assert_eq!(
            shadow_request(selectors::INFO_STRUCT, 0, 0).unwrap(),
            ShadowRequest::Info
        );
        assert_eq!(
            shadow_request(selectors::INFO_STRUCT, 0, 16).unwrap_err(),
            SyscallError::Einval
        );
        assert!(matches!(
            shadow_request(selectors::ENTIRE, 0, 0).unwrap(),
            ShadowRequest::Region {
                selector: ShadowSelector::Entire,
                perms: ShadowPerms::LOAD,
                ..
            }
        ));
        assert_eq!(shadow_request(7, 0, 16).unwrap_err(), SyscallError::Einval);
    }

    #[test]
    fn test_region_range_checks() {
        assert_eq!(
            shadow_request(selectors::MEMORY, 0x1000, 0).unwrap_err(),
            SyscallError::Einval
        );
        assert_eq!(
            shadow_request(selectors::OTYPE, u64::MAX - 4, 16).unwrap_err(),
            SyscallError::Efault
        );
        assert!(shadow_request(selectors::CID, 4, 4).is_ok());
    }
}
