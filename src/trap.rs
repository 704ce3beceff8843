//! Page-Fault Routing
//!
//! Classifies user access faults and hands them to the revocation engine
//! before default handling.
//!
//! # Fault Kinds
//! - CapLoadGen: capability load through a translation from an older
//!   capability-load generation
//! - CapStore: first capability store to a page
//! - Write: store to a read-only page (copy-on-write upgrade)
//! - Translation: no page mapped
//!
//! # Routing
//! While revocation is active on the address space (or the fault is a
//! load-generation fault, which only revocation produces) the fault
//! resolver runs first:
//! - Resolved: retry the access
//! - Capstore: handle as a capability-store fault, then retry
//! - Unresolved: default handling below

use alloc::sync::Arc;

use log::{trace, warn};

use crate::mm::{MappingError, VirtAddr, VmSpace};
use crate::revoke::{fault_visit, FaultResolution};

/// Why a user access trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Capability load with a stale load generation.
    CapLoadGen,
    /// Capability store to a page not enabled for capability stores.
    CapStore,
    /// Store to a read-only page.
    Write,
    /// No translation.
    Translation,
}

/// A fault default handling could not fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// Nothing is mapped at the address.
    NotMapped,
    /// The address is not capability-aligned.
    Misaligned,
    /// The fault kept recurring or hit a page mid-unmap.
    Unhandled,
}

impl core::fmt::Display for AccessFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotMapped => write!(f, "address not mapped"),
            Self::Misaligned => write!(f, "address not capability-aligned"),
            Self::Unhandled => write!(f, "unhandled access fault"),
        }
    }
}

impl From<MappingError> for AccessFault {
    fn from(e: MappingError) -> Self {
        match e {
            MappingError::NotMapped => Self::NotMapped,
            MappingError::MisalignedAddress => Self::Misaligned,
            MappingError::AlreadyMapped => Self::Unhandled,
        }
    }
}

/// Handle a user access fault at `addr`.
///
/// Returns Ok if the access should be retried.
pub fn handle_fault(vm: &Arc<VmSpace>, addr: VirtAddr, kind: FaultKind) -> Result<(), AccessFault> {
    let vpn = addr.page_number();

    if kind == FaultKind::CapLoadGen || vm.revoke_state().is_active() {
        match fault_visit(vm, addr) {
            FaultResolution::Resolved => {
                trace!("[TRAP] {:?} at {} resolved by revoker", kind, addr);
                return Ok(());
            }
            FaultResolution::Capstore => {
                trace!("[TRAP] {:?} at {} rerouted as capstore", kind, addr);
                vm.upgrade_for_write(vpn)?;
                vm.capstore_fault(vpn)?;
                return Ok(());
            }
            FaultResolution::Unresolved => {}
        }
    }

    match kind {
        FaultKind::CapLoadGen => {
            let page = vm.page(vpn).ok_or(AccessFault::NotMapped)?;
            if page.is_busy() {
                warn!("[TRAP] capability load from page {:#x} mid-unmap", vpn);
                return Err(AccessFault::Unhandled);
            }
            if !vm.revoke_state().has_shadow() {
                page.set_load_gen(vm.load_gen());
            }
            vm.tlb().invalidate_page(vpn);
            Ok(())
        }
        FaultKind::CapStore => Ok(vm.capstore_fault(vpn)?),
        FaultKind::Write => Ok(vm.upgrade_for_write(vpn)?),
        FaultKind::Translation => Err(AccessFault::NotMapped),
    }
}
