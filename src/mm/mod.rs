//! Memory management module for the revocation engine
//!
//! Provides the address-space model the engine sweeps:
//! - Virtual addresses and capability-word arithmetic
//! - Resident pages with capability metadata
//! - A per-space translation cache
//! - The address space itself, with mutator access paths
//!
//! # Security Principles
//! - A page that can hold a tagged capability always carries HASCAPS
//! - Capability stores always leave a trace (capdirty or DIRTY)
//!   unless a stale cached translation suppresses it
//! - Capability loads honour the address space's load generation

pub mod address;
pub mod page;
pub mod tlb;
pub mod vmspace;

pub use address::{VirtAddr, CAP_SIZE, PAGE_SIZE, WORDS_PER_PAGE};
pub use page::{Page, PageFlags};
pub use tlb::{Tlb, TlbEntry};
pub use vmspace::{MappingError, VmSpace};
