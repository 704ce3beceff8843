//! Capability Model
//!
//! Portable stand-in for a hardware tagged-capability representation.
//!
//! # Design
//! - `Capability` is a plain value: tag, address, bounds, permissions, otype
//! - `CapCell` is a word of memory holding one, replaceable atomically
//! - `RevokeImage` picks how a revoked word is rewritten
//!
//! # Security Properties
//! - Permissions can only be narrowed
//! - An untagged capability carries no authority
//! - Revoking an already-revoked image is a fatal defect

pub mod capability;
pub mod cell;

pub use capability::{Capability, Otype, Perms, RevokeImage, OTYPE_MAX};
pub use cell::CapCell;
