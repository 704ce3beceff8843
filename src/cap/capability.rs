//! Capability Values and Permissions
//!
//! Defines the portable capability model the revocation engine inspects.
//!
//! # Capability Structure
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Capability                          │
//! ├──────────────────────────────────────────────────────────┤
//! │  tag: bool            - Validity tag (no tag = no auth)  │
//! │  address: u64         - Current cursor                   │
//! │  base, length: u64    - Bounds [base, base + length)     │
//! │  perms: Perms         - Permitted operations             │
//! │  otype: Option<Otype> - Sealing object type              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Revoked Image
//! Revocation never deletes a word. It rewrites it into one of two images,
//! picked per address space by [`RevokeImage`]:
//! - `ZeroPermissions`: tag kept, permissions emptied, unsealed. A sealed
//!   token holder sees a type mismatch instead of a silently weakened token.
//! - `ClearTag`: tag cleared, bit pattern kept.

use core::fmt;

bitflags::bitflags! {
    /// Permission set carried by a capability.
    ///
    /// Permissions can only be removed from a capability, never added.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct Perms: u32 {
        /// Load data.
        const LOAD = 1 << 0;
        /// Store data.
        const STORE = 1 << 1;
        /// Execute instructions.
        const EXECUTE = 1 << 2;
        /// Load tagged capabilities.
        const LOAD_CAP = 1 << 3;
        /// Store tagged capabilities.
        const STORE_CAP = 1 << 4;
        /// Store local (non-global) capabilities.
        const STORE_LOCAL_CAP = 1 << 5;
        /// Capability may be stored anywhere.
        const GLOBAL = 1 << 6;
        /// Seal other capabilities with an object type in bounds.
        const SEAL = 1 << 7;
        /// Unseal capabilities whose object type is in bounds.
        const UNSEAL = 1 << 8;
        /// Switch to a compartment id in bounds.
        const COMPARTMENT_ID = 1 << 9;
        /// Access system registers.
        const SYSTEM_REGS = 1 << 10;
    }
}

impl Perms {
    /// Permissions that authorise access to memory at the capability's address.
    pub const MEMORY: Self = Self::LOAD
        .union(Self::STORE)
        .union(Self::EXECUTE)
        .union(Self::LOAD_CAP)
        .union(Self::STORE_CAP)
        .union(Self::STORE_LOCAL_CAP);

    /// Permissions that make the bounds name object types.
    pub const OTYPE: Self = Self::SEAL.union(Self::UNSEAL);

    /// Read/write data and capabilities.
    pub const DATA_RW: Self = Self::LOAD
        .union(Self::STORE)
        .union(Self::LOAD_CAP)
        .union(Self::STORE_CAP)
        .union(Self::GLOBAL);
}

/// Largest representable sealing object type.
pub const OTYPE_MAX: u32 = (1 << 18) - 1;

/// A sealing object type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct Otype(u32);

impl Otype {
    /// Create an object type.
    ///
    /// Returns None if the value is not representable.
    #[inline]
    pub const fn new(value: u32) -> Option<Self> {
        if value <= OTYPE_MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

/// How a revoked capability is rewritten.
///
/// Resolved once per address space when its revocation cookie is built.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum RevokeImage {
    /// Keep the tag, empty the permissions and unseal.
    #[default]
    ZeroPermissions,
    /// Clear the tag only.
    ClearTag,
}

/// A capability: a tagged, bounded, permission-restricted pointer.
///
/// An untagged capability carries no authority regardless of its bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    tag: bool,
    address: u64,
    base: u64,
    length: u64,
    perms: Perms,
    otype: Option<Otype>,
}

impl Capability {
    /// The null capability: untagged, zero everything.
    pub const fn null() -> Self {
        Self {
            tag: false,
            address: 0,
            base: 0,
            length: 0,
            perms: Perms::empty(),
            otype: None,
        }
    }

    /// Create a tagged, unsealed capability with its cursor at `base`.
    pub const fn new(base: u64, length: u64, perms: Perms) -> Self {
        Self {
            tag: true,
            address: base,
            base,
            length,
            perms,
            otype: None,
        }
    }

    /// Rebuild a capability from raw fields (used by the memory word codec).
    pub(crate) const fn from_raw_parts(
        tag: bool,
        address: u64,
        base: u64,
        length: u64,
        perms: Perms,
        otype: Option<Otype>,
    ) -> Self {
        Self {
            tag,
            address,
            base,
            length,
            perms,
            otype,
        }
    }

    /// Check the validity tag.
    #[inline]
    pub const fn is_tagged(&self) -> bool {
        self.tag
    }

    /// Get the cursor.
    #[inline]
    pub const fn address(&self) -> u64 {
        self.address
    }

    /// Get the lower bound.
    #[inline]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Get the length of the bounds.
    #[inline]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Get the exclusive upper bound, saturating at the top of the address space.
    #[inline]
    pub const fn top(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// Get the permission set.
    #[inline]
    pub const fn perms(&self) -> Perms {
        self.perms
    }

    /// Get the sealing object type, if sealed.
    #[inline]
    pub const fn otype(&self) -> Option<Otype> {
        self.otype
    }

    /// Check if the capability is sealed.
    #[inline]
    pub const fn is_sealed(&self) -> bool {
        self.otype.is_some()
    }

    /// Move the cursor. Bounds and tag are unaffected.
    #[inline]
    pub const fn with_address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    /// Derive a capability with narrower bounds and permissions.
    ///
    /// Returns None if the source is untagged or sealed, or if the request
    /// is not a subset of the source's bounds and permissions.
    pub fn derive(&self, base: u64, length: u64, perms: Perms) -> Option<Self> {
        if !self.tag || self.is_sealed() {
            return None;
        }

        let top = base.checked_add(length)?;
        if base < self.base || top > self.top() {
            return None;
        }

        if !self.perms.contains(perms) {
            return None;
        }

        Some(Self {
            tag: true,
            address: base,
            base,
            length,
            perms,
            otype: None,
        })
    }

    /// Seal this capability with an object type.
    pub fn seal(mut self, otype: Otype) -> Option<Self> {
        if !self.tag || self.is_sealed() {
            return None;
        }
        self.otype = Some(otype);
        Some(self)
    }

    /// Check if the bounds exceed a coarse-granularity threshold.
    #[inline]
    pub const fn is_coarse(&self, threshold: u64) -> bool {
        self.length > threshold
    }

    /// Check if the permissions only name object types or compartments,
    /// never memory.
    #[inline]
    pub fn is_type_token(&self) -> bool {
        self.perms
            .intersects(Perms::OTYPE.union(Perms::COMPARTMENT_ID))
            && !self.perms.intersects(Perms::MEMORY)
    }

    /// Check if this is already a revoked image: tagged, unsealed, no permissions.
    #[inline]
    pub const fn is_revoked_image(&self) -> bool {
        self.tag && self.perms.is_empty() && self.otype.is_none()
    }

    /// Produce the revoked image of this capability.
    ///
    /// # Panics
    /// Panics on an untagged capability or one that is already a revoked
    /// image. Either means a sweep tried to revoke a word twice.
    pub fn revoked(&self, image: RevokeImage) -> Self {
        assert!(self.tag, "revoking an untagged capability: {:?}", self);
        assert!(!self.is_revoked_image(), "double revocation of {:?}", self);

        match image {
            RevokeImage::ZeroPermissions => Self {
                perms: Perms::empty(),
                otype: None,
                ..*self
            },
            RevokeImage::ClearTag => Self { tag: false, ..*self },
        }
    }

    /// Check if this capability carries no authority.
    #[inline]
    pub const fn is_powerless(&self) -> bool {
        !self.tag || self.perms.is_empty()
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tag && self.length == 0 && self.address == 0 {
            return write!(f, "Cap(null)");
        }
        write!(
            f,
            "Cap({}{:#x} [{:#x}, {:#x}) {:?}",
            if self.tag { "" } else { "untagged " },
            self.address,
            self.base,
            self.top(),
            self.perms
        )?;
        if let Some(otype) = self.otype {
            write!(f, " sealed={}", otype.value())?;
        }
        write!(f, ")")
    }
}
