//! Shadow Bitmap
//!
//! One bit per granule of an address space's revocable namespaces. A set bit
//! means "no live capability may cover this".
//!
//! # Layout
//! ```text
//! bit 0                                                          bit N
//! ┌────────────────────────┬──────────────────┬──────────────────┐
//! │ Memory                 │ Otype            │ Cid              │
//! │ 1 bit / 16-byte granule│ 1 bit / otype    │ 1 bit / cid      │
//! └────────────────────────┴──────────────────┴──────────────────┘
//! ```
//!
//! The bitmap is only reached through a [`ShadowCap`]: a bounded,
//! permission-restricted view of one region (or of the whole bitmap).
//!
//! # Concurrency
//! - Readers never block: every test is a handful of acquire loads
//! - Painters set bits with atomic OR, then bump the generation
//! - Exclusion between painters is the allocator's business

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// Bytes of address space covered by one memory-region bit.
pub const GRANULE_SIZE: u64 = 16;

/// Which part of the shadow a capability addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShadowSelector {
    /// Memory region, indexed by address.
    Memory,
    /// Object-type region, indexed by otype.
    Otype,
    /// Compartment-id region, indexed by compartment id.
    Cid,
    /// The whole bitmap.
    Entire,
}

bitflags::bitflags! {
    /// What a shadow capability may do to the bits it covers.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct ShadowPerms: u8 {
        /// Test bits.
        const LOAD = 0x01;
        /// Set and clear bits.
        const STORE = 0x02;
    }
}

/// Errors from shadow capability operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowError {
    /// The request reaches outside the capability's bounds.
    OutOfBounds,
    /// The capability lacks the permission for this operation.
    PermissionDenied,
    /// A memory range is not granule-aligned.
    Misaligned,
    /// The operation needs a single-region capability.
    SelectorMismatch,
}

impl core::fmt::Display for ShadowError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfBounds => write!(f, "shadow range out of bounds"),
            Self::PermissionDenied => write!(f, "insufficient shadow permissions"),
            Self::Misaligned => write!(f, "shadow range not granule-aligned"),
            Self::SelectorMismatch => write!(f, "shadow selector mismatch"),
        }
    }
}

/// Sizes of the shadow's regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowLayout {
    /// Bytes of user address space covered, from address zero.
    pub memory_span: u64,
    /// Number of object types covered.
    pub otype_count: u64,
    /// Number of compartment ids covered.
    pub cid_count: u64,
}

impl ShadowLayout {
    /// Default layout: 64 MiB of memory, the full otype space, 64 Ki cids.
    pub const fn new() -> Self {
        Self {
            memory_span: 64 << 20,
            otype_count: 1 << 18,
            cid_count: 1 << 16,
        }
    }

    /// Number of index units (bits) in a region.
    const fn units(&self, selector: ShadowSelector) -> u64 {
        match selector {
            ShadowSelector::Memory => self.memory_span / GRANULE_SIZE,
            ShadowSelector::Otype => self.otype_count,
            ShadowSelector::Cid => self.cid_count,
            ShadowSelector::Entire => self.total_bits(),
        }
    }

    /// Bit offset of a region's first bit.
    const fn bit_offset(&self, selector: ShadowSelector) -> u64 {
        match selector {
            ShadowSelector::Memory | ShadowSelector::Entire => 0,
            ShadowSelector::Otype => self.memory_span / GRANULE_SIZE,
            ShadowSelector::Cid => self.memory_span / GRANULE_SIZE + self.otype_count,
        }
    }

    /// Extent of a region in its own index space (bytes for memory).
    const fn extent(&self, selector: ShadowSelector) -> u64 {
        match selector {
            ShadowSelector::Memory => self.memory_span,
            other => self.units(other),
        }
    }

    const fn total_bits(&self) -> u64 {
        self.memory_span / GRANULE_SIZE + self.otype_count + self.cid_count
    }
}

impl Default for ShadowLayout {
    fn default() -> Self {
        Self::new()
    }
}

/// The bitmap itself.
pub struct ShadowBitmap {
    layout: ShadowLayout,
    words: Vec<AtomicU64>,
    generation: AtomicU64,
}

impl ShadowBitmap {
    /// Allocate a cleared bitmap.
    pub fn new(layout: ShadowLayout) -> Arc<Self> {
        let nwords = layout.total_bits().div_ceil(64) as usize;
        Arc::new(Self {
            layout,
            words: (0..nwords).map(|_| AtomicU64::new(0)).collect(),
            generation: AtomicU64::new(0),
        })
    }

    /// Layout of the regions.
    pub fn layout(&self) -> ShadowLayout {
        self.layout
    }

    /// Number of paint operations so far.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidate every sweep recorded against the current generation.
    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Build a capability over `[base, base + size)` of a region.
    ///
    /// For `Entire`, `base` and `size` must both be zero and the capability
    /// covers every region.
    pub fn cap(
        self: &Arc<Self>,
        selector: ShadowSelector,
        base: u64,
        size: u64,
        perms: ShadowPerms,
    ) -> Result<ShadowCap, ShadowError> {
        let (base, size) = if selector == ShadowSelector::Entire {
            if base != 0 || size != 0 {
                return Err(ShadowError::OutOfBounds);
            }
            (0, self.layout.total_bits())
        } else {
            let top = base.checked_add(size).ok_or(ShadowError::OutOfBounds)?;
            if top > self.layout.extent(selector) {
                return Err(ShadowError::OutOfBounds);
            }
            if selector == ShadowSelector::Memory
                && (base % GRANULE_SIZE != 0 || size % GRANULE_SIZE != 0)
            {
                return Err(ShadowError::Misaligned);
            }
            (base, size)
        };

        Ok(ShadowCap {
            bitmap: Arc::clone(self),
            selector,
            base,
            size,
            perms,
        })
    }

    /// Bit range `[first, end)` for `[base, base + len)` of a region,
    /// clamped to the region. Zero-length ranges cover their base unit.
    fn bit_range(&self, selector: ShadowSelector, base: u64, len: u64) -> Option<(u64, u64)> {
        let (first, end) = match selector {
            ShadowSelector::Memory => {
                let top = base.saturating_add(len.max(1));
                (base / GRANULE_SIZE, top.div_ceil(GRANULE_SIZE))
            }
            _ => (base, base.saturating_add(len.max(1))),
        };
        let units = self.layout.units(selector);
        let end = end.min(units);
        if first >= end {
            return None;
        }
        let offset = self.layout.bit_offset(selector);
        Some((offset + first, offset + end))
    }

    fn any_set(&self, first: u64, end: u64) -> bool {
        let mut bit = first;
        while bit < end {
            let index = (bit / 64) as usize;
            let lo = bit % 64;
            let hi = (end - index as u64 * 64).min(64);
            let mask = mask_range(lo, hi);
            if self.words[index].load(Ordering::Acquire) & mask != 0 {
                return true;
            }
            bit = (index as u64 + 1) * 64;
        }
        false
    }

    fn update(&self, first: u64, end: u64, set: bool) {
        let mut bit = first;
        while bit < end {
            let index = (bit / 64) as usize;
            let lo = bit % 64;
            let hi = (end - index as u64 * 64).min(64);
            let mask = mask_range(lo, hi);
            if set {
                self.words[index].fetch_or(mask, Ordering::Release);
            } else {
                self.words[index].fetch_and(!mask, Ordering::Release);
            }
            bit = (index as u64 + 1) * 64;
        }
    }
}

impl core::fmt::Debug for ShadowBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShadowBitmap")
            .field("layout", &self.layout)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// Mask with bits `[lo, hi)` set, `hi <= 64`.
#[inline]
const fn mask_range(lo: u64, hi: u64) -> u64 {
    let upper = if hi >= 64 { u64::MAX } else { (1u64 << hi) - 1 };
    upper & !((1u64 << lo) - 1)
}

/// A bounded, permission-restricted view of the shadow bitmap.
#[derive(Clone)]
pub struct ShadowCap {
    bitmap: Arc<ShadowBitmap>,
    selector: ShadowSelector,
    base: u64,
    size: u64,
    perms: ShadowPerms,
}

impl ShadowCap {
    /// Region this capability addresses.
    pub fn selector(&self) -> ShadowSelector {
        self.selector
    }

    /// Lower bound in the region's index space.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Extent in the region's index space.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Permissions.
    pub fn perms(&self) -> ShadowPerms {
        self.perms
    }

    /// Underlying bitmap.
    pub fn bitmap(&self) -> &Arc<ShadowBitmap> {
        &self.bitmap
    }

    /// Drop permissions.
    pub fn restrict(&self, perms: ShadowPerms) -> Self {
        Self {
            perms: self.perms & perms,
            ..self.clone()
        }
    }

    /// Narrow the bounds to a sub-range.
    pub fn narrow(&self, base: u64, size: u64) -> Result<Self, ShadowError> {
        self.check_range(base, size)?;
        Ok(Self {
            base,
            size,
            ..self.clone()
        })
    }

    /// Check if any unit of `[base, base + len)` is marked.
    pub fn is_marked(&self, base: u64, len: u64) -> Result<bool, ShadowError> {
        self.require(ShadowPerms::LOAD)?;
        self.check_range(base, len)?;
        Ok(self.intersects(self.selector, base, len))
    }

    /// Mark `[base, base + len)` as revoked.
    ///
    /// The generation moves after the bits are visible.
    pub fn paint(&self, base: u64, len: u64) -> Result<(), ShadowError> {
        self.require(ShadowPerms::STORE)?;
        self.check_range(base, len)?;
        if let Some((first, end)) = self.bitmap.bit_range(self.selector, base, len) {
            if len != 0 {
                self.bitmap.update(first, end, true);
                self.bitmap.bump_generation();
            }
        }
        Ok(())
    }

    /// Unmark `[base, base + len)` once its memory may be reused.
    pub fn clear(&self, base: u64, len: u64) -> Result<(), ShadowError> {
        self.require(ShadowPerms::STORE)?;
        self.check_range(base, len)?;
        if let Some((first, end)) = self.bitmap.bit_range(self.selector, base, len) {
            if len != 0 {
                self.bitmap.update(first, end, false);
            }
        }
        Ok(())
    }

    /// Test a range of `region` without bounds or permission checks.
    ///
    /// Used by the capability tester; ranges beyond the region are clamped
    /// and never fail.
    pub(crate) fn intersects(&self, region: ShadowSelector, base: u64, len: u64) -> bool {
        match self.bitmap.bit_range(region, base, len) {
            Some((first, end)) => self.bitmap.any_set(first, end),
            None => false,
        }
    }

    fn require(&self, perms: ShadowPerms) -> Result<(), ShadowError> {
        if self.perms.contains(perms) {
            Ok(())
        } else {
            Err(ShadowError::PermissionDenied)
        }
    }

    fn check_range(&self, base: u64, len: u64) -> Result<(), ShadowError> {
        if self.selector == ShadowSelector::Entire {
            return Err(ShadowError::SelectorMismatch);
        }
        let top = base.checked_add(len).ok_or(ShadowError::OutOfBounds)?;
        if base < self.base || top > self.base + self.size {
            return Err(ShadowError::OutOfBounds);
        }
        if self.selector == ShadowSelector::Memory
            && (base % GRANULE_SIZE != 0 || len % GRANULE_SIZE != 0)
        {
            return Err(ShadowError::Misaligned);
        }
        Ok(())
    }
}

impl core::fmt::Debug for ShadowCap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "ShadowCap({:?} [{:#x}, {:#x}) {:?})",
            self.selector,
            self.base,
            self.base + self.size,
            self.perms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ShadowLayout {
        ShadowLayout {
            memory_span: 1 << 20,
            otype_count: 1024,
            cid_count: 256,
        }
    }

    fn rw(bitmap: &Arc<ShadowBitmap>, selector: ShadowSelector) -> ShadowCap {
        let size = bitmap.layout().extent(selector);
        bitmap
            .cap(selector, 0, size, ShadowPerms::LOAD | ShadowPerms::STORE)
            .unwrap()
    }

    #[test]
    fn test_paint_then_intersect() {
        let bitmap = ShadowBitmap::new(layout());
        let mem = rw(&bitmap, ShadowSelector::Memory);
        mem.paint(0x4000, 0x40).unwrap();

        assert!(mem.is_marked(0x4000, 0x10).unwrap());
        assert!(mem.is_marked(0x3ff0, 0x20).unwrap());
        assert!(!mem.is_marked(0x4040, 0x40).unwrap());
        assert!(mem.intersects(ShadowSelector::Memory, 0x403f, 1));
        assert!(!mem.intersects(ShadowSelector::Memory, 0x4040, 0x1000));
        assert_eq!(bitmap.generation(), 1);

        mem.clear(0x4000, 0x40).unwrap();
        assert!(!mem.is_marked(0x4000, 0x40).unwrap());
    }

    #[test]
    fn test_regions_do_not_alias() {
        let bitmap = ShadowBitmap::new(layout());
        let otype = rw(&bitmap, ShadowSelector::Otype);
        let cid = rw(&bitmap, ShadowSelector::Cid);
        let mem = rw(&bitmap, ShadowSelector::Memory);

        otype.paint(5, 1).unwrap();
        assert!(otype.is_marked(5, 1).unwrap());
        assert!(!cid.is_marked(5, 1).unwrap());
        assert!(!mem.is_marked(5 * GRANULE_SIZE, GRANULE_SIZE).unwrap());
    }

    #[test]
    fn test_paint_across_word_boundaries() {
        let bitmap = ShadowBitmap::new(layout());
        let mem = rw(&bitmap, ShadowSelector::Memory);
        // granules 60..200 span three bitmap words
        mem.paint(60 * GRANULE_SIZE, 140 * GRANULE_SIZE).unwrap();
        assert!(!mem.is_marked(59 * GRANULE_SIZE, GRANULE_SIZE).unwrap());
        assert!(mem.is_marked(64 * GRANULE_SIZE, GRANULE_SIZE).unwrap());
        assert!(mem.is_marked(199 * GRANULE_SIZE, GRANULE_SIZE).unwrap());
        assert!(!mem.is_marked(200 * GRANULE_SIZE, GRANULE_SIZE).unwrap());
    }

    #[test]
    fn test_bounds_and_permissions() {
        let bitmap = ShadowBitmap::new(layout());
        let mem = bitmap
            .cap(ShadowSelector::Memory, 0x1000, 0x1000, ShadowPerms::LOAD | ShadowPerms::STORE)
            .unwrap();

        assert_eq!(mem.paint(0x800, 0x10), Err(ShadowError::OutOfBounds));
        assert_eq!(mem.paint(0x1008, 0x10), Err(ShadowError::Misaligned));
        assert_eq!(
            mem.restrict(ShadowPerms::LOAD).paint(0x1000, 0x10),
            Err(ShadowError::PermissionDenied)
        );
        assert_eq!(
            bitmap
                .cap(ShadowSelector::Memory, 0, (1 << 20) + 16, ShadowPerms::LOAD)
                .unwrap_err(),
            ShadowError::OutOfBounds
        );

        let narrowed = mem.narrow(0x1800, 0x100).unwrap();
        assert_eq!(narrowed.paint(0x1000, 0x10), Err(ShadowError::OutOfBounds));
        narrowed.paint(0x1800, 0x10).unwrap();
    }

    #[test]
    fn test_entire_cap_is_test_only() {
        let bitmap = ShadowBitmap::new(layout());
        let entire = bitmap
            .cap(ShadowSelector::Entire, 0, 0, ShadowPerms::LOAD)
            .unwrap();
        assert_eq!(
            entire.is_marked(0, 16),
            Err(ShadowError::SelectorMismatch)
        );

        rw(&bitmap, ShadowSelector::Cid).paint(7, 1).unwrap();
        assert!(entire.intersects(ShadowSelector::Cid, 0, 8));
        assert!(!entire.intersects(ShadowSelector::Cid, 8, 8));
        // ranges beyond the region clamp instead of failing
        assert!(!entire.intersects(ShadowSelector::Memory, u64::MAX - 4, 16));
    }

    #[test]
    fn test_mask_range() {
        assert_eq!(mask_range(0, 64), u64::MAX);
        assert_eq!(mask_range(4, 8), 0xf0);
        assert_eq!(mask_range(63, 64), 1 << 63);
    }
}
