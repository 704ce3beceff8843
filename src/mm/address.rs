//! Virtual Address Type
//!
//! Type-safe wrapper for user virtual addresses with the page and
//! capability-word arithmetic the revocation engine needs.
//!
//! # Security Properties
//! - Capability words are only addressed at capability alignment
//! - Page numbers and word indices are derived, never passed around raw

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: u64 = 4096;
/// Page size mask
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: u32 = 12;

/// Size and alignment of one capability word in memory.
pub const CAP_SIZE: u64 = 16;

/// Number of capability words per page.
pub const WORDS_PER_PAGE: usize = (PAGE_SIZE / CAP_SIZE) as usize;

/// A user virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create a new virtual address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Address of word `index` of page `vpn`.
    #[inline]
    pub const fn from_word(vpn: u64, index: usize) -> Self {
        Self((vpn << PAGE_SHIFT) + index as u64 * CAP_SIZE)
    }

    /// Get the raw address as u64.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Check if the address is capability-aligned.
    #[inline]
    pub const fn is_cap_aligned(self) -> bool {
        self.0 & (CAP_SIZE - 1) == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Get the virtual page number.
    #[inline]
    pub const fn page_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    /// Index of the capability word containing this address.
    #[inline]
    pub const fn word_index(self) -> usize {
        (self.page_offset() / CAP_SIZE) as usize
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_arithmetic() {
        let addr = VirtAddr::new(0x4008_1230);
        assert_eq!(addr.page_number(), 0x40081);
        assert_eq!(addr.page_offset(), 0x230);
        assert_eq!(addr.word_index(), 0x23);
        assert!(addr.is_cap_aligned());
        assert!(!VirtAddr::new(0x4008_1238).is_cap_aligned());
        assert_eq!(VirtAddr::from_word(0x40081, 0x23), addr);
    }

    #[test]
    fn test_page_alignment() {
        let addr = VirtAddr::new(0x4008_1234);
        assert!(!addr.is_aligned());
        assert_eq!(addr.align_down().as_u64(), 0x4008_1000);
        assert_eq!(WORDS_PER_PAGE, 256);
    }
}
