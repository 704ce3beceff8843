//! Capability Tester
//!
//! Decides whether a capability must be revoked against a shadow snapshot.
//!
//! A capability must be revoked iff a region it names intersects a set
//! shadow bit, unless an immunity class applies:
//! - `no_coarse_mem`: memory capabilities larger than the coarse threshold
//!   are not tested against the memory region
//! - `no_otypes`: sealing/unsealing authority is not tested against the
//!   otype region
//! - `no_cids`: compartment-id authority is not tested against the cid region
//!
//! The test is side-effect free and lock-free; the scanner and the fault
//! resolver call it concurrently.

use super::shadow::{ShadowCap, ShadowSelector};
use crate::cap::{Capability, Perms};

/// Immunity classes consulted by the tester.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TestFlags {
    /// Capabilities with coarse bounds are immune to memory revocation.
    pub no_coarse_mem: bool,
    /// Sealing authority is immune to otype revocation.
    pub no_otypes: bool,
    /// Compartment-id authority is immune to cid revocation.
    pub no_cids: bool,
}

impl TestFlags {
    /// No immunity.
    pub const NONE: Self = Self {
        no_coarse_mem: false,
        no_otypes: false,
        no_cids: false,
    };

    // Packing for atomic storage only.
    pub(crate) const fn pack(self) -> u8 {
        (self.no_coarse_mem as u8) | (self.no_otypes as u8) << 1 | (self.no_cids as u8) << 2
    }

    pub(crate) const fn unpack(bits: u8) -> Self {
        Self {
            no_coarse_mem: bits & 0x1 != 0,
            no_otypes: bits & 0x2 != 0,
            no_cids: bits & 0x4 != 0,
        }
    }
}

/// Verdict for one capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    /// Leave the capability alone.
    Clear,
    /// The capability names revoked memory, otypes or compartments.
    MustRevoke,
}

/// A tester bound to one shadow and one set of immunity flags.
#[derive(Clone, Debug)]
pub struct CapTester {
    shadow: ShadowCap,
    flags: TestFlags,
    coarse_threshold: u64,
}

impl CapTester {
    /// Create a tester.
    pub fn new(shadow: ShadowCap, flags: TestFlags, coarse_threshold: u64) -> Self {
        Self {
            shadow,
            flags,
            coarse_threshold,
        }
    }

    /// Immunity flags in effect.
    pub fn flags(&self) -> TestFlags {
        self.flags
    }

    /// Test one capability.
    pub fn test(&self, cap: &Capability) -> TestResult {
        if !cap.is_tagged() || cap.is_revoked_image() {
            return TestResult::Clear;
        }

        let perms = cap.perms();
        let (base, len) = (cap.base(), cap.length());

        if perms.intersects(Perms::OTYPE)
            && !self.flags.no_otypes
            && self.shadow.intersects(ShadowSelector::Otype, base, len)
        {
            return TestResult::MustRevoke;
        }

        if perms.contains(Perms::COMPARTMENT_ID)
            && !self.flags.no_cids
            && self.shadow.intersects(ShadowSelector::Cid, base, len)
        {
            return TestResult::MustRevoke;
        }

        if cap.is_type_token() {
            return TestResult::Clear;
        }

        if self.flags.no_coarse_mem && cap.is_coarse(self.coarse_threshold) {
            return TestResult::Clear;
        }

        if self.shadow.intersects(ShadowSelector::Memory, base, len) {
            TestResult::MustRevoke
        } else {
            TestResult::Clear
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::{Otype, RevokeImage};
    use crate::revoke::shadow::{ShadowBitmap, ShadowLayout, ShadowPerms};
    use alloc::sync::Arc;

    const COARSE: u64 = 0x1_0000;

    struct Fixture {
        bitmap: Arc<ShadowBitmap>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                bitmap: ShadowBitmap::new(ShadowLayout {
                    memory_span: 1 << 20,
                    otype_count: 1024,
                    cid_count: 256,
                }),
            }
        }

        fn paint(&self, selector: ShadowSelector, base: u64, len: u64) {
            let extent = match selector {
                ShadowSelector::Memory => 1 << 20,
                ShadowSelector::Otype => 1024,
                _ => 256,
            };
            self.bitmap
                .cap(selector, 0, extent, ShadowPerms::STORE)
                .unwrap()
                .paint(base, len)
                .unwrap();
        }

        fn tester(&self, flags: TestFlags) -> CapTester {
            let entire = self
                .bitmap
                .cap(ShadowSelector::Entire, 0, 0, ShadowPerms::LOAD)
                .unwrap();
            CapTester::new(entire, flags, COARSE)
        }
    }

    #[test]
    fn test_memory_intersection() {
        let fx = Fixture::new();
        fx.paint(ShadowSelector::Memory, 0x8000, 0x100);
        let tester = fx.tester(TestFlags::NONE);

        let inside = Capability::new(0x8080, 0x10, Perms::LOAD);
        let overlapping = Capability::new(0x7f00, 0x200, Perms::LOAD);
        let outside = Capability::new(0x9000, 0x100, Perms::LOAD);

        assert_eq!(tester.test(&inside), TestResult::MustRevoke);
        assert_eq!(tester.test(&overlapping), TestResult::MustRevoke);
        assert_eq!(tester.test(&outside), TestResult::Clear);
        assert_eq!(
            tester.test(&inside.revoked(RevokeImage::ZeroPermissions)),
            TestResult::Clear
        );
        assert_eq!(
            tester.test(&inside.revoked(RevokeImage::ClearTag)),
            TestResult::Clear
        );
    }

    #[test]
    fn test_sealed_memory_cap_is_tested() {
        let fx = Fixture::new();
        fx.paint(ShadowSelector::Memory, 0x8000, 0x100);
        let sealed = Capability::new(0x8000, 0x20, Perms::LOAD)
            .seal(Otype::new(9).unwrap())
            .unwrap();
        assert_eq!(fx.tester(TestFlags::NONE).test(&sealed), TestResult::MustRevoke);
    }

    #[test]
    fn test_coarse_immunity_flips_result() {
        let fx = Fixture::new();
        fx.paint(ShadowSelector::Memory, 0x8000, 0x100);
        let coarse = Capability::new(0, COARSE * 2, Perms::DATA_RW);

        let immune = TestFlags {
            no_coarse_mem: true,
            ..TestFlags::NONE
        };
        assert_eq!(fx.tester(immune).test(&coarse), TestResult::Clear);
        assert_eq!(fx.tester(TestFlags::NONE).test(&coarse), TestResult::MustRevoke);

        // fine-grained capabilities stay subject to revocation
        let fine = Capability::new(0x8000, 0x10, Perms::LOAD);
        assert_eq!(fx.tester(immune).test(&fine), TestResult::MustRevoke);
    }

    #[test]
    fn test_otype_and_cid_regions() {
        let fx = Fixture::new();
        fx.paint(ShadowSelector::Otype, 40, 1);
        fx.paint(ShadowSelector::Cid, 3, 1);

        let sealer = Capability::new(32, 16, Perms::SEAL);
        let cid = Capability::new(0, 8, Perms::COMPARTMENT_ID);
        let unrelated = Capability::new(48, 16, Perms::UNSEAL);

        let all = fx.tester(TestFlags::NONE);
        assert_eq!(all.test(&sealer), TestResult::MustRevoke);
        assert_eq!(all.test(&cid), TestResult::MustRevoke);
        assert_eq!(all.test(&unrelated), TestResult::Clear);

        let immune = fx.tester(TestFlags {
            no_otypes: true,
            no_cids: true,
            ..TestFlags::NONE
        });
        assert_eq!(immune.test(&sealer), TestResult::Clear);
        assert_eq!(immune.test(&cid), TestResult::Clear);
    }

    #[test]
    fn test_type_token_ignores_memory_region() {
        let fx = Fixture::new();
        // memory granule 2 covers addresses 32..48, the same numbers the
        // sealer below names as otypes
        fx.paint(ShadowSelector::Memory, 32, 16);
        let sealer = Capability::new(32, 16, Perms::SEAL);
        assert_eq!(fx.tester(TestFlags::NONE).test(&sealer), TestResult::Clear);
    }

    #[test]
    fn test_flag_packing() {
        let flags = TestFlags {
            no_coarse_mem: true,
            no_otypes: false,
            no_cids: true,
        };
        assert_eq!(TestFlags::unpack(flags.pack()), flags);
        assert_eq!(TestFlags::NONE.pack(), 0);
    }
}
