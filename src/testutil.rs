//! Test fixtures: a small address space with a shadow installed and helpers
//! to map pages and plant capabilities without going through the traps.

use alloc::sync::Arc;

use crate::cap::{Capability, RevokeImage};
use crate::mm::{Page, PageFlags, VirtAddr, VmSpace, PAGE_SIZE};
use crate::revoke::{
    install_shadow, shadow_cap, RevokeConfig, RevokeCookie, ShadowLayout, ShadowPerms,
    ShadowSelector,
};

/// First user page mapped by [`Harness::map`].
pub const PAGE_BASE: u64 = 0x4000_0000;

/// Memory span covered by the harness shadow.
pub const MEMORY_SPAN: u64 = 1 << 20;

pub struct Harness {
    pub vm: Arc<VmSpace>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_image(RevokeImage::ZeroPermissions)
    }

    pub fn with_image(image: RevokeImage) -> Self {
        let harness = Self::build(image);
        install_shadow(&harness.vm).unwrap();
        harness
    }

    pub fn without_shadow() -> Self {
        Self::build(RevokeImage::ZeroPermissions)
    }

    fn build(image: RevokeImage) -> Self {
        let config = RevokeConfig::new()
            .with_image(image)
            .with_coarse_threshold(0x1_0000)
            .with_layout(ShadowLayout {
                memory_span: MEMORY_SPAN,
                otype_count: 1024,
                cid_count: 256,
            });
        Self {
            vm: VmSpace::new(config),
        }
    }

    /// Mark `[base, base + len)` of memory for revocation.
    pub fn paint(&self, base: u64, len: u64) {
        shadow_cap(
            &self.vm,
            ShadowSelector::Memory,
            0,
            MEMORY_SPAN,
            ShadowPerms::STORE,
        )
        .unwrap()
        .paint(base, len)
        .unwrap();
    }

    pub fn vpn(&self, index: u64) -> u64 {
        VirtAddr::new(PAGE_BASE + index * PAGE_SIZE).page_number()
    }

    pub fn addr(&self, index: u64, word: usize) -> VirtAddr {
        VirtAddr::from_word(self.vpn(index), word)
    }

    pub fn map(&self, index: u64, writable: bool) -> Arc<Page> {
        self.vm
            .map_page(VirtAddr::new(PAGE_BASE + index * PAGE_SIZE), writable)
            .unwrap()
    }

    /// Plant `cap` in word `word` as if a capability store had already
    /// been taken and swept: HASCAPS set, capdirty left clear.
    pub fn place(&self, page: &Arc<Page>, word: usize, cap: Capability) -> Capability {
        page.word(word).unwrap().store(cap);
        page.set_flags(PageFlags::HASCAPS);
        page.enable_capstore();
        cap
    }

    pub fn cookie(&self) -> Arc<RevokeCookie> {
        RevokeCookie::init(&self.vm).unwrap()
    }
}
