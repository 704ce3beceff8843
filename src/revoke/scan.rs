//! Page Scanner
//!
//! Sweeps the capability words of one page against a shadow snapshot.
//!
//! # Read-write sweep
//! 1. Clear capdirty and DIRTY (atomically; a store racing the sweep sets
//!    them again after writing its word), then start the page's sweep
//!    sequence
//! 2. For every tagged word that tests as revocable, compare-and-replace it
//!    with its revoked image
//! 3. Set HASCAPS if any tagged word was seen; never clear it
//! 4. Record the sweep against the shadow generation unless a revocation
//!    lost its race, in which case the page is left DIRTY
//!
//! # Read-only sweep
//! Writes no word and never makes the page writable. A page that needs a
//! revocation is reported DIRTY with its dirtiness restored, and the caller
//! upgrades it and sweeps it read-write.

use log::trace;

use super::cookie::RevokeCookie;
use super::stats::{stat_inc, RevokeStats};
use super::tester::{CapTester, TestResult};
use crate::cap::{CapCell, RevokeImage};
use crate::mm::{Page, PageFlags};

/// Attempts at replacing a word that keeps changing under the sweeper.
pub(crate) const MAX_REVOKE_RETRIES: usize = 4;

/// What a sweep of one page found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageScan {
    /// HASCAPS and DIRTY as observed after the sweep.
    pub flags: PageFlags,
    /// Tagged words seen.
    pub found: u64,
    /// Words revoked by this sweep.
    pub revoked: u64,
}

impl PageScan {
    /// For a read-only sweep: the page must be swept read-write.
    pub fn needs_write(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }
}

/// Outcome of revoking one word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WordOutcome {
    /// Replaced by its revoked image.
    Revoked,
    /// Every attempt lost to a concurrent store.
    Raced,
}

/// A sweeper bound to one shadow snapshot.
pub struct Scanner<'a> {
    tester: CapTester,
    image: RevokeImage,
    shadow_gen: u64,
    stats: &'a RevokeStats,
}

impl<'a> Scanner<'a> {
    /// Bind a scanner to `cookie`, sweeping against shadow generation `shadow_gen`.
    ///
    /// `shadow_gen` must have been read before the tester's flags are used,
    /// so a clean sweep never claims a newer generation than it saw.
    pub fn new(cookie: &'a RevokeCookie, shadow_gen: u64) -> Self {
        Self {
            tester: cookie.tester(),
            image: cookie.image(),
            shadow_gen,
            stats: cookie.map().revoke_state().stats(),
        }
    }

    /// Tester in use.
    pub fn tester(&self) -> &CapTester {
        &self.tester
    }

    /// Shadow generation this scanner sweeps against.
    pub fn shadow_gen(&self) -> u64 {
        self.shadow_gen
    }

    /// Sweep a writable page, revoking in place.
    pub fn page_rw(&self, page: &Page) -> PageScan {
        stat_inc!(self.stats, pages_scan_rw);
        page.take_capdirty();
        page.take_dirty();
        let seq = page.begin_sweep();

        let mut scan = PageScan::default();
        let mut raced = false;
        for word in page.words() {
            let cap = word.load();
            if !cap.is_tagged() {
                continue;
            }
            scan.found += 1;
            stat_inc!(self.stats, caps_found);

            if cap.is_revoked_image() {
                stat_inc!(self.stats, caps_already_revoked);
                continue;
            }
            if self.tester.test(&cap) == TestResult::Clear {
                continue;
            }

            match self.revoke_word(word) {
                Some(WordOutcome::Revoked) => scan.revoked += 1,
                Some(WordOutcome::Raced) => raced = true,
                None => {}
            }
        }

        if scan.found > 0 {
            page.set_flags(PageFlags::HASCAPS);
        }
        if raced {
            page.mark_dirty();
        } else {
            page.record_swept(seq, self.shadow_gen);
        }

        scan.flags = observed_flags(page);
        trace!(
            "[REVOKE] swept rw: found={} revoked={} flags={:?}",
            scan.found,
            scan.revoked,
            scan.flags
        );
        scan
    }

    /// Sweep a page without writing to it.
    pub fn page_ro(&self, page: &Page) -> PageScan {
        stat_inc!(self.stats, pages_scan_ro);
        let had_capdirty = page.take_capdirty();
        let had_dirty = page.take_dirty();
        let seq = page.begin_sweep();

        let mut scan = PageScan::default();
        let mut needs_write = false;
        for word in page.words() {
            let cap = word.load();
            if !cap.is_tagged() {
                continue;
            }
            scan.found += 1;
            stat_inc!(self.stats, caps_found);

            if cap.is_revoked_image() {
                stat_inc!(self.stats, caps_already_revoked);
                continue;
            }
            if self.tester.test(&cap) == TestResult::MustRevoke {
                needs_write = true;
                break;
            }
        }

        if scan.found > 0 {
            page.set_flags(PageFlags::HASCAPS);
        }
        if needs_write {
            if had_capdirty {
                page.set_capdirty();
            }
            if had_dirty {
                page.mark_dirty();
            }
            scan.flags = observed_flags(page) | PageFlags::DIRTY;
        } else {
            page.record_swept(seq, self.shadow_gen);
            scan.flags = observed_flags(page);
        }

        trace!(
            "[REVOKE] swept ro: found={} needs_write={}",
            scan.found,
            needs_write
        );
        scan
    }

    /// Check the page again without touching it. Returns the index of the
    /// first revocable word.
    pub(crate) fn find_revocable(&self, page: &Page) -> Option<usize> {
        page.words()
            .position(|word| self.tester.test(&word.load()) == TestResult::MustRevoke)
    }

    /// Replace one revocable word with its revoked image.
    ///
    /// Returns None if the word stopped being revocable under us.
    pub(crate) fn revoke_word(&self, word: &CapCell) -> Option<WordOutcome> {
        let mut cap = word.load();
        for _ in 0..MAX_REVOKE_RETRIES {
            if self.tester.test(&cap) == TestResult::Clear {
                return None;
            }
            match word.compare_and_replace(&cap, &cap.revoked(self.image)) {
                Ok(()) => {
                    stat_inc!(self.stats, caps_revoked);
                    return Some(WordOutcome::Revoked);
                }
                Err(current) => cap = current,
            }
        }
        stat_inc!(self.stats, caps_raced);
        Some(WordOutcome::Raced)
    }
}

/// HASCAPS and DIRTY as the page stands, with capdirty reported as DIRTY.
fn observed_flags(page: &Page) -> PageFlags {
    let mut flags = page.flags();
    if page.capdirty() {
        flags |= PageFlags::DIRTY;
    }
    flags
}

/// Sweep a writable page against the cookie's current shadow.
pub fn scan_page_rw(cookie: &RevokeCookie, page: &Page) -> PageFlags {
    let shadow_gen = cookie.shadow().bitmap().generation();
    Scanner::new(cookie, shadow_gen).page_rw(page).flags
}

/// Sweep a page read-only against the cookie's current shadow.
///
/// DIRTY in the result means the page holds a revocable capability and must
/// be swept read-write.
pub fn scan_page_ro(cookie: &RevokeCookie, page: &Page) -> PageFlags {
    let shadow_gen = cookie.shadow().bitmap().generation();
    Scanner::new(cookie, shadow_gen).page_ro(page).flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::{Capability, Perms};
    use crate::testutil::Harness;

    #[test]
    fn test_rw_revokes_only_matches() {
        let h = Harness::new();
        h.paint(0x8000, 0x100);
        let page = h.map(0, true);
        let victim = h.place(&page, 0, Capability::new(0x8000, 0x40, Perms::DATA_RW));
        let survivor = h.place(&page, 1, Capability::new(0x9000, 0x40, Perms::DATA_RW));
        page.set_flags(PageFlags::DIRTY);

        let cookie = h.cookie();
        let flags = scan_page_rw(&cookie, &page);

        assert_eq!(flags, PageFlags::HASCAPS);
        let revoked = page.word(0).unwrap().load();
        assert!(revoked.is_revoked_image());
        assert_eq!(revoked.base(), victim.base());
        assert_eq!(page.word(1).unwrap().load(), survivor);
        assert!(page.swept_gen().is_some());
    }

    #[test]
    fn test_rw_second_sweep_finds_nothing_new() {
        let h = Harness::new();
        h.paint(0x8000, 0x100);
        let page = h.map(0, true);
        h.place(&page, 4, Capability::new(0x8010, 0x10, Perms::LOAD));

        let cookie = h.cookie();
        let scanner = Scanner::new(&cookie, cookie.shadow().bitmap().generation());
        assert_eq!(scanner.page_rw(&page).revoked, 1);

        let again = scanner.page_rw(&page);
        assert_eq!(again.revoked, 0);
        assert_eq!(again.found, 1);
    }

    #[test]
    fn test_hascaps_survives_empty_sweep() {
        let h = Harness::new();
        let page = h.map(0, true);
        page.set_flags(PageFlags::HASCAPS | PageFlags::DIRTY);

        let flags = scan_page_rw(&h.cookie(), &page);
        assert_eq!(flags, PageFlags::HASCAPS);
    }

    #[test]
    fn test_ro_reports_needed_write_without_writing() {
        let h = Harness::new();
        h.paint(0x8000, 0x100);
        let page = h.map(0, false);
        let victim = h.place(&page, 9, Capability::new(0x8000, 0x40, Perms::LOAD));
        page.set_capdirty();

        let flags = scan_page_ro(&h.cookie(), &page);
        assert!(flags.contains(PageFlags::DIRTY));
        assert_eq!(page.word(9).unwrap().load(), victim);
        assert!(!page.is_writable());
        assert!(page.capdirty());
        assert_eq!(page.swept_gen(), None);
    }

    #[test]
    fn test_ro_clean_page_is_recorded() {
        let h = Harness::new();
        h.paint(0x8000, 0x100);
        let page = h.map(0, false);
        h.place(&page, 9, Capability::new(0xa000, 0x40, Perms::LOAD));
        page.set_flags(PageFlags::DIRTY);

        let flags = scan_page_ro(&h.cookie(), &page);
        assert_eq!(flags, PageFlags::HASCAPS);
        assert!(page.swept_gen().is_some());
    }

    #[test]
    fn test_clear_tag_image() {
        let h = Harness::with_image(RevokeImage::ClearTag);
        h.paint(0x8000, 0x100);
        let page = h.map(0, true);
        let victim = h.place(&page, 0, Capability::new(0x8000, 0x40, Perms::LOAD));

        scan_page_rw(&h.cookie(), &page);
        let revoked = page.word(0).unwrap().load();
        assert!(!revoked.is_tagged());
        assert_eq!(revoked.perms(), victim.perms());
    }
}
