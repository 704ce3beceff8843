//! Per-Address-Space Revocation State
//!
//! Everything the engine keeps for one address space: configuration, the
//! installed shadow, immunity flags, the epoch ledger and its info page,
//! statistics and the orchestrator's lock.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use spin::{Mutex, Once};

use super::epoch::{EpochLedger, InfoPage, InfoSnapshot};
use super::pass::PassPhase;
use super::shadow::{ShadowBitmap, ShadowLayout};
use super::stats::RevokeStats;
use super::tester::TestFlags;
use super::RevokeError;
use crate::cap::RevokeImage;

/// Default coarse-bounds threshold (1 MiB).
pub const DEFAULT_COARSE_THRESHOLD: u64 = 1 << 20;

/// Revocation configuration, resolved once per address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RevokeConfig {
    /// How revoked words are rewritten.
    pub image: RevokeImage,
    /// Bounds length above which a capability counts as coarse.
    pub coarse_threshold: u64,
    /// Shadow bitmap layout.
    pub layout: ShadowLayout,
}

impl RevokeConfig {
    /// Zero-permission images, 1 MiB coarse threshold, default layout.
    pub const fn new() -> Self {
        Self {
            image: RevokeImage::ZeroPermissions,
            coarse_threshold: DEFAULT_COARSE_THRESHOLD,
            layout: ShadowLayout::new(),
        }
    }

    /// Use a different revocation image.
    pub const fn with_image(mut self, image: RevokeImage) -> Self {
        self.image = image;
        self
    }

    /// Use a different coarse threshold.
    pub const fn with_coarse_threshold(mut self, threshold: u64) -> Self {
        self.coarse_threshold = threshold;
        self
    }

    /// Use a different shadow layout.
    pub const fn with_layout(mut self, layout: ShadowLayout) -> Self {
        self.layout = layout;
        self
    }
}

impl Default for RevokeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// State guarded by the orchestrator lock.
pub(crate) struct EngineState {
    pub(crate) ledger: EpochLedger,
    /// Shadow generation at the open of the last completed pass.
    pub(crate) last_open_gen: Option<u64>,
}

/// Revocation state of one address space.
pub struct RevokeState {
    config: RevokeConfig,
    shadow: Once<Arc<ShadowBitmap>>,
    test_flags: AtomicU8,
    info: Arc<InfoPage>,
    stats: RevokeStats,
    cookies: AtomicUsize,
    phase: AtomicU8,
    pass_open: AtomicBool,
    pub(crate) engine: Mutex<EngineState>,
}

impl RevokeState {
    pub(crate) fn new(config: RevokeConfig) -> Self {
        Self {
            config,
            shadow: Once::new(),
            test_flags: AtomicU8::new(0),
            info: Arc::new(InfoPage::new()),
            stats: RevokeStats::new(),
            cookies: AtomicUsize::new(0),
            phase: AtomicU8::new(PassPhase::Idle as u8),
            pass_open: AtomicBool::new(false),
            engine: Mutex::new(EngineState {
                ledger: EpochLedger::new(),
                last_open_gen: None,
            }),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &RevokeConfig {
        &self.config
    }

    /// Installed shadow, if any.
    pub fn shadow(&self) -> Option<&Arc<ShadowBitmap>> {
        self.shadow.get()
    }

    /// Check for an installed shadow.
    pub fn has_shadow(&self) -> bool {
        self.shadow.is_completed()
    }

    /// Allocate the shadow. Fails if one is already installed.
    pub(crate) fn install_shadow(&self) -> Result<Arc<ShadowBitmap>, RevokeError> {
        let mut created = false;
        let shadow = self.shadow.call_once(|| {
            created = true;
            ShadowBitmap::new(self.config.layout)
        });
        if created {
            Ok(Arc::clone(shadow))
        } else {
            Err(RevokeError::ShadowAlreadyInstalled)
        }
    }

    /// Immunity flags for passes that have not opened yet.
    pub fn test_flags(&self) -> TestFlags {
        TestFlags::unpack(self.test_flags.load(Ordering::Acquire))
    }

    /// Change the immunity flags for subsequent passes.
    ///
    /// Invalidates every clean-sweep record: a page swept clean under the
    /// old flags may hold capabilities the new ones revoke.
    pub(crate) fn set_test_flags(&self, flags: TestFlags) {
        self.test_flags.store(flags.pack(), Ordering::Release);
        if let Some(shadow) = self.shadow() {
            shadow.bump_generation();
        }
    }

    /// Info page shared with user space.
    pub fn info(&self) -> &Arc<InfoPage> {
        &self.info
    }

    /// Published epochs.
    pub fn epochs(&self) -> InfoSnapshot {
        self.info.snapshot()
    }

    /// Statistics.
    pub fn stats(&self) -> &RevokeStats {
        &self.stats
    }

    /// Phase of the orchestrator.
    pub fn phase(&self) -> PassPhase {
        PassPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: PassPhase) {
        self.phase.store(phase as u8, Ordering::Release);
        self.pass_open
            .store(phase != PassPhase::Idle, Ordering::Release);
    }

    /// Check if a pass is open or a cookie is live.
    ///
    /// The fault path consults the resolver only while this holds.
    pub fn is_active(&self) -> bool {
        self.pass_open.load(Ordering::Acquire) || self.cookies.load(Ordering::Acquire) > 0
    }

    /// Number of live cookies.
    pub fn cookie_count(&self) -> usize {
        self.cookies.load(Ordering::Acquire)
    }

    pub(crate) fn cookie_acquired(&self) {
        self.cookies.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn cookie_released(&self) {
        let prior = self.cookies.fetch_sub(1, Ordering::AcqRel);
        assert!(prior > 0, "revocation cookie released twice");
    }
}

impl core::fmt::Debug for RevokeState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RevokeState")
            .field("config", &self.config)
            .field("shadow", &self.has_shadow())
            .field("phase", &self.phase())
            .field("epochs", &self.epochs())
            .finish_non_exhaustive()
    }
}
