//! Revocation Statistics
//!
//! Named relaxed counters, one set per address space. Only updated when the
//! `stats` feature is enabled; never read by the engine itself.

use core::sync::atomic::{AtomicU64, Ordering};

/// Bump a counter by one.
macro_rules! stat_inc {
    ($stats:expr, $field:ident) => {
        if cfg!(feature = "stats") {
            $stats
                .$field
                .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        }
    };
}

/// Bump a counter by `n`.
macro_rules! stat_add {
    ($stats:expr, $field:ident, $n:expr) => {
        if cfg!(feature = "stats") {
            $stats
                .$field
                .fetch_add($n, core::sync::atomic::Ordering::Relaxed);
        }
    };
}

pub(crate) use {stat_add, stat_inc};

macro_rules! define_stats {
    ($($(#[$doc:meta])* $field:ident),* $(,)?) => {
        /// Live counters.
        #[derive(Default)]
        pub struct RevokeStats {
            $($(#[$doc])* pub(crate) $field: AtomicU64,)*
        }

        /// A copy of the counters.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $field: u64,)*
        }

        impl RevokeStats {
            /// All counters zero.
            pub const fn new() -> Self {
                Self {
                    $($field: AtomicU64::new(0),)*
                }
            }

            /// Read every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

define_stats! {
    /// Pages swept read-write.
    pages_scan_rw,
    /// Pages swept read-only.
    pages_scan_ro,
    /// Pages skipped: no capabilities, or clean in an incremental pass.
    pages_skip,
    /// Pages skipped: already swept against the current shadow.
    pages_skip_fast,
    /// Pages skipped: being unmapped.
    pages_skip_busy,
    /// Read-only pages upgraded for write to revoke in them.
    pages_upgraded,
    /// Tagged words seen.
    caps_found,
    /// Tagged words already in revoked form.
    caps_already_revoked,
    /// Words revoked by the sweeper.
    caps_revoked,
    /// Revocations lost to a concurrent store.
    caps_raced,
    /// Fault resolver invocations.
    fault_visits,
    /// Faults the resolver fixed itself.
    fault_fixes,
    /// Faults converted to capability-store faults.
    fault_capstore,
    /// Passes that advanced the epoch.
    passes_completed,
    /// Passes abandoned between pages.
    passes_aborted,
    /// Hardware capdirty bits folded into DIRTY.
    capdirty_syncs,
}

impl core::fmt::Debug for RevokeStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self.snapshot(), f)
    }
}

#[cfg(all(test, feature = "stats"))]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let stats = RevokeStats::new();
        stat_inc!(stats, caps_found);
        stat_add!(stats, caps_found, 2);
        stat_inc!(stats, passes_completed);

        let snap = stats.snapshot();
        assert_eq!(snap.caps_found, 3);
        assert_eq!(snap.passes_completed, 1);
        assert_eq!(snap.caps_revoked, 0);
    }
}
