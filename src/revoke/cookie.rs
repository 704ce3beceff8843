//! Revocation Cookie
//!
//! A cookie binds a scan (or a fault resolution) to one address space. It
//! holds a read-only capability over the whole shadow, a reference to the
//! map and the revocation image resolved from the map's configuration.
//!
//! Cookies are reference counted; the address space counts live cookies so
//! the fault path knows when revocation is in flight.

use alloc::sync::Arc;

use super::shadow::{ShadowCap, ShadowPerms, ShadowSelector};
use super::tester::CapTester;
use super::RevokeError;
use crate::cap::RevokeImage;
use crate::mm::VmSpace;

/// Session handle for revocation on one address space.
pub struct RevokeCookie {
    shadow: ShadowCap,
    map: Arc<VmSpace>,
    image: RevokeImage,
}

impl RevokeCookie {
    /// Bind a cookie to `map`.
    ///
    /// Fails with `NoShadow` if the map has no shadow installed.
    pub fn init(map: &Arc<VmSpace>) -> Result<Arc<Self>, RevokeError> {
        let state = map.revoke_state();
        let bitmap = state.shadow().ok_or(RevokeError::NoShadow)?;
        let shadow = bitmap.cap(ShadowSelector::Entire, 0, 0, ShadowPerms::LOAD)?;

        state.cookie_acquired();
        Ok(Arc::new(Self {
            shadow,
            map: Arc::clone(map),
            image: state.config().image,
        }))
    }

    /// Address space this cookie is bound to.
    pub fn map(&self) -> &Arc<VmSpace> {
        &self.map
    }

    /// Read-only capability over the whole shadow.
    pub fn shadow(&self) -> &ShadowCap {
        &self.shadow
    }

    /// Revocation image for this address space.
    pub fn image(&self) -> RevokeImage {
        self.image
    }

    /// Snapshot the map's current immunity flags into a tester.
    pub fn tester(&self) -> CapTester {
        let state = self.map.revoke_state();
        CapTester::new(
            self.shadow.clone(),
            state.test_flags(),
            state.config().coarse_threshold,
        )
    }
}

impl Drop for RevokeCookie {
    fn drop(&mut self) {
        self.map.revoke_state().cookie_released();
    }
}

impl core::fmt::Debug for RevokeCookie {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RevokeCookie")
            .field("shadow", &self.shadow)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}
