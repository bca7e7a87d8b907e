// SPDX-License-Identifier: CEPL-1.0
//! Swap-chain generations: when the one we have must be thrown away.
use tracing::info;

/// Health of a swap chain as last reported by acquire or present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SwapchainStatus {
    #[default]
    Ok,
    /// Out of date; it can no longer be presented to.
    Stale,
    /// Still presentable, but no longer matches the surface.
    Suboptimal,
}

/// A swap chain together with the frame chain built on its images.
pub trait SwapTarget {
    fn status(&self) -> SwapchainStatus;
}

/// Makes sure `slot` holds a presentable target.
///
/// A target whose status is not [`SwapchainStatus::Ok`] is handed to
/// `destroy` before `build` is asked for its replacement, so the old chain's
/// frames are drained and their samples released first.
pub fn ensure_target<'a, T: SwapTarget, E>(
    slot: &'a mut Option<T>,
    destroy: impl FnOnce(T) -> Result<(), E>,
    build: impl FnOnce() -> Result<T, E>,
) -> Result<&'a mut T, E> {
    let target = match slot.take() {
        Some(current) if current.status() == SwapchainStatus::Ok => current,
        Some(old) => {
            info!(status = ?old.status(), "rebuilding swapchain");
            destroy(old)?;
            build()?
        }
        None => build()?,
    };
    Ok(slot.insert(target))
}
