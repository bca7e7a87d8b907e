// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: imports decoder hardware buffers and presents them to a
//! window surface, one full-screen quad per frame.
#![deny(unsafe_op_in_unsafe_fn)]

mod ahb;
mod device;
mod frame;
mod import;
mod present;
mod scene;
mod surface;
mod unwind;

pub use device::{DeviceContext, REQUIRED_DEVICE_EXTENSIONS};
pub use import::{choose_import_path, ImportPath, TilingSupport};

use anyhow::{anyhow, Result};
use frame::{Cache, FrameChain};
use raw_window_handle::HasDisplayHandle;
use scene::Scene;
use std::sync::Arc;
use surface::{Surface, Swapchain};
use tracing::{debug, error, info};
use vidsurf_core::{ExternalFormatPolicy, RendererConfig};
use vidsurf_render::{
    ensure_target, Acquired, Backend, BufferId, CacheError, FrameError, NativeWindow, Presented,
    RenderError, SampleFeed, SwapTarget, SwapchainStatus,
};

/// A swapchain generation and the frames built on its images.
struct Target {
    swapchain: Swapchain,
    chain: FrameChain,
}

impl Target {
    unsafe fn destroy(self, ctx: &DeviceContext, scene: &Scene, cache: &mut Cache) -> Result<()> {
        let Target { swapchain, chain } = self;
        unsafe {
            chain.destroy(ctx, scene, cache)?;
            swapchain.destroy(ctx);
        }
        info!("swapchain destroyed");
        Ok(())
    }
}

impl SwapTarget for Target {
    fn status(&self) -> SwapchainStatus {
        self.swapchain.status
    }
}

struct Presentation {
    surface: Surface,
    target: Option<Target>,
}

pub struct VkBackend {
    ctx: DeviceContext,
    scene: Scene,
    policy: ExternalFormatPolicy,
    presentation: Option<Presentation>,
    cache: Cache,
    feed: Option<SampleFeed>,
}

impl VkBackend {
    /// Negotiates the device against `display`. No window is needed yet.
    pub fn new(display: &dyn HasDisplayHandle, cfg: RendererConfig) -> Result<Self> {
        let raw = display.display_handle()?.as_raw();
        unsafe {
            let ctx = DeviceContext::new(raw, cfg.validation)?;
            let scene = match Scene::new(&ctx) {
                Ok(scene) => scene,
                Err(err) => {
                    let mut ctx = ctx;
                    ctx.destroy();
                    return Err(err);
                }
            };
            info!(
                validation = cfg.validation,
                external_format = %cfg.external_format,
                "vulkan backend ready"
            );
            Ok(Self {
                ctx,
                scene,
                policy: cfg.external_format,
                presentation: None,
                cache: Cache::new(),
                feed: None,
            })
        }
    }

    /// Drops the current swapchain if it was reported stale or suboptimal,
    /// then builds one if none exists.
    unsafe fn ensure_target(&mut self) -> Result<(), RenderError> {
        let Self {
            ctx,
            scene,
            presentation,
            cache,
            ..
        } = self;
        let (ctx, scene) = (&*ctx, &*scene);
        let Presentation { surface, target } = presentation
            .as_mut()
            .ok_or_else(|| anyhow!("no window bound"))?;

        ensure_target(
            target,
            |old| unsafe { old.destroy(ctx, scene, cache) }.map_err(RenderError::from),
            || {
                let swapchain = unsafe { Swapchain::new(ctx, surface) }?;
                match unsafe { FrameChain::new(ctx, scene, &swapchain) } {
                    Ok(chain) => Ok(Target { swapchain, chain }),
                    Err(err) => {
                        unsafe { swapchain.destroy(ctx) };
                        Err(err.into())
                    }
                }
            },
        )?;
        Ok(())
    }
}

impl Backend for VkBackend {
    fn bind_window(&mut self, window: Arc<dyn NativeWindow>) -> Result<(), RenderError> {
        if self.presentation.is_some() {
            return Err(anyhow!("a window is already bound").into());
        }
        let surface = unsafe { Surface::new(&self.ctx, window) }?;
        self.presentation = Some(Presentation {
            surface,
            target: None,
        });
        Ok(())
    }

    fn unbind_window(&mut self) -> Result<(), RenderError> {
        let Some(mut presentation) = self.presentation.take() else {
            return Ok(());
        };
        unsafe {
            if let Some(target) = presentation.target.take() {
                target.destroy(&self.ctx, &self.scene, &mut self.cache)?;
            }
            presentation.surface.destroy(&self.ctx);
        }
        Ok(())
    }

    fn start(&mut self, feed: SampleFeed) -> Result<(), RenderError> {
        self.feed = Some(feed);
        Ok(())
    }

    fn present(&mut self) -> Result<Presented, RenderError> {
        unsafe { self.ensure_target() }?;

        let Self {
            ctx,
            scene,
            policy,
            presentation,
            cache,
            feed,
        } = self;
        let (ctx, scene, policy) = (&*ctx, &*scene, *policy);
        let feed = feed.as_ref().ok_or_else(|| anyhow!("present before start"))?;
        let Some(Target { swapchain, chain }) =
            presentation.as_mut().and_then(|p| p.target.as_mut())
        else {
            return Err(anyhow!("no swapchain to present to").into());
        };

        unsafe {
            let index = match chain.next_frame(ctx, swapchain, cache, feed, |buffer| {
                import::import_buffer(ctx, scene, policy, buffer)
            })? {
                Acquired::Frame(index) => index,
                Acquired::Stale => return Ok(Presented::Skipped),
                Acquired::Ended => return Ok(Presented::EndOfStream),
            };

            let slot = chain.ring.bound(index).ok_or(FrameError::Unbound(index))?;
            let imported = cache.resources(slot).ok_or(CacheError::Vacant(slot))?;
            present::record(ctx, scene, &chain.frames[index], swapchain.extent, imported)?;
            present::submit_and_present(ctx, chain, swapchain, index)?;
        }
        Ok(Presented::Frame)
    }

    fn collect(&mut self) -> Result<(), RenderError> {
        let Some(target) = self.presentation.as_mut().and_then(|p| p.target.as_mut()) else {
            return Ok(());
        };
        unsafe { target.chain.collect(&self.ctx, &mut self.cache) }?;
        Ok(())
    }

    fn evict_dead(&mut self) {
        let ctx = &self.ctx;
        let evicted = self
            .cache
            .evict_dead(|_, imported| unsafe { imported.destroy(ctx) });
        if evicted > 0 {
            debug!(evicted, live = self.cache.len(), "evicted dead imports");
        }
    }

    fn buffer_reclaimed(&mut self, buffer: BufferId) {
        if !self.cache.mark_reclaimed(buffer) {
            debug!(?buffer, "reclaim for a buffer that was never imported");
        }
    }
}

// STRICT TEARDOWN ORDER:
// - Swapchain generation first (waits its fences, returns held samples)
// - Surface before the instance
// - device_wait_idle() before any imported buffer goes away
// - Imports, then shared scene objects, then the device
impl Drop for VkBackend {
    fn drop(&mut self) {
        unsafe {
            if let Some(mut presentation) = self.presentation.take() {
                if let Some(target) = presentation.target.take() {
                    if let Err(err) = target.destroy(&self.ctx, &self.scene, &mut self.cache) {
                        error!("swapchain teardown: {err:#}");
                    }
                }
                presentation.surface.destroy(&self.ctx);
            }

            self.ctx.device.device_wait_idle().ok();

            let ctx = &self.ctx;
            self.cache.drain(|_, imported, held| {
                drop(held);
                imported.destroy(ctx);
            });
            self.feed = None;

            self.scene.destroy(&self.ctx);
            self.ctx.destroy();
        }
        info!("vulkan backend destroyed");
    }
}
