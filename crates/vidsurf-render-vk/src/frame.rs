// SPDX-License-Identifier: CEPL-1.0
use crate::device::DeviceContext;
use crate::import::ImportedBuffer;
use crate::scene::Scene;
use crate::surface::{Swapchain, PRESENT_FORMAT};
use anyhow::{anyhow, Context, Result};
use ash::vk;
use tracing::debug;
use vidsurf_render::{
    AcquireGpu, Acquired, ExternalBuffer, FrameRing, ImportCache, RenderError, Sample, SampleFeed,
    SwapchainStatus,
};

pub type Cache = ImportCache<ImportedBuffer, Box<dyn Sample>>;

/// Per-swapchain-image GPU objects.
pub struct Frame {
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
    pub cmd: vk::CommandBuffer,
    /// Created signaled; reset right before each submit.
    pub fence: vk::Fence,
    /// Signaled by the draw, waited on by present.
    pub release: vk::Semaphore,
}

/// One frame per swapchain image plus the bookkeeping that ties each frame to
/// the decoder sample it is drawing.
pub struct FrameChain {
    pub frames: Vec<Frame>,
    pub ring: FrameRing,
    acquire_fence: vk::Fence,
}

impl FrameChain {
    pub unsafe fn new(ctx: &DeviceContext, scene: &Scene, swapchain: &Swapchain) -> Result<Self> {
        let d = &ctx.device;
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: scene.cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: swapchain.images.len() as u32,
            ..Default::default()
        };
        let cmds = unsafe { d.allocate_command_buffers(&alloc_info) }
            .context("allocate_command_buffers")?;

        let mut frames = Vec::with_capacity(swapchain.images.len());
        for (&image, &cmd) in swapchain.images.iter().zip(&cmds) {
            let view_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: PRESENT_FORMAT.format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = unsafe { d.create_image_view(&view_info, None) }
                .context("create_image_view (swapchain)")?;

            let fb_info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: scene.render_pass,
                attachment_count: 1,
                p_attachments: &view,
                width: swapchain.extent.width,
                height: swapchain.extent.height,
                layers: 1,
                ..Default::default()
            };
            let framebuffer =
                unsafe { d.create_framebuffer(&fb_info, None) }.context("create_framebuffer")?;

            let fence_info = vk::FenceCreateInfo {
                s_type: vk::StructureType::FENCE_CREATE_INFO,
                flags: vk::FenceCreateFlags::SIGNALED,
                ..Default::default()
            };
            let fence = unsafe { d.create_fence(&fence_info, None) }.context("create_fence")?;
            let sem_info = vk::SemaphoreCreateInfo {
                s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
                ..Default::default()
            };
            let release =
                unsafe { d.create_semaphore(&sem_info, None) }.context("create_semaphore")?;

            frames.push(Frame {
                view,
                framebuffer,
                cmd,
                fence,
                release,
            });
        }

        let acquire_info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            ..Default::default()
        };
        let acquire_fence =
            unsafe { d.create_fence(&acquire_info, None) }.context("create_fence (acquire)")?;

        debug!(frames = frames.len(), "frame chain created");
        Ok(Self {
            ring: FrameRing::new(frames.len()),
            frames,
            acquire_fence,
        })
    }

    /// Acquires the next image, recycles its frame and binds the newest
    /// decoded sample to it. Blocks on the acquire fence and then on the
    /// decoder.
    pub unsafe fn next_frame(
        &mut self,
        ctx: &DeviceContext,
        swapchain: &mut Swapchain,
        cache: &mut Cache,
        feed: &SampleFeed,
        import: impl FnOnce(ExternalBuffer) -> Result<ImportedBuffer>,
    ) -> Result<Acquired, RenderError> {
        let mut gpu = ChainGpu {
            ctx,
            swapchain,
            frames: &self.frames,
            acquire_fence: self.acquire_fence,
        };
        self.ring.acquire_next(&mut gpu, cache, feed, import)
    }

    /// Resets every in-flight frame whose fence has signaled, oldest first.
    pub unsafe fn collect(&mut self, ctx: &DeviceContext, cache: &mut Cache) -> Result<usize, RenderError> {
        let device = &ctx.device;
        let frames = &self.frames;
        self.ring.collect(cache, |index| {
            unsafe { device.get_fence_status(frames[index].fence) }
                .map_err(|err| anyhow!("get_fence_status: {err:?}"))
        })
    }

    /// STRICT TEARDOWN ORDER:
    /// - wait every frame fence, then the device
    /// - hand all samples back to the decoder
    /// - framebuffers before views, command buffers back to the pool
    pub unsafe fn destroy(
        self,
        ctx: &DeviceContext,
        scene: &Scene,
        cache: &mut Cache,
    ) -> Result<()> {
        let Self {
            frames,
            mut ring,
            acquire_fence,
        } = self;
        let d = &ctx.device;

        // Idle frames keep their fence signaled, so this never waits on
        // something that was not submitted.
        let fences: Vec<_> = frames.iter().map(|f| f.fence).collect();
        if !fences.is_empty() {
            unsafe { d.wait_for_fences(&fences, true, u64::MAX) }
                .context("wait_for_fences (teardown)")?;
        }
        unsafe { d.device_wait_idle() }.context("device_wait_idle")?;

        ring.reset_all(cache);

        let cmds: Vec<_> = frames.iter().map(|f| f.cmd).collect();
        unsafe {
            for f in &frames {
                d.destroy_framebuffer(f.framebuffer, None);
                d.destroy_image_view(f.view, None);
                d.destroy_fence(f.fence, None);
                d.destroy_semaphore(f.release, None);
            }
            if !cmds.is_empty() {
                d.free_command_buffers(scene.cmd_pool, &cmds);
            }
            d.destroy_fence(acquire_fence, None);
        }
        debug!(frames = frames.len(), "frame chain destroyed");
        Ok(())
    }
}

/// Fences and the swapchain as [`FrameRing::acquire_next`] sees them.
struct ChainGpu<'a> {
    ctx: &'a DeviceContext,
    swapchain: &'a mut Swapchain,
    frames: &'a [Frame],
    acquire_fence: vk::Fence,
}

impl AcquireGpu for ChainGpu<'_> {
    fn acquire_image(&mut self) -> Result<Option<usize>> {
        let ctx = self.ctx;
        unsafe { ctx.device.reset_fences(&[self.acquire_fence]) }
            .context("reset_fences (acquire)")?;
        let acquired = unsafe {
            ctx.swapchain_loader.acquire_next_image(
                self.swapchain.raw,
                u64::MAX,
                vk::Semaphore::null(),
                self.acquire_fence,
            )
        };
        match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    self.swapchain.status = SwapchainStatus::Suboptimal;
                }
                Ok(Some(index as usize))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("acquire: swapchain out of date");
                self.swapchain.status = SwapchainStatus::Stale;
                Ok(None)
            }
            Err(err) => Err(anyhow!("acquire_next_image: {err:?}")),
        }
    }

    fn wait_frame(&mut self, index: usize) -> Result<()> {
        let frame = self
            .frames
            .get(index)
            .ok_or_else(|| anyhow!("acquired image {index} has no frame"))?;
        unsafe { self.ctx.device.wait_for_fences(&[frame.fence], true, u64::MAX) }
            .context("wait_for_fences (frame)")
    }

    fn wait_acquired(&mut self) -> Result<()> {
        unsafe {
            self.ctx
                .device
                .wait_for_fences(&[self.acquire_fence], true, u64::MAX)
        }
        .context("wait_for_fences (acquire)")
    }
}
