// SPDX-License-Identifier: CEPL-1.0
use crate::device::DeviceContext;
use anyhow::{anyhow, bail, Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use tracing::{debug, info};
use vidsurf_render::{NativeWindow, RenderSize, SwapchainStatus};

/// The only presentable format the chain is built with.
pub const PRESENT_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::R8G8B8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Maps the per-swapchain present result. Anything outside the three known
/// outcomes is a device-level failure.
pub fn present_status(result: vk::Result) -> Result<SwapchainStatus> {
    match result {
        vk::Result::SUCCESS => Ok(SwapchainStatus::Ok),
        vk::Result::ERROR_OUT_OF_DATE_KHR => Ok(SwapchainStatus::Stale),
        vk::Result::SUBOPTIMAL_KHR => Ok(SwapchainStatus::Suboptimal),
        other => bail!("present failed: {other:?}"),
    }
}

/// A presentable window and which queue families can present to it.
pub struct Surface {
    pub raw: vk::SurfaceKHR,
    pub window: Arc<dyn NativeWindow>,
    queue_support: Vec<bool>,
}

impl Surface {
    pub unsafe fn new(ctx: &DeviceContext, window: Arc<dyn NativeWindow>) -> Result<Self> {
        let dh = window.display_handle()?.as_raw();
        let wh = window.window_handle()?.as_raw();
        let raw = unsafe { ash_window::create_surface(&ctx.entry, &ctx.instance, dh, wh, None) }
            .context("ash_window::create_surface")?;

        match unsafe { Self::query(ctx, raw) } {
            Ok(queue_support) => {
                let size = window.size();
                info!(width = size.width, height = size.height, "surface bound");
                Ok(Self {
                    raw,
                    window,
                    queue_support,
                })
            }
            Err(err) => {
                unsafe { ctx.surface_loader.destroy_surface(raw, None) };
                Err(err)
            }
        }
    }

    /// Checks the present format and returns per-queue-family present support.
    unsafe fn query(ctx: &DeviceContext, raw: vk::SurfaceKHR) -> Result<Vec<bool>> {
        let sl = &ctx.surface_loader;
        let formats = unsafe { sl.get_physical_device_surface_formats(ctx.phys, raw) }
            .context("get_physical_device_surface_formats")?;
        if !formats.iter().any(|f| {
            f.format == PRESENT_FORMAT.format && f.color_space == PRESENT_FORMAT.color_space
        }) {
            bail!("surface does not offer R8G8B8A8_UNORM / SRGB_NONLINEAR");
        }
        let families =
            unsafe { ctx.instance.get_physical_device_queue_family_properties(ctx.phys) }.len();
        let queue_support = (0..families as u32)
            .map(|i| unsafe { sl.get_physical_device_surface_support(ctx.phys, i, raw) })
            .collect::<Result<Vec<_>, _>>()
            .context("get_physical_device_surface_support")?;
        Ok(queue_support)
    }

    pub fn can_present(&self, family: u32) -> bool {
        self.queue_support
            .get(family as usize)
            .copied()
            .unwrap_or(false)
    }

    pub unsafe fn destroy(&self, ctx: &DeviceContext) {
        unsafe { ctx.surface_loader.destroy_surface(self.raw, None) };
        debug!("surface destroyed");
    }
}

pub struct Swapchain {
    pub raw: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub status: SwapchainStatus,
}

impl Swapchain {
    /// Builds a FIFO chain at the window's current size, from capabilities
    /// queried now rather than at bind time.
    pub unsafe fn new(ctx: &DeviceContext, surface: &Surface) -> Result<Self> {
        if !surface.can_present(ctx.queue_family) {
            bail!(
                "queue family {} cannot present to this surface",
                ctx.queue_family
            );
        }

        let caps = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(ctx.phys, surface.raw)
        }
        .context("get_physical_device_surface_capabilities")?;

        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        if !caps.supported_usage_flags.contains(usage) {
            bail!("surface images cannot be color attachments");
        }

        let extent = extent_from_caps(&caps, surface.window.size());
        let ci = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: surface.raw,
            min_image_count: caps.min_image_count,
            image_format: PRESENT_FORMAT.format,
            image_color_space: PRESENT_FORMAT.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: usage,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: pick_transform(&caps),
            composite_alpha: pick_composite_alpha(caps.supported_composite_alpha)?,
            present_mode: vk::PresentModeKHR::FIFO,
            clipped: vk::FALSE,
            ..Default::default()
        };
        let raw = unsafe { ctx.swapchain_loader.create_swapchain(&ci, None) }
            .context("create_swapchain")?;
        let images = match unsafe { ctx.swapchain_loader.get_swapchain_images(raw) } {
            Ok(images) => images,
            Err(err) => {
                unsafe { ctx.swapchain_loader.destroy_swapchain(raw, None) };
                return Err(anyhow!("get_swapchain_images: {err:?}"));
            }
        };

        info!(
            width = extent.width,
            height = extent.height,
            images = images.len(),
            "swapchain created"
        );
        Ok(Self {
            raw,
            extent,
            images,
            status: SwapchainStatus::Ok,
        })
    }

    pub unsafe fn destroy(&self, ctx: &DeviceContext) {
        unsafe { ctx.swapchain_loader.destroy_swapchain(self.raw, None) };
    }
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Lowest supported composite-alpha bit.
pub fn pick_composite_alpha(
    supported: vk::CompositeAlphaFlagsKHR,
) -> Result<vk::CompositeAlphaFlagsKHR> {
    let bits = supported.as_raw();
    if bits == 0 {
        bail!("surface reports no composite alpha mode");
    }
    Ok(vk::CompositeAlphaFlagsKHR::from_raw(bits & bits.wrapping_neg()))
}

pub fn pick_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[test]
    fn present_results_map_to_status() {
        use SwapchainStatus::*;
        assert_eq!(present_status(vk::Result::SUCCESS).unwrap(), Ok);
        assert_eq!(
            present_status(vk::Result::ERROR_OUT_OF_DATE_KHR).unwrap(),
            Stale
        );
        assert_eq!(
            present_status(vk::Result::SUBOPTIMAL_KHR).unwrap(),
            Suboptimal
        );
        assert!(present_status(vk::Result::ERROR_DEVICE_LOST).is_err());
        assert!(present_status(vk::Result::ERROR_SURFACE_LOST_KHR).is_err());
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let want = RenderSize {
            width: 100,
            height: 100,
        };
        let e = extent_from_caps(&caps((1080, 2340)), want);
        assert_eq!((e.width, e.height), (1080, 2340));
    }

    #[test]
    fn window_size_is_clamped_when_surface_defers() {
        let want = RenderSize {
            width: 8000,
            height: 10,
        };
        let e = extent_from_caps(&caps((u32::MAX, u32::MAX)), want);
        assert_eq!((e.width, e.height), (4096, 64));
    }

    #[test]
    fn lowest_composite_alpha_bit_is_chosen() {
        let supported =
            vk::CompositeAlphaFlagsKHR::INHERIT | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED;
        assert_eq!(
            pick_composite_alpha(supported).unwrap(),
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
        );
        assert_eq!(
            pick_composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE | supported).unwrap(),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
        assert!(pick_composite_alpha(vk::CompositeAlphaFlagsKHR::empty()).is_err());
    }

    #[test]
    fn identity_transform_preferred() {
        let mut c = caps((1, 1));
        c.supported_transforms =
            vk::SurfaceTransformFlagsKHR::IDENTITY | vk::SurfaceTransformFlagsKHR::ROTATE_90;
        c.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(pick_transform(&c), vk::SurfaceTransformFlagsKHR::IDENTITY);

        c.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(pick_transform(&c), vk::SurfaceTransformFlagsKHR::ROTATE_90);
    }
}
