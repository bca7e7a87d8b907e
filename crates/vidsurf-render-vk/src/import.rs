// SPDX-License-Identifier: CEPL-1.0
//! Turning one decoder hardware buffer into everything needed to sample it.
//!
//! A buffer is either imported with its native format (when the driver can
//! import it with some tiling) or through the driver's opaque external
//! format. Either way it gets its own Y'CbCr conversion, so it also gets its
//! own immutable sampler, descriptor set layout and pipeline.

use crate::ahb::{HardwareBufferRef, USAGE_GPU_SAMPLED_IMAGE};
use crate::device::DeviceContext;
use crate::scene::Scene;
use crate::unwind::on_error;
use anyhow::{bail, Context, Result};
use ash::vk;
use tracing::{debug, info};
use vidsurf_core::ExternalFormatPolicy;
use vidsurf_render::ExternalBuffer;

const AHB_HANDLE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::ANDROID_HARDWARE_BUFFER_ANDROID;

/// Native tilings to try, in order of preference.
pub const TILING_CHOICES: [vk::ImageTiling; 2] = [vk::ImageTiling::LINEAR, vk::ImageTiling::OPTIMAL];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportPath {
    Native { tiling: vk::ImageTiling },
    External,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TilingSupport {
    Importable,
    Unsupported,
}

/// Picks how a buffer is imported.
///
/// `query` is asked about each tiling in [`TILING_CHOICES`] unless the buffer
/// has no Vulkan format or the policy forces the external path. Falling
/// through to the external path under [`ExternalFormatPolicy::Never`] is an
/// error.
pub fn choose_import_path(
    format_undefined: bool,
    policy: ExternalFormatPolicy,
    mut query: impl FnMut(vk::ImageTiling) -> Result<TilingSupport>,
) -> Result<ImportPath> {
    let forced = format_undefined || policy == ExternalFormatPolicy::Always;
    if !forced {
        for tiling in TILING_CHOICES {
            match query(tiling)? {
                TilingSupport::Importable => return Ok(ImportPath::Native { tiling }),
                TilingSupport::Unsupported => debug!(?tiling, "native import unsupported"),
            }
        }
    }
    if policy == ExternalFormatPolicy::Never {
        if format_undefined {
            bail!("buffer has no Vulkan format and external formats are disabled");
        }
        bail!("no tiling can import the buffer and external formats are disabled");
    }
    Ok(ImportPath::External)
}

/// Asks the driver whether `format` can be imported from a hardware buffer
/// with `tiling`. An unsupported format, or a supported one that is not
/// importable, both count as [`TilingSupport::Unsupported`].
unsafe fn query_tiling(
    ctx: &DeviceContext,
    format: vk::Format,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
) -> Result<TilingSupport> {
    let mut external_info =
        vk::PhysicalDeviceExternalImageFormatInfo::default().handle_type(AHB_HANDLE);
    let info = vk::PhysicalDeviceImageFormatInfo2::default()
        .format(format)
        .ty(vk::ImageType::TYPE_2D)
        .tiling(tiling)
        .usage(usage)
        .push_next(&mut external_info);

    let mut external_props = vk::ExternalImageFormatProperties::default();
    let mut ahb_usage = vk::AndroidHardwareBufferUsageANDROID::default();
    let mut ycbcr_props = vk::SamplerYcbcrConversionImageFormatProperties::default();
    let mut props = vk::ImageFormatProperties2::default()
        .push_next(&mut external_props)
        .push_next(&mut ahb_usage)
        .push_next(&mut ycbcr_props);

    let res = unsafe {
        ctx.props2_loader
            .get_physical_device_image_format_properties2(ctx.phys, &info, &mut props)
    };
    match res {
        Ok(()) => {}
        Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => return Ok(TilingSupport::Unsupported),
        Err(err) => bail!("get_physical_device_image_format_properties2: {err:?}"),
    }

    let importable = external_props
        .external_memory_properties
        .external_memory_features
        .contains(vk::ExternalMemoryFeatureFlags::IMPORTABLE);
    Ok(if importable {
        TilingSupport::Importable
    } else {
        TilingSupport::Unsupported
    })
}

/// Everything created for one import. Starts out all null so that a
/// half-built set can be destroyed the same way as a complete one.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImportObjects {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    memory: vk::DeviceMemory,
    conversion: vk::SamplerYcbcrConversion,
    set_layout: vk::DescriptorSetLayout,
}

impl ImportObjects {
    /// Reverse creation order. Null handles are skipped by the driver.
    unsafe fn destroy(self, ctx: &DeviceContext) {
        let d = &ctx.device;
        unsafe {
            d.destroy_pipeline(self.pipeline, None);
            d.destroy_pipeline_layout(self.pipeline_layout, None);
            d.destroy_descriptor_set_layout(self.set_layout, None);
            d.destroy_sampler(self.sampler, None);
            ctx.ycbcr_loader
                .destroy_sampler_ycbcr_conversion(self.conversion, None);
            d.destroy_image_view(self.view, None);
            d.destroy_image(self.image, None);
            d.free_memory(self.memory, None);
        }
    }
}

/// GPU objects for one imported buffer. The buffer reference is released
/// after everything created from it.
pub struct ImportedBuffer {
    pub objects: ImportObjects,
    buffer: HardwareBufferRef,
}

impl ImportedBuffer {
    /// Caller guarantees no submitted work still samples this buffer.
    pub unsafe fn destroy(self, ctx: &DeviceContext) {
        unsafe { self.objects.destroy(ctx) };
        debug!(buffer = ?self.buffer.id(), "import destroyed");
        drop(self.buffer);
    }
}

/// Imports `buffer` as a sampled image with its own conversion and pipeline.
/// On failure whatever was already created is destroyed again.
pub unsafe fn import_buffer(
    ctx: &DeviceContext,
    scene: &Scene,
    policy: ExternalFormatPolicy,
    buffer: ExternalBuffer,
) -> Result<ImportedBuffer> {
    let buffer = HardwareBufferRef::acquire(buffer)?;
    let mut objects = ImportObjects::default();
    let created = unsafe { create_objects(ctx, scene, policy, &buffer, &mut objects) };
    on_error(created, || unsafe { objects.destroy(ctx) })?;
    Ok(ImportedBuffer { objects, buffer })
}

/// Fills `made` step by step, so a failure leaves only created handles set.
unsafe fn create_objects(
    ctx: &DeviceContext,
    scene: &Scene,
    policy: ExternalFormatPolicy,
    buffer: &HardwareBufferRef,
    made: &mut ImportObjects,
) -> Result<()> {
    let d = &ctx.device;
    let desc = buffer.describe();
    if desc.usage & USAGE_GPU_SAMPLED_IMAGE == 0 {
        bail!(
            "{:?} was not allocated for GPU sampling (usage {:#x})",
            buffer.id(),
            desc.usage
        );
    }

    // --- Driver's view of the buffer ---
    let mut format_props = vk::AndroidHardwareBufferFormatPropertiesANDROID::default();
    let (allocation_size, memory_type_bits) = {
        let mut ahb_props =
            vk::AndroidHardwareBufferPropertiesANDROID::default().push_next(&mut format_props);
        unsafe {
            ctx.ahb_loader
                .get_android_hardware_buffer_properties(buffer.as_ptr(), &mut ahb_props)
        }
        .context("get_android_hardware_buffer_properties")?;
        (ahb_props.allocation_size, ahb_props.memory_type_bits)
    };
    if memory_type_bits == 0 {
        bail!("no memory type can import {:?}", buffer.id());
    }

    // --- Import path ---
    let usage = vk::ImageUsageFlags::SAMPLED;
    let path = choose_import_path(
        format_props.format == vk::Format::UNDEFINED,
        policy,
        |tiling| unsafe { query_tiling(ctx, format_props.format, tiling, usage) },
    )?;
    let (format, tiling, external_format) = match path {
        ImportPath::Native { tiling } => (format_props.format, tiling, 0),
        ImportPath::External => (
            vk::Format::UNDEFINED,
            vk::ImageTiling::OPTIMAL,
            format_props.external_format,
        ),
    };

    // --- Image ---
    let mut external_memory = vk::ExternalMemoryImageCreateInfo::default().handle_types(AHB_HANDLE);
    let mut image_ext_format = vk::ExternalFormatANDROID::default().external_format(external_format);
    let queue_families = [ctx.queue_family];
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(tiling)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .queue_family_indices(&queue_families)
        .initial_layout(vk::ImageLayout::PREINITIALIZED)
        .push_next(&mut external_memory)
        .push_next(&mut image_ext_format);
    let image = unsafe { d.create_image(&image_info, None) }.context("create_image")?;
    made.image = image;

    // --- Memory: dedicated import of the buffer itself ---
    let mut import_info = vk::ImportAndroidHardwareBufferInfoANDROID::default().buffer(buffer.as_ptr());
    let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(allocation_size)
        .memory_type_index(memory_type_bits.trailing_zeros())
        .push_next(&mut import_info)
        .push_next(&mut dedicated);
    made.memory =
        unsafe { d.allocate_memory(&alloc_info, None) }.context("allocate_memory (import)")?;
    unsafe { d.bind_image_memory(image, made.memory, 0) }.context("bind_image_memory")?;

    // --- Y'CbCr conversion, as the driver suggests ---
    let mut conversion_ext_format =
        vk::ExternalFormatANDROID::default().external_format(external_format);
    let conversion_info = vk::SamplerYcbcrConversionCreateInfo::default()
        .format(format)
        .ycbcr_model(format_props.suggested_ycbcr_model)
        .ycbcr_range(format_props.suggested_ycbcr_range)
        .components(format_props.sampler_ycbcr_conversion_components)
        .x_chroma_offset(format_props.suggested_x_chroma_offset)
        .y_chroma_offset(format_props.suggested_y_chroma_offset)
        .chroma_filter(vk::Filter::NEAREST)
        .force_explicit_reconstruction(false)
        .push_next(&mut conversion_ext_format);
    let conversion = unsafe {
        ctx.ycbcr_loader
            .create_sampler_ycbcr_conversion(&conversion_info, None)
    }
    .context("create_sampler_ycbcr_conversion")?;
    made.conversion = conversion;

    // --- Sampler and view share the conversion ---
    let mut sampler_conversion = vk::SamplerYcbcrConversionInfo::default().conversion(conversion);
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::NEAREST)
        .min_filter(vk::Filter::NEAREST)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .max_anisotropy(1.0)
        .push_next(&mut sampler_conversion);
    let sampler = unsafe { d.create_sampler(&sampler_info, None) }.context("create_sampler")?;
    made.sampler = sampler;

    let mut view_conversion = vk::SamplerYcbcrConversionInfo::default().conversion(conversion);
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .push_next(&mut view_conversion);
    made.view = unsafe { d.create_image_view(&view_info, None) }.context("create_image_view")?;

    // --- Push-descriptor layout with the sampler baked in ---
    let immutable = [sampler];
    let bindings = [vk::DescriptorSetLayoutBinding::default()
        .binding(0)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .stage_flags(vk::ShaderStageFlags::FRAGMENT)
        .immutable_samplers(&immutable)];
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
        .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
        .bindings(&bindings);
    let set_layout = unsafe { d.create_descriptor_set_layout(&layout_info, None) }
        .context("create_descriptor_set_layout")?;
    made.set_layout = set_layout;

    (made.pipeline_layout, made.pipeline) = unsafe { scene.create_pipeline(ctx, set_layout) }?;

    info!(
        buffer = ?buffer.id(),
        width = desc.width,
        height = desc.height,
        ahb_format = desc.format,
        ?path,
        "imported buffer"
    );

    Ok(())
}
