// SPDX-License-Identifier: CEPL-1.0
use crate::device::DeviceContext;
use crate::frame::{Frame, FrameChain};
use crate::import::ImportedBuffer;
use crate::scene::Scene;
use crate::surface::{present_status, Swapchain};
use anyhow::{anyhow, Context, Result};
use ash::vk;
use tracing::debug;
use vidsurf_render::{RenderError, SwapchainStatus};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Ownership transfer of an imported image between the decoder (foreign
/// queue family) and ours.
fn ownership_barrier(
    image: vk::Image,
    src_family: u32,
    dst_family: u32,
    old_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: src_access,
        dst_access_mask: dst_access,
        old_layout,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        src_queue_family_index: src_family,
        dst_queue_family_index: dst_family,
        image,
        subresource_range: COLOR_RANGE,
        ..Default::default()
    }
}

/// Records the full draw of `imported` into `frame`'s command buffer:
/// acquire the image from the decoder, draw the quad, release it back.
pub unsafe fn record(
    ctx: &DeviceContext,
    scene: &Scene,
    frame: &Frame,
    extent: vk::Extent2D,
    imported: &ImportedBuffer,
) -> Result<()> {
    let d = &ctx.device;
    let cmd = frame.cmd;

    let begin = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    unsafe { d.begin_command_buffer(cmd, &begin) }.context("begin_command_buffer")?;

    let acquire = ownership_barrier(
        imported.objects.image,
        vk::QUEUE_FAMILY_FOREIGN_EXT,
        ctx.queue_family,
        vk::ImageLayout::PREINITIALIZED,
        vk::AccessFlags::empty(),
        vk::AccessFlags::SHADER_READ,
    );
    let release = ownership_barrier(
        imported.objects.image,
        ctx.queue_family,
        vk::QUEUE_FAMILY_FOREIGN_EXT,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::AccessFlags::SHADER_READ,
        vk::AccessFlags::empty(),
    );

    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    let rp_begin = vk::RenderPassBeginInfo {
        s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
        render_pass: scene.render_pass,
        framebuffer: frame.framebuffer,
        render_area,
        ..Default::default()
    };
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let image_info = [vk::DescriptorImageInfo {
        sampler: imported.objects.sampler,
        image_view: imported.objects.view,
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }];
    let write = vk::WriteDescriptorSet::default()
        .dst_binding(0)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(&image_info);

    unsafe {
        d.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[acquire],
        );
        d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
        d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, imported.objects.pipeline);
        ctx.push_loader.cmd_push_descriptor_set(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            imported.objects.pipeline_layout,
            0,
            std::slice::from_ref(&write),
        );
        d.cmd_set_viewport(cmd, 0, &[viewport]);
        d.cmd_set_scissor(cmd, 0, &[render_area]);
        d.cmd_draw(cmd, 4, 1, 0, 0);
        d.cmd_end_render_pass(cmd);
        d.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[release],
        );
    }
    unsafe { d.end_command_buffer(cmd) }.context("end_command_buffer")?;
    Ok(())
}

/// Marks frame `index` in flight, submits it and queues its image for
/// presentation. A stale or suboptimal present is recorded on the swapchain
/// for the next acquire to act on.
pub unsafe fn submit_and_present(
    ctx: &DeviceContext,
    chain: &mut FrameChain,
    swapchain: &mut Swapchain,
    index: usize,
) -> Result<(), RenderError> {
    chain.ring.mark_submitted(index)?;
    let frame = &chain.frames[index];
    let d = &ctx.device;

    unsafe { d.reset_fences(&[frame.fence]) }.context("reset_fences")?;
    let submit = vk::SubmitInfo {
        s_type: vk::StructureType::SUBMIT_INFO,
        command_buffer_count: 1,
        p_command_buffers: &frame.cmd,
        signal_semaphore_count: 1,
        p_signal_semaphores: &frame.release,
        ..Default::default()
    };
    unsafe { d.queue_submit(ctx.queue, std::slice::from_ref(&submit), frame.fence) }
        .context("queue_submit")?;

    let image_index = index as u32;
    let mut result = vk::Result::SUCCESS;
    let present = vk::PresentInfoKHR {
        s_type: vk::StructureType::PRESENT_INFO_KHR,
        wait_semaphore_count: 1,
        p_wait_semaphores: &frame.release,
        swapchain_count: 1,
        p_swapchains: &swapchain.raw,
        p_image_indices: &image_index,
        p_results: &mut result,
        ..Default::default()
    };
    match unsafe { ctx.swapchain_loader.queue_present(ctx.queue, &present) } {
        Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {}
        Err(err) => return Err(anyhow!("queue_present: {err:?}").into()),
    }

    let status = present_status(result)?;
    if status != SwapchainStatus::Ok {
        debug!(?status, "present");
        swapchain.status = status;
    }
    Ok(())
}
