// SPDX-License-Identifier: CEPL-1.0
//! Objects shared by every imported buffer and every swapchain generation:
//! the render pass, the quad shaders and the command pool.

use crate::device::DeviceContext;
use crate::surface::PRESENT_FORMAT;
use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use std::io::Cursor;

pub struct Scene {
    pub render_pass: vk::RenderPass,
    pub cmd_pool: vk::CommandPool,
    vert: vk::ShaderModule,
    frag: vk::ShaderModule,
}

unsafe fn create_shader(device: &ash::Device, bytes: &[u8]) -> Result<vk::ShaderModule> {
    let code = read_spv(&mut Cursor::new(bytes))?;
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    Ok(unsafe { device.create_shader_module(&ci, None) }?)
}

unsafe fn create_render_pass(device: &ash::Device) -> Result<vk::RenderPass> {
    // The quad covers every pixel, so the old contents are never loaded.
    let color = vk::AttachmentDescription {
        format: PRESENT_FORMAT.format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::DONT_CARE,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        ..Default::default()
    };
    let ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color,
        subpass_count: 1,
        p_subpasses: &subpass,
        ..Default::default()
    };
    Ok(unsafe { device.create_render_pass(&ci, None) }.context("create_render_pass")?)
}

impl Scene {
    pub unsafe fn new(ctx: &DeviceContext) -> Result<Self> {
        let d = &ctx.device;
        let render_pass = unsafe { create_render_pass(d) }?;

        let vs_bytes = include_bytes!(concat!(env!("OUT_DIR"), "/quad.vert.spv"));
        let fs_bytes = include_bytes!(concat!(env!("OUT_DIR"), "/quad.frag.spv"));
        let vert = unsafe { create_shader(d, &vs_bytes[..]) }.context("quad.vert")?;
        let frag = unsafe { create_shader(d, &fs_bytes[..]) }.context("quad.frag")?;

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: ctx.queue_family,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let cmd_pool =
            unsafe { d.create_command_pool(&pool_info, None) }.context("create_command_pool")?;

        Ok(Self {
            render_pass,
            cmd_pool,
            vert,
            frag,
        })
    }

    /// A pipeline bound to one imported buffer's descriptor layout, whose
    /// immutable sampler carries that buffer's Y'CbCr conversion.
    pub unsafe fn create_pipeline(
        &self,
        ctx: &DeviceContext,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<(vk::PipelineLayout, vk::Pipeline)> {
        let device = &ctx.device;
        let entry = c"main";

        let stages = [
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::VERTEX,
                module: self.vert,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: self.frag,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
        ];

        // Positions come from gl_VertexIndex.
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology: vk::PrimitiveTopology::TRIANGLE_STRIP,
            ..Default::default()
        };
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
            dynamic_state_count: dyn_states.len() as u32,
            p_dynamic_states: dyn_states.as_ptr(),
            ..Default::default()
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };
        let raster = vk::PipelineRasterizationStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        let color_blend_att = vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
            blend_enable: vk::FALSE,
            ..Default::default()
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            attachment_count: 1,
            p_attachments: &color_blend_att,
            ..Default::default()
        };

        let layout_info = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &set_layout,
            ..Default::default()
        };
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .context("create_pipeline_layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo {
            s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &raster,
            p_multisample_state: &multisample,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout,
            render_pass: self.render_pass,
            subpass: 0,
            ..Default::default()
        };

        let pipelines = match unsafe {
            device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_info),
                None,
            )
        } {
            Ok(p) => p,
            Err((_, err)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(anyhow!("create_graphics_pipelines failed: {:?}", err));
            }
        };

        Ok((layout, pipelines[0]))
    }

    pub unsafe fn destroy(&self, ctx: &DeviceContext) {
        let d = &ctx.device;
        unsafe {
            d.destroy_command_pool(self.cmd_pool, None);
            d.destroy_shader_module(self.vert, None);
            d.destroy_shader_module(self.frag, None);
            d.destroy_render_pass(self.render_pass, None);
        }
    }
}
