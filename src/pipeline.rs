// Graphics pipelines
//
// Vertex bindings via vertex_layout/instance_layout, SRC_ALPHA
// blending, dynamic viewport+scissor, built from a caller-supplied
// shader reflection, vertex layout and descriptor attachment shape
// rather than one hardcoded vertex format.

use ash::vk;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::atlas::Atlas;
use crate::display::Display;
use crate::error::{HutError, Result};
use crate::log;
use crate::sampler::Sampler;
use crate::target::RenderTarget;

/// An index buffer element type a `Pipeline` can be parameterized over.
pub trait IndexType: Copy {
    const VK_INDEX_TYPE: vk::IndexType;
}
impl IndexType for u16 {
    const VK_INDEX_TYPE: vk::IndexType = vk::IndexType::UINT16;
}
impl IndexType for u32 {
    const VK_INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;
}

#[derive(Debug, Clone)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage: vk::ShaderStageFlags,
}

#[derive(Debug, Clone)]
pub struct ShaderReflection {
    pub bytecode: &'static [u32],
    pub bindings: Vec<DescriptorBinding>,
}

#[derive(Debug, Clone, Default)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<(u32, vk::Format, u32)>, // (location, format, offset)
}

#[derive(Debug, Clone)]
pub struct VertexReflection {
    pub shader: ShaderReflection,
    pub vertex_layout: VertexLayout,
    pub instance_layout: Option<VertexLayout>,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineParams {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_compare: vk::CompareOp,
    pub blending: bool,
    pub max_sets: u32,
    pub initial_sets: u32,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            blending: true,
            max_sets: 16,
            initial_sets: 1,
        }
    }
}

/// One descriptor attachment slot, supplied at `write()` time.
pub enum Attachment<'a> {
    Ubo { buffer: vk::Buffer, size: u64 },
    Image { view: vk::ImageView, sampler: &'a Sampler },
    Images { views: &'a [vk::ImageView], sampler: &'a Sampler },
    Atlas { atlas: &'a Arc<Atlas>, sampler: &'a Sampler },
}

struct AtlasBinding {
    binding: u32,
    last_bound: usize,
}

/// A compiled graphics pipeline: descriptor layout/pool/sets, pipeline
/// layout, and the `VkPipeline` itself.
pub struct Pipeline<I: IndexType> {
    display: Arc<Display>,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) handle: vk::Pipeline,
    descriptor_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    atlas_bindings: Vec<Vec<AtlasBinding>>,
    _marker: PhantomData<I>,
}

impl<I: IndexType> Pipeline<I> {
    pub fn new(
        display: Arc<Display>,
        target: &dyn RenderTarget,
        vertex: &VertexReflection,
        fragment: &ShaderReflection,
        params: PipelineParams,
    ) -> Result<Self> {
        let bindings = Self::union_bindings(&vertex.shader.bindings, &fragment.bindings);

        let (descriptor_layout, pool_sizes) = Self::build_descriptor_layout(&display, &bindings)?;
        let descriptor_pool = Self::build_descriptor_pool(&display, &pool_sizes, params.max_sets)?;
        let descriptor_sets = Self::allocate_sets(&display, descriptor_pool, descriptor_layout, params.initial_sets)?;

        let atlas_bindings = descriptor_sets
            .iter()
            .map(|_| Vec::new())
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(std::slice::from_ref(&descriptor_layout))
            .build();
        let layout = unsafe { display.device().create_pipeline_layout(&layout_info, None) }
            .map_err(HutError::from)?;

        let handle = Self::build_graphics_pipeline(&display, target, vertex, fragment, layout, &params)?;

        log::debug!("pipeline: compiled with {} descriptor bindings", bindings.len());

        Ok(Self {
            display,
            layout,
            handle,
            descriptor_layout,
            descriptor_pool,
            descriptor_sets,
            atlas_bindings,
            _marker: PhantomData,
        })
    }

    fn union_bindings(vertex: &[DescriptorBinding], fragment: &[DescriptorBinding]) -> Vec<DescriptorBinding> {
        let mut merged: Vec<DescriptorBinding> = Vec::new();
        for b in vertex.iter().chain(fragment.iter()) {
            if let Some(existing) = merged.iter_mut().find(|m| m.binding == b.binding) {
                existing.stage |= b.stage;
            } else {
                merged.push(b.clone());
            }
        }
        merged
    }

    fn build_descriptor_layout(
        display: &Display,
        bindings: &[DescriptorBinding],
    ) -> Result<(vk::DescriptorSetLayout, Vec<vk::DescriptorPoolSize>)> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.descriptor_count)
                    .stage_flags(b.stage)
                    .build()
            })
            .collect();

        // Any attachment with more than one descriptor (an atlas's
        // pages) needs PARTIALLY_BOUND + UPDATE_AFTER_BIND so the
        // array can grow without rebuilding the descriptor set.
        let flags: Vec<vk::DescriptorBindingFlags> = bindings
            .iter()
            .map(|b| {
                if b.descriptor_count > 1 {
                    vk::DescriptorBindingFlags::PARTIALLY_BOUND
                        | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                } else {
                    vk::DescriptorBindingFlags::empty()
                }
            })
            .collect();
        let mut binding_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&flags)
            .build();

        let needs_update_after_bind = flags.iter().any(|f| !f.is_empty());
        let layout_flags = if needs_update_after_bind {
            vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL
        } else {
            vk::DescriptorSetLayoutCreateFlags::empty()
        };

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&vk_bindings)
            .flags(layout_flags)
            .push_next(&mut binding_flags_info)
            .build();
        let descriptor_layout = unsafe { display.device().create_descriptor_set_layout(&layout_info, None) }
            .map_err(HutError::from)?;

        let pool_sizes = bindings
            .iter()
            .map(|b| vk::DescriptorPoolSize {
                ty: b.descriptor_type,
                descriptor_count: b.descriptor_count,
            })
            .collect();

        Ok((descriptor_layout, pool_sizes))
    }

    fn build_descriptor_pool(
        display: &Display,
        sizes_per_set: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        let sizes: Vec<vk::DescriptorPoolSize> = sizes_per_set
            .iter()
            .map(|s| vk::DescriptorPoolSize {
                ty: s.ty,
                descriptor_count: s.descriptor_count * max_sets,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(max_sets)
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .build();
        unsafe { display.device().create_descriptor_pool(&pool_info, None) }.map_err(HutError::from).map_err(Into::into)
    }

    fn allocate_sets(
        display: &Display,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout; count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .build();
        unsafe { display.device().allocate_descriptor_sets(&alloc_info) }.map_err(HutError::from)
    }

    fn build_graphics_pipeline(
        display: &Display,
        target: &dyn RenderTarget,
        vertex: &VertexReflection,
        fragment: &ShaderReflection,
        layout: vk::PipelineLayout,
        params: &PipelineParams,
    ) -> Result<vk::Pipeline> {
        let vs_info = vk::ShaderModuleCreateInfo::builder().code(vertex.shader.bytecode).build();
        let vs = unsafe { display.device().create_shader_module(&vs_info, None) }.map_err(HutError::from)?;
        let fs_info = vk::ShaderModuleCreateInfo::builder().code(fragment.bytecode).build();
        let fs = unsafe { display.device().create_shader_module(&fs_info, None) }.map_err(HutError::from)?;

        let entry = std::ffi::CString::new("main").unwrap();
        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vs)
                .name(&entry)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fs)
                .name(&entry)
                .build(),
        ];

        let mut bindings = Vec::new();
        let mut attributes = Vec::new();
        // Binding 0: per-vertex. Binding 1: per-instance, omitted when
        // the struct is too small to carry real attributes.
        if vertex.vertex_layout.stride >= 4 {
            bindings.push(vk::VertexInputBindingDescription {
                binding: 0,
                stride: vertex.vertex_layout.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            });
            for &(loc, fmt, off) in &vertex.vertex_layout.attributes {
                attributes.push(vk::VertexInputAttributeDescription {
                    location: loc,
                    binding: 0,
                    format: fmt,
                    offset: off,
                });
            }
        }
        if let Some(instance_layout) = &vertex.instance_layout {
            if instance_layout.stride >= 4 {
                bindings.push(vk::VertexInputBindingDescription {
                    binding: 1,
                    stride: instance_layout.stride,
                    input_rate: vk::VertexInputRate::INSTANCE,
                });
                for &(loc, fmt, off) in &instance_layout.attributes {
                    attributes.push(vk::VertexInputAttributeDescription {
                        location: loc,
                        binding: 1,
                        format: fmt,
                        offset: off,
                    });
                }
            }
        }

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes)
            .build();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(params.topology)
            .build();

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1)
            .build();

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(params.polygon_mode)
            .cull_mode(params.cull_mode)
            .front_face(params.front_face)
            .line_width(1.0)
            .build();

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(target.sample_count())
            .build();

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(target.params().flags.contains(crate::target::TargetFlags::DEPTH))
            .depth_write_enable(target.params().flags.contains(crate::target::TargetFlags::DEPTH))
            .depth_compare_op(params.depth_compare)
            .build();

        let blend_attachment = if params.blending {
            vk::PipelineColorBlendAttachmentState::builder()
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .build()
        } else {
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .build()
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(std::slice::from_ref(&blend_attachment))
            .build();

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states)
            .build();

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(target.renderpass())
            .subpass(0)
            .build();

        let pipelines = unsafe {
            display
                .device()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, e)| HutError::from(e))?
        };

        unsafe {
            display.device().destroy_shader_module(vs, None);
            display.device().destroy_shader_module(fs, None);
        }

        Ok(pipelines[0])
    }

    /// Write the attachment tuple into descriptor set `desc_index`.
    pub fn write(&mut self, desc_index: usize, attachments: &[Attachment<'_>]) -> Result<()> {
        let set = self.descriptor_sets[desc_index];
        let mut image_infos_storage: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();
        let mut buffer_infos_storage: Vec<vk::DescriptorBufferInfo> = Vec::new();
        let mut writes = Vec::new();

        for (binding, attachment) in attachments.iter().enumerate() {
            match attachment {
                Attachment::Ubo { buffer, size } => {
                    buffer_infos_storage.push(vk::DescriptorBufferInfo {
                        buffer: *buffer,
                        offset: 0,
                        range: *size,
                    });
                    let idx = buffer_infos_storage.len() - 1;
                    writes.push((binding as u32, vk::DescriptorType::UNIFORM_BUFFER, None, Some(idx)));
                }
                Attachment::Image { view, sampler } => {
                    image_infos_storage.push(vec![vk::DescriptorImageInfo {
                        sampler: sampler.handle(),
                        image_view: *view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }]);
                    let idx = image_infos_storage.len() - 1;
                    writes.push((binding as u32, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, Some(idx), None));
                }
                Attachment::Images { views, sampler } => {
                    let infos = views
                        .iter()
                        .map(|v| vk::DescriptorImageInfo {
                            sampler: sampler.handle(),
                            image_view: *v,
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        })
                        .collect();
                    image_infos_storage.push(infos);
                    let idx = image_infos_storage.len() - 1;
                    writes.push((binding as u32, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, Some(idx), None));
                }
                Attachment::Atlas { atlas, sampler } => {
                    let infos = (0..atlas.page_count())
                        .map(|p| vk::DescriptorImageInfo {
                            sampler: sampler.handle(),
                            image_view: atlas.page_view(p),
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        })
                        .collect();
                    image_infos_storage.push(infos);
                    let idx = image_infos_storage.len() - 1;
                    writes.push((binding as u32, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, Some(idx), None));
                    self.atlas_bindings[desc_index].push(AtlasBinding {
                        binding: binding as u32,
                        last_bound: atlas.page_count(),
                    });
                }
            }
        }

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|(binding, ty, img_idx, buf_idx)| {
                let mut w = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                if let Some(i) = img_idx {
                    w = w.image_info(&image_infos_storage[*i]);
                }
                if let Some(i) = buf_idx {
                    w = w.buffer_info(std::slice::from_ref(&buffer_infos_storage[*i]));
                }
                w.build()
            })
            .collect();

        unsafe { self.display.device().update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    /// If `atlas` has grown since the last `write`/`update_atlas`,
    /// write the newly added pages into the trailing descriptor slots.
    pub fn update_atlas(&mut self, desc_index: usize, atlas: &Arc<Atlas>, sampler: &Sampler) {
        let set = self.descriptor_sets[desc_index];
        let entries = &mut self.atlas_bindings[desc_index];
        for entry in entries.iter_mut() {
            let page_count = atlas.page_count();
            if page_count <= entry.last_bound {
                continue;
            }
            let infos: Vec<vk::DescriptorImageInfo> = (entry.last_bound..page_count)
                .map(|p| vk::DescriptorImageInfo {
                    sampler: sampler.handle(),
                    image_view: atlas.page_view(p),
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
                .collect();
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(entry.binding)
                .dst_array_element(entry.last_bound as u32)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&infos)
                .build();
            unsafe { self.display.device().update_descriptor_sets(&[write], &[]) };
            entry.last_bound = page_count;
        }
    }

    /// Bind and issue an indexed draw. `instances` is `None` for
    /// non-instanced geometry.
    #[allow(clippy::too_many_arguments)]
    pub fn draw(
        &self,
        cb: vk::CommandBuffer,
        desc_index: usize,
        vertex_buffer: vk::Buffer,
        vertex_offset: u64,
        index_buffer: vk::Buffer,
        index_offset: u64,
        index_count: u32,
        instance_buffer: Option<(vk::Buffer, u64)>,
        instance_count: u32,
    ) {
        let dev = self.display.device();
        unsafe {
            dev.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, self.handle);
            dev.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout,
                0,
                &[self.descriptor_sets[desc_index]],
                &[],
            );
            dev.cmd_bind_vertex_buffers(cb, 0, &[vertex_buffer], &[vertex_offset]);
            if let Some((buf, off)) = instance_buffer {
                dev.cmd_bind_vertex_buffers(cb, 1, &[buf], &[off]);
            }
            dev.cmd_bind_index_buffer(cb, index_buffer, index_offset, I::VK_INDEX_TYPE);
            dev.cmd_draw_indexed(cb, index_count, instance_count, 0, 0, 0);
        }
    }

    /// Same as `draw`, but the draw parameters come from a
    /// `VkDrawIndexedIndirectCommand` buffer.
    pub fn draw_indirect(
        &self,
        cb: vk::CommandBuffer,
        desc_index: usize,
        vertex_buffer: vk::Buffer,
        index_buffer: vk::Buffer,
        indirect_buffer: vk::Buffer,
        indirect_offset: u64,
        draw_count: u32,
        instance_buffer: Option<(vk::Buffer, u64)>,
    ) {
        let dev = self.display.device();
        unsafe {
            dev.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, self.handle);
            dev.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout,
                0,
                &[self.descriptor_sets[desc_index]],
                &[],
            );
            dev.cmd_bind_vertex_buffers(cb, 0, &[vertex_buffer], &[0]);
            if let Some((buf, off)) = instance_buffer {
                dev.cmd_bind_vertex_buffers(cb, 1, &[buf], &[off]);
            }
            dev.cmd_bind_index_buffer(cb, index_buffer, 0, I::VK_INDEX_TYPE);
            dev.cmd_draw_indexed_indirect(
                cb,
                indirect_buffer,
                indirect_offset,
                draw_count,
                std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32,
            );
        }
    }
}

impl<I: IndexType> Drop for Pipeline<I> {
    fn drop(&mut self) {
        unsafe {
            self.display.device().destroy_pipeline(self.handle, None);
            self.display.device().destroy_pipeline_layout(self.layout, None);
            self.display.device().destroy_descriptor_pool(self.descriptor_pool, None);
            self.display
                .device()
                .destroy_descriptor_set_layout(self.descriptor_layout, None);
        }
    }
}
