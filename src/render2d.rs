// Instanced quad renderer.
//
// One 32-byte packed instance per quad, drawn with a single shared
// 6-index quad mesh. Instance storage reuses buffer.rs's page/batch
// growth exactly (a quad "batch" here is just a typed BufferPool).

use ash::vk;
use std::sync::Arc;

use memoffset::offset_of;

use crate::buffer::{BufferPool, BufferSuballoc};
use crate::display::Display;
use crate::error::Result;
use crate::pipeline::{Pipeline, VertexLayout};
use crate::sampler::Sampler;
use crate::atlas::Atlas;
use crate::types::{BBox, Rgba};

/// The `binding 1` instance layout a pipeline needs to bind
/// `Instance` records: two packed-u16 vec4s and two byte-color vec4s.
pub fn instance_vertex_layout() -> VertexLayout {
    VertexLayout {
        stride: std::mem::size_of::<Instance>() as u32,
        attributes: vec![
            (1, vk::Format::R16G16B16A16_UINT, offset_of!(Instance, pos_box) as u32),
            (2, vk::Format::R16G16B16A16_SNORM, offset_of!(Instance, uv_box) as u32),
            (3, vk::Format::R8G8B8A8_UNORM, offset_of!(Instance, col_from) as u32),
            (4, vk::Format::R8G8B8A8_UNORM, offset_of!(Instance, col_to) as u32),
        ],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gradient {
    T2B = 0,
    L2R = 1,
    Tl2Br = 2,
    Tr2Bl = 3,
}

/// The 32-byte instance record described in the wire layout: packed
/// positions with 4-bit metadata fields in each component's high
/// nibble, snorm16 UVs with the atlas page folded into their signs,
/// and a two-color gradient.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Instance {
    pos_box: [u16; 4],
    uv_box: [u16; 4],
    col_from: [u8; 4],
    col_to: [u8; 4],
    _reserved: [u8; 8],
}

const POS_MASK: u16 = 0x0FFF;

fn pack_component(pos: u16, meta: u8) -> u16 {
    (pos & POS_MASK) | ((meta as u16 & 0xF) << 12)
}

fn snorm16(v: f32) -> u16 {
    (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16 as u16
}

impl Instance {
    /// `bbox` corners are clipped to 0xFFF (4095px); `uv` is
    /// `(u0,v0,u1,v1)` in `[0,1]`, or `None` for an untextured quad.
    /// `atlas_page` must be `< 4` when `uv` is `Some`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bbox: BBox,
        corner_radius: u8,
        corner_softness: u8,
        atlas_page: u8,
        gradient: Gradient,
        uv: Option<(f32, f32, f32, f32)>,
        col_from: Rgba,
        col_to: Rgba,
    ) -> Self {
        let x0 = bbox.x().min(POS_MASK as u32) as u16;
        let y0 = bbox.y().min(POS_MASK as u32) as u16;
        let x1 = (bbox.x() + bbox.width()).min(POS_MASK as u32) as u16;
        let y1 = (bbox.y() + bbox.height()).min(POS_MASK as u32) as u16;

        let pos_box = [
            pack_component(x0, corner_radius),
            pack_component(y0, corner_softness),
            pack_component(x1, atlas_page),
            pack_component(y1, gradient as u8),
        ];

        // Page sign encoding: bit0 of the page index flips u's sign,
        // bit1 flips v's sign -- four pages fit inside one snorm16 box
        // without a uniform switch.
        let page_u_sign = if atlas_page & 0b01 != 0 { -1.0 } else { 1.0 };
        let page_v_sign = if atlas_page & 0b10 != 0 { -1.0 } else { 1.0 };
        let uv_box = match uv {
            Some((u0, v0, u1, v1)) => [
                snorm16(u0 * page_u_sign),
                snorm16(v0 * page_v_sign),
                snorm16(u1 * page_u_sign),
                snorm16(v1 * page_v_sign),
            ],
            None => [0, 0, 0, 0],
        };

        Self {
            pos_box,
            uv_box,
            col_from: [col_from.0, col_from.1, col_from.2, col_from.3],
            col_to: [col_to.0, col_to.1, col_to.2, col_to.3],
            _reserved: [0; 8],
        }
    }
}

/// A move-only range of instance slots. On drop, the range is zeroed
/// (degenerating to `(0,0,0,0)` boxes with no fragments) and returned
/// to its batch.
pub struct QuadAllocation {
    suballoc: BufferSuballoc<Instance>,
}

impl QuadAllocation {
    pub fn len(&self) -> usize {
        self.suballoc.len()
    }
}

/// The instanced quad renderer: one growable pool of instance batches
/// plus the shared 6-index quad mesh every batch draws with.
pub struct Renderer2D {
    display: Arc<Display>,
    pool: Arc<BufferPool>,
    quad_indices: vk::Buffer,
    quad_index_memory: vk::DeviceMemory,
    quad_vertices: vk::Buffer,
    quad_vertex_memory: vk::DeviceMemory,
}

const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];
// unit quad in [0,1]^2, expanded to pos_box by the vertex shader
const QUAD_VERTICES: [f32; 8] = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];

impl Renderer2D {
    pub fn new(display: Arc<Display>) -> Result<Self> {
        let pool = Arc::new(BufferPool::new(display.clone(), vk::BufferUsageFlags::VERTEX_BUFFER));
        let (quad_indices, quad_index_memory) =
            Self::create_device_local(&display, vk::BufferUsageFlags::INDEX_BUFFER, bytemuck(&QUAD_INDICES))?;
        let (quad_vertices, quad_vertex_memory) =
            Self::create_device_local(&display, vk::BufferUsageFlags::VERTEX_BUFFER, bytemuck(&QUAD_VERTICES))?;

        Ok(Self {
            display,
            pool,
            quad_indices,
            quad_index_memory,
            quad_vertices,
            quad_vertex_memory,
        })
    }

    fn create_device_local(
        display: &Display,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(data.len() as u64)
            .usage(usage | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let buffer = unsafe { display.device().create_buffer(&create_info, None) }
            .map_err(crate::error::HutError::from)?;
        let reqs = unsafe { display.device().get_buffer_memory_requirements(buffer) };
        let type_index = Display::find_memory_type(&display.mem_props, &reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .ok_or(crate::error::HutError::ResourceExhausted("no device-local memory type"))?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(type_index)
            .build();
        let memory = unsafe { display.device().allocate_memory(&alloc_info, None) }
            .map_err(crate::error::HutError::from)?;
        unsafe { display.device().bind_buffer_memory(buffer, memory, 0) }
            .map_err(crate::error::HutError::from)?;

        let (staging_buf, staging_offset, ptr) = display.reserve_staging(data.len() as u64)?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };

        display.one_shot_copy(staging_buf, staging_offset, buffer, 0, data.len() as u64)?;
        Ok((buffer, memory))
    }

    /// Allocate `count` instance slots, growing the pool with a new
    /// batch if no existing batch has room.
    pub fn allocate(&self, count: usize) -> Result<QuadAllocation> {
        Ok(QuadAllocation {
            suballoc: self.pool.allocate::<Instance>(count)?,
        })
    }

    /// Write one instance into `alloc[index]`.
    pub fn write(&self, alloc: &mut QuadAllocation, index: usize, quad: Instance) -> Result<()> {
        alloc.suballoc.update(index, &[quad])?;
        Ok(())
    }

    /// Record staged instance uploads, then draw every batch with
    /// live instances: bind pipeline/descriptor 0/instance buffer,
    /// refresh the atlas descriptor, and issue one draw of 6 indices
    /// times the batch's instance upper bound.
    pub fn draw(
        &self,
        cb: vk::CommandBuffer,
        pipeline: &mut Pipeline<u16>,
        atlas: &Arc<Atlas>,
        sampler: &Sampler,
    ) {
        self.pool.flush_staged(cb);
        pipeline.update_atlas(0, atlas, sampler);

        for idx in 0..self.pool.page_count() {
            let (buf, upper_bound) = self.pool.page_draw_info(idx);
            let instance_count = (upper_bound as usize / std::mem::size_of::<Instance>()) as u32;
            if instance_count == 0 {
                continue;
            }
            pipeline.draw(
                cb,
                0,
                self.quad_vertices,
                0,
                self.quad_indices,
                0,
                QUAD_INDICES.len() as u32,
                Some((buf, 0)),
                instance_count,
            );
        }
    }
}

impl Drop for Renderer2D {
    fn drop(&mut self) {
        unsafe {
            self.display.device().destroy_buffer(self.quad_indices, None);
            self.display.device().free_memory(self.quad_index_memory, None);
            self.display.device().destroy_buffer(self.quad_vertices, None);
            self.display.device().free_memory(self.quad_vertex_memory, None);
        }
    }
}

fn bytemuck<T>(data: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}
