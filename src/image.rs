// Device images and their staging-backed update/download protocol.
//
// Mirrors buffer.rs's staging discipline: `update()` returns a scoped
// handle into staging memory that records a buffer-to-image copy on
// drop; downloads go the other way, through the same staging buffer,
// driven by the caller's command buffer and fence (owned by
// target.rs, not here).

use ash::vk;
use std::sync::{Arc, Mutex};

use crate::display::Display;
use crate::error::{HutError, Result};
use crate::log;
use crate::types::{BBox, Extent2D};

enum PendingImageOp {
    Upload {
        staging: vk::Buffer,
        staging_offset: u64,
        row_length: u32,
        bbox: BBox,
    },
}

/// A device-local 2-D image plus its default view.
pub struct Image {
    display: Arc<Display>,
    pub(crate) image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    format: vk::Format,
    extent: Extent2D,
    layout: Mutex<vk::ImageLayout>,
    pending: Mutex<Vec<PendingImageOp>>,
}

fn bytes_per_pixel(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM => 1,
        vk::Format::R8G8B8A8_UNORM | vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => 4,
        _ => 4,
    }
}

/// True when `src` can be reconciled onto `dst` by replicating a
/// single channel across all four (alpha-only glyph bitmap onto a
/// BGRA atlas page).
fn alpha_replicates_onto(src: vk::Format, dst: vk::Format) -> bool {
    src == vk::Format::R8_UNORM
        && matches!(dst, vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB)
}

impl Image {
    pub fn new(
        display: Arc<Display>,
        extent: Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .build();
        let image = unsafe { display.device().create_image(&create_info, None) }
            .map_err(HutError::from)?;
        let reqs = unsafe { display.device().get_image_memory_requirements(image) };
        let type_index = Display::find_memory_type(
            &display.mem_props,
            &reqs,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or(HutError::ResourceExhausted("no device-local memory type for image"))?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(type_index)
            .build();
        let memory = unsafe { display.device().allocate_memory(&alloc_info, None) }
            .map_err(HutError::from)?;
        unsafe { display.device().bind_image_memory(image, memory, 0) }
            .map_err(HutError::from)?;

        let aspect = if format == vk::Format::D32_SFLOAT {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        let view = unsafe { display.device().create_image_view(&view_info, None) }
            .map_err(HutError::from)?;

        log::debug!("image: created {}x{} format={:?}", extent.width, extent.height, format);

        Ok(Self {
            display,
            image,
            memory,
            view,
            format,
            extent,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    fn optimal_row_pitch_alignment(&self) -> u64 {
        // Conservative default matching common implementations;
        // VkPhysicalDeviceLimits::optimalBufferCopyRowPitchAlignment
        // on desktop drivers is typically 1 or 4.
        4
    }

    fn align_up(v: u64, a: u64) -> u64 {
        if a == 0 {
            v
        } else {
            (v + a - 1) / a * a
        }
    }

    /// Stage `data` (packed with `src_row_pitch` bytes per row, in
    /// `src_format`) for upload to `bbox`, converting alpha-only
    /// bitmaps onto a BGRA atlas page when needed. On drop, records
    /// the buffer-to-image copy.
    pub fn update<'a>(
        &'a self,
        bbox: BBox,
        data: &[u8],
        src_row_pitch: usize,
        src_format: vk::Format,
    ) -> Result<ImageUpdator<'a>> {
        if !bbox.fits_within(self.extent) {
            crate::invariant_violation!("image::update bbox exceeds image extent");
        }
        let bpp = bytes_per_pixel(self.format) as u64;
        let dst_row_pitch = Self::align_up(bbox.width() as u64 * bpp, self.optimal_row_pitch_alignment());
        let total = dst_row_pitch * bbox.height() as u64;

        let (staging_buf, staging_offset, ptr) = self.display.reserve_staging(total)?;

        let convert_alpha = src_format != self.format && alpha_replicates_onto(src_format, self.format);
        if src_format != self.format && !convert_alpha {
            return Err(HutError::FormatMismatch("image update source format incompatible with target"));
        }

        unsafe {
            for row in 0..bbox.height() as usize {
                let src_off = row * src_row_pitch;
                let dst_off = row * dst_row_pitch as usize;
                let dst_row = std::slice::from_raw_parts_mut(ptr.add(dst_off), bbox.width() as usize * bpp as usize);
                if convert_alpha {
                    for col in 0..bbox.width() as usize {
                        let a = data[src_off + col];
                        let px = &mut dst_row[col * 4..col * 4 + 4];
                        px.copy_from_slice(&[a, a, a, a]);
                    }
                } else {
                    let src_row = &data[src_off..src_off + bbox.width() as usize * bpp as usize];
                    dst_row.copy_from_slice(src_row);
                }
            }
        }

        Ok(ImageUpdator {
            image: self,
            staging_buf,
            staging_offset,
            row_length: (dst_row_pitch / bpp) as u32,
            bbox,
        })
    }

    /// Record a layout transition into `cbuf`. A no-op if the image is
    /// already in `new_layout`.
    pub(crate) fn record_transition(&self, cbuf: vk::CommandBuffer, new_layout: vk::ImageLayout) {
        let mut layout = self.layout.lock().unwrap();
        if *layout == new_layout {
            return;
        }
        let aspect = if self.format == vk::Format::D32_SFLOAT {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(*layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE | vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(vk::AccessFlags::MEMORY_WRITE | vk::AccessFlags::MEMORY_READ)
            .build();
        unsafe {
            self.display.device().cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
        *layout = new_layout;
    }

    /// Record all pending uploads (from dropped `ImageUpdator`s) into
    /// `cbuf`. The caller submits `cbuf` before any draw that samples
    /// this image.
    pub fn flush_staged(&self, cbuf: vk::CommandBuffer) {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return;
        }
        self.record_transition(cbuf, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        for op in pending.drain(..) {
            let PendingImageOp::Upload {
                staging,
                staging_offset,
                row_length,
                bbox,
            } = op;
            let region = vk::BufferImageCopy {
                buffer_offset: staging_offset,
                buffer_row_length: row_length,
                buffer_image_height: bbox.height(),
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D {
                    x: bbox.x() as i32,
                    y: bbox.y() as i32,
                    z: 0,
                },
                image_extent: vk::Extent3D {
                    width: bbox.width(),
                    height: bbox.height(),
                    depth: 1,
                },
            };
            unsafe {
                self.display.device().cmd_copy_buffer_to_image(
                    cbuf,
                    staging,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
            };
        }
    }

    /// Record a download of `subresource` to the staging buffer,
    /// transitioning the image to `TRANSFER_SRC_OPTIMAL` first. The
    /// caller (target.rs's `Offscreen::download`) owns the fence wait
    /// and the final staging-to-caller-span copy.
    pub(crate) fn record_download(
        &self,
        cbuf: vk::CommandBuffer,
        subresource: BBox,
    ) -> Result<(vk::Buffer, u64, u64, *mut u8)> {
        let bpp = bytes_per_pixel(self.format) as u64;
        let row_pitch = Self::align_up(subresource.width() as u64 * bpp, self.optimal_row_pitch_alignment());
        let total = row_pitch * subresource.height() as u64;

        self.record_transition(cbuf, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let (staging_buf, staging_offset, ptr) = self.display.reserve_staging(total)?;

        let region = vk::BufferImageCopy {
            buffer_offset: staging_offset,
            buffer_row_length: (row_pitch / bpp) as u32,
            buffer_image_height: subresource.height(),
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D {
                x: subresource.x() as i32,
                y: subresource.y() as i32,
                z: 0,
            },
            image_extent: vk::Extent3D {
                width: subresource.width(),
                height: subresource.height(),
                depth: 1,
            },
        };
        unsafe {
            self.display.device().cmd_copy_image_to_buffer(
                cbuf,
                self.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                staging_buf,
                &[region],
            )
        };

        Ok((staging_buf, staging_offset, row_pitch, ptr))
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.display.device().destroy_image_view(self.view, None);
            self.display.device().destroy_image(self.image, None);
            self.display.device().free_memory(self.memory, None);
        }
    }
}

/// A scoped handle to staging memory for one image `update()` call. On
/// drop, enqueues the buffer-to-image copy.
pub struct ImageUpdator<'a> {
    image: &'a Image,
    staging_buf: vk::Buffer,
    staging_offset: u64,
    row_length: u32,
    bbox: BBox,
}

impl<'a> Drop for ImageUpdator<'a> {
    fn drop(&mut self) {
        self.image.pending.lock().unwrap().push(PendingImageOp::Upload {
            staging: self.staging_buf,
            staging_offset: self.staging_offset,
            row_length: self.row_length,
            bbox: self.bbox,
        });
    }
}
