// Render targets
//
// `RenderTarget` is the abstract contract pipelines render into: a
// render pass, a sample count, and the parameters (viewport box,
// format, clear values, depth/MSAA flags) used to build it.
// `Offscreen` is the one concrete implementation this crate ships --
// windowing surfaces are out of scope.

use ash::vk;
use std::sync::Arc;

use crate::display::Display;
use crate::error::{HutError, Result};
use crate::image::Image;
use crate::log;
use crate::types::{BBox, Extent2D, Rgba};

bitflags::bitflags! {
    pub struct TargetFlags: u32 {
        const DEPTH        = 0b01;
        const MULTISAMPLING = 0b10;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenderTargetParams {
    pub viewport_box: BBox,
    pub format: vk::Format,
    pub clear_color: Rgba,
    pub clear_depth_stencil: (f32, u32),
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    pub flags: TargetFlags,
}

/// Contract every pipeline renders against.
pub trait RenderTarget {
    fn renderpass(&self) -> vk::RenderPass;
    fn sample_count(&self) -> vk::SampleCountFlags;
    fn params(&self) -> &RenderTargetParams;
    fn begin_cb(&self, fbo_index: usize, cb: vk::CommandBuffer);
    fn end_cb(&self, cb: vk::CommandBuffer);
}

fn clear_color_value(c: Rgba) -> vk::ClearColorValue {
    vk::ClearColorValue {
        float32: [
            c.0 as f32 / 255.0,
            c.1 as f32 / 255.0,
            c.2 as f32 / 255.0,
            c.3 as f32 / 255.0,
        ],
    }
}

/// A headless render target backed by its own color image (plus
/// optional MSAA and depth images), sized and cleared per
/// `RenderTargetParams`.
pub struct Offscreen {
    display: Arc<Display>,
    params: RenderTargetParams,
    color: Image,
    msaa: Option<Image>,
    depth: Option<Image>,
    renderpass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
}

impl Offscreen {
    pub fn new(display: Arc<Display>, extent: Extent2D, params: RenderTargetParams) -> Result<Self> {
        let color = Image::new(
            display.clone(),
            extent,
            params.format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        )?;

        let sample_count = if params.flags.contains(TargetFlags::MULTISAMPLING) {
            vk::SampleCountFlags::TYPE_4
        } else {
            vk::SampleCountFlags::TYPE_1
        };
        let msaa = if params.flags.contains(TargetFlags::MULTISAMPLING) {
            Some(Image::new(
                display.clone(),
                extent,
                params.format,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            )?)
        } else {
            None
        };
        let depth = if params.flags.contains(TargetFlags::DEPTH) {
            Some(Image::new(
                display.clone(),
                extent,
                vk::Format::D32_SFLOAT,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            )?)
        } else {
            None
        };

        let (renderpass, framebuffer) =
            Self::build_pass(&display, &params, sample_count, &color, msaa.as_ref(), depth.as_ref(), extent)?;

        log::debug!("offscreen: created {}x{} target", extent.width, extent.height);

        Ok(Self {
            display,
            params,
            color,
            msaa,
            depth,
            renderpass,
            framebuffer,
        })
    }

    fn build_pass(
        display: &Display,
        params: &RenderTargetParams,
        sample_count: vk::SampleCountFlags,
        color: &Image,
        msaa: Option<&Image>,
        depth: Option<&Image>,
        extent: Extent2D,
    ) -> Result<(vk::RenderPass, vk::Framebuffer)> {
        let mut attachments = Vec::new();
        let mut views = Vec::new();

        let resolve_target = msaa.is_some();
        let render_attachment = msaa.unwrap_or(color);

        attachments.push(
            vk::AttachmentDescription::builder()
                .format(params.format)
                .samples(sample_count)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .initial_layout(params.initial_layout)
                .final_layout(if resolve_target {
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                } else {
                    params.final_layout
                })
                .build(),
        );
        views.push(render_attachment.view());

        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };

        let mut depth_ref = None;
        if let Some(depth) = depth {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(vk::Format::D32_SFLOAT)
                    .samples(sample_count)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            views.push(depth.view());
            depth_ref = Some(vk::AttachmentReference {
                attachment: attachments.len() as u32 - 1,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            });
        }

        let mut resolve_ref = None;
        if resolve_target {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(params.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(params.initial_layout)
                    .final_layout(params.final_layout)
                    .build(),
            );
            views.push(color.view());
            resolve_ref = Some(vk::AttachmentReference {
                attachment: attachments.len() as u32 - 1,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref));
        if let Some(d) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(d);
        }
        let resolve_refs = resolve_ref.map(|r| [r]);
        if let Some(r) = resolve_refs.as_ref() {
            subpass = subpass.resolve_attachments(r);
        }
        let subpass = subpass.build();

        let pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .build();
        let renderpass = unsafe { display.device().create_render_pass(&pass_info, None) }
            .map_err(HutError::from)?;

        let fb_info = vk::FramebufferCreateInfo::builder()
            .render_pass(renderpass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1)
            .build();
        let framebuffer = unsafe { display.device().create_framebuffer(&fb_info, None) }
            .map_err(HutError::from)?;

        Ok((renderpass, framebuffer))
    }

    pub fn color_image(&self) -> &Image {
        &self.color
    }

    /// Run one download through the staging buffer: transition, copy
    /// to staging, block on a one-shot fence, then copy into `bytes`
    /// at `row_pitch` stride, clamped to the image's own extent.
    pub fn download(&self, bytes: &mut [u8], row_pitch: usize, subresource: BBox) -> Result<()> {
        let extent = self.color.extent();
        let width = subresource.width().min(extent.width.saturating_sub(subresource.x()));
        let height = subresource.height().min(extent.height.saturating_sub(subresource.y()));
        let clamped = BBox::new(subresource.x(), subresource.y(), width, height);

        let mut download = None;
        self.display.record_and_submit(|cbuf| {
            download = Some(self.color.record_download(cbuf, clamped));
        })?;
        let (staging_buf, staging_offset, dev_row_pitch, ptr) = download.unwrap()?;

        let bpp = 4usize;
        for row in 0..height as usize {
            let src = unsafe { std::slice::from_raw_parts(ptr.add(row * dev_row_pitch as usize), width as usize * bpp) };
            let dst_off = row * row_pitch;
            bytes[dst_off..dst_off + width as usize * bpp].copy_from_slice(src);
        }
        let _ = staging_buf;
        let _ = staging_offset;
        Ok(())
    }
}

impl RenderTarget for Offscreen {
    fn renderpass(&self) -> vk::RenderPass {
        self.renderpass
    }

    fn sample_count(&self) -> vk::SampleCountFlags {
        if self.msaa.is_some() {
            vk::SampleCountFlags::TYPE_4
        } else {
            vk::SampleCountFlags::TYPE_1
        }
    }

    fn params(&self) -> &RenderTargetParams {
        &self.params
    }

    fn begin_cb(&self, _fbo_index: usize, cb: vk::CommandBuffer) {
        let box_ = self.params.viewport_box;
        let render_area = vk::Rect2D {
            offset: vk::Offset2D {
                x: box_.x() as i32,
                y: box_.y() as i32,
            },
            extent: vk::Extent2D {
                width: box_.width(),
                height: box_.height(),
            },
        };
        let mut clears = vec![vk::ClearValue {
            color: clear_color_value(self.params.clear_color),
        }];
        if self.depth.is_some() {
            clears.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.params.clear_depth_stencil.0,
                    stencil: self.params.clear_depth_stencil.1,
                },
            });
        }
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.renderpass)
            .framebuffer(self.framebuffer)
            .render_area(render_area)
            .clear_values(&clears)
            .build();
        unsafe {
            self.display
                .device()
                .cmd_begin_render_pass(cb, &begin_info, vk::SubpassContents::INLINE)
        };
        let viewport = vk::Viewport {
            x: box_.x() as f32,
            y: box_.y() as f32,
            width: box_.width() as f32,
            height: box_.height() as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.display.device().cmd_set_viewport(cb, 0, &[viewport]);
            self.display.device().cmd_set_scissor(cb, 0, &[render_area]);
        }
    }

    fn end_cb(&self, cb: vk::CommandBuffer) {
        unsafe { self.display.device().cmd_end_render_pass(cb) };
    }
}

impl Drop for Offscreen {
    fn drop(&mut self) {
        unsafe {
            self.display.device().destroy_framebuffer(self.framebuffer, None);
            self.display.device().destroy_render_pass(self.renderpass, None);
        }
    }
}
