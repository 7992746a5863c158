// Growable texture atlas: a sequence of same-format, same-size pages,
// each carrying its own 2-D shelf packer. Mirrors the buffer pool's
// page-on-demand growth, but in two dimensions.

use ash::vk;
use std::sync::{Arc, Mutex};

use crate::display::Display;
use crate::error::Result;
use crate::image::Image;
use crate::log;
use crate::shelf::{ShelfPacker, ShelfSelector};
use crate::types::{BBox, Extent2D};

/// Border kept around every sub-image so that bilinear sampling near
/// an edge doesn't bleed into a neighboring allocation.
const PADDING: u32 = 1;

struct AtlasPage {
    image: Image,
    packer: ShelfPacker,
}

struct AtlasInner {
    pages: Vec<AtlasPage>,
}

/// A growable collection of equally-sized, equally-formatted atlas
/// pages.
pub struct Atlas {
    display: Arc<Display>,
    page_size: Extent2D,
    format: vk::Format,
    inner: Mutex<AtlasInner>,
}

impl Atlas {
    pub fn new(display: Arc<Display>, page_size: Extent2D, format: vk::Format) -> Self {
        Self {
            display,
            page_size,
            format,
            inner: Mutex::new(AtlasInner { pages: Vec::new() }),
        }
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn page_count(&self) -> usize {
        self.inner.lock().unwrap().pages.len()
    }

    fn new_page(&self) -> Result<AtlasPage> {
        let image = Image::new(
            self.display.clone(),
            self.page_size,
            self.format,
            vk::ImageUsageFlags::SAMPLED,
        )?;
        log::debug!("atlas: grew to a new {}x{} page", self.page_size.width, self.page_size.height);
        Ok(AtlasPage {
            image,
            packer: ShelfPacker::new(self.page_size.width, self.page_size.height, ShelfSelector::pow2_min16()),
        })
    }

    /// Reserve `size_px` (unpadded) on some page, growing the atlas
    /// with a fresh page if every existing page is full.
    pub fn alloc(self: &Arc<Self>, size_px: (u32, u32)) -> Result<Subimage> {
        let padded = (size_px.0 + 2 * PADDING, size_px.1 + 2 * PADDING);

        let mut inner = self.inner.lock().unwrap();
        for (idx, page) in inner.pages.iter_mut().enumerate() {
            if let Some(pos) = page.packer.pack(padded) {
                return Ok(self.make_subimage(idx, pos, size_px));
            }
        }
        drop(inner);

        let mut page = self.new_page()?;
        let pos = page
            .packer
            .pack(padded)
            .ok_or(crate::error::HutError::ResourceExhausted("sub-image too large for a fresh atlas page"))?;
        let mut inner = self.inner.lock().unwrap();
        inner.pages.push(page);
        let idx = inner.pages.len() - 1;
        drop(inner);

        Ok(self.make_subimage(idx, pos, size_px))
    }

    fn make_subimage(self: &Arc<Self>, page_index: usize, padded_pos: (u32, u32), size_px: (u32, u32)) -> Subimage {
        let bbox = BBox::new(padded_pos.0 + PADDING, padded_pos.1 + PADDING, size_px.0, size_px.1);
        Subimage {
            atlas: self.clone(),
            page_index,
            padded_pos,
            bbox,
        }
    }

    /// Convenience: allocate and immediately upload `data`.
    pub fn pack(self: &Arc<Self>, size_px: (u32, u32), data: &[u8], src_row_pitch: usize, src_format: vk::Format) -> Result<Subimage> {
        let sub = self.alloc(size_px)?;
        {
            let inner = self.inner.lock().unwrap();
            let page = &inner.pages[sub.page_index];
            let _updator = page.image.update(sub.bbox, data, src_row_pitch, src_format)?;
        }
        Ok(sub)
    }

    pub(crate) fn page_view(&self, page_index: usize) -> vk::ImageView {
        self.inner.lock().unwrap().pages[page_index].image.view()
    }

    /// Record every page's pending staging uploads into `cbuf`.
    pub fn flush_staged(&self, cbuf: vk::CommandBuffer) {
        let inner = self.inner.lock().unwrap();
        for page in inner.pages.iter() {
            page.image.flush_staged(cbuf);
        }
    }

    fn release(&self, page_index: usize, padded_pos: (u32, u32)) {
        let mut inner = self.inner.lock().unwrap();
        inner.pages[page_index].packer.offer(padded_pos);
    }
}

/// A live allocation on one atlas page. Returns its space to the
/// page's shelf packer on drop.
pub struct Subimage {
    atlas: Arc<Atlas>,
    page_index: usize,
    padded_pos: (u32, u32),
    bbox: BBox,
}

impl Subimage {
    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }
}

impl Drop for Subimage {
    fn drop(&mut self) {
        self.atlas.release(self.page_index, self.padded_pos);
    }
}
