// Text renderer.
//
// A batch owns a glyph mesh store and a per-word draw store, both
// backed by the same growable buffer.rs pools the quad renderer uses.
// Words are cached by content hash so repeated strings ("OK", common
// labels) share one glyph mesh across however many times they appear
// on screen.

use ash::vk;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::buffer::{BufferPool, BufferSuballoc};
use crate::display::Display;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::types::{BBox, Offset2D, Rgba};

fn hash_word(word: &str) -> u64 {
    // FNV-1a64: stable across runs, which is all `word_cache` needs.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GlyphVertex {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WordInstance {
    pub pos: [f32; 2],
    pub color: [u8; 4],
}

/// One glyph emitted by a `Shaper`: a local quad box, its atlas
/// texcoords, and which atlas page it lives on.
pub struct GlyphEmit {
    pub glyph_index: u32,
    pub bbox: [i16; 4],
    pub uv: [f32; 4],
    pub atlas_page: u32,
}

/// Converts a UTF-8 word into glyph quads via `emit`. A collaborator,
/// not owned by this module -- font loading and shaping live outside
/// this crate entirely.
pub trait Shaper {
    fn shape(&self, word: &str, emit: &mut dyn FnMut(GlyphEmit));
}

struct WordEntry {
    vertices: BufferSuballoc<GlyphVertex>,
    indices: BufferSuballoc<u16>,
    glyph_count: u32,
    ref_count: u32,
    bbox: BBox,
}

/// Which page of `vertex_pool`/`index_pool`/`instance_pool` a given
/// indirect-command slot's offsets are relative to. Keyed by
/// `(indirect_page, slot_index)` since a single `indirect_pool` page's
/// commands can reference meshes and instances spread across several
/// pages of the other three pools.
type DrawSlotPages = HashMap<(usize, usize), (usize, usize, usize)>;

struct TextBatch {
    vertex_pool: Arc<BufferPool>,
    index_pool: Arc<BufferPool>,
    instance_pool: Arc<BufferPool>,
    indirect_pool: Arc<BufferPool>,
    word_cache: Mutex<HashMap<u64, WordEntry>>,
    draw_slot_pages: Mutex<DrawSlotPages>,
}

impl TextBatch {
    fn new(display: Arc<Display>) -> Self {
        Self {
            vertex_pool: Arc::new(BufferPool::new(display.clone(), vk::BufferUsageFlags::VERTEX_BUFFER)),
            index_pool: Arc::new(BufferPool::new(display.clone(), vk::BufferUsageFlags::INDEX_BUFFER)),
            instance_pool: Arc::new(BufferPool::new(display.clone(), vk::BufferUsageFlags::VERTEX_BUFFER)),
            indirect_pool: Arc::new(BufferPool::new(display, vk::BufferUsageFlags::INDIRECT_BUFFER)),
            word_cache: Mutex::new(HashMap::new()),
            draw_slot_pages: Mutex::new(HashMap::new()),
        }
    }

    /// Reuse bonus weighted higher than raw free capacity, matching
    /// "prefer a batch that already has these words cached".
    fn score(&self, hashes: &[u64], word_count: usize) -> Option<u64> {
        let cache = self.word_cache.lock().unwrap();
        let mut cached_glyphs = 0u64;
        let mut uncached_glyphs = 0u64;
        for h in hashes {
            match cache.get(h) {
                Some(entry) => cached_glyphs += entry.glyph_count as u64,
                None => uncached_glyphs += 1, // refined to codepoint count by the caller
            }
        }
        drop(cache);

        let free_instances = self.instance_pool.free_estimate() / std::mem::size_of::<WordInstance>() as u64;
        let free_mesh_vertices = self.vertex_pool.free_estimate() / std::mem::size_of::<GlyphVertex>() as u64;

        if (free_instances as usize) < word_count {
            return None;
        }
        if free_mesh_vertices < uncached_glyphs * 4 {
            return None;
        }

        Some(cached_glyphs * 4 + free_instances * 8 + free_mesh_vertices)
    }

    fn release_word(&self, hash: u64) {
        let mut cache = self.word_cache.lock().unwrap();
        if let Some(entry) = cache.get_mut(&hash) {
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                cache.remove(&hash);
            }
        }
    }
}

/// The text renderer: a growable list of batches, each independently
/// scored for best fit by `allocate`.
pub struct TextRenderer {
    display: Arc<Display>,
    batches: Mutex<Vec<Arc<TextBatch>>>,
}

impl TextRenderer {
    pub fn new(display: Arc<Display>) -> Self {
        Self {
            display,
            batches: Mutex::new(Vec::new()),
        }
    }

    fn pick_batch(&self, hashes: &[u64], word_count: usize) -> Arc<TextBatch> {
        let batches = self.batches.lock().unwrap();
        let best = batches
            .iter()
            .filter_map(|b| b.score(hashes, word_count).map(|s| (s, b)))
            .max_by_key(|(s, _)| *s)
            .map(|(_, b)| b.clone());
        drop(batches);

        match best {
            Some(b) => b,
            None => {
                let fresh = Arc::new(TextBatch::new(self.display.clone()));
                self.batches.lock().unwrap().push(fresh.clone());
                fresh
            }
        }
    }

    /// Shape and upload `words`, reusing any already-cached glyph
    /// meshes, and return a holder owning the draw-instance range.
    pub fn allocate(&self, words: &[&str], shaper: &dyn Shaper) -> Result<WordsHolder> {
        let hashes: Vec<u64> = words.iter().map(|w| hash_word(w)).collect();
        let batch = self.pick_batch(&hashes, words.len());

        let mut instance_alloc = batch.instance_pool.allocate::<WordInstance>(words.len())?;
        let mut indirect_alloc = batch.indirect_pool.allocate::<vk::DrawIndexedIndirectCommand>(words.len())?;

        let mut bboxes = Vec::with_capacity(words.len());

        for (i, (word, hash)) in words.iter().zip(hashes.iter()).enumerate() {
            let mut cache = batch.word_cache.lock().unwrap();
            if !cache.contains_key(hash) {
                drop(cache);
                let codepoints = word.chars().count().max(1);
                let mut vertices = batch.vertex_pool.allocate::<GlyphVertex>(codepoints * 4)?;
                let mut indices = batch.index_pool.allocate::<u16>(codepoints * 6)?;

                let mut glyph_count = 0u32;
                let mut min = (i16::MAX, i16::MAX);
                let mut max = (i16::MIN, i16::MIN);

                let mut vbuf: Vec<GlyphVertex> = Vec::with_capacity(codepoints * 4);
                let mut ibuf: Vec<u16> = Vec::with_capacity(codepoints * 6);

                shaper.shape(word, &mut |g: GlyphEmit| {
                    let [x0, y0, x1, y1] = g.bbox;
                    min.0 = min.0.min(x0);
                    min.1 = min.1.min(y0);
                    max.0 = max.0.max(x1);
                    max.1 = max.1.max(y1);

                    let slot = glyph_count;
                    vbuf.push(GlyphVertex { pos: [x0 as f32, y0 as f32], uv: [g.uv[0], g.uv[1]] });
                    vbuf.push(GlyphVertex { pos: [x1 as f32, y0 as f32], uv: [g.uv[2], g.uv[1]] });
                    vbuf.push(GlyphVertex { pos: [x1 as f32, y1 as f32], uv: [g.uv[2], g.uv[3]] });
                    vbuf.push(GlyphVertex { pos: [x0 as f32, y1 as f32], uv: [g.uv[0], g.uv[3]] });
                    let base = (slot * 4) as u16;
                    ibuf.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
                    glyph_count += 1;
                    let _ = g.glyph_index;
                    let _ = g.atlas_page;
                });

                vertices.update(0, &vbuf)?;
                indices.update(0, &ibuf)?;

                let bbox = if glyph_count == 0 {
                    BBox::new(0, 0, 0, 0)
                } else {
                    BBox::new(
                        min.0.max(0) as u32,
                        min.1.max(0) as u32,
                        (max.0 - min.0).max(0) as u32,
                        (max.1 - min.1).max(0) as u32,
                    )
                };

                let mut cache = batch.word_cache.lock().unwrap();
                cache.insert(
                    *hash,
                    WordEntry {
                        vertices,
                        indices,
                        glyph_count,
                        ref_count: 0,
                        bbox,
                    },
                );
            }

            let mut cache = batch.word_cache.lock().unwrap();
            let entry = cache.get_mut(hash).unwrap();
            entry.ref_count += 1;
            bboxes.push(entry.bbox);

            let vertex_base = (entry.vertices.offset_bytes() / std::mem::size_of::<GlyphVertex>() as u64) as i32;
            let index_base = (entry.indices.offset_bytes() / std::mem::size_of::<u16>() as u64) as u32;
            let first_instance = (instance_alloc.offset_bytes() / std::mem::size_of::<WordInstance>() as u64) as u32 + i as u32;

            let cmd = vk::DrawIndexedIndirectCommand {
                index_count: entry.glyph_count * 6,
                instance_count: 1,
                first_index: index_base,
                vertex_offset: vertex_base,
                first_instance,
            };
            indirect_alloc.update(i, &[cmd])?;

            let cmd_size = std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u64;
            let slot = (indirect_alloc.offset_bytes() / cmd_size) as usize + i;
            batch.draw_slot_pages.lock().unwrap().insert(
                (indirect_alloc.page_index(), slot),
                (entry.vertices.page_index(), entry.indices.page_index(), instance_alloc.page_index()),
            );
        }

        Ok(WordsHolder {
            batch,
            instance_alloc,
            indirect_alloc,
            hashes,
            bboxes,
        })
    }

    /// Current reference count for `word` in whichever batch holds it,
    /// or `None` if it isn't cached anywhere. Exposed for inspection in
    /// tests; not used by the draw path.
    pub fn ref_count(&self, word: &str) -> Option<u32> {
        let hash = hash_word(word);
        for batch in self.batches.lock().unwrap().iter() {
            if let Some(entry) = batch.word_cache.lock().unwrap().get(&hash) {
                return Some(entry.ref_count);
            }
        }
        None
    }

    /// Record every batch's pending staging uploads into `cbuf`.
    pub fn flush_staged(&self, cbuf: vk::CommandBuffer) {
        for batch in self.batches.lock().unwrap().iter() {
            batch.vertex_pool.flush_staged(cbuf);
            batch.index_pool.flush_staged(cbuf);
            batch.instance_pool.flush_staged(cbuf);
            batch.indirect_pool.flush_staged(cbuf);
        }
    }

    /// Draw every batch with live words: one `vkCmdDrawIndexedIndirect`
    /// per contiguous run of commands that share a vertex/index/instance
    /// page, covering every page of `indirect_pool`. Most runs are the
    /// whole page -- grouping only splits a call where a mesh or
    /// instance landed on a different page than its neighbors.
    pub fn draw(&self, cb: vk::CommandBuffer, pipeline: &Pipeline<u16>) {
        let cmd_size = std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u64;
        for batch in self.batches.lock().unwrap().iter() {
            let slot_pages = batch.draw_slot_pages.lock().unwrap();
            for page in 0..batch.indirect_pool.page_count() {
                let (indirect_buf, upper_bound) = batch.indirect_pool.page_draw_info(page);
                let slot_count = (upper_bound / cmd_size) as usize;
                if slot_count == 0 {
                    continue;
                }

                let mut run_start = 0usize;
                while run_start < slot_count {
                    let pages = slot_pages
                        .get(&(page, run_start))
                        .copied()
                        .unwrap_or((0, 0, 0));
                    let mut run_end = run_start + 1;
                    while run_end < slot_count
                        && slot_pages.get(&(page, run_end)).copied().unwrap_or((0, 0, 0)) == pages
                    {
                        run_end += 1;
                    }

                    let (vertex_page, index_page, instance_page) = pages;
                    let (vertex_buf, _) = batch.vertex_pool.page_draw_info(vertex_page);
                    let (index_buf, _) = batch.index_pool.page_draw_info(index_page);
                    let (instance_buf, _) = batch.instance_pool.page_draw_info(instance_page);
                    let indirect_offset = run_start as u64 * cmd_size;
                    let draw_count = (run_end - run_start) as u32;
                    pipeline.draw_indirect(
                        cb,
                        0,
                        vertex_buf,
                        index_buf,
                        indirect_buf,
                        indirect_offset,
                        draw_count,
                        Some((instance_buf, 0)),
                    );

                    run_start = run_end;
                }
            }
        }
    }
}

/// Owns one `allocate()` call's draw-instance range. On drop, each
/// word's reference count is decremented; a word whose count reaches
/// zero has its glyph mesh slots returned to the batch.
pub struct WordsHolder {
    batch: Arc<TextBatch>,
    instance_alloc: BufferSuballoc<WordInstance>,
    indirect_alloc: BufferSuballoc<vk::DrawIndexedIndirectCommand>,
    hashes: Vec<u64>,
    bboxes: Vec<BBox>,
}

impl WordsHolder {
    pub fn word_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn bbox(&self, index: usize) -> BBox {
        self.bboxes[index]
    }

    /// Position and tint word `index` for drawing.
    pub fn set_instance(&mut self, index: usize, pos: Offset2D, color: Rgba) -> Result<()> {
        self.instance_alloc.update(
            index,
            &[WordInstance {
                pos: [pos.x as f32, pos.y as f32],
                color: [color.0, color.1, color.2, color.3],
            }],
        )?;
        Ok(())
    }
}

impl Drop for WordsHolder {
    fn drop(&mut self) {
        for hash in &self.hashes {
            self.batch.release_word(*hash);
        }
    }
}
