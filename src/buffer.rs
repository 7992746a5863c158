// Buffer pool
//
// A growable collection of device buffers ("pages"), each chunked by a
// linear suballocator. Sub-allocations are handles -- `(pool, page,
// offset, size)` -- rather than pointers back into the page, per the
// "self-referential sub-allocation" design note: the pool owns all the
// storage, BufferSuballoc is a plain value that indexes into it.

use ash::vk;
use std::marker::PhantomData;
use std::mem;
use std::sync::{Arc, Mutex};

use crate::display::Display;
use crate::error::{HutError, Result};
use crate::log;
use crate::suballoc::Suballocator;

struct BufferPage {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    capacity: u64,
    alloc: Suballocator,
}

enum PendingOp {
    Copy {
        src: vk::Buffer,
        src_offset: u64,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    },
    Fill {
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    },
}

struct PoolInner {
    pages: Vec<BufferPage>,
    pending: Vec<PendingOp>,
}

/// A growable pool of device buffers, chunked by a linear suballocator
/// per page.
pub struct BufferPool {
    display: Arc<Display>,
    usage: vk::BufferUsageFlags,
    inner: Mutex<PoolInner>,
}

fn align_of_bytes<T>() -> u64 {
    mem::align_of::<T>() as u64
}

impl BufferPool {
    pub fn new(display: Arc<Display>, usage: vk::BufferUsageFlags) -> Self {
        Self {
            display,
            usage,
            inner: Mutex::new(PoolInner {
                pages: Vec::new(),
                pending: Vec::new(),
            }),
        }
    }

    fn create_page(&self, size: u64) -> Result<BufferPage> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(self.usage | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let buffer = unsafe { self.display.device().create_buffer(&create_info, None) }
            .map_err(HutError::from)?;
        let reqs = unsafe { self.display.device().get_buffer_memory_requirements(buffer) };
        let type_index = Display::find_memory_type(
            &self.display.mem_props,
            &reqs,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or(HutError::ResourceExhausted("no device-local memory type"))?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(type_index)
            .build();
        let memory = unsafe { self.display.device().allocate_memory(&alloc_info, None) }
            .map_err(HutError::from)?;
        unsafe {
            self.display
                .device()
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(HutError::from)?
        };

        log::debug!("buffer pool: created page of size {}", size);
        Ok(BufferPage {
            buffer,
            memory,
            capacity: size,
            alloc: Suballocator::new(size),
        })
    }

    /// Allocate `count` elements of `T`, growing the pool with a new
    /// page if no existing page has room.
    pub fn allocate<T>(self: &Arc<Self>, count: usize) -> Result<BufferSuballoc<T>> {
        let size_bytes = (count * mem::size_of::<T>()) as u64;
        let align = align_of_bytes::<T>().max(1);

        let mut inner = self.inner.lock().unwrap();
        for (idx, page) in inner.pages.iter_mut().enumerate() {
            if let Some(offset) = page.alloc.pack(size_bytes, align) {
                return Ok(BufferSuballoc {
                    pool: self.clone(),
                    page_index: idx,
                    offset_bytes: offset,
                    size_bytes,
                    _marker: PhantomData,
                });
            }
        }

        let last_capacity = inner.pages.last().map(|p| p.capacity).unwrap_or(size_bytes);
        let new_capacity = size_bytes.max(last_capacity.saturating_mul(2)).max(1);
        drop(inner);
        let mut page = self.create_page(new_capacity)?;
        let offset = page
            .alloc
            .pack(size_bytes, align)
            .ok_or(HutError::ResourceExhausted("fresh page too small for request"))?;

        let mut inner = self.inner.lock().unwrap();
        inner.pages.push(page);
        let page_index = inner.pages.len() - 1;
        drop(inner);

        Ok(BufferSuballoc {
            pool: self.clone(),
            page_index,
            offset_bytes: offset,
            size_bytes,
            _marker: PhantomData,
        })
    }

    fn page_buffer(&self, page_index: usize) -> vk::Buffer {
        self.inner.lock().unwrap().pages[page_index].buffer
    }

    pub fn page_count(&self) -> usize {
        self.inner.lock().unwrap().pages.len()
    }

    /// Sum of free bytes across every page. A best-fit scoring hint,
    /// not a guarantee -- fragmentation can still fail an allocation
    /// that fits by this estimate.
    pub fn free_estimate(&self) -> u64 {
        self.inner.lock().unwrap().pages.iter().map(|p| p.alloc.free()).sum()
    }

    /// `(buffer, upper_bound_bytes)` for page `idx` -- the draw range
    /// a batched instanced draw needs.
    pub fn page_draw_info(&self, idx: usize) -> (vk::Buffer, u64) {
        let inner = self.inner.lock().unwrap();
        let page = &inner.pages[idx];
        (page.buffer, page.alloc.upper_bound())
    }

    fn release(&self, page_index: usize, offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.pages[page_index].alloc.offer(offset);
    }

    /// Submit all copies/fills enqueued by dropped `Updator`s and
    /// zeroed `BufferSuballoc`s into `cbuf`. The caller (the Display's
    /// frame loop) must do this before the command buffer that reads
    /// the affected ranges is submitted.
    pub fn flush_staged(&self, cbuf: vk::CommandBuffer) {
        let mut inner = self.inner.lock().unwrap();
        let dev = self.display.device();
        for op in inner.pending.drain(..) {
            match op {
                PendingOp::Copy {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let region = vk::BufferCopy {
                        src_offset,
                        dst_offset,
                        size,
                    };
                    unsafe { dev.cmd_copy_buffer(cbuf, src, dst, &[region]) };
                }
                PendingOp::Fill { dst, dst_offset, size } => {
                    unsafe { dev.cmd_fill_buffer(cbuf, dst, dst_offset, size, 0) };
                }
            }
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for page in inner.pages.drain(..) {
            unsafe {
                self.display.device().destroy_buffer(page.buffer, None);
                self.display.device().free_memory(page.memory, None);
            }
        }
    }
}

/// A typed, move-only view of a byte range within one buffer page.
///
/// On drop, the range is zeroed (device-side, via a queued
/// `vkCmdFillBuffer`) and returned to its page's suballocator.
pub struct BufferSuballoc<T> {
    pool: Arc<BufferPool>,
    page_index: usize,
    offset_bytes: u64,
    size_bytes: u64,
    _marker: PhantomData<T>,
}

impl<T> BufferSuballoc<T> {
    pub fn buffer(&self) -> vk::Buffer {
        self.pool.page_buffer(self.page_index)
    }

    /// Which page of the owning pool this range lives on. Callers that
    /// batch several suballocations into one draw need this to avoid
    /// binding the wrong page's buffer once a pool grows past one.
    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn offset_bytes(&self) -> u64 {
        self.offset_bytes
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        (self.size_bytes as usize) / mem::size_of::<T>().max(1)
    }

    /// Stage `data` for upload to `self[offset_elems..offset_elems+data.len()]`.
    /// The copy is recorded the next time the owning pool's
    /// `flush_staged` runs.
    pub fn update(&mut self, offset_elems: usize, data: &[T]) -> Result<Updator<'_, T>>
    where
        T: Copy,
    {
        let elem_size = mem::size_of::<T>() as u64;
        let byte_offset = self.offset_bytes + offset_elems as u64 * elem_size;
        let byte_size = data.len() as u64 * elem_size;
        if byte_offset + byte_size > self.offset_bytes + self.size_bytes {
            crate::invariant_violation!("BufferSuballoc::update out of range");
        }

        let (staging_buf, staging_offset, ptr) =
            self.pool.display.reserve_staging(byte_size)?;
        unsafe {
            let dst = std::slice::from_raw_parts_mut(ptr as *mut T, data.len());
            dst.copy_from_slice(data);
        }

        Ok(Updator {
            suballoc: self,
            staging_buf,
            staging_offset,
            dst_offset: byte_offset,
            size: byte_size,
        })
    }

    /// Record a device-side zero fill over `[offset_elems,
    /// offset_elems+count)` without waiting for the Drop path.
    pub fn zero(&mut self, offset_elems: usize, count: usize) {
        let elem_size = mem::size_of::<T>() as u64;
        let byte_offset = self.offset_bytes + offset_elems as u64 * elem_size;
        let byte_size = count as u64 * elem_size;
        let mut inner = self.pool.inner.lock().unwrap();
        let dst = inner.pages[self.page_index].buffer;
        inner.pending.push(PendingOp::Fill {
            dst,
            dst_offset: byte_offset,
            size: byte_size,
        });
    }
}

impl<T> Drop for BufferSuballoc<T> {
    fn drop(&mut self) {
        self.zero(0, self.len());
        self.pool.release(self.page_index, self.offset_bytes);
    }
}

/// A scoped handle to staging memory for one `update()` call. On drop,
/// enqueues the staging-to-target GPU copy; the caller does not need
/// to do anything else.
pub struct Updator<'a, T> {
    suballoc: &'a BufferSuballoc<T>,
    staging_buf: vk::Buffer,
    staging_offset: u64,
    dst_offset: u64,
    size: u64,
}

impl<'a, T> Drop for Updator<'a, T> {
    fn drop(&mut self) {
        let dst = self.suballoc.buffer();
        let mut inner = self.suballoc.pool.inner.lock().unwrap();
        inner.pending.push(PendingOp::Copy {
            src: self.staging_buf,
            src_offset: self.staging_offset,
            dst,
            dst_offset: self.dst_offset,
            size: self.size,
        });
    }
}
