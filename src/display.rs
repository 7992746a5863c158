// The Display collaborator
//
// Vulkan instance/device/queue bootstrap is treated as largely an
// external concern: callers are assumed to already have a `display`
// object that hands out a device handle, a staging queue, UBO
// alignment, a max image size and a feature bitset. This module
// provides exactly that surface, plus a standalone headless
// constructor so the crate (and its tests) don't need an embedding
// application.

use ash::vk;
use std::sync::Mutex;

use crate::error::Result;
use crate::log;
use crate::suballoc::Suballocator;

bitflags::bitflags! {
    /// Device capability bits consulted by Sampler/Pipeline/Atlas.
    pub struct DeviceFeatures: u32 {
        const SAMPLER_ANISOTROPY   = 0b0001;
        const DESCRIPTOR_INDEXING  = 0b0010;
        const PARTIALLY_BOUND_DESC = 0b0100;
    }
}

/// Construction parameters for a standalone `Display`.
#[derive(Debug, Clone, Default)]
pub struct CreateInfo {
    /// Enable Vulkan validation layers where available (debug builds only).
    pub debug_validation: bool,
}

impl CreateInfo {
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn debug_validation(mut self, v: bool) -> Self {
        self.debug_validation = v;
        self
    }

    pub fn build(self) -> Self {
        self
    }
}

/// Alignment given to every staging sub-allocation. Generous enough to
/// cover vertex/uniform alignment and image row-pitch alignment without
/// consulting per-request requirements.
const STAGING_ALIGN: u64 = 16;

/// Externally-synchronized mutable state for the staging buffer: the
/// one piece of shared state `allocate`/`copy` paths touch from more
/// than one logical owner across frames. `mem` is mapped for the
/// buffer's whole lifetime -- Vulkan forbids mapping a `VkDeviceMemory`
/// a second time while it's already mapped, so per-reservation
/// map/unmap can't coexist with more than one outstanding reservation.
struct StagingState {
    buf: vk::Buffer,
    mem: vk::DeviceMemory,
    mapped: *mut u8,
    capacity: u64,
    alloc: Suballocator,
}

// `mapped` is a pointer into device memory the GPU doesn't touch
// concurrently with the host (HOST_COHERENT, host-written only); the
// mutex around StagingState is what makes access to it safe to share.
unsafe impl Send for StagingState {}

/// The process-wide GPU context assumed by every other component in
/// this crate: a device handle, a staging queue + buffer, the UBO
/// alignment, the max supported 2-D image size, and a feature bitset.
pub struct Display {
    entry: Option<ash::Entry>,
    instance: Option<ash::Instance>,
    pub(crate) device: ash::Device,
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) transfer_queue: vk::Queue,
    pub(crate) transfer_queue_family: u32,
    staging: Mutex<StagingState>,
    pub(crate) ubo_alignment: u64,
    pub(crate) max_image_size: u32,
    pub(crate) features: DeviceFeatures,
}

impl Display {
    /// Build a standalone Display with its own throwaway Vulkan
    /// instance/device -- for tests, tools, and embedders that don't
    /// already have one. Picks a single physical device with a
    /// transfer-capable queue (no swapchain, no surface).
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let entry = unsafe { ash::Entry::load().map_err(|_| crate::error::HutError::DeviceLost)? };

        let app_name = std::ffi::CString::new("hut").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .engine_name(&app_name)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let layer_names: Vec<std::ffi::CString> = if info.debug_validation {
            vec![std::ffi::CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            Vec::new()
        };
        let layer_names_raw: Vec<*const i8> = layer_names.iter().map(|n| n.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names_raw)
            .build();

        let instance = unsafe {
            entry
                .create_instance(&instance_info, None)
                .map_err(crate::error::HutError::from)?
        };

        let pdev = *unsafe { instance.enumerate_physical_devices() }
            .map_err(crate::error::HutError::from)?
            .first()
            .ok_or(crate::error::HutError::DeviceLost)?;

        let result = Self::from_physical_device(&entry, &instance, pdev);
        match result {
            Ok(mut display) => {
                display.entry = Some(entry);
                display.instance = Some(instance);
                Ok(display)
            }
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    /// Build a Display on top of an instance/physical device the
    /// embedding application already owns. This is the documented
    /// external-collaborator path: hut never creates the instance or
    /// chooses the physical device itself here.
    pub fn from_existing(
        entry: &ash::Entry,
        instance: &ash::Instance,
        pdev: vk::PhysicalDevice,
    ) -> Result<Self> {
        Self::from_physical_device(entry, instance, pdev)
    }

    fn select_transfer_queue_family(instance: &ash::Instance, pdev: vk::PhysicalDevice) -> u32 {
        unsafe { instance.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .find_map(|(idx, props)| {
                props
                    .queue_flags
                    .contains(vk::QueueFlags::TRANSFER)
                    .then_some(idx as u32)
            })
            .expect("no queue family supports transfer")
    }

    fn from_physical_device(
        _entry: &ash::Entry,
        instance: &ash::Instance,
        pdev: vk::PhysicalDevice,
    ) -> Result<Self> {
        let queue_family = Self::select_transfer_queue_family(instance, pdev);
        let mem_props = unsafe { instance.get_physical_device_memory_properties(pdev) };
        let props = unsafe { instance.get_physical_device_properties(pdev) };

        let mut features = DeviceFeatures::empty();
        let dev_features = unsafe { instance.get_physical_device_features(pdev) };
        if dev_features.sampler_anisotropy == vk::TRUE {
            features |= DeviceFeatures::SAMPLER_ANISOTROPY;
        }
        // Descriptor indexing (partially-bound / update-after-bind) is
        // what lets the atlas grow without rebuilding descriptor sets
        // from scratch; assume Vulkan 1.2 core support is present.
        features |= DeviceFeatures::DESCRIPTOR_INDEXING | DeviceFeatures::PARTIALLY_BOUND_DESC;

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build();
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::builder()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_update_unused_while_pending(true)
            .build();
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .push_next(&mut vk12)
            .build();

        let device = unsafe { instance.create_device(pdev, &device_info, None) }
            .map_err(crate::error::HutError::from)?;
        let transfer_queue = unsafe { device.get_device_queue(queue_family, 0) };

        let ubo_alignment = props.limits.min_uniform_buffer_offset_alignment.max(1);
        let max_image_size = props
            .limits
            .max_image_dimension2_d
            .min(props.limits.max_framebuffer_width);

        log::debug!(
            "Display initialized: ubo_alignment={} max_image_size={}",
            ubo_alignment,
            max_image_size
        );

        // Start with a small staging buffer; reserve_staging grows it
        // on demand as larger uploads/downloads come through.
        let (staging_buf, staging_mem, staging_ptr) =
            Self::create_host_buffer(&device, &mem_props, 64 * 1024)?;

        Ok(Self {
            entry: None,
            instance: None,
            device,
            pdev,
            mem_props,
            transfer_queue,
            transfer_queue_family: queue_family,
            staging: Mutex::new(StagingState {
                buf: staging_buf,
                mem: staging_mem,
                mapped: staging_ptr,
                capacity: 64 * 1024,
                alloc: Suballocator::new(64 * 1024),
            }),
            ubo_alignment: ubo_alignment as u64,
            max_image_size,
            features,
        })
    }

    /// Create a host-visible, host-coherent buffer and map it for its
    /// entire lifetime -- staging buffers are written far more often
    /// than they're resized, so persistent mapping avoids repeated
    /// map/unmap calls (and the Vulkan rule against mapping the same
    /// `VkDeviceMemory` twice while already mapped).
    fn create_host_buffer(
        device: &ash::Device,
        mem_props: &vk::PhysicalDeviceMemoryProperties,
        size: u64,
    ) -> Result<(vk::Buffer, vk::DeviceMemory, *mut u8)> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let buffer = unsafe { device.create_buffer(&create_info, None) }
            .map_err(crate::error::HutError::from)?;
        let reqs = unsafe { device.get_buffer_memory_requirements(buffer) };
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let type_index = Self::find_memory_type(mem_props, &reqs, flags)
            .ok_or(crate::error::HutError::ResourceExhausted("no host-visible memory type"))?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(type_index)
            .build();
        let memory = unsafe { device.allocate_memory(&alloc_info, None) }
            .map_err(crate::error::HutError::from)?;
        unsafe { device.bind_buffer_memory(buffer, memory, 0) }
            .map_err(crate::error::HutError::from)?;
        let ptr = unsafe {
            device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                .map_err(crate::error::HutError::from)?
        };
        Ok((buffer, memory, ptr as *mut u8))
    }

    pub(crate) fn find_memory_type(
        props: &vk::PhysicalDeviceMemoryProperties,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..props.memory_type_count).find(|&i| {
            (reqs.memory_type_bits >> i) & 1 == 1
                && props.memory_types[i as usize].property_flags.contains(flags)
        })
    }

    pub fn ubo_alignment(&self) -> u64 {
        self.ubo_alignment
    }

    pub fn max_image_size(&self) -> u32 {
        self.max_image_size
    }

    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Reserve `size` bytes of the staging buffer's own sub-allocator,
    /// growing the buffer if no free range fits, and return the
    /// buffer/offset the caller should record a copy from plus a host
    /// pointer already positioned at that offset. Each call gets a
    /// distinct range -- callers that stage several updates before a
    /// flush do not clobber one another.
    pub(crate) fn reserve_staging(&self, size: u64) -> Result<(vk::Buffer, u64, *mut u8)> {
        let mut staging = self.staging.lock().unwrap();
        if staging.alloc.try_fit(size, STAGING_ALIGN).is_none() {
            let new_capacity = size.max(staging.capacity.saturating_mul(2));
            let (buf, mem, mapped) = Self::create_host_buffer(&self.device, &self.mem_props, new_capacity)?;
            unsafe {
                self.device.unmap_memory(staging.mem);
                self.device.destroy_buffer(staging.buf, None);
                self.device.free_memory(staging.mem, None);
            }
            staging.buf = buf;
            staging.mem = mem;
            staging.mapped = mapped;
            staging.capacity = new_capacity;
            staging.alloc = Suballocator::new(new_capacity);
        }
        let offset = staging
            .alloc
            .pack(size, STAGING_ALIGN)
            .ok_or(crate::error::HutError::ResourceExhausted("staging buffer exhausted"))?;
        let ptr = unsafe { staging.mapped.add(offset as usize) };
        Ok((staging.buf, offset, ptr))
    }

    /// Record `f` into a fresh one-time-submit command buffer, then
    /// submit it to the transfer queue and block until it completes.
    /// The library never presents and never owns a persistent render
    /// loop, but something has to drive staging flushes and downloads
    /// -- this is that something, for callers who don't already have a
    /// command buffer of their own in flight.
    pub fn record_and_submit<F: FnOnce(vk::CommandBuffer)>(&self, f: F) -> Result<()> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.transfer_queue_family)
            .build();
        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .map_err(crate::error::HutError::from)?;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1)
            .build();
        let cbuf = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(crate::error::HutError::from)?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .build();
        unsafe {
            self.device
                .begin_command_buffer(cbuf, &begin_info)
                .map_err(crate::error::HutError::from)?;
        }
        f(cbuf);
        unsafe {
            self.device.end_command_buffer(cbuf).map_err(crate::error::HutError::from)?;
        }

        let fence_info = vk::FenceCreateInfo::builder().build();
        let fence = unsafe { self.device.create_fence(&fence_info, None) }
            .map_err(crate::error::HutError::from)?;
        let submit = vk::SubmitInfo::builder()
            .command_buffers(std::slice::from_ref(&cbuf))
            .build();
        unsafe {
            self.device
                .queue_submit(self.transfer_queue, &[submit], fence)
                .map_err(crate::error::HutError::from)?;
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(crate::error::HutError::from)?;
            self.device.destroy_fence(fence, None);
            self.device.destroy_command_pool(pool, None);
        }
        Ok(())
    }

    /// Record and submit a single `vkCmdCopyBuffer`, blocking until it
    /// completes. Used for the handful of static, device-local buffers
    /// (the shared quad mesh) that never go through the per-frame
    /// staging/flush path.
    pub(crate) fn one_shot_copy(
        &self,
        src: vk::Buffer,
        src_offset: u64,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.record_and_submit(|cbuf| {
            let region = vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            };
            unsafe { self.device.cmd_copy_buffer(cbuf, src, dst, &[region]) };
        })
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            let staging = self.staging.get_mut().unwrap();
            self.device.unmap_memory(staging.mem);
            self.device.destroy_buffer(staging.buf, None);
            self.device.free_memory(staging.mem, None);
            self.device.destroy_device(None);
            if let Some(instance) = self.instance.take() {
                instance.destroy_instance(None);
            }
        }
        let _ = &self.entry;
    }
}
