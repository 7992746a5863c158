// VkSampler wrapper, pulled out into its own shareable object: samplers
// and atlases are immutable after construction and may be bound by
// more than one pipeline/descriptor index.

use ash::vk;
use std::sync::Arc;

use crate::display::{Display, DeviceFeatures};
use crate::error::{HutError, Result};

#[derive(Debug, Clone, Copy)]
pub struct SamplerParams {
    pub filter: vk::Filter,
    pub anisotropy: bool,
    pub address_mode: vk::SamplerAddressMode,
    pub lod_range: (f32, f32),
    pub lod_bias: f32,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            anisotropy: true,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            lod_range: (0.0, 0.0),
            lod_bias: 0.0,
        }
    }
}

pub struct Sampler {
    display: Arc<Display>,
    pub(crate) handle: vk::Sampler,
}

impl Sampler {
    pub fn new(display: Arc<Display>, params: SamplerParams) -> Result<Self> {
        let anisotropy_enabled = params.anisotropy && display.features().contains(DeviceFeatures::SAMPLER_ANISOTROPY);
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(params.filter)
            .min_filter(params.filter)
            .address_mode_u(params.address_mode)
            .address_mode_v(params.address_mode)
            .address_mode_w(params.address_mode)
            .anisotropy_enable(anisotropy_enabled)
            .max_anisotropy(if anisotropy_enabled { 16.0 } else { 1.0 })
            .min_lod(params.lod_range.0)
            .max_lod(params.lod_range.1)
            .mip_lod_bias(params.lod_bias)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .build();
        let handle = unsafe { display.device().create_sampler(&create_info, None) }
            .map_err(HutError::from)?;
        Ok(Self { display, handle })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.display.device().destroy_sampler(self.handle, None) };
    }
}
