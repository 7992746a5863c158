//! `hut`: a Vulkan-backed core for 2-D and text rendering plus the GPU
//! resource management it needs -- suballocation, buffer pools, a
//! growable texture atlas, render targets, and pipeline plumbing.
//!
//! The crate never presents to a window and never ships a swapchain;
//! it records command buffers against a caller-supplied render target
//! and hands them back for the embedding application to submit.

pub mod atlas;
pub mod buffer;
pub mod display;
pub mod error;
pub mod image;
pub mod log;
pub mod pipeline;
pub mod render2d;
pub mod sampler;
pub mod shelf;
pub mod suballoc;
pub mod target;
pub mod text;
pub mod types;

pub use display::{CreateInfo, DeviceFeatures, Display};
pub use error::{HutError, Result};
