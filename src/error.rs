// Error types for hut
//
// All fallible per-frame operations (allocate/update/draw) only ever
// return `ResourceExhausted`; everything else is either a construction
// time failure or an invariant violation that aborts instead of
// propagating.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HutError>;

#[derive(Error, Debug)]
pub enum HutError {
    /// All batches/pages are full and growth failed, either because the
    /// device is out of memory or a user-imposed cap (max descriptor
    /// sets, max atlas pages) was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A Vulkan call reported the device as lost. Higher layers must
    /// recreate the Display; hut does not attempt to recover internally.
    #[error("device lost")]
    DeviceLost,

    /// An image update's pixel layout cannot be reconciled with the
    /// target atlas/image format.
    #[error("format mismatch: {0}")]
    FormatMismatch(&'static str),

    /// A raw Vulkan error bubbled up from a driver call.
    #[error("vulkan error: {0:?}")]
    Vulkan(ash::vk::Result),
}

impl From<ash::vk::Result> for HutError {
    fn from(r: ash::vk::Result) -> Self {
        match r {
            ash::vk::Result::ERROR_DEVICE_LOST => HutError::DeviceLost,
            other => HutError::Vulkan(other),
        }
    }
}

/// Aborts with diagnostic info in debug builds, and in release aborts
/// too (invariant violations are bugs, not recoverable errors per the
/// error handling policy -- they never escape as a `Result`).
#[macro_export]
macro_rules! invariant_violation {
    ($($arg:tt)+) => {{
        $crate::log::critical!($($arg)+);
        panic!($($arg)+);
    }};
}
