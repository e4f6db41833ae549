//! Error type shared by the acceleration-structure core and its backends.

use ash::vk;

pub type RtResult<T> = Result<T, RtError>;

#[derive(Debug, thiserror::Error)]
pub enum RtError {
    /// The device refused a build description. Parameters are deterministic,
    /// so retrying the same description cannot succeed.
    #[error("device rejected {what}: {reason}")]
    BuildRejected { what: String, reason: String },

    /// Only a full teardown and recreate of device state recovers from this.
    #[error("device lost")]
    DeviceLost,

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("failed to allocate {what}: {reason}")]
    Allocation { what: String, reason: String },

    #[error("{context}: {result:?}")]
    Vulkan { context: &'static str, result: vk::Result },

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl RtError {
    pub fn invariant(message: impl Into<String>) -> Self {
        RtError::InvariantViolation(message.into())
    }

    /// Map a Vulkan result, routing device loss to `DeviceLost`.
    pub fn vulkan(context: &'static str, result: vk::Result) -> Self {
        if result == vk::Result::ERROR_DEVICE_LOST {
            RtError::DeviceLost
        } else {
            RtError::Vulkan { context, result }
        }
    }

    /// Whether the only way forward is to tear down and recreate all device state.
    pub fn is_fatal_device_error(&self) -> bool {
        matches!(self, RtError::DeviceLost)
    }
}
