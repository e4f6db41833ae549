//! Headless Vulkan backend for the acceleration-structure core.
//!
//! Uses `VK_KHR_acceleration_structure` and `VK_KHR_ray_tracing_pipeline`
//! with buffer device addresses. No surface or swapchain is created.

pub mod commands;
pub mod context;
pub mod device;
pub mod memory;

pub use commands::CommandRing;
pub use context::{RtCapabilities, VulkanContext};
pub use device::{VulkanDevice, VulkanEncoder};
pub use memory::{Buffer, MemoryManager};

use ash::vk;
use std::ffi::CStr;

/// Ray tracing pipelines need Vulkan 1.2 features; 1.3 for synchronization2.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

pub const APP_NAME: &CStr = c"dyngeo";

pub const ENGINE_NAME: &CStr = c"dyngeo";

pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);
