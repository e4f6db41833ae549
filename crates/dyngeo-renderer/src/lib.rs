//! Dynamic-geometry ray tracing acceleration structures.
//!
//! [`raytracing::AccelerationStructureScheduler`] keeps bottom- and top-level
//! acceleration structures for an animated procedural scene up to date, one
//! frame at a time, against any [`raytracing::RaytracingDevice`]: the Vulkan
//! backend in [`vulkan`] or the in-memory [`raytracing::RecordingDevice`].

pub mod error;
pub mod raytracing;
pub mod scene;
pub mod vulkan;

pub use error::{RtError, RtResult};
