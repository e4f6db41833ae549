//! Per-frame upload streams.
//!
//! An [`UploadStream`] keeps a CPU staging array and one GPU copy of it per
//! frame in flight, all in a single host-visible buffer. Frame `i` writes
//! only its own slice, so the CPU never overwrites data the GPU may still be
//! reading from an earlier frame.

use bytemuck::{Pod, Zeroable};

use crate::error::{RtError, RtResult};

use super::device::{
    align_up, BufferDesc, BufferUsage, GpuAddress, GpuBuffer, MemoryLocation, RaytracingDevice, Transform3x4,
};

/// Number of frames the CPU may run ahead of the GPU.
pub const FRAME_COUNT: usize = 3;

/// Alignment of each per-frame slice inside the stream buffer.
const FRAME_SLICE_ALIGNMENT: u64 = 256;

pub struct UploadStream<T: Pod> {
    name: String,
    staging: Vec<T>,
    buffer: Option<GpuBuffer>,
    frame_stride: u64,
    frame_count: usize,
}

/// Per-geometry transforms consumed by bottom-level builds.
pub type GeometryTransformStream = UploadStream<Transform3x4>;

impl<T: Pod> UploadStream<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            staging: Vec::new(),
            buffer: None,
            frame_stride: 0,
            frame_count: 0,
        }
    }

    /// (Re)allocate for `len` elements per frame. Staging is zeroed.
    pub fn create<D: RaytracingDevice>(&mut self, device: &mut D, len: usize, frame_count: usize) -> RtResult<()> {
        if frame_count == 0 {
            return Err(RtError::invariant(format!("upload stream '{}' needs at least one frame", self.name)));
        }
        self.release(device);

        self.staging = vec![T::zeroed(); len];
        self.frame_count = frame_count;
        self.frame_stride = align_up((len * std::mem::size_of::<T>()) as u64, FRAME_SLICE_ALIGNMENT);
        if len == 0 {
            return Ok(());
        }

        let buffer = device.create_buffer(&BufferDesc {
            name: &self.name,
            size: self.frame_stride * frame_count as u64,
            usage: BufferUsage::BUILD_INPUT | BufferUsage::STORAGE,
            location: MemoryLocation::CpuToGpu,
            alignment: FRAME_SLICE_ALIGNMENT,
        })?;
        log::debug!(
            "Upload stream '{}': {} x {} bytes across {} frames",
            self.name,
            len,
            std::mem::size_of::<T>(),
            frame_count
        );
        self.buffer = Some(buffer);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn staging(&self) -> &[T] {
        &self.staging
    }

    pub fn staging_mut(&mut self) -> &mut [T] {
        &mut self.staging
    }

    /// Size of the whole GPU buffer, all frames included.
    pub fn gpu_size(&self) -> u64 {
        self.buffer.as_ref().map_or(0, |b| b.size)
    }

    /// Copy staging into the slice owned by `frame_index`.
    pub fn copy_staging_to_gpu<D: RaytracingDevice>(&self, device: &mut D, frame_index: usize) -> RtResult<()> {
        let Some(buffer) = &self.buffer else {
            return Ok(());
        };
        let offset = self.frame_offset(frame_index)?;
        device.write_buffer(buffer, offset, bytemuck::cast_slice(&self.staging))
    }

    /// Address of the first element of `frame_index`'s slice.
    pub fn gpu_address(&self, frame_index: usize) -> Option<GpuAddress> {
        let buffer = self.buffer.as_ref()?;
        let offset = self.frame_offset(frame_index).ok()?;
        Some(buffer.at(offset))
    }

    pub fn element_address(&self, frame_index: usize, element: usize) -> Option<GpuAddress> {
        if element >= self.staging.len() {
            return None;
        }
        self.gpu_address(frame_index)
            .map(|base| base + (element * std::mem::size_of::<T>()) as u64)
    }

    pub fn release<D: RaytracingDevice>(&mut self, device: &mut D) {
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }
        self.staging.clear();
        self.frame_stride = 0;
    }

    fn frame_offset(&self, frame_index: usize) -> RtResult<u64> {
        if frame_index >= self.frame_count {
            return Err(RtError::invariant(format!(
                "frame index {frame_index} out of range for stream '{}' ({} frames)",
                self.name, self.frame_count
            )));
        }
        Ok(self.frame_stride * frame_index as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracing::recording::RecordingDevice;
    use glam::{Mat4, Vec3};

    #[test]
    fn test_frames_do_not_overlap() {
        let mut device = RecordingDevice::new();
        let mut stream = GeometryTransformStream::new("transforms");
        stream.create(&mut device, 5, FRAME_COUNT).unwrap();

        let a0 = stream.gpu_address(0).unwrap();
        let a1 = stream.gpu_address(1).unwrap();
        let a2 = stream.gpu_address(2).unwrap();
        assert!(a1 - a0 >= 5 * 48);
        assert_eq!(a2 - a1, a1 - a0);
        assert!(stream.gpu_address(3).is_none());
    }

    #[test]
    fn test_copy_writes_only_the_frame_slice() {
        let mut device = RecordingDevice::new();
        let mut stream = GeometryTransformStream::new("transforms");
        stream.create(&mut device, 2, FRAME_COUNT).unwrap();

        let moved = Transform3x4::from(Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0)));
        stream.staging_mut()[1] = moved;
        stream.copy_staging_to_gpu(&mut device, 1).unwrap();

        let written = device.read(stream.element_address(1, 1).unwrap(), 48).unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<Transform3x4>(written), moved);
        // Frame 0 never received the copy.
        let untouched = device.read(stream.element_address(0, 1).unwrap(), 48).unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<Transform3x4>(untouched), Transform3x4::zeroed());
    }

    #[test]
    fn test_out_of_range_frame_is_rejected() {
        let mut device = RecordingDevice::new();
        let mut stream = UploadStream::<u32>::new("words");
        stream.create(&mut device, 4, 2).unwrap();
        assert!(stream.copy_staging_to_gpu(&mut device, 2).is_err());
    }

    #[test]
    fn test_recreate_releases_previous_buffer() {
        let mut device = RecordingDevice::new();
        let mut stream = UploadStream::<u32>::new("words");
        stream.create(&mut device, 4, FRAME_COUNT).unwrap();
        stream.create(&mut device, 8, FRAME_COUNT).unwrap();
        assert_eq!(device.live_buffer_count(), 1);
        assert_eq!(stream.len(), 8);

        stream.release(&mut device);
        assert_eq!(device.live_buffer_count(), 0);
        assert!(stream.gpu_address(0).is_none());
    }

    #[test]
    fn test_empty_stream_allocates_nothing() {
        let mut device = RecordingDevice::new();
        let mut stream = GeometryTransformStream::new("transforms");
        stream.create(&mut device, 0, FRAME_COUNT).unwrap();
        assert!(stream.is_empty());
        assert_eq!(device.live_buffer_count(), 0);
        stream.copy_staging_to_gpu(&mut device, 0).unwrap();
    }
}
