//! Per-frame acceleration structure lifecycle.
//!
//! The scheduler owns the scene geometry, every bottom-level structure, the
//! top-level structure, the geometry transform stream and the shared scratch
//! buffer. Each frame it handles pending reinitialization requests, decides
//! between a full build and a refit, and records BLAS builds followed by the
//! TLAS build into one submission.
//!
//! Reinitialization is requested through [`RebuildRequests`], a cloneable
//! handle that parameter callbacks capture. The flags are only read at the
//! start of [`AccelerationStructureScheduler::update`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use glam::Mat4;

use dyngeo_common::CvarContext;

use crate::error::{RtError, RtResult};
use crate::scene::layout::{self, BLAS_ANIMATION_SECONDS, GEOMETRY_ANIMATION_SECONDS, GEOMETRY_RADIUS};
use crate::scene::{SceneArgs, SceneGeometry, SceneSettings, SceneTopology};

use super::blas::BottomLevelStructure;
use super::device::{
    AccelerationStructureEncoder, BufferDesc, BufferUsage, BuildFlags, BuildMode, GpuBuffer, MemoryLocation,
    RaytracingDevice,
};
use super::hit_groups::{HitGroupLayout, RayType};
use super::sbt::{ShaderBindingTableBuilder, ShaderBindingTables, ShaderIdentifiers};
use super::stream::{GeometryTransformStream, FRAME_COUNT};
use super::tlas::TopLevelStructure;

const SCRATCH_ALIGNMENT: u64 = 256;

/// How acceleration structures are brought up to date each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    #[default]
    Build,
    Update,
    /// Refit, with a full build every `build_frequency` frames.
    UpdateBuildEveryXFrames,
}

impl UpdateMode {
    pub fn index(self) -> usize {
        match self {
            UpdateMode::Build => 0,
            UpdateMode::Update => 1,
            UpdateMode::UpdateBuildEveryXFrames => 2,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index {
            1 => UpdateMode::Update,
            2 => UpdateMode::UpdateBuildEveryXFrames,
            _ => UpdateMode::Build,
        }
    }
}

/// Pending reinitialization flags, shared between the scheduler and the
/// parameter callbacks that raise them.
#[derive(Debug, Clone)]
pub struct RebuildRequests {
    geometry: Arc<AtomicBool>,
    acceleration_structures: Arc<AtomicBool>,
}

impl Default for RebuildRequests {
    /// Both raised, so the first update initializes everything.
    fn default() -> Self {
        Self {
            geometry: Arc::new(AtomicBool::new(true)),
            acceleration_structures: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl RebuildRequests {
    /// New geometry invalidates every acceleration structure as well.
    pub fn request_geometry(&self) {
        self.geometry.store(true, Ordering::Release);
        self.acceleration_structures.store(true, Ordering::Release);
    }

    pub fn request_acceleration_structures(&self) {
        self.acceleration_structures.store(true, Ordering::Release);
    }

    pub fn is_geometry_requested(&self) -> bool {
        self.geometry.load(Ordering::Acquire)
    }

    pub fn is_acceleration_structures_requested(&self) -> bool {
        self.acceleration_structures.load(Ordering::Acquire)
    }

    /// Clear the geometry flag, returning whether it was raised.
    pub fn take_geometry(&self) -> bool {
        self.geometry.swap(false, Ordering::AcqRel)
    }

    pub fn take_acceleration_structures(&self) -> bool {
        self.acceleration_structures.swap(false, Ordering::AcqRel)
    }
}

/// Choose between a full build and a refit.
///
/// `frames_since_last_build` already counts the current frame. A forced build
/// or a structure that cannot be refit always gets a full build.
pub fn decide_build_mode(
    mode: UpdateMode,
    build_frequency: u32,
    frames_since_last_build: u32,
    force_build: bool,
    can_update: bool,
) -> BuildMode {
    if force_build || !can_update {
        return BuildMode::Build;
    }
    match mode {
        UpdateMode::Build => BuildMode::Build,
        UpdateMode::Update => BuildMode::Update,
        UpdateMode::UpdateBuildEveryXFrames => {
            if frames_since_last_build < build_frequency {
                BuildMode::Update
            } else {
                BuildMode::Build
            }
        }
    }
}

/// GPU memory held by the acceleration structures, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryFootprint {
    pub bottom_level: u64,
    pub top_level: u64,
    pub scratch: u64,
    pub instance_descs: u64,
    pub geometry_transforms: u64,
}

impl MemoryFootprint {
    pub fn total(&self) -> u64 {
        self.bottom_level + self.top_level + self.scratch + self.instance_descs + self.geometry_transforms
    }
}

/// What one call to [`AccelerationStructureScheduler::update`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    /// Frame-in-flight slot the builds were recorded into, `None` when skipped.
    pub frame_slot: Option<usize>,
    /// `None` when builds are disabled.
    pub mode: Option<BuildMode>,
    pub geometry_reinitialized: bool,
    pub acceleration_structures_reinitialized: bool,
    pub blas_built: usize,
    pub frames_since_last_build: u32,
    pub triangle_count: u64,
    pub footprint: MemoryFootprint,
}

impl fmt::Display for FrameReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Some(BuildMode::Build) => "build",
            Some(BuildMode::Update) => "update",
            None => "skipped",
        };
        write!(
            f,
            "{} ({} BLAS, {} triangles), {} frames since build, {} bytes",
            mode,
            self.blas_built,
            self.triangle_count,
            self.frames_since_last_build,
            self.footprint.total()
        )?;
        if let Some(slot) = self.frame_slot {
            write!(f, ", slot {slot}")?;
        }
        if self.geometry_reinitialized {
            write!(f, ", geometry reinitialized")?;
        }
        if self.acceleration_structures_reinitialized {
            write!(f, ", acceleration structures reinitialized")?;
        }
        Ok(())
    }
}

/// Base transform of each BLAS and whether it bobs.
#[derive(Debug, Clone, Copy)]
struct BlasPlacement {
    transform: Mat4,
    animated: bool,
}

/// Scene shape the current acceleration structures were created for. The
/// geometry counts of every BLAS follow from these three values.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StructureKey {
    topology: SceneTopology,
    flags: BuildFlags,
    tesselation: u32,
}

pub struct AccelerationStructureScheduler {
    requests: RebuildRequests,
    scene: Option<SceneGeometry>,
    bottom_levels: Vec<BottomLevelStructure>,
    placements: Vec<BlasPlacement>,
    top_level: TopLevelStructure,
    hit_groups: Option<HitGroupLayout>,
    geometry_transforms: GeometryTransformStream,
    scratch: Option<GpuBuffer>,
    structure_key: Option<StructureKey>,
    frames_since_last_build: u32,
    force_build: bool,
}

impl Default for AccelerationStructureScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AccelerationStructureScheduler {
    pub fn new() -> Self {
        Self::with_requests(RebuildRequests::default())
    }

    /// Use a request handle that parameter callbacks were already wired to.
    pub fn with_requests(requests: RebuildRequests) -> Self {
        Self {
            requests,
            scene: None,
            bottom_levels: Vec::new(),
            placements: Vec::new(),
            top_level: TopLevelStructure::new(),
            hit_groups: None,
            geometry_transforms: GeometryTransformStream::new("geometry transforms"),
            scratch: None,
            structure_key: None,
            frames_since_last_build: 0,
            force_build: false,
        }
    }

    pub fn requests(&self) -> &RebuildRequests {
        &self.requests
    }

    /// Make the next recorded frame a full build regardless of policy.
    pub fn request_full_build(&mut self) {
        self.force_build = true;
    }

    pub fn scene(&self) -> Option<&SceneGeometry> {
        self.scene.as_ref()
    }

    pub fn bottom_levels(&self) -> &[BottomLevelStructure] {
        &self.bottom_levels
    }

    pub fn top_level(&self) -> &TopLevelStructure {
        &self.top_level
    }

    pub fn hit_groups(&self) -> Option<&HitGroupLayout> {
        self.hit_groups.as_ref()
    }

    pub fn geometry_transforms(&self) -> &GeometryTransformStream {
        &self.geometry_transforms
    }

    pub fn scratch_size(&self) -> u64 {
        self.scratch.as_ref().map_or(0, |s| s.size)
    }

    pub fn frames_since_last_build(&self) -> u32 {
        self.frames_since_last_build
    }

    pub fn triangle_count(&self) -> u64 {
        self.bottom_levels.iter().map(BottomLevelStructure::triangle_count).sum()
    }

    pub fn footprint(&self) -> MemoryFootprint {
        MemoryFootprint {
            bottom_level: self.bottom_levels.iter().map(BottomLevelStructure::required_result_data_size).sum(),
            top_level: self.top_level.required_result_data_size(),
            scratch: self.scratch_size(),
            instance_descs: self.top_level.instance_descs_size(),
            geometry_transforms: self.geometry_transforms.gpu_size(),
        }
    }

    /// Snapshot the registered scene parameters and run one frame.
    pub fn update_from_cvars<D: RaytracingDevice>(
        &mut self,
        device: &mut D,
        cvars: &CvarContext,
        time: f32,
    ) -> RtResult<FrameReport> {
        let settings = SceneArgs::snapshot(cvars);
        self.update(device, &settings, time)
    }

    /// Bring geometry and acceleration structures up to date for one frame.
    ///
    /// `time` is in seconds and drives the animation when enabled. Per-frame
    /// uploads go to the slot of the device's command encoder, after the
    /// device has waited for that slot to retire.
    pub fn update<D: RaytracingDevice>(
        &mut self,
        device: &mut D,
        settings: &SceneSettings,
        time: f32,
    ) -> RtResult<FrameReport> {
        let mut report = FrameReport::default();
        if !settings.enable_as_updates {
            report.frames_since_last_build = self.frames_since_last_build;
            report.footprint = self.footprint();
            return Ok(report);
        }

        self.check_structure(settings);

        if self.requests.take_geometry() {
            self.initialize_geometry(device, settings)?;
            report.geometry_reinitialized = true;
        }
        if self.requests.take_acceleration_structures() {
            self.initialize_acceleration_structures(device, settings)?;
            report.acceleration_structures_reinitialized = true;
        }

        if settings.animate {
            self.animate(time);
        }

        self.frames_since_last_build = self.frames_since_last_build.saturating_add(1);
        let can_update = self.top_level.can_update() && self.bottom_levels.iter().all(BottomLevelStructure::can_update);
        let mode = decide_build_mode(
            settings.update_mode,
            settings.build_frequency,
            self.frames_since_last_build,
            self.force_build,
            can_update,
        );
        let slot = self.record_frame(device, mode)?;
        log::debug!(
            "Frame slot {}: {:?} of {} BLAS ({} frames since last build)",
            slot,
            mode,
            self.bottom_levels.len(),
            self.frames_since_last_build
        );
        if mode == BuildMode::Build {
            self.frames_since_last_build = 0;
            self.force_build = false;
        }

        report.frame_slot = Some(slot);
        report.mode = Some(mode);
        report.blas_built = self.bottom_levels.len();
        report.frames_since_last_build = self.frames_since_last_build;
        report.triangle_count = self.triangle_count();
        report.footprint = self.footprint();
        Ok(report)
    }

    /// Move every animated BLAS and rotate the geometries for `time` seconds.
    /// Only transforms change; the next recorded frame picks them up.
    pub fn animate(&mut self, time: f32) {
        let t = layout::animation_interpolant(time, BLAS_ANIMATION_SECONDS) - 0.5;
        for (blas, placement) in self.bottom_levels.iter_mut().zip(&self.placements) {
            if placement.animated {
                blas.set_transform(layout::bob(placement.transform, t));
            }
        }
        let angle = layout::animation_interpolant(time, GEOMETRY_ANIMATION_SECONDS) * std::f32::consts::TAU;
        self.stage_geometry_transforms(angle);
    }

    /// Shader tables matching the current structures, in hit group order.
    pub fn build_shader_tables<D: RaytracingDevice>(&self, device: &D) -> RtResult<ShaderBindingTables> {
        let hit_groups = self
            .hit_groups
            .as_ref()
            .ok_or_else(|| RtError::invariant("shader tables built before acceleration structures"))?;
        let identifiers = ShaderIdentifiers::query(device)?;
        ShaderBindingTableBuilder::new(device.shader_group_layout(), &identifiers, hit_groups)
            .build(&self.bottom_levels)
    }

    /// Release every GPU resource. Used after device loss; the next update
    /// starts from scratch.
    pub fn teardown<D: RaytracingDevice>(&mut self, device: &mut D) {
        self.release_acceleration_structures(device);
        if let Some(scene) = self.scene.take() {
            scene.release(device);
        }
        self.frames_since_last_build = 0;
        self.force_build = false;
        self.requests.request_geometry();
        log::info!("Acceleration structures torn down");
    }

    /// Raise requests for parameters that changed without a callback.
    fn check_structure(&self, settings: &SceneSettings) {
        let Some(scene) = &self.scene else {
            self.requests.request_geometry();
            return;
        };
        if scene.tesselation() != settings.tesselation {
            log::debug!("Tesselation changed to {}, reinitializing geometry", settings.tesselation);
            self.requests.request_geometry();
            return;
        }
        let Some(key) = &self.structure_key else {
            self.requests.request_acceleration_structures();
            return;
        };
        let wanted = StructureKey {
            topology: settings.scene_topology(),
            flags: settings.build_flags(),
            tesselation: scene.tesselation(),
        };
        if *key != wanted {
            log::debug!("Scene topology changed, reinitializing acceleration structures");
            self.requests.request_acceleration_structures();
        }
    }

    fn initialize_geometry<D: RaytracingDevice>(&mut self, device: &mut D, settings: &SceneSettings) -> RtResult<()> {
        device.wait_idle()?;
        self.release_acceleration_structures(device);
        if let Some(scene) = self.scene.take() {
            scene.release(device);
        }
        self.scene = Some(SceneGeometry::build(device, settings.tesselation, GEOMETRY_RADIUS)?);
        self.requests.request_acceleration_structures();
        Ok(())
    }

    fn initialize_acceleration_structures<D: RaytracingDevice>(
        &mut self,
        device: &mut D,
        settings: &SceneSettings,
    ) -> RtResult<()> {
        device.wait_idle()?;
        self.release_acceleration_structures(device);

        let scene = self
            .scene
            .as_ref()
            .ok_or_else(|| RtError::invariant("acceleration structures initialized before geometry"))?;
        let topology = settings.scene_topology();
        let flags = settings.build_flags();

        for layout in topology.blas_layouts(scene) {
            let mut blas = BottomLevelStructure::initialize(device, layout.name, layout.instances, flags)?;
            blas.set_transform(layout.transform);
            self.bottom_levels.push(blas);
            self.placements.push(BlasPlacement { transform: layout.transform, animated: layout.animated });
        }

        let hit_groups = HitGroupLayout::from_structures(&self.bottom_levels, RayType::COUNT);
        hit_groups.apply(&mut self.bottom_levels)?;

        self.geometry_transforms.create(device, topology.transform_slot_count(), FRAME_COUNT)?;
        self.top_level.initialize(device, &self.bottom_levels, flags)?;

        let scratch_size = self
            .bottom_levels
            .iter()
            .map(BottomLevelStructure::required_scratch_size)
            .chain(std::iter::once(self.top_level.required_scratch_size()))
            .max()
            .unwrap_or(0);
        self.scratch = Some(device.create_buffer(&BufferDesc {
            name: "acceleration structure scratch",
            size: scratch_size,
            usage: BufferUsage::SCRATCH | BufferUsage::STORAGE,
            location: MemoryLocation::GpuOnly,
            alignment: SCRATCH_ALIGNMENT,
        })?);

        self.hit_groups = Some(hit_groups);
        self.structure_key = Some(StructureKey { topology, flags, tesselation: scene.tesselation() });
        self.stage_geometry_transforms(0.0);
        self.force_build = true;
        self.frames_since_last_build = 0;

        let footprint = self.footprint();
        log::info!(
            "Acceleration structures: {} BLAS, {} triangles, {:?}",
            self.bottom_levels.len(),
            self.triangle_count(),
            flags
        );
        log::info!(
            "AS memory: {} bytes BLAS, {} bytes TLAS, {} bytes scratch, {} bytes total",
            footprint.bottom_level,
            footprint.top_level,
            footprint.scratch,
            footprint.total()
        );
        Ok(())
    }

    fn stage_geometry_transforms(&mut self, angle: f32) {
        let Some(key) = &self.structure_key else {
            return;
        };
        let transforms = key.topology.geometry_transforms(GEOMETRY_RADIUS, angle);
        for (slot, transform) in self.geometry_transforms.staging_mut().iter_mut().zip(transforms) {
            *slot = transform.into();
        }
    }

    /// Stage, upload and record one frame, returning the slot it used.
    ///
    /// Host writes into a slot only happen after `begin_commands` has waited
    /// for the previous submission using that slot.
    fn record_frame<D: RaytracingDevice>(&mut self, device: &mut D, mode: BuildMode) -> RtResult<usize> {
        let scratch = self
            .scratch
            .as_ref()
            .ok_or_else(|| RtError::invariant("frame recorded before acceleration structures were initialized"))?;
        let do_update = mode == BuildMode::Update;

        self.top_level.update_instance_desc_transforms(&mut self.bottom_levels)?;

        let mut encoder = device.begin_commands()?;
        let slot = encoder.frame_slot();
        if !self.geometry_transforms.is_empty() {
            self.geometry_transforms.copy_staging_to_gpu(device, slot)?;
        }
        let transforms = self.geometry_transforms.gpu_address(slot);

        for blas in &mut self.bottom_levels {
            blas.build(&mut encoder, scratch, transforms, do_update)?;
            log::trace!("BLAS '{}' {:?}", blas.name(), mode);
        }
        self.top_level.build(device, &mut encoder, scratch, do_update)?;
        log::trace!("TLAS {:?}", mode);
        device.submit_commands(encoder)?;
        Ok(slot)
    }

    fn release_acceleration_structures<D: RaytracingDevice>(&mut self, device: &mut D) {
        for blas in &mut self.bottom_levels {
            blas.release(device);
        }
        self.bottom_levels.clear();
        self.placements.clear();
        self.top_level.release(device);
        self.geometry_transforms.release(device);
        if let Some(scratch) = self.scratch.take() {
            device.destroy_buffer(scratch);
        }
        self.hit_groups = None;
        self.structure_key = None;
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracing::device::{
        AccelerationStructure, AccelerationStructureKind, BlasGeometryDesc, BuildSizes, ShaderGroupLayout,
        ShaderIdentifier, Transform3x4,
    };
    use crate::raytracing::recording::{RecordedCommand, RecordingDevice, RecordingEncoder};
    use crate::raytracing::tlas::InstanceDesc;
    use crate::scene::TopologyKind;

    fn settings() -> SceneSettings {
        SceneSettings { tesselation: 3, sphere_blas: 2, geometries_per_blas: 2, ..Default::default() }
    }

    fn modes(device: &RecordingDevice) -> Vec<BuildMode> {
        device
            .submissions()
            .iter()
            .map(|commands| commands.iter().find_map(RecordedCommand::mode).unwrap())
            .collect()
    }

    fn run(
        scheduler: &mut AccelerationStructureScheduler,
        device: &mut RecordingDevice,
        s: &SceneSettings,
        frames: usize,
    ) {
        for frame in 0..frames {
            scheduler.update(device, s, frame as f32 / 60.0).unwrap();
        }
    }

    #[test]
    fn test_decide_build_mode() {
        use BuildMode::{Build, Update};
        assert_eq!(decide_build_mode(UpdateMode::Build, 1, 3, false, true), Build);
        assert_eq!(decide_build_mode(UpdateMode::Update, 1, 3, false, true), Update);
        assert_eq!(decide_build_mode(UpdateMode::Update, 1, 3, true, true), Build);
        assert_eq!(decide_build_mode(UpdateMode::Update, 1, 3, false, false), Build);
        assert_eq!(decide_build_mode(UpdateMode::UpdateBuildEveryXFrames, 4, 3, false, true), Update);
        assert_eq!(decide_build_mode(UpdateMode::UpdateBuildEveryXFrames, 4, 4, false, true), Build);
    }

    #[test]
    fn test_update_mode_index_round_trip() {
        for mode in [UpdateMode::Build, UpdateMode::Update, UpdateMode::UpdateBuildEveryXFrames] {
            assert_eq!(UpdateMode::from_index(mode.index()), mode);
        }
        assert_eq!(UpdateMode::from_index(42), UpdateMode::Build);
    }

    #[test]
    fn test_requests() {
        let requests = RebuildRequests::default();
        assert!(requests.take_geometry());
        assert!(requests.take_acceleration_structures());
        assert!(!requests.take_geometry());

        let handle = requests.clone();
        handle.request_acceleration_structures();
        assert!(!requests.is_geometry_requested());
        assert!(requests.is_acceleration_structures_requested());
        handle.request_geometry();
        assert!(requests.is_geometry_requested());
    }

    #[test]
    fn test_cold_start_builds_everything() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { update_mode: UpdateMode::Update, ..settings() };

        let report = scheduler.update(&mut device, &s, 0.0).unwrap();
        assert_eq!(report.mode, Some(BuildMode::Build));
        assert!(report.geometry_reinitialized);
        assert!(report.acceleration_structures_reinitialized);
        assert_eq!(report.blas_built, 3);
        assert_eq!(report.frames_since_last_build, 0);
        assert_eq!(device.wait_idle_count(), 2);

        let report = scheduler.update(&mut device, &s, 0.1).unwrap();
        assert_eq!(report.mode, Some(BuildMode::Update));
        assert!(!report.acceleration_structures_reinitialized);
        assert_eq!(device.wait_idle_count(), 2);
    }

    #[test]
    fn test_frame_records_blas_before_tlas() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        scheduler.update(&mut device, &settings(), 0.0).unwrap();

        let commands = device.last_submission().unwrap();
        let kinds: Vec<&str> = commands
            .iter()
            .map(|c| match c {
                RecordedCommand::BuildBottomLevel { .. } => "blas",
                RecordedCommand::BuildTopLevel { .. } => "tlas",
                RecordedCommand::Barrier => "barrier",
            })
            .collect();
        assert_eq!(kinds, ["blas", "barrier", "blas", "barrier", "blas", "barrier", "tlas", "barrier"]);

        let Some(RecordedCommand::BuildTopLevel { instance_count, instances, .. }) = commands.get(6) else {
            panic!("expected TLAS build");
        };
        assert_eq!(*instance_count, 3);
        assert_eq!(Some(*instances), scheduler.top_level().instance_descs_address(0));
    }

    #[test]
    fn test_build_policy_always_builds() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        run(&mut scheduler, &mut device, &settings(), 5);
        assert!(modes(&device).iter().all(|&m| m == BuildMode::Build));
        assert_eq!(scheduler.frames_since_last_build(), 0);
    }

    #[test]
    fn test_update_policy_refits_after_first_frame() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { update_mode: UpdateMode::Update, ..settings() };
        run(&mut scheduler, &mut device, &s, 5);
        let modes = modes(&device);
        assert_eq!(modes[0], BuildMode::Build);
        assert!(modes[1..].iter().all(|&m| m == BuildMode::Update));
        assert_eq!(scheduler.frames_since_last_build(), 4);
    }

    #[test]
    fn test_periodic_rebuild_is_exactly_periodic() {
        for frequency in [1u32, 2, 5] {
            let mut device = RecordingDevice::new();
            let mut scheduler = AccelerationStructureScheduler::new();
            let s = SceneSettings {
                update_mode: UpdateMode::UpdateBuildEveryXFrames,
                build_frequency: frequency,
                ..settings()
            };
            run(&mut scheduler, &mut device, &s, 1 + 3 * frequency as usize);

            let modes = modes(&device);
            for (frame, mode) in modes.iter().enumerate() {
                let expected = if frame % frequency as usize == 0 { BuildMode::Build } else { BuildMode::Update };
                assert_eq!(*mode, expected, "frequency {frequency}, frame {frame}");
            }
        }
    }

    #[test]
    fn test_refit_falls_back_to_build_without_allow_update() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { update_mode: UpdateMode::Update, allow_update: false, ..settings() };
        run(&mut scheduler, &mut device, &s, 3);
        assert!(modes(&device).iter().all(|&m| m == BuildMode::Build));
    }

    #[test]
    fn test_request_full_build_overrides_policy() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { update_mode: UpdateMode::Update, ..settings() };
        run(&mut scheduler, &mut device, &s, 2);
        scheduler.request_full_build();
        let report = scheduler.update(&mut device, &s, 1.0).unwrap();
        assert_eq!(report.mode, Some(BuildMode::Build));
        assert!(!report.acceleration_structures_reinitialized);
        let report = scheduler.update(&mut device, &s, 1.1).unwrap();
        assert_eq!(report.mode, Some(BuildMode::Update));
    }

    #[test]
    fn test_as_request_reinitializes_and_forces_build() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { update_mode: UpdateMode::Update, ..settings() };
        run(&mut scheduler, &mut device, &s, 3);

        scheduler.requests().request_acceleration_structures();
        let report = scheduler.update(&mut device, &s, 1.0).unwrap();
        assert!(report.acceleration_structures_reinitialized);
        assert!(!report.geometry_reinitialized);
        assert_eq!(report.mode, Some(BuildMode::Build));
        assert_eq!(report.frames_since_last_build, 0);
    }

    #[test]
    fn test_topology_change_forces_reinit() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let mut s = SceneSettings { update_mode: UpdateMode::Update, ..settings() };
        run(&mut scheduler, &mut device, &s, 2);

        s.sphere_blas = 4;
        let report = scheduler.update(&mut device, &s, 1.0).unwrap();
        assert!(report.acceleration_structures_reinitialized);
        assert_eq!(report.mode, Some(BuildMode::Build));
        assert_eq!(scheduler.bottom_levels().len(), 5);

        s.topology = TopologyKind::SingleBlas;
        let report = scheduler.update(&mut device, &s, 1.1).unwrap();
        assert!(report.acceleration_structures_reinitialized);
        assert_eq!(scheduler.bottom_levels().len(), 1);
        assert_eq!(scheduler.bottom_levels()[0].geometry_count(), 3);

        s.tesselation = 5;
        let report = scheduler.update(&mut device, &s, 1.2).unwrap();
        assert!(report.geometry_reinitialized);
        assert!(report.acceleration_structures_reinitialized);
        assert_eq!(scheduler.scene().unwrap().tesselation(), 5);
    }

    #[test]
    fn test_build_flag_change_forces_reinit() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let mut s = SceneSettings { update_mode: UpdateMode::Update, ..settings() };
        run(&mut scheduler, &mut device, &s, 3);
        let waits = device.wait_idle_count();

        s.minimize_memory = true;
        let report = scheduler.update(&mut device, &s, 1.0).unwrap();
        assert!(report.acceleration_structures_reinitialized);
        assert!(!report.geometry_reinitialized);
        assert_eq!(report.mode, Some(BuildMode::Build));
        assert!(scheduler.bottom_levels().iter().all(|b| b.build_flags().contains(BuildFlags::MINIMIZE_MEMORY)));

        let report = scheduler.update(&mut device, &s, 1.1).unwrap();
        assert!(!report.acceleration_structures_reinitialized);
        assert_eq!(report.mode, Some(BuildMode::Update));
        assert_eq!(device.wait_idle_count(), waits + 1);
    }

    #[test]
    fn test_hit_group_contributions_follow_instances() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { sphere_blas: 3, geometries_per_blas: 4, ..settings() };
        scheduler.update(&mut device, &s, 0.0).unwrap();

        let contributions: Vec<u32> =
            scheduler.bottom_levels().iter().map(|b| b.instance_contribution_to_hit_group_index()).collect();
        assert_eq!(contributions, [0, 3, 15, 27]);
        let offsets: Vec<u32> = scheduler.top_level().instance_descs().iter().map(|d| d.hit_group_offset()).collect();
        assert_eq!(offsets, contributions);
        assert_eq!(scheduler.hit_groups().unwrap().record_count(), 13 * 3);
    }

    #[test]
    fn test_scratch_covers_every_structure() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        scheduler.update(&mut device, &settings(), 0.0).unwrap();
        let needed = scheduler
            .bottom_levels()
            .iter()
            .map(|b| b.required_scratch_size())
            .chain([scheduler.top_level().required_scratch_size()])
            .max()
            .unwrap();
        assert_eq!(scheduler.scratch_size(), needed);
        assert_eq!(scheduler.footprint().scratch, needed);
    }

    #[test]
    fn test_animation_moves_transforms_only() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { update_mode: UpdateMode::Update, ..settings() };
        scheduler.update(&mut device, &s, 0.0).unwrap();
        let plane_before = scheduler.bottom_levels()[0].transform();
        let sphere_before = scheduler.bottom_levels()[1].transform();
        let stream_before = scheduler.geometry_transforms().staging().to_vec();

        let report = scheduler.update(&mut device, &s, 3.0).unwrap();
        assert_eq!(report.mode, Some(BuildMode::Update));
        assert_eq!(scheduler.bottom_levels()[0].transform(), plane_before);
        assert_ne!(scheduler.bottom_levels()[1].transform(), sphere_before);
        assert_ne!(scheduler.geometry_transforms().staging(), stream_before.as_slice());

        let staged = scheduler.top_level().instance_descs()[1].transform;
        assert_eq!(staged, Transform3x4::from(scheduler.bottom_levels()[1].transform()));
    }

    #[test]
    fn test_static_scene_keeps_transforms() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { animate: false, ..settings() };
        scheduler.update(&mut device, &s, 0.0).unwrap();
        let before = scheduler.bottom_levels()[1].transform();
        scheduler.update(&mut device, &s, 5.0).unwrap();
        assert_eq!(scheduler.bottom_levels()[1].transform(), before);
    }

    #[test]
    fn test_disabled_builds_skip_frames() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { enable_as_updates: false, ..settings() };
        let report = scheduler.update(&mut device, &s, 0.0).unwrap();
        assert_eq!(report.mode, None);
        assert!(device.submissions().is_empty());
        assert!(scheduler.requests().is_geometry_requested());
    }

    #[test]
    fn test_rejected_build_description_is_fatal() {
        let mut device = RecordingDevice::new();
        device.reject_triangles_above(10);
        let mut scheduler = AccelerationStructureScheduler::new();
        let err = scheduler.update(&mut device, &settings(), 0.0).unwrap_err();
        assert!(matches!(err, RtError::BuildRejected { .. }));
    }

    #[test]
    fn test_device_loss_then_teardown_and_recreate() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { update_mode: UpdateMode::Update, ..settings() };
        run(&mut scheduler, &mut device, &s, 2);

        device.lose_device_on_next_submit();
        let err = scheduler.update(&mut device, &s, 1.0).unwrap_err();
        assert!(err.is_fatal_device_error());
        scheduler.teardown(&mut device);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_structure_count(), 0);

        let mut device = RecordingDevice::new();
        let report = scheduler.update(&mut device, &s, 1.1).unwrap();
        assert!(report.geometry_reinitialized);
        assert_eq!(report.mode, Some(BuildMode::Build));
    }

    #[test]
    fn test_skipped_frames_keep_slots_in_step_with_device() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = settings();
        let report = scheduler.update(&mut device, &s, 0.0).unwrap();
        assert_eq!(report.frame_slot, Some(0));

        let disabled = SceneSettings { enable_as_updates: false, ..s.clone() };
        let report = scheduler.update(&mut device, &disabled, 0.1).unwrap();
        assert_eq!(report.frame_slot, None);

        let report = scheduler.update(&mut device, &s, 0.2).unwrap();
        assert_eq!(report.frame_slot, Some(1));
        assert_eq!(device.frame_slot(), 2);
    }

    /// Logs the order of host writes and command ring calls.
    struct CallLog {
        inner: RecordingDevice,
        calls: Vec<String>,
    }

    impl RaytracingDevice for CallLog {
        type Encoder = RecordingEncoder;

        fn blas_build_sizes(&self, geometries: &[BlasGeometryDesc], flags: BuildFlags) -> RtResult<BuildSizes> {
            self.inner.blas_build_sizes(geometries, flags)
        }

        fn tlas_build_sizes(&self, instance_count: u32, flags: BuildFlags) -> RtResult<BuildSizes> {
            self.inner.tlas_build_sizes(instance_count, flags)
        }

        fn create_buffer(&mut self, desc: &BufferDesc) -> RtResult<GpuBuffer> {
            self.inner.create_buffer(desc)
        }

        fn write_buffer(&mut self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> RtResult<()> {
            let name = self.inner.buffer_name(buffer).unwrap_or("?").to_string();
            self.calls.push(format!("write {name}"));
            self.inner.write_buffer(buffer, offset, data)
        }

        fn destroy_buffer(&mut self, buffer: GpuBuffer) {
            self.inner.destroy_buffer(buffer)
        }

        fn create_acceleration_structure(
            &mut self,
            kind: AccelerationStructureKind,
            size: u64,
            name: &str,
        ) -> RtResult<AccelerationStructure> {
            self.inner.create_acceleration_structure(kind, size, name)
        }

        fn destroy_acceleration_structure(&mut self, structure: AccelerationStructure) {
            self.inner.destroy_acceleration_structure(structure)
        }

        fn begin_commands(&mut self) -> RtResult<RecordingEncoder> {
            self.calls.push("begin".to_string());
            self.inner.begin_commands()
        }

        fn submit_commands(&mut self, encoder: RecordingEncoder) -> RtResult<()> {
            self.calls.push("submit".to_string());
            self.inner.submit_commands(encoder)
        }

        fn wait_idle(&mut self) -> RtResult<()> {
            self.inner.wait_idle()
        }

        fn shader_group_layout(&self) -> ShaderGroupLayout {
            self.inner.shader_group_layout()
        }

        fn shader_identifiers(&self, group_count: u32) -> RtResult<Vec<ShaderIdentifier>> {
            self.inner.shader_identifiers(group_count)
        }
    }

    #[test]
    fn test_frame_slot_written_only_after_fence_wait() {
        let mut device = CallLog { inner: RecordingDevice::new(), calls: Vec::new() };
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = SceneSettings { update_mode: UpdateMode::Update, ..settings() };
        for frame in 0..5 {
            scheduler.update(&mut device, &s, frame as f32 / 60.0).unwrap();
        }

        let mut frames = device.calls.split(|c| c == "submit").filter(|calls| !calls.is_empty());
        let last = frames.next_back().unwrap();
        assert_eq!(last, ["begin", "write geometry transforms", "write tlas instance descs"]);
        for calls in frames {
            let begin = calls.iter().position(|c| c == "begin").unwrap();
            assert!(calls[begin..].iter().any(|c| c == "write geometry transforms"));
            assert!(calls[..begin].iter().all(|c| !c.contains("transforms") && !c.contains("instance descs")));
        }
    }

    fn plane_and_eight_spheres(update_mode: UpdateMode) -> SceneSettings {
        SceneSettings { sphere_blas: 1, geometries_per_blas: 8, update_mode, ..settings() }
    }

    #[test]
    fn test_plane_and_eight_spheres_build_policy() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = plane_and_eight_spheres(UpdateMode::Build);
        for frame in 0..6 {
            let report = scheduler.update(&mut device, &s, frame as f32 / 60.0).unwrap();
            assert_eq!(report.mode, Some(BuildMode::Build));
            assert_eq!(report.blas_built, 2);
            assert_eq!(report.frames_since_last_build, 0);
        }
        assert_eq!(scheduler.bottom_levels()[1].geometry_count(), 8);

        assert_eq!(device.submissions().len(), 6);
        for commands in device.submissions() {
            let blas = commands.iter().filter(|c| matches!(c, RecordedCommand::BuildBottomLevel { .. })).count();
            let tlas = commands.iter().filter(|c| matches!(c, RecordedCommand::BuildTopLevel { .. })).count();
            assert_eq!((blas, tlas), (2, 1));
            assert!(commands.iter().filter_map(RecordedCommand::mode).all(|m| m == BuildMode::Build));
        }
    }

    #[test]
    fn test_plane_and_eight_spheres_update_policy() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        let s = plane_and_eight_spheres(UpdateMode::Update);
        scheduler.update(&mut device, &s, 0.0).unwrap();
        let footprint = scheduler.footprint();
        let sizes: Vec<BuildSizes> = scheduler.bottom_levels().iter().map(BottomLevelStructure::sizes).collect();

        for frame in 1..7 {
            let report = scheduler.update(&mut device, &s, frame as f32 * 0.7).unwrap();
            assert_eq!(report.mode, Some(BuildMode::Update));
            assert_eq!(report.frames_since_last_build, frame);
            assert_eq!(scheduler.footprint(), footprint);
            let now: Vec<BuildSizes> = scheduler.bottom_levels().iter().map(BottomLevelStructure::sizes).collect();
            assert_eq!(now, sizes);

            let slot = report.frame_slot.unwrap();
            let top_level = scheduler.top_level();
            let count = top_level.instance_descs().len();
            let bytes = device.read(top_level.instance_descs_address(slot).unwrap(), count * 64).unwrap();
            for (chunk, blas) in bytes.chunks_exact(64).zip(scheduler.bottom_levels()) {
                let uploaded: InstanceDesc = bytemuck::pod_read_unaligned(chunk);
                assert_eq!(uploaded.transform, Transform3x4::from(blas.transform()), "frame {frame}");
            }

            let stream = scheduler.geometry_transforms();
            let bytes = device.read(stream.gpu_address(slot).unwrap(), stream.len() * 48).unwrap();
            let uploaded: Vec<Transform3x4> =
                bytes.chunks_exact(48).map(bytemuck::pod_read_unaligned).collect();
            assert_eq!(uploaded.as_slice(), stream.staging());
        }
    }

    #[test]
    fn test_shader_tables_match_structures() {
        let mut device = RecordingDevice::new();
        let mut scheduler = AccelerationStructureScheduler::new();
        assert!(scheduler.build_shader_tables(&device).is_err());
        scheduler.update(&mut device, &settings(), 0.0).unwrap();
        let tables = scheduler.build_shader_tables(&device).unwrap();
        assert_eq!(tables.ray_gen.len(), 3);
        assert_eq!(tables.miss.len(), 3);
        assert_eq!(tables.hit_group.len(), 5 * 3);
    }

    #[test]
    fn test_report_display() {
        let report =
            FrameReport { frame_slot: Some(2), mode: Some(BuildMode::Update), blas_built: 2, ..Default::default() };
        let text = report.to_string();
        assert!(text.starts_with("update (2 BLAS"));
        assert!(text.contains(", slot 2"));
    }
}
