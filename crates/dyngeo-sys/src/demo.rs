//! Frame loop: apply parameter changes, update acceleration structures and
//! rebuild shader tables whenever the structures were recreated.

use dyngeo_common::{CvarContext, CvarError};
use dyngeo_renderer::raytracing::{
    AccelerationStructureScheduler, BuildMode, RaytracingDevice, RebuildRequests, UploadedShaderTables,
};
use dyngeo_renderer::scene::SceneArgs;
use dyngeo_renderer::RtError;

use crate::cmdline::{CommandLine, CvarAssignment};

/// Simulated frame rate driving the animation clock.
const FRAMES_PER_SECOND: f32 = 60.0;

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Cvar(#[from] CvarError),
    #[error(transparent)]
    Render(#[from] RtError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub full_builds: u64,
    pub refits: u64,
    pub skipped: u64,
    pub reinitializations: u64,
}

/// Drive the scheduler for `cmdline.frames` frames on `device`.
pub fn run<D: RaytracingDevice>(device: &mut D, cmdline: &CommandLine) -> Result<RunSummary, DemoError> {
    let mut cvars = CvarContext::new();
    let requests = RebuildRequests::default();
    SceneArgs::register(&mut cvars, &requests)?;
    for assignment in cmdline.initial_assignments() {
        apply(&mut cvars, assignment)?;
    }

    let mut scheduler = AccelerationStructureScheduler::with_requests(requests);
    let mut tables: Option<UploadedShaderTables> = None;
    let result = run_frames(device, cmdline, &mut cvars, &mut scheduler, &mut tables);

    if let Some(tables) = tables.take() {
        tables.release(device);
    }
    scheduler.teardown(device);
    result
}

fn run_frames<D: RaytracingDevice>(
    device: &mut D,
    cmdline: &CommandLine,
    cvars: &mut CvarContext,
    scheduler: &mut AccelerationStructureScheduler,
    tables: &mut Option<UploadedShaderTables>,
) -> Result<RunSummary, DemoError> {
    let mut summary = RunSummary::default();

    for frame in 0..cmdline.frames {
        for assignment in cmdline.assignments_at(frame) {
            apply(cvars, assignment)?;
        }

        let time = frame as f32 / FRAMES_PER_SECOND;
        let report = match scheduler.update_from_cvars(device, cvars, time) {
            Ok(report) => report,
            Err(e) => {
                if e.is_fatal_device_error() {
                    log::error!("Device lost at frame {frame}, releasing all acceleration structures");
                }
                return Err(e.into());
            }
        };
        log::debug!("{report}");

        summary.frames += 1;
        match report.mode {
            Some(BuildMode::Build) => summary.full_builds += 1,
            Some(BuildMode::Update) => summary.refits += 1,
            None => summary.skipped += 1,
        }

        if report.acceleration_structures_reinitialized {
            summary.reinitializations += 1;
            if let Some(old) = tables.take() {
                old.release(device);
            }
            *tables = upload_shader_tables(device, scheduler)?;
        }
    }

    log::info!(
        "{} frames: {} full builds, {} refits, {} skipped, {} reinitializations",
        summary.frames,
        summary.full_builds,
        summary.refits,
        summary.skipped,
        summary.reinitializations
    );
    Ok(summary)
}

/// Without a bound pipeline there are no shader identifiers and no tables.
fn upload_shader_tables<D: RaytracingDevice>(
    device: &mut D,
    scheduler: &AccelerationStructureScheduler,
) -> Result<Option<UploadedShaderTables>, RtError> {
    let tables = match scheduler.build_shader_tables(device) {
        Ok(tables) => tables,
        Err(RtError::Unsupported(reason)) => {
            log::info!("Skipping shader tables: {reason}");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    let uploaded = tables.upload(device)?;
    log::info!(
        "Shader tables: {} hit group records, stride {}, {} bytes",
        tables.hit_group.len(),
        uploaded.hit_group.stride,
        uploaded.size()
    );
    Ok(Some(uploaded))
}

fn apply(cvars: &mut CvarContext, assignment: &CvarAssignment) -> Result<(), CvarError> {
    if cvars.set_from_str(&assignment.name, &assignment.value)? {
        log::info!("{} = {}", assignment.name, assignment.value);
    }
    Ok(())
}
