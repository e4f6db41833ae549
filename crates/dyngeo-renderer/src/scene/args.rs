//! Tunable scene parameters.
//!
//! Parameters live in a [`CvarContext`]. Changing one that affects geometry
//! requests geometry and acceleration structure reinitialization, changing
//! one that only affects acceleration structures requests the latter.

use dyngeo_common::{Cvar, CvarContext, CvarError};

use crate::raytracing::device::BuildFlags;
use crate::raytracing::scheduler::{RebuildRequests, UpdateMode};

use super::SceneTopology;

/// Upper bound for the number of sphere BLAS.
pub const MAX_BLAS: u32 = 100;

pub const ENABLE_AS_UPDATES: &str = "rt_enable_as_updates";
pub const SCENE_TOPOLOGY: &str = "scene_topology";
pub const AS_UPDATE_MODE: &str = "as_update_mode";
pub const AS_BUILD_FREQUENCY: &str = "as_build_frequency";
pub const AS_MINIMIZE_MEMORY: &str = "as_minimize_memory";
pub const AS_ALLOW_UPDATE: &str = "as_allow_update";
pub const GEO_TESSELATION: &str = "geo_tesselation";
pub const GEO_PER_BLAS: &str = "geo_per_blas";
pub const GEO_SPHERE_BLAS: &str = "geo_sphere_blas";
pub const SCENE_ANIMATE: &str = "scene_animate";

const TOPOLOGY_NAMES: &[&str] = &["multi_blas", "single_blas"];
const UPDATE_MODE_NAMES: &[&str] = &["build", "update", "update_build_every_x_frames"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    MultiBlas,
    SingleBlas,
}

/// Snapshot of the scene parameters for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneSettings {
    pub enable_as_updates: bool,
    pub topology: TopologyKind,
    pub update_mode: UpdateMode,
    pub build_frequency: u32,
    pub minimize_memory: bool,
    pub allow_update: bool,
    pub tesselation: u32,
    pub geometries_per_blas: u32,
    pub sphere_blas: u32,
    pub animate: bool,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            enable_as_updates: true,
            topology: TopologyKind::MultiBlas,
            update_mode: UpdateMode::Build,
            build_frequency: 1,
            minimize_memory: false,
            allow_update: true,
            tesselation: 14,
            geometries_per_blas: 1,
            sphere_blas: 1,
            animate: true,
        }
    }
}

impl SceneSettings {
    pub fn build_flags(&self) -> BuildFlags {
        let mut flags = BuildFlags::PREFER_FAST_TRACE;
        if self.allow_update {
            flags |= BuildFlags::ALLOW_UPDATE;
        }
        if self.minimize_memory {
            flags |= BuildFlags::MINIMIZE_MEMORY;
        }
        flags
    }

    pub fn scene_topology(&self) -> SceneTopology {
        match self.topology {
            TopologyKind::MultiBlas => SceneTopology::MultiBlas {
                sphere_blas: self.sphere_blas,
                geometries_per_blas: self.geometries_per_blas,
            },
            TopologyKind::SingleBlas => SceneTopology::SingleBlas { geometries: self.geometries_per_blas },
        }
    }
}

pub struct SceneArgs;

impl SceneArgs {
    /// Register every scene parameter and route its changes to `requests`.
    pub fn register(cvars: &mut CvarContext, requests: &RebuildRequests) -> Result<(), CvarError> {
        let defaults = SceneSettings::default();
        cvars.register_bool(ENABLE_AS_UPDATES, defaults.enable_as_updates);
        cvars.register_enum(SCENE_TOPOLOGY, 0, TOPOLOGY_NAMES);
        cvars.register_enum(AS_UPDATE_MODE, defaults.update_mode.index(), UPDATE_MODE_NAMES);
        cvars.register_int(AS_BUILD_FREQUENCY, defaults.build_frequency as i32, 1, 1200, 1);
        cvars.register_bool(AS_MINIMIZE_MEMORY, defaults.minimize_memory);
        cvars.register_bool(AS_ALLOW_UPDATE, defaults.allow_update);
        cvars.register_int(GEO_TESSELATION, defaults.tesselation as i32, 0, 80, 1);
        cvars.register_int(GEO_PER_BLAS, defaults.geometries_per_blas as i32, 1, 1000, 1);
        cvars.register_int(GEO_SPHERE_BLAS, defaults.sphere_blas as i32, 1, MAX_BLAS as i32, 1);
        cvars.register_bool(SCENE_ANIMATE, defaults.animate);

        for name in [SCENE_TOPOLOGY, GEO_TESSELATION, GEO_PER_BLAS] {
            let requests = requests.clone();
            cvars.subscribe(name, Box::new(move |_: &Cvar| requests.request_geometry()))?;
        }
        for name in [AS_MINIMIZE_MEMORY, AS_ALLOW_UPDATE, GEO_SPHERE_BLAS] {
            let requests = requests.clone();
            cvars.subscribe(name, Box::new(move |_: &Cvar| requests.request_acceleration_structures()))?;
        }
        Ok(())
    }

    pub fn snapshot(cvars: &CvarContext) -> SceneSettings {
        let positive = |name: &str| cvars.value_int(name).max(0) as u32;
        SceneSettings {
            enable_as_updates: cvars.value_bool(ENABLE_AS_UPDATES),
            topology: match cvars.value_enum(SCENE_TOPOLOGY) {
                1 => TopologyKind::SingleBlas,
                _ => TopologyKind::MultiBlas,
            },
            update_mode: UpdateMode::from_index(cvars.value_enum(AS_UPDATE_MODE)),
            build_frequency: positive(AS_BUILD_FREQUENCY).max(1),
            minimize_memory: cvars.value_bool(AS_MINIMIZE_MEMORY),
            allow_update: cvars.value_bool(AS_ALLOW_UPDATE),
            tesselation: positive(GEO_TESSELATION),
            geometries_per_blas: positive(GEO_PER_BLAS).max(1),
            sphere_blas: positive(GEO_SPHERE_BLAS).max(1),
            animate: cvars.value_bool(SCENE_ANIMATE),
        }
    }
}
