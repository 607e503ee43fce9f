//! Communicator hierarchy: reshapes the world group into nested sub-groups
//! that each write their own storage target.
//!
//! Two sources of grouping:
//! - hardware mesh coordinates, split level by level (x, y, z, node, rank)
//! - an external group file giving each rank a color and ordering key
//!
//! Every split appends a token to the target name so sub-groups never share
//! a target.

use std::path::{Path, PathBuf};

use crate::comm::Communicator;
use crate::error::{BenchError, Result};
use crate::groupfile::GroupAssignment;

/// Deepest supported tree level (one rank per group).
pub const MAX_TREE_LEVEL: u8 = 5;

/// Joins split tokens in the target name.
pub const TOKEN_DELIMITER: &str = "-";

/// Position of a rank's node in the machine's interconnect mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub node: u32,
}

/// Source of hardware placement for the calling rank.
pub trait TopologyProvider: Send + Sync {
    fn mesh_coord(&self) -> Result<MeshCoord>;
}

/// No placement information; tree grouping is unavailable.
pub struct NoTopology;

impl TopologyProvider for NoTopology {
    fn mesh_coord(&self) -> Result<MeshCoord> {
        Err(BenchError::Config(
            "tree grouping requested but no mesh topology is available".into(),
        ))
    }
}

/// Placement supplied as explicit mesh coordinates.
pub struct MeshCoordinateTopology {
    coord: std::result::Result<MeshCoord, String>,
}

impl MeshCoordinateTopology {
    pub fn new(coord: MeshCoord) -> Self {
        Self { coord: Ok(coord) }
    }

    /// Read `STEPBENCH_MESH` (`x,y,z[,node]`); the node id falls back to
    /// `SLURM_NODEID`.
    pub fn from_env() -> Self {
        let node_fallback = std::env::var("SLURM_NODEID")
            .ok()
            .and_then(|s| s.trim().parse().ok());
        let coord = match std::env::var("STEPBENCH_MESH") {
            Ok(text) => parse_mesh(&text, node_fallback),
            Err(_) => Err("STEPBENCH_MESH is not set".to_string()),
        };
        Self { coord }
    }
}

impl TopologyProvider for MeshCoordinateTopology {
    fn mesh_coord(&self) -> Result<MeshCoord> {
        self.coord.clone().map_err(BenchError::Config)
    }
}

/// Parse `x,y,z[,node]`.
pub fn parse_mesh(
    text: &str,
    node_fallback: Option<u32>,
) -> std::result::Result<MeshCoord, String> {
    let parts = text
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("bad mesh coordinate '{text}': {e}"))?;

    match parts.as_slice() {
        [x, y, z] => Ok(MeshCoord {
            x: *x,
            y: *y,
            z: *z,
            node: node_fallback
                .ok_or_else(|| format!("mesh coordinate '{text}' has no node id"))?,
        }),
        [x, y, z, node] => Ok(MeshCoord {
            x: *x,
            y: *y,
            z: *z,
            node: *node,
        }),
        _ => Err(format!("mesh coordinate '{text}' must be x,y,z[,node]")),
    }
}

/// How the world group is reshaped before the step loop.
pub enum Grouping {
    /// All ranks write one shared target.
    Flat,
    /// Split by mesh coordinates down to `depth` levels.
    Tree {
        depth: u8,
        topology: Box<dyn TopologyProvider>,
    },
    /// Split once by a group file.
    Assigned(PathBuf),
}

/// The nested sub-groups built for a run.
pub struct Hierarchy<'w> {
    world: &'w dyn Communicator,
    levels: Vec<Box<dyn Communicator>>,
    tokens: Vec<String>,
}

impl<'w> Hierarchy<'w> {
    /// Build the hierarchy. Collective over `world`.
    ///
    /// Every rank either gets a complete hierarchy or an error; a failure on
    /// any rank is reported on all of them before the first split.
    pub fn build(world: &'w dyn Communicator, grouping: &Grouping) -> Result<Self> {
        let world_rank = world.rank();

        let plan = match grouping {
            Grouping::Flat => Ok(Vec::new()),
            Grouping::Tree { depth, topology } => tree_plan(*depth, topology.as_ref(), world_rank),
            Grouping::Assigned(path) => assigned_plan(path, world),
        };

        if !world.all_agree(plan.is_ok()) {
            return Err(plan.err().unwrap_or_else(|| {
                BenchError::Config("grouping failed on another rank".into())
            }));
        }
        let plan = plan?;

        let mut levels: Vec<Box<dyn Communicator>> = Vec::with_capacity(plan.len());
        let mut tokens = Vec::with_capacity(plan.len());
        for (color, key, token) in plan {
            let parent: &dyn Communicator = levels.last().map_or(world, |c| c.as_ref());
            let sub = parent.split(color, key)?;
            tracing::debug!(
                level = levels.len() + 1,
                color,
                sub_rank = sub.rank(),
                sub_size = sub.size(),
                "split"
            );
            levels.push(sub);
            tokens.push(token);
        }

        let hierarchy = Self {
            world,
            levels,
            tokens,
        };
        if let Some(suffix) = hierarchy.suffix() {
            tracing::info!(
                world_rank,
                levels = hierarchy.depth(),
                group_size = hierarchy.comm().size(),
                %suffix,
                "communicator hierarchy built"
            );
        }
        Ok(hierarchy)
    }

    /// The innermost group; all storage operations use it.
    pub fn comm(&self) -> &dyn Communicator {
        self.levels.last().map_or(self.world, |c| c.as_ref())
    }

    /// Number of splits performed.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Split tokens joined by `TOKEN_DELIMITER`, or `None` for a flat run.
    pub fn suffix(&self) -> Option<String> {
        (!self.tokens.is_empty()).then(|| self.tokens.join(TOKEN_DELIMITER))
    }

    /// Storage target for this rank's group.
    ///
    /// `out.bp` becomes `out.<suffix>.bp`; a name without an extension gets
    /// `.<suffix>` appended.
    pub fn target_name(&self, base: &str) -> String {
        match self.suffix() {
            Some(suffix) => decorate(base, &suffix),
            None => base.to_string(),
        }
    }
}

fn decorate(base: &str, suffix: &str) -> String {
    let path = Path::new(base);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) if !stem.is_empty() => path
            .with_file_name(format!(
                "{}.{}.{}",
                stem.to_string_lossy(),
                suffix,
                ext.to_string_lossy()
            ))
            .to_string_lossy()
            .into_owned(),
        _ => format!("{base}.{suffix}"),
    }
}

/// (color, key, token) per level.
type Plan = Vec<(i32, i32, String)>;

fn tree_plan(depth: u8, topology: &dyn TopologyProvider, world_rank: i32) -> Result<Plan> {
    if depth > MAX_TREE_LEVEL {
        return Err(BenchError::Config(format!(
            "tree level {depth} out of range (0-{MAX_TREE_LEVEL})"
        )));
    }
    if depth == 0 {
        return Ok(Vec::new());
    }

    let coord = topology.mesh_coord()?;
    tracing::info!(
        world_rank,
        x = coord.x,
        y = coord.y,
        z = coord.z,
        node = coord.node,
        "mesh coordinates"
    );

    let mut colors = Vec::with_capacity(depth as usize);
    for value in [coord.x, coord.y, coord.z, coord.node] {
        let color = i32::try_from(value)
            .map_err(|_| BenchError::Config(format!("mesh coordinate {value} too large")))?;
        colors.push(color);
    }
    colors.push(world_rank);

    Ok(colors
        .into_iter()
        .take(depth as usize)
        .map(|color| (color, world_rank, color.to_string()))
        .collect())
}

fn assigned_plan(path: &Path, world: &dyn Communicator) -> Result<Plan> {
    let assignment = GroupAssignment::load(path, world.size() as usize)?;
    if !assignment.has_explicit_keys() {
        tracing::warn!("group file has no key column; ordering falls back to rank ids");
    }
    let entry = assignment.entry(world.rank() as usize);
    Ok(vec![(entry.color, entry.key, entry.color.to_string())])
}
