//! Placement policies and per-value schemas.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::grid::DeviceGrid;

/// How one value's data is distributed across the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Every device holds a full copy.
    Replicate,
    /// The value is partitioned along the given tensor dimension.
    Shard(usize),
}

/// The placement of one value: a grid reference plus one policy per grid
/// dimension. The grid here is 1-D, so each schema carries one policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub grid: Arc<DeviceGrid>,
    pub placements: Vec<Placement>,
}

impl Schema {
    pub fn new(grid: Arc<DeviceGrid>, placements: Vec<Placement>) -> Self {
        Schema { grid, placements }
    }

    pub fn replicate(grid: Arc<DeviceGrid>) -> Self {
        Schema::new(grid, vec![Placement::Replicate])
    }

    pub fn shard(grid: Arc<DeviceGrid>, dim: usize) -> Self {
        Schema::new(grid, vec![Placement::Shard(dim)])
    }

    /// The single policy of a 1-D grid schema.
    pub fn placement(&self) -> Placement {
        self.placements[0]
    }
}
