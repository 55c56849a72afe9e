//! The logical device grid collective operations address.

use serde::{Deserialize, Serialize};

/// Identifier of one participating device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// A 1-D logical arrangement of the participating devices. The grid's size
/// is the world size; collective communication groups are addressed against
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGrid {
    devices: Vec<DeviceId>,
}

impl DeviceGrid {
    /// A grid of `world_size` consecutively numbered devices.
    pub fn new(world_size: usize) -> Self {
        DeviceGrid {
            devices: (0..world_size as u32).map(DeviceId).collect(),
        }
    }

    pub fn world_size(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceGrid;

    #[test]
    fn grid_enumerates_world_size_devices() {
        let grid = DeviceGrid::new(4);
        assert_eq!(grid.world_size(), 4);
        assert_eq!(grid.devices()[3].0, 3);
    }
}
