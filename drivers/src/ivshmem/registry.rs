use alloc::vec::Vec;

use super::IvshmemDevice;
use super::error::IvshmemError;

/// Discovered devices in discovery order.  A device's id is its index.
///
/// Append-only: records are never removed, so ids stay valid for the life
/// of the kernel.
pub struct DeviceRegistry {
    devices: Vec<IvshmemDevice>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Append a record built for the next id.
    ///
    /// Storage is reserved before `build` runs, so on failure nothing is
    /// inserted.
    pub fn insert_with(
        &mut self,
        build: impl FnOnce(u32) -> IvshmemDevice,
    ) -> Result<u32, IvshmemError> {
        let id = u32::try_from(self.devices.len()).map_err(|_| IvshmemError::AllocationFailed)?;
        self.devices
            .try_reserve(1)
            .map_err(|_| IvshmemError::AllocationFailed)?;
        self.devices.push(build(id));
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<&IvshmemDevice> {
        self.devices.get(id as usize)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
