use core::fmt;

use ivshmem_mm::MmError;

use crate::irq::IrqError;
use crate::msix::MsixError;
use crate::pci_bar::BarError;

const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvshmemError {
    InvalidArgument,
    NotFound,
    /// The device does not have the BAR/MSI-X layout the driver expects.
    UnexpectedConfiguration,
    MappingFailed,
    AllocationFailed,
    /// The interrupt controller refused a registration.
    DependencyFailed(IrqError),
}

impl IvshmemError {
    /// Negative errno for C-style callers such as the PCI driver table.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument => -EINVAL,
            Self::NotFound | Self::UnexpectedConfiguration | Self::MappingFailed => -ENODEV,
            Self::AllocationFailed => -ENOMEM,
            Self::DependencyFailed(_) => -EIO,
        }
    }
}

impl fmt::Display for IvshmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "no such device"),
            Self::UnexpectedConfiguration => write!(f, "unexpected device configuration"),
            Self::MappingFailed => write!(f, "BAR mapping failed"),
            Self::AllocationFailed => write!(f, "out of memory"),
            Self::DependencyFailed(err) => write!(f, "interrupt controller: {}", err),
        }
    }
}

impl From<BarError> for IvshmemError {
    fn from(_: BarError) -> Self {
        Self::InvalidArgument
    }
}

impl From<MmError> for IvshmemError {
    fn from(err: MmError) -> Self {
        match err {
            MmError::NotAligned { .. } => Self::InvalidArgument,
            MmError::MappingFailed | MmError::InvalidAddress | MmError::AddressSpaceExhausted => {
                Self::MappingFailed
            }
        }
    }
}

impl From<MsixError> for IvshmemError {
    fn from(err: MsixError) -> Self {
        match err {
            MsixError::InvalidEntry(_) => Self::InvalidArgument,
            MsixError::CapabilityTruncated(_)
            | MsixError::UnexpectedBir(_)
            | MsixError::UnexpectedTableBar
            | MsixError::TableOutsideBar => Self::UnexpectedConfiguration,
            MsixError::BarProbe(err) => err.into(),
            MsixError::MappingFailed(err) => err.into(),
        }
    }
}

impl From<IrqError> for IvshmemError {
    fn from(err: IrqError) -> Self {
        Self::DependencyFailed(err)
    }
}
