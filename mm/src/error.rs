//! Error type for the memory-mapping layer.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// The page-mapping collaborator rejected the request.
    MappingFailed,
    InvalidAddress,
    NotAligned { address: u64, required: u64 },
    /// The virtual-address cursor would wrap.
    AddressSpaceExhausted,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MappingFailed => write!(f, "page mapping operation failed"),
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::NotAligned { address, required } => {
                write!(f, "address {:#x} not aligned to {:#x}", address, required)
            }
            Self::AddressSpaceExhausted => write!(f, "MMIO virtual address space exhausted"),
        }
    }
}

/// Convenience result type for memory management operations.
pub type MmResult<T = ()> = Result<T, MmError>;
