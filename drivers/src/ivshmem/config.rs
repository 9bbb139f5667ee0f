use ivshmem_lib::klog_warn;
use ivshmem_mm::PAGE_SIZE_4KB;

use crate::msix::MSIX_CTRL_TABLE_SIZE_MASK;

const DEFAULT_MAX_VECTORS: u16 = 8;
const DEFAULT_BASE_IRQ: u32 = 1;
const DEFAULT_BAR_VADDR_START: u64 = 0x1_0000_0000;

/// Most vectors a single MSI-X table can describe.
pub const IVSHMEM_MAX_VECTORS_LIMIT: u16 = MSIX_CTRL_TABLE_SIZE_MASK + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IvshmemConfig {
    /// Upper bound on MSI-X vectors used per device.
    pub max_vectors: u16,
    /// IRQ requested for vector 0; vector `n` uses `base_irq + n`.
    pub base_irq: u32,
    /// First virtual address handed out for BAR mappings (paged mode).
    pub bar_vaddr_start: u64,
}

impl Default for IvshmemConfig {
    fn default() -> Self {
        Self {
            max_vectors: DEFAULT_MAX_VECTORS,
            base_irq: DEFAULT_BASE_IRQ,
            bar_vaddr_start: DEFAULT_BAR_VADDR_START,
        }
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse::<u64>().ok(),
    }
}

impl IvshmemConfig {
    /// Defaults overridden by `ivshmem.*` tokens of the kernel command line.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_cmdline(cmdline: Option<&str>) -> Self {
        let mut cfg = Self::default();
        let Some(cmdline) = cmdline else {
            return cfg;
        };

        for token in cmdline.split_whitespace() {
            if let Some(value) = token.strip_prefix("ivshmem.max_vectors=") {
                match parse_u64(value) {
                    Some(parsed) => {
                        let clamped = parsed.clamp(1, IVSHMEM_MAX_VECTORS_LIMIT as u64);
                        cfg.max_vectors = clamped as u16;
                    }
                    None => klog_warn!("ivshmem: ignoring max_vectors={}", value),
                }
            } else if let Some(value) = token.strip_prefix("ivshmem.base_irq=") {
                match parse_u64(value).and_then(|parsed| u32::try_from(parsed).ok()) {
                    Some(parsed) => cfg.base_irq = parsed,
                    None => klog_warn!("ivshmem: ignoring base_irq={}", value),
                }
            } else if let Some(value) = token.strip_prefix("ivshmem.bar_vaddr=") {
                match parse_u64(value).filter(|addr| addr % PAGE_SIZE_4KB == 0) {
                    Some(parsed) => cfg.bar_vaddr_start = parsed,
                    None => klog_warn!("ivshmem: ignoring bar_vaddr={}", value),
                }
            }
        }
        cfg
    }
}
