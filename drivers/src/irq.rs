//! Interrupt-controller seam.
//!
//! Drivers request platform IRQ numbers through [`IrqController`]; the
//! platform decides how an IRQ becomes a CPU vector.  [`IrqTable`] is a
//! ready-made controller for platforms that dispatch from a flat table.

use core::ffi::c_void;
use core::fmt;

use spin::Mutex;

use ivshmem_lib::{klog_debug, klog_info};

/// First CPU vector used for external interrupts (0..31 are exceptions).
pub const IRQ_BASE_VECTOR: u32 = 32;

/// Interrupt handler.  Returns `true` if the interrupt was handled.
pub type IrqHandler = fn(arg: *mut c_void) -> bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// The IRQ number is outside what the controller manages.
    InvalidIrq(u32),
    /// The controller has no room for another handler.
    NoFreeSlot,
    /// The controller has not been brought up.
    Unavailable,
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIrq(irq) => write!(f, "IRQ {} out of range", irq),
            Self::NoFreeSlot => write!(f, "no free handler slot"),
            Self::Unavailable => write!(f, "interrupt controller unavailable"),
        }
    }
}

pub trait IrqController: Sync {
    /// Install `handler` for `irq`, replacing any previous handler.
    fn register(&self, irq: u32, handler: IrqHandler, arg: *mut c_void) -> Result<(), IrqError>;

    /// CPU vector an MSI for `irq` must carry.
    fn delivery_vector(&self, irq: u32) -> u8 {
        IRQ_BASE_VECTOR.wrapping_add(irq) as u8
    }
}

// =============================================================================
// Table-based controller
// =============================================================================

#[derive(Clone, Copy)]
struct IrqEntry {
    handler: Option<IrqHandler>,
    context: *mut c_void,
    count: u64,
}

impl IrqEntry {
    const fn new() -> Self {
        Self {
            handler: None,
            context: core::ptr::null_mut(),
            count: 0,
        }
    }
}

// SAFETY: `context` is an opaque cookie handed back to the handler; the table
// never dereferences it.
unsafe impl Send for IrqEntry {}

/// Flat table of `LINES` handlers indexed by IRQ number.
pub struct IrqTable<const LINES: usize> {
    entries: Mutex<[IrqEntry; LINES]>,
}

impl<const LINES: usize> IrqTable<LINES> {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new([IrqEntry::new(); LINES]),
        }
    }

    /// Run the handler for `irq`.  Returns `false` if none is installed or
    /// the handler did not claim the interrupt.
    pub fn dispatch(&self, irq: u32) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(irq as usize) else {
                return false;
            };
            entry.count += 1;
            *entry
        };
        match entry.handler {
            Some(handler) => handler(entry.context),
            None => {
                klog_debug!("IRQ: Unhandled IRQ {}", irq);
                false
            }
        }
    }

    pub fn count(&self, irq: u32) -> u64 {
        self.entries
            .lock()
            .get(irq as usize)
            .map_or(0, |entry| entry.count)
    }
}

impl<const LINES: usize> Default for IrqTable<LINES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const LINES: usize> IrqController for IrqTable<LINES> {
    fn register(&self, irq: u32, handler: IrqHandler, arg: *mut c_void) -> Result<(), IrqError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(irq as usize)
            .ok_or(IrqError::InvalidIrq(irq))?;
        entry.handler = Some(handler);
        entry.context = arg;
        klog_info!("IRQ: Registered handler for IRQ {}", irq);
        Ok(())
    }
}
