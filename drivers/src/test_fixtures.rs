//! In-memory stand-ins for the hardware the driver talks to.

use core::ffi::c_void;

use std::alloc::{Layout, alloc_zeroed};
use std::boxed::Box;
use std::collections::BTreeMap;
use std::vec::Vec;

use spin::Mutex;

use ivshmem_mm::{MmError, MmResult, PAGE_SIZE_4KB, PageFlags, PageMapper, PhysAddr, VirtAddr};

use crate::irq::{IrqController, IrqError, IrqHandler};
use crate::pci::{
    PCI_BAR_IO_SPACE, PCI_BAR_MEM_PREFETCHABLE, PCI_BAR_MEM_TYPE_64, PCI_BAR0_OFFSET,
    PCI_BAR5_OFFSET, PCI_CAP_ID_MSIX, PCI_CAP_PTR_OFFSET, PCI_COMMAND_OFFSET,
    PCI_HEADER_TYPE_OFFSET, PCI_STATUS_OFFSET, PciAddress, PciCommand, PciConfigSpace, PciStatus,
};
use crate::msix::{MSIX_REG_CONTROL, MSIX_REG_TABLE_OFFSET};

// =============================================================================
// Config space
// =============================================================================

const CONFIG_DWORDS: usize = 64;
const BAR_SLOTS: usize = 6;

/// Which bits of a BAR register software may change.
#[derive(Clone, Copy)]
struct BarEmulation {
    writable: u32,
}

struct FakeFunction {
    regs: [u32; CONFIG_DWORDS],
    bars: [Option<BarEmulation>; BAR_SLOTS],
    sized_with_decode_off: [bool; BAR_SLOTS],
}

impl FakeFunction {
    fn new() -> Self {
        Self {
            regs: [0; CONFIG_DWORDS],
            bars: [None; BAR_SLOTS],
            sized_with_decode_off: [false; BAR_SLOTS],
        }
    }
}

fn bar_slot(offset: u8) -> Option<usize> {
    if (PCI_BAR0_OFFSET..=PCI_BAR5_OFFSET).contains(&offset) && offset % 4 == 0 {
        Some(((offset - PCI_BAR0_OFFSET) / 4) as usize)
    } else {
        None
    }
}

#[derive(Default)]
struct FakeConfigState {
    functions: BTreeMap<PciAddress, FakeFunction>,
    command_log: Vec<PciCommand>,
}

/// Configuration space for a handful of functions.
///
/// Absent functions read as all-ones.  BARs installed with the `set_*_bar`
/// helpers answer the all-ones sizing write like real hardware.  Writes to
/// the command register are logged.
#[derive(Default)]
pub struct FakeConfigSpace {
    state: Mutex<FakeConfigState>,
}

impl FakeConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaked() -> &'static Self {
        Box::leak(Box::new(Self::new()))
    }

    fn with_function<R>(&self, addr: PciAddress, f: impl FnOnce(&mut FakeFunction) -> R) -> R {
        let mut state = self.state.lock();
        let func = state
            .functions
            .get_mut(&addr)
            .expect("function not installed in fake config space");
        f(func)
    }

    pub fn add_function(&self, addr: PciAddress, vendor_id: u16, device_id: u16) {
        let mut func = FakeFunction::new();
        func.regs[0] = vendor_id as u32 | ((device_id as u32) << 16);
        self.state.lock().functions.insert(addr, func);
    }

    /// Store without side effects.
    pub fn poke32(&self, addr: PciAddress, offset: u8, value: u32) {
        self.with_function(addr, |func| func.regs[(offset / 4) as usize] = value);
    }

    pub fn poke16(&self, addr: PciAddress, offset: u8, value: u16) {
        let shift = (offset & 0x2) * 8;
        self.with_function(addr, |func| {
            let reg = &mut func.regs[(offset / 4) as usize];
            *reg = (*reg & !(0xFFFF << shift)) | ((value as u32) << shift);
        });
    }

    pub fn poke8(&self, addr: PciAddress, offset: u8, value: u8) {
        let shift = (offset & 0x3) * 8;
        self.with_function(addr, |func| {
            let reg = &mut func.regs[(offset / 4) as usize];
            *reg = (*reg & !(0xFF << shift)) | ((value as u32) << shift);
        });
    }

    pub fn peek32(&self, addr: PciAddress, offset: u8) -> u32 {
        self.with_function(addr, |func| func.regs[(offset / 4) as usize])
    }

    pub fn peek16(&self, addr: PciAddress, offset: u8) -> u16 {
        (self.peek32(addr, offset & 0xFC) >> ((offset & 0x2) * 8)) as u16
    }

    pub fn set_status(&self, addr: PciAddress, status: PciStatus) {
        self.poke16(addr, PCI_STATUS_OFFSET, status.bits());
    }

    pub fn set_header_type(&self, addr: PciAddress, header_type: u8) {
        self.poke8(addr, PCI_HEADER_TYPE_OFFSET, header_type);
    }

    /// Build a capability list.  Each entry is `(pointer, id)`; pointers may
    /// carry reserved low bits, which the list stores unmasked.
    pub fn set_capabilities(&self, addr: PciAddress, caps: &[(u8, u8)]) {
        self.set_status(addr, PciStatus::CAP_LIST);
        let first = caps.first().map_or(0, |&(ptr, _)| ptr);
        self.poke8(addr, PCI_CAP_PTR_OFFSET, first);
        for (idx, &(ptr, id)) in caps.iter().enumerate() {
            let next = caps.get(idx + 1).map_or(0, |&(ptr, _)| ptr);
            let offset = ptr & 0xFC;
            self.poke8(addr, offset, id);
            self.poke8(addr, offset + 1, next);
        }
    }

    /// Single MSI-X capability at `cap` with the given table-size field and
    /// table offset/BIR dword.
    pub fn set_msix(&self, addr: PciAddress, cap: u8, table_size_field: u16, table_dword: u32) {
        self.set_capabilities(addr, &[(cap, PCI_CAP_ID_MSIX)]);
        self.poke16(addr, cap + MSIX_REG_CONTROL, table_size_field);
        self.poke32(addr, cap + MSIX_REG_TABLE_OFFSET, table_dword);
    }

    fn install_bar(&self, addr: PciAddress, offset: u8, value: u32, writable: u32) {
        let slot = bar_slot(offset).expect("BAR offset");
        self.with_function(addr, |func| {
            func.regs[(offset / 4) as usize] = value;
            func.bars[slot] = Some(BarEmulation { writable });
        });
    }

    pub fn set_mem_bar32(&self, addr: PciAddress, offset: u8, base: u32, size: u32, prefetch: bool) {
        let flags = if prefetch { PCI_BAR_MEM_PREFETCHABLE } else { 0 };
        self.install_bar(addr, offset, base | flags, !(size - 1) & !0xF);
    }

    pub fn set_mem_bar64(&self, addr: PciAddress, offset: u8, base: u64, size: u64) {
        let mask = !(size - 1);
        self.install_bar(
            addr,
            offset,
            base as u32 | PCI_BAR_MEM_TYPE_64,
            mask as u32 & !0xF,
        );
        self.install_bar(addr, offset + 4, (base >> 32) as u32, (mask >> 32) as u32);
    }

    pub fn set_io_bar(&self, addr: PciAddress, offset: u8, base: u32, size: u32) {
        self.install_bar(addr, offset, base | PCI_BAR_IO_SPACE, !(size - 1) & !0x3);
    }

    pub fn clear_command_log(&self) {
        self.state.lock().command_log.clear();
    }

    pub fn command_log(&self) -> Vec<PciCommand> {
        self.state.lock().command_log.clone()
    }

    pub fn bar_probed_with_decode_off(&self, addr: PciAddress, offset: u8) -> bool {
        let slot = bar_slot(offset).expect("BAR offset");
        self.with_function(addr, |func| func.sized_with_decode_off[slot])
    }
}

impl PciConfigSpace for FakeConfigSpace {
    fn read32(&self, addr: PciAddress, offset: u8) -> u32 {
        let state = self.state.lock();
        state
            .functions
            .get(&addr)
            .map_or(0xFFFF_FFFF, |func| func.regs[(offset / 4) as usize])
    }

    fn write32(&self, addr: PciAddress, offset: u8, value: u32) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(func) = state.functions.get_mut(&addr) else {
            return;
        };
        let idx = (offset / 4) as usize;

        if offset & 0xFC == PCI_COMMAND_OFFSET {
            state
                .command_log
                .push(PciCommand::from_bits_retain(value as u16));
        }

        match bar_slot(offset & 0xFC).and_then(|slot| func.bars[slot].map(|bar| (slot, bar))) {
            Some((slot, bar)) => {
                if value == 0xFFFF_FFFF {
                    let command = PciCommand::from_bits_retain(func.regs[1] as u16);
                    func.sized_with_decode_off[slot] = !command.intersects(PciCommand::DECODE);
                }
                func.regs[idx] = (value & bar.writable) | (func.regs[idx] & !bar.writable);
            }
            None => func.regs[idx] = value,
        }
    }
}

// =============================================================================
// Interrupt controller
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    pub irq: u32,
    pub arg: usize,
}

#[derive(Default)]
struct FakeIrqState {
    handlers: BTreeMap<u32, (IrqHandler, usize)>,
    log: Vec<Registration>,
    fail: Option<IrqError>,
}

/// Records registrations; can be told to refuse them.
#[derive(Default)]
pub struct FakeIrqController {
    state: Mutex<FakeIrqState>,
}

impl FakeIrqController {
    pub fn leaked() -> &'static Self {
        Box::leak(Box::new(Self::default()))
    }

    pub fn fail_with(&self, err: Option<IrqError>) {
        self.state.lock().fail = err;
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.state.lock().log.clone()
    }

    /// Invoke the handler registered for `irq`, as the platform would.
    pub fn fire(&self, irq: u32) -> Option<bool> {
        let (handler, arg) = *self.state.lock().handlers.get(&irq)?;
        Some(handler(arg as *mut c_void))
    }
}

impl IrqController for FakeIrqController {
    fn register(&self, irq: u32, handler: IrqHandler, arg: *mut c_void) -> Result<(), IrqError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail {
            return Err(err);
        }
        state.handlers.insert(irq, (handler, arg as usize));
        state.log.push(Registration {
            irq,
            arg: arg as usize,
        });
        Ok(())
    }
}

// =============================================================================
// Page mapper
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapCall {
    pub virt: u64,
    pub phys: u64,
    pub pages: u64,
    pub flags: PageFlags,
}

#[derive(Default)]
struct FakePagerState {
    calls: Vec<MapCall>,
    /// Device register contents keyed by physical address, copied into
    /// every mapping that covers them.
    seeds: BTreeMap<u64, u32>,
    fail: bool,
}

/// Maps BARs into a private, zeroed, page-aligned arena.
///
/// The virtual-address cursor of the driver must start at [`Self::base`];
/// any request outside the arena is refused.
pub struct FakePageMapper {
    base: u64,
    len: u64,
    state: Mutex<FakePagerState>,
}

impl FakePageMapper {
    pub const ARENA_SIZE: usize = 8 * 1024 * 1024;

    pub fn leaked() -> &'static Self {
        let layout = Layout::from_size_align(Self::ARENA_SIZE, PAGE_SIZE_4KB as usize)
            .expect("arena layout");
        let arena = unsafe { alloc_zeroed(layout) };
        assert!(!arena.is_null(), "arena allocation failed");
        Box::leak(Box::new(Self {
            base: arena as u64,
            len: Self::ARENA_SIZE as u64,
            state: Mutex::new(FakePagerState::default()),
        }))
    }

    pub fn base(&self) -> VirtAddr {
        VirtAddr::new(self.base)
    }

    pub fn seed32(&self, phys: u64, value: u32) {
        self.state.lock().seeds.insert(phys, value);
    }

    pub fn set_fail(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    pub fn calls(&self) -> Vec<MapCall> {
        self.state.lock().calls.clone()
    }
}

impl PageMapper for FakePageMapper {
    fn map(&self, virt: VirtAddr, phys: PhysAddr, pages: u64, flags: PageFlags) -> MmResult<()> {
        let mut state = self.state.lock();
        state.calls.push(MapCall {
            virt: virt.as_u64(),
            phys: phys.as_u64(),
            pages,
            flags,
        });
        if state.fail {
            return Err(MmError::MappingFailed);
        }

        let span = pages * PAGE_SIZE_4KB;
        let start = virt.as_u64();
        if start < self.base || start + span > self.base + self.len {
            return Err(MmError::InvalidAddress);
        }

        let phys_start = phys.as_u64();
        for (&seed_phys, &value) in state.seeds.range(phys_start..phys_start + span) {
            let target = (start + (seed_phys - phys_start)) as *mut u32;
            unsafe { target.write_volatile(value) };
        }
        Ok(())
    }
}
