use core::fmt;

use spin::Mutex;
use x86_64::instructions::port::Port;

use ivshmem_lib::ports::{PCI_CONFIG_ADDRESS, PCI_CONFIG_DATA};
use ivshmem_lib::{klog_debug, klog_info, klog_warn};

pub use crate::pci_defs::*;

// =============================================================================
// Addressing
// =============================================================================

/// Bus/device/function triple identifying one PCI function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

// =============================================================================
// Configuration Space Access
// =============================================================================

/// Raw access to PCI configuration space.
///
/// Implementors provide aligned 32-bit accesses; the narrower forms are
/// derived from them, with read-modify-write for stores.
pub trait PciConfigSpace: Sync {
    fn read32(&self, addr: PciAddress, offset: u8) -> u32;
    fn write32(&self, addr: PciAddress, offset: u8, value: u32);

    fn read16(&self, addr: PciAddress, offset: u8) -> u16 {
        let value = self.read32(addr, offset & 0xFC);
        ((value >> ((offset & 0x2) * 8)) & 0xFFFF) as u16
    }

    fn read8(&self, addr: PciAddress, offset: u8) -> u8 {
        let value = self.read32(addr, offset & 0xFC);
        ((value >> ((offset & 0x3) * 8)) & 0xFF) as u8
    }

    fn write16(&self, addr: PciAddress, offset: u8, value: u16) {
        let dword = self.read32(addr, offset & 0xFC);
        let shift = (offset & 0x2) * 8;
        let mask = !(0xFFFFu32 << shift);
        let new_dword = (dword & mask) | ((value as u32) << shift);
        self.write32(addr, offset & 0xFC, new_dword);
    }

    fn write8(&self, addr: PciAddress, offset: u8, value: u8) {
        let dword = self.read32(addr, offset & 0xFC);
        let shift = (offset & 0x3) * 8;
        let mask = !(0xFFu32 << shift);
        let new_dword = (dword & mask) | ((value as u32) << shift);
        self.write32(addr, offset & 0xFC, new_dword);
    }
}

/// Compute the 32-bit address for legacy PCI configuration port I/O.
#[inline(always)]
fn pci_pio_config_addr(addr: PciAddress, offset: u8) -> u32 {
    0x8000_0000
        | ((addr.bus as u32) << 16)
        | ((addr.device as u32) << 11)
        | ((addr.function as u32) << 8)
        | ((offset as u32) & 0xFC)
}

struct PioPorts {
    address: Port<u32>,
    data: Port<u32>,
}

/// Legacy configuration mechanism #1 (ports 0xCF8/0xCFC).
///
/// The address/data pair is a shared resource, so each access holds the
/// port lock across both halves.
pub struct PortIoConfigSpace {
    ports: Mutex<PioPorts>,
}

impl PortIoConfigSpace {
    pub const fn new() -> Self {
        Self {
            ports: Mutex::new(PioPorts {
                address: Port::new(PCI_CONFIG_ADDRESS),
                data: Port::new(PCI_CONFIG_DATA),
            }),
        }
    }
}

impl Default for PortIoConfigSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl PciConfigSpace for PortIoConfigSpace {
    fn read32(&self, addr: PciAddress, offset: u8) -> u32 {
        let mut ports = self.ports.lock();
        unsafe {
            ports.address.write(pci_pio_config_addr(addr, offset));
            ports.data.read()
        }
    }

    fn write32(&self, addr: PciAddress, offset: u8, value: u32) {
        let mut ports = self.ports.lock();
        unsafe {
            ports.address.write(pci_pio_config_addr(addr, offset));
            ports.data.write(value);
        }
    }
}

/// Port I/O config space shared by the whole kernel.
pub static PCI_PORT_IO: PortIoConfigSpace = PortIoConfigSpace::new();

// =============================================================================
// Function Handle
// =============================================================================

/// A config-space accessor bound to one function.
#[derive(Clone, Copy)]
pub struct PciFunction<'a> {
    cfg: &'a dyn PciConfigSpace,
    addr: PciAddress,
}

macro_rules! impl_function_accessors {
    ($($bits:literal => $ty:ty),* $(,)?) => {
        paste::paste! {
            $(
                #[inline]
                pub fn [<read $bits>](&self, offset: u8) -> $ty {
                    self.cfg.[<read $bits>](self.addr, offset)
                }

                #[inline]
                pub fn [<write $bits>](&self, offset: u8, value: $ty) {
                    self.cfg.[<write $bits>](self.addr, offset, value)
                }
            )*
        }
    };
}

impl<'a> PciFunction<'a> {
    pub fn new(cfg: &'a dyn PciConfigSpace, addr: PciAddress) -> Self {
        Self { cfg, addr }
    }

    #[inline]
    pub fn address(&self) -> PciAddress {
        self.addr
    }

    impl_function_accessors!(8 => u8, 16 => u16, 32 => u32);

    pub fn vendor_id(&self) -> u16 {
        self.read16(PCI_VENDOR_ID_OFFSET)
    }

    pub fn device_id(&self) -> u16 {
        self.read16(PCI_DEVICE_ID_OFFSET)
    }

    pub fn header_type(&self) -> u8 {
        self.read8(PCI_HEADER_TYPE_OFFSET)
    }

    pub fn status(&self) -> PciStatus {
        PciStatus::from_bits_retain(self.read16(PCI_STATUS_OFFSET))
    }

    pub fn command(&self) -> PciCommand {
        PciCommand::from_bits_retain(self.read16(PCI_COMMAND_OFFSET))
    }

    pub fn set_command(&self, command: PciCommand) {
        self.write16(PCI_COMMAND_OFFSET, command.bits());
    }

    /// Iterate over the function's capability list.
    pub fn capabilities(&self) -> PciCapabilityIter<'a> {
        PciCapabilityIter::new(*self)
    }

    /// Config-space offset of the first capability with `cap_id`.
    pub fn find_capability(&self, cap_id: u8) -> Option<u8> {
        pci_find_capability(self, cap_id)
    }
}

// =============================================================================
// PCI Capability List Walking
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciCapability {
    pub offset: u8,
    pub id: u8,
}

/// Iterator over PCI capabilities in a function's configuration space.
///
/// Walks the capability linked list starting from the Capabilities Pointer
/// (offset 0x34). Each capability header contains an 8-bit ID and a pointer
/// to the next capability.
///
/// # Infinite-loop protection
///
/// A guard counter limits traversal to [`Self::MAX_CAPS`] entries to protect
/// against malformed capability lists on buggy hardware.
pub struct PciCapabilityIter<'a> {
    func: PciFunction<'a>,
    next_ptr: u8,
    /// Remaining entries before we give up (infinite-loop guard).
    remaining: u8,
}

impl<'a> PciCapabilityIter<'a> {
    /// Maximum capabilities to visit before assuming a malformed list.
    ///
    /// The standard 256-byte config space can fit at most ~60 entries
    /// (4 bytes minimum per capability, starting around offset 0x40).
    /// 48 matches Linux's `PCI_FIND_CAP_TTL`.
    pub const MAX_CAPS: u8 = 48;

    /// Returns an empty iterator if the Status register does not advertise a
    /// capabilities list.
    pub fn new(func: PciFunction<'a>) -> Self {
        let first_ptr = if func.status().contains(PciStatus::CAP_LIST) {
            func.read8(PCI_CAP_PTR_OFFSET) & PCI_CAP_PTR_MASK
        } else {
            0
        };

        Self {
            func,
            next_ptr: first_ptr,
            remaining: Self::MAX_CAPS,
        }
    }
}

impl Iterator for PciCapabilityIter<'_> {
    type Item = PciCapability;

    fn next(&mut self) -> Option<PciCapability> {
        if self.next_ptr == 0 || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let offset = self.next_ptr;
        let header = self.func.read16(offset);
        let id = (header & 0xFF) as u8;
        self.next_ptr = ((header >> 8) as u8) & PCI_CAP_PTR_MASK;

        Some(PciCapability { offset, id })
    }
}

/// Find the first PCI capability with the given ID.
///
/// Returns the config-space byte offset of the capability header,
/// or `None` if the function doesn't advertise that capability.
pub fn pci_find_capability(func: &PciFunction<'_>, cap_id: u8) -> Option<u8> {
    func.capabilities()
        .find(|cap| cap.id == cap_id)
        .map(|cap| cap.offset)
}

// =============================================================================
// Devices and Drivers
// =============================================================================

/// A discovered PCI function as handed to drivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciDevice {
    pub addr: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
}

impl PciDevice {
    pub fn function<'a>(&self, cfg: &'a dyn PciConfigSpace) -> PciFunction<'a> {
        PciFunction::new(cfg, self.addr)
    }
}

/// One entry of a driver's id table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

impl PciDeviceId {
    pub const fn new(vendor_id: u16, device_id: u16) -> Self {
        Self {
            vendor_id,
            device_id,
        }
    }

    /// Wildcard entry; terminates an id table.
    pub const ANY: Self = Self::new(PCI_ANY_ID, PCI_ANY_ID);

    #[inline]
    pub fn is_terminator(&self) -> bool {
        self.vendor_id == PCI_ANY_ID
    }
}

pub struct PciDriver {
    pub name: &'static str,
    /// Supported ids, ending with [`PciDeviceId::ANY`].
    pub ids: &'static [PciDeviceId],
    /// Returns 0 once the device is bound, a negative errno otherwise.
    pub add_dev: fn(PciDevice) -> i32,
}

impl PciDriver {
    pub fn matches(&self, dev: &PciDevice) -> bool {
        self.ids
            .iter()
            .take_while(|id| !id.is_terminator())
            .any(|id| id.vendor_id == dev.vendor_id && id.device_id == dev.device_id)
    }
}

/// Maximum registered PCI drivers.
pub const PCI_DRIVER_MAX: usize = 16;

struct PciDriverRegistry {
    drivers: [Option<&'static PciDriver>; PCI_DRIVER_MAX],
    count: usize,
}

static DRIVER_REGISTRY: Mutex<PciDriverRegistry> = Mutex::new(PciDriverRegistry {
    drivers: [None; PCI_DRIVER_MAX],
    count: 0,
});

pub fn pci_register_driver(driver: &'static PciDriver) -> i32 {
    let mut registry = DRIVER_REGISTRY.lock();
    let idx = registry.count;
    if idx >= PCI_DRIVER_MAX {
        return -1;
    }
    klog_info!("PCI: Registered driver {}", driver.name);
    registry.drivers[idx] = Some(driver);
    registry.count = idx + 1;
    0
}

// =============================================================================
// Bus Walk
// =============================================================================

struct PciBusWalker<'a> {
    cfg: &'a dyn PciConfigSpace,
    bus_visited: [bool; PCI_MAX_BUSES],
}

impl PciBusWalker<'_> {
    fn probe_function(&mut self, addr: PciAddress, visit: &mut dyn FnMut(PciDevice)) {
        let func = PciFunction::new(self.cfg, addr);
        let vendor_id = func.vendor_id();
        if vendor_id == PCI_VENDOR_ID_INVALID {
            return;
        }
        let device_id = func.device_id();

        klog_debug!(
            "PCI: [{}] VID=0x{:04x} DID=0x{:04x}",
            addr,
            vendor_id,
            device_id
        );
        visit(PciDevice {
            addr,
            vendor_id,
            device_id,
        });

        if func.header_type() & PCI_HEADER_TYPE_MASK == PCI_HEADER_TYPE_BRIDGE {
            let secondary = func.read8(PCI_SECONDARY_BUS_OFFSET);
            self.scan_bus(secondary, visit);
        }
    }

    fn scan_bus(&mut self, bus: u8, visit: &mut dyn FnMut(PciDevice)) {
        if self.bus_visited[bus as usize] {
            return;
        }
        self.bus_visited[bus as usize] = true;

        for device in 0..PCI_MAX_DEVICES_PER_BUS {
            let func0 = PciFunction::new(self.cfg, PciAddress::new(bus, device, 0));
            if func0.vendor_id() == PCI_VENDOR_ID_INVALID {
                continue;
            }
            self.probe_function(func0.address(), visit);

            if func0.header_type() & PCI_HEADER_TYPE_MULTIFUNCTION != 0 {
                for function in 1..PCI_MAX_FUNCTIONS {
                    self.probe_function(PciAddress::new(bus, device, function), visit);
                }
            }
        }
    }
}

/// Visit every present function reachable from bus 0.
pub fn pci_for_each_device(cfg: &dyn PciConfigSpace, visit: &mut dyn FnMut(PciDevice)) {
    let mut walker = PciBusWalker {
        cfg,
        bus_visited: [false; PCI_MAX_BUSES],
    };
    walker.scan_bus(0, visit);

    // Multi-function host bridge: function N owns bus N.
    let host = PciFunction::new(cfg, PciAddress::new(0, 0, 0));
    if host.vendor_id() != PCI_VENDOR_ID_INVALID
        && host.header_type() & PCI_HEADER_TYPE_MULTIFUNCTION != 0
    {
        for function in 1..PCI_MAX_FUNCTIONS {
            let func = PciFunction::new(cfg, PciAddress::new(0, 0, function));
            if func.vendor_id() != PCI_VENDOR_ID_INVALID {
                walker.scan_bus(function, visit);
            }
        }
    }
}

fn probe_with_drivers<'d, I>(cfg: &dyn PciConfigSpace, drivers: I) -> usize
where
    I: Iterator<Item = &'d PciDriver> + Clone,
{
    let mut bound = 0usize;
    pci_for_each_device(cfg, &mut |dev| {
        let Some(drv) = drivers.clone().find(|drv| drv.matches(&dev)) else {
            return;
        };
        match (drv.add_dev)(dev) {
            0 => bound += 1,
            rc => klog_warn!("PCI: driver {} rejected {}: errno {}", drv.name, dev.addr, rc),
        }
    });
    klog_info!("PCI: Driver probe complete. Devices bound: {}", bound);
    bound
}

/// Walk the bus and hand every device to the first matching driver.
///
/// Returns the number of devices a driver accepted.
pub fn pci_probe_drivers_with(cfg: &dyn PciConfigSpace, drivers: &[&PciDriver]) -> usize {
    probe_with_drivers(cfg, drivers.iter().copied())
}

/// Probe using every driver registered with [`pci_register_driver`].
pub fn pci_probe_drivers(cfg: &dyn PciConfigSpace) -> usize {
    let (drivers, count) = {
        let registry = DRIVER_REGISTRY.lock();
        (registry.drivers, registry.count)
    };
    probe_with_drivers(cfg, drivers.iter().take(count).flatten().copied())
}
