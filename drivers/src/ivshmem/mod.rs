//! QEMU inter-VM shared memory (ivshmem) PCI driver.
//!
//! BAR2 is the shared memory itself.  A device with an MSI-X capability is a
//! doorbell device: BAR1 holds the vector table and BAR0 a 256-byte register
//! block used to learn this VM's peer id and to interrupt other peers.
//! Devices without MSI-X are plain shared memory.
//!
//! Discovery runs once, serially, from the PCI probe.  Afterwards the query,
//! handler and doorbell calls may come from any CPU.

use core::ffi::c_void;

use spin::{Mutex, Once, RwLock};

use ivshmem_lib::{klog_error, klog_info};
use ivshmem_mm::{MmioMapper, MmioRegion, PageMapper, VirtAddr};

use crate::irq::{IrqController, IrqHandler};
use crate::msix::{MsixVectorTable, msix_message_data, msix_setup};
use crate::pci::{
    PCI_BAR0_OFFSET, PCI_BAR2_OFFSET, PCI_DEVICE_ID_IVSHMEM, PCI_VENDOR_ID_REDHAT_QUMRANET,
    PciConfigSpace, PciDevice, PciDeviceId, PciDriver, PciFunction, pci_register_driver,
};
use crate::pci_bar::{Locatable, pci_probe_bar};

mod config;
mod doorbell;
mod error;
mod registry;

pub use config::{IVSHMEM_MAX_VECTORS_LIMIT, IvshmemConfig};
pub use doorbell::{DoorbellRegs, IVSHMEM_DOORBELL_SIZE, doorbell_value};
pub use error::IvshmemError;
pub use registry::DeviceRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IvshmemType {
    /// Shared memory only.
    Plain,
    /// Shared memory plus MSI-X doorbell.
    Doorbell,
}

#[derive(Debug, Clone, Copy)]
pub enum IvshmemKind {
    Plain,
    Doorbell {
        regs: DoorbellRegs,
        vectors: MsixVectorTable,
        /// This VM's peer id (IVPosition at discovery time).
        doorbell_id: u32,
    },
}

/// One discovered device.
#[derive(Debug, Clone, Copy)]
pub struct IvshmemDevice {
    pub id: u32,
    pub kind: IvshmemKind,
    pub shmem: MmioRegion,
    pub pdev: PciDevice,
}

impl IvshmemDevice {
    pub fn ty(&self) -> IvshmemType {
        match self.kind {
            IvshmemKind::Plain => IvshmemType::Plain,
            IvshmemKind::Doorbell { .. } => IvshmemType::Doorbell,
        }
    }

    pub fn vectors_count(&self) -> u16 {
        match &self.kind {
            IvshmemKind::Plain => 0,
            IvshmemKind::Doorbell { vectors, .. } => vectors.count(),
        }
    }

    pub fn info(&self) -> IvshmemInfo {
        let doorbell_id = match self.kind {
            IvshmemKind::Plain => 0,
            IvshmemKind::Doorbell { doorbell_id, .. } => doorbell_id,
        };
        IvshmemInfo {
            ty: self.ty(),
            addr: self.shmem.virt_base(),
            size: self.shmem.size() as u64,
            doorbell_id,
            vectors_count: self.vectors_count(),
        }
    }
}

/// Public view of a device.  `doorbell_id` and `vectors_count` are 0 for
/// plain devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IvshmemInfo {
    pub ty: IvshmemType,
    pub addr: VirtAddr,
    pub size: u64,
    pub doorbell_id: u32,
    pub vectors_count: u16,
}

impl Default for IvshmemInfo {
    fn default() -> Self {
        Self {
            ty: IvshmemType::Plain,
            addr: VirtAddr::NULL,
            size: 0,
            doorbell_id: 0,
            vectors_count: 0,
        }
    }
}

/// Platform facilities the driver depends on.
#[derive(Clone, Copy)]
pub struct IvshmemServices {
    pub config: &'static dyn PciConfigSpace,
    pub irq: &'static dyn IrqController,
    /// `None` selects flat (identity) BAR addressing.
    pub pager: Option<&'static dyn PageMapper>,
    /// Number of online CPUs; 0 is treated as 1.
    pub cpu_count: fn() -> u32,
}

pub struct IvshmemDriver {
    services: IvshmemServices,
    config: IvshmemConfig,
    mapper: Mutex<MmioMapper>,
    devices: RwLock<DeviceRegistry>,
}

impl IvshmemDriver {
    pub fn new(services: IvshmemServices, config: IvshmemConfig) -> Result<Self, IvshmemError> {
        let mapper = MmioMapper::new(services.pager, VirtAddr::new(config.bar_vaddr_start))?;
        Ok(Self {
            services,
            config,
            mapper: Mutex::new(mapper),
            devices: RwLock::new(DeviceRegistry::new()),
        })
    }

    #[inline]
    pub fn config(&self) -> &IvshmemConfig {
        &self.config
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// Snapshot of device `id`'s record.
    pub fn device(&self, id: u32) -> Option<IvshmemDevice> {
        self.devices.read().get(id).copied()
    }

    /// Bring up one matched PCI function and register it.
    ///
    /// On any failure the registry is left unchanged.  Virtual space already
    /// handed out for this device's BARs is not reclaimed.
    pub fn add_dev(&self, pdev: PciDevice) -> Result<u32, IvshmemError> {
        let func = pdev.function(self.services.config);
        let (kind, shmem) = self.discover(&func).inspect_err(|err| {
            klog_error!("ivshmem: [{}] discovery failed: {}", pdev.addr, err);
        })?;

        let id = self
            .devices
            .write()
            .insert_with(|id| IvshmemDevice {
                id,
                kind,
                shmem,
                pdev,
            })
            .inspect_err(|err| {
                klog_error!("ivshmem: [{}] not registered: {}", pdev.addr, err);
            })?;

        match kind {
            IvshmemKind::Plain => klog_info!(
                "ivshmem: [{}] plain device {}: shmem {:#x} size {:#x}",
                pdev.addr,
                id,
                shmem.virt_base(),
                shmem.size()
            ),
            IvshmemKind::Doorbell {
                vectors,
                doorbell_id,
                ..
            } => klog_info!(
                "ivshmem: [{}] doorbell device {}: shmem {:#x} size {:#x} vectors {} doorbell_id {}",
                pdev.addr,
                id,
                shmem.virt_base(),
                shmem.size(),
                vectors.count(),
                doorbell_id
            ),
        }
        Ok(id)
    }

    fn discover(&self, func: &PciFunction<'_>) -> Result<(IvshmemKind, MmioRegion), IvshmemError> {
        let mut mapper = self.mapper.lock();

        let shmem_bar = pci_probe_bar(func, PCI_BAR2_OFFSET)?;
        if !shmem_bar.is_memory() {
            klog_error!("ivshmem: [{}] BAR2 is not a memory BAR", func.address());
            return Err(IvshmemError::UnexpectedConfiguration);
        }
        let shmem = mapper.map(shmem_bar.base, shmem_bar.size)?;

        let cpu_count = (self.services.cpu_count)();
        let Some(msix) = msix_setup(func, &mut mapper, self.config.max_vectors, cpu_count)?
        else {
            return Ok((IvshmemKind::Plain, shmem));
        };

        let regs_bar = pci_probe_bar(func, PCI_BAR0_OFFSET)?;
        if regs_bar.locatable() != Some(Locatable::Locatable32)
            || regs_bar.size != IVSHMEM_DOORBELL_SIZE
        {
            klog_error!(
                "ivshmem: [{}] unexpected BAR0: {:?} size {:#x}",
                func.address(),
                regs_bar.space,
                regs_bar.size
            );
            return Err(IvshmemError::UnexpectedConfiguration);
        }
        let regs = DoorbellRegs::new(mapper.map(regs_bar.base, regs_bar.size)?)
            .ok_or(IvshmemError::UnexpectedConfiguration)?;

        let kind = IvshmemKind::Doorbell {
            regs,
            vectors: msix.vectors,
            doorbell_id: regs.iv_position(),
        };
        Ok((kind, shmem))
    }

    pub fn get_info(&self, id: u32) -> Result<IvshmemInfo, IvshmemError> {
        let devices = self.devices.read();
        devices
            .get(id)
            .map(IvshmemDevice::info)
            .ok_or(IvshmemError::NotFound)
    }

    /// Fill `out` with the description of device `id`.
    pub fn get_info_into(
        &self,
        id: u32,
        out: Option<&mut IvshmemInfo>,
    ) -> Result<(), IvshmemError> {
        let out = out.ok_or(IvshmemError::InvalidArgument)?;
        *out = self.get_info(id)?;
        Ok(())
    }

    /// Route doorbell `vector` of device `id` to `handler`.
    ///
    /// The handler is registered for IRQ `base_irq + vector`, then the
    /// vector's message data is programmed and the vector unmasked.
    /// Registering a vector again replaces its handler.
    pub fn set_interrupt_handler(
        &self,
        id: u32,
        vector: u16,
        handler: IrqHandler,
        arg: *mut c_void,
    ) -> Result<(), IvshmemError> {
        let devices = self.devices.read();
        let dev = devices.get(id).ok_or(IvshmemError::NotFound)?;
        let IvshmemKind::Doorbell { vectors, .. } = &dev.kind else {
            return Err(IvshmemError::InvalidArgument);
        };
        if vector >= vectors.count() {
            return Err(IvshmemError::InvalidArgument);
        }

        let irq = self
            .config
            .base_irq
            .checked_add(vector as u32)
            .ok_or(IvshmemError::InvalidArgument)?;
        self.services.irq.register(irq, handler, arg).inspect_err(|err| {
            klog_error!("ivshmem: device {} vector {}: IRQ {}: {}", id, vector, irq, err);
        })?;

        let cpu_vector = self.services.irq.delivery_vector(irq);
        vectors.set_data(vector, msix_message_data(cpu_vector))?;
        vectors.unmask(vector)?;
        Ok(())
    }

    /// Ring `vector` on peer `peer_id` through device `id`'s doorbell.
    pub fn interrupt_peer(&self, id: u32, peer_id: u16, vector: u16) -> Result<(), IvshmemError> {
        let devices = self.devices.read();
        let dev = devices.get(id).ok_or(IvshmemError::NotFound)?;
        match &dev.kind {
            IvshmemKind::Doorbell { regs, .. } => {
                regs.ring(peer_id, vector);
                Ok(())
            }
            IvshmemKind::Plain => Err(IvshmemError::InvalidArgument),
        }
    }
}

// =============================================================================
// Global instance and PCI glue
// =============================================================================

static IVSHMEM: Once<IvshmemDriver> = Once::new();

fn driver() -> Result<&'static IvshmemDriver, IvshmemError> {
    IVSHMEM.get().ok_or(IvshmemError::InvalidArgument)
}

/// Install the kernel-wide driver instance.  May only succeed once.
pub fn ivshmem_init(services: IvshmemServices, config: IvshmemConfig) -> Result<(), IvshmemError> {
    if IVSHMEM.is_completed() {
        klog_error!("ivshmem: already initialized");
        return Err(IvshmemError::InvalidArgument);
    }
    let instance = IvshmemDriver::new(services, config)?;
    let mut installed = false;
    IVSHMEM.call_once(|| {
        installed = true;
        instance
    });
    if !installed {
        return Err(IvshmemError::InvalidArgument);
    }
    klog_info!(
        "ivshmem: initialized (max_vectors {}, base_irq {})",
        config.max_vectors,
        config.base_irq
    );
    Ok(())
}

pub fn ivshmem_add_dev(pdev: PciDevice) -> Result<u32, IvshmemError> {
    driver()?.add_dev(pdev)
}

pub fn ivshmem_get_info(id: u32) -> Result<IvshmemInfo, IvshmemError> {
    driver()?.get_info(id)
}

pub fn ivshmem_get_info_into(id: u32, out: Option<&mut IvshmemInfo>) -> Result<(), IvshmemError> {
    driver()?.get_info_into(id, out)
}

pub fn ivshmem_set_interrupt_handler(
    id: u32,
    vector: u16,
    handler: IrqHandler,
    arg: *mut c_void,
) -> Result<(), IvshmemError> {
    driver()?.set_interrupt_handler(id, vector, handler, arg)
}

pub fn ivshmem_interrupt_peer(id: u32, peer_id: u16, vector: u16) -> Result<(), IvshmemError> {
    driver()?.interrupt_peer(id, peer_id, vector)
}

pub fn ivshmem_device_count() -> usize {
    IVSHMEM.get().map_or(0, IvshmemDriver::device_count)
}

static IVSHMEM_IDS: [PciDeviceId; 2] = [
    PciDeviceId::new(PCI_VENDOR_ID_REDHAT_QUMRANET, PCI_DEVICE_ID_IVSHMEM),
    PciDeviceId::ANY,
];

fn ivshmem_pci_add_dev(pdev: PciDevice) -> i32 {
    match ivshmem_add_dev(pdev) {
        Ok(_) => 0,
        Err(err) => err.errno(),
    }
}

pub static IVSHMEM_PCI_DRIVER: PciDriver = PciDriver {
    name: "ivshmem",
    ids: &IVSHMEM_IDS,
    add_dev: ivshmem_pci_add_dev,
};

pub fn ivshmem_register_driver() {
    if pci_register_driver(&IVSHMEM_PCI_DRIVER) != 0 {
        klog_error!("ivshmem: driver registration failed");
    }
}
