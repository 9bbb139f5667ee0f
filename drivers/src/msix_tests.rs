//! MSI-X setup tests against an in-memory function.
//!
//! These tests verify:
//! - Functions without the capability are reported as such
//! - Table size decoding and clamping to the caller's limit
//! - BIR and BAR1 layout validation
//! - Setup order: all vectors masked, then enable, then addresses
//! - Per-entry accessors stay within the configured vector count

use std::vec;

use ivshmem_mm::{MmioMapper, MmioRegion, PhysAddr, VirtAddr};

use crate::msix::*;
use crate::pci::{PCI_BAR1_OFFSET, PciAddress, PciFunction};
use crate::test_fixtures::{FakeConfigSpace, FakePageMapper};

const ADDR: PciAddress = PciAddress::new(0, 3, 0);
const CAP: u8 = 0x50;
const TABLE_PHYS: u32 = 0xFEBD_1000;

fn function_with_msix(table_size_field: u16, table_dword: u32) -> &'static FakeConfigSpace {
    let cfg = FakeConfigSpace::leaked();
    cfg.add_function(ADDR, 0x1AF4, 0x1110);
    cfg.set_mem_bar32(ADDR, PCI_BAR1_OFFSET, TABLE_PHYS, 0x1000, false);
    cfg.set_msix(ADDR, CAP, table_size_field, table_dword);
    cfg
}

fn paged_mapper() -> (&'static FakePageMapper, MmioMapper) {
    let pager = FakePageMapper::leaked();
    (pager, MmioMapper::paged(pager, pager.base()))
}

#[test]
fn test_no_capability_is_not_an_error() {
    let cfg = FakeConfigSpace::leaked();
    cfg.add_function(ADDR, 0x1AF4, 0x1110);
    let func = PciFunction::new(cfg, ADDR);
    let (pager, mut mapper) = paged_mapper();

    assert!(matches!(msix_setup(&func, &mut mapper, 8, 1), Ok(None)));
    assert!(pager.calls().is_empty());
}

#[test]
fn test_setup_masks_enables_and_targets_cpus() {
    let cfg = function_with_msix(5, 0x1);
    let func = PciFunction::new(cfg, ADDR);
    let (_pager, mut mapper) = paged_mapper();

    let msix = msix_setup(&func, &mut mapper, 8, 3)
        .expect("setup")
        .expect("capability");
    assert_eq!(msix.cap_offset, CAP);
    assert_eq!(msix.table_size, 6);
    assert_eq!(msix.vectors_count(), 6);

    let control = cfg.peek16(ADDR, CAP + MSIX_REG_CONTROL);
    assert_eq!(control & MSIX_CTRL_ENABLE, MSIX_CTRL_ENABLE);
    assert_eq!(control & MSIX_CTRL_TABLE_SIZE_MASK, 5);

    for vector in 0..6u16 {
        assert_eq!(msix.vectors.is_masked(vector), Some(true));
        let expected = msix_message_address(vector as u32 % 3) as u64;
        assert_eq!(msix.vectors.read_address(vector), Some(expected));
    }
}

#[test]
fn test_zero_cpus_treated_as_one() {
    let cfg = function_with_msix(1, 0x1);
    let func = PciFunction::new(cfg, ADDR);
    let (_pager, mut mapper) = paged_mapper();

    let msix = msix_setup(&func, &mut mapper, 8, 0)
        .expect("setup")
        .expect("capability");
    assert_eq!(msix.vectors.read_address(1), Some(MSIX_ADDR_BASE as u64));
}

#[test]
fn test_table_offset_drops_bir_bits() {
    let cfg = function_with_msix(0, 0x801);
    let func = PciFunction::new(cfg, ADDR);
    let (pager, mut mapper) = paged_mapper();

    let msix = msix_setup(&func, &mut mapper, 8, 1)
        .expect("setup")
        .expect("capability");
    let table = msix.vectors.region();
    assert_eq!(table.phys_base(), PhysAddr::new(TABLE_PHYS as u64 + 0x800));
    assert_eq!(table.virt_base().as_u64(), pager.base().as_u64() + 0x800);
}

#[test]
fn test_vector_count_clamped_to_limit() {
    let cfg = function_with_msix(MSIX_CTRL_TABLE_SIZE_MASK, 0x1);
    let func = PciFunction::new(cfg, ADDR);
    let (_pager, mut mapper) = paged_mapper();

    let msix = msix_setup(&func, &mut mapper, 8, 1)
        .expect("setup")
        .expect("capability");
    assert_eq!(msix.table_size, 2048);
    assert_eq!(msix.vectors_count(), 8);
    assert_eq!(msix.vectors.is_masked(8), None);
    assert_eq!(msix.vectors.mask(8), Err(MsixError::InvalidEntry(8)));
}

#[test]
fn test_wrong_bir_rejected() {
    let cfg = function_with_msix(3, 0x2);
    let func = PciFunction::new(cfg, ADDR);
    let (pager, mut mapper) = paged_mapper();

    assert!(matches!(
        msix_setup(&func, &mut mapper, 8, 1),
        Err(MsixError::UnexpectedBir(2))
    ));
    assert!(pager.calls().is_empty());
    assert_eq!(cfg.peek16(ADDR, CAP + MSIX_REG_CONTROL) & MSIX_CTRL_ENABLE, 0);
}

#[test]
fn test_64bit_bar1_rejected() {
    let cfg = function_with_msix(3, 0x1);
    cfg.set_mem_bar64(ADDR, PCI_BAR1_OFFSET, TABLE_PHYS as u64, 0x1000);
    let func = PciFunction::new(cfg, ADDR);
    let (_pager, mut mapper) = paged_mapper();

    assert!(matches!(
        msix_setup(&func, &mut mapper, 8, 1),
        Err(MsixError::UnexpectedTableBar)
    ));
}

#[test]
fn test_table_past_bar_end_rejected() {
    let cfg = function_with_msix(3, 0xFF9);
    let func = PciFunction::new(cfg, ADDR);
    let (_pager, mut mapper) = paged_mapper();

    assert!(matches!(
        msix_setup(&func, &mut mapper, 8, 1),
        Err(MsixError::TableOutsideBar)
    ));
}

#[test]
fn test_entry_accessors() {
    let mut backing = vec![0u32; 16];
    let region = unsafe {
        MmioRegion::from_raw(
            VirtAddr::from(backing.as_mut_ptr()),
            PhysAddr::new(0xFEBD_1000),
            64,
        )
    };
    let table = MsixVectorTable::new(region, 4).expect("fits");
    assert!(MsixVectorTable::new(region, 5).is_none());

    table.set_address(1, 0x1_FEE0_2000).expect("address");
    table.set_data(1, msix_message_data(0x41)).expect("data");
    table.mask(1).expect("mask");

    assert_eq!(backing[4], 0xFEE0_2000);
    assert_eq!(backing[5], 0x1);
    assert_eq!(backing[6], 0x4041);
    assert_eq!(backing[7], MSIX_ENTRY_CTRL_MASK);

    table.unmask(1).expect("unmask");
    assert_eq!(table.is_masked(1), Some(false));
    assert_eq!(table.set_data(4, 0), Err(MsixError::InvalidEntry(4)));
}

#[test]
fn test_capability_ending_at_config_space_end() {
    let cfg = FakeConfigSpace::leaked();
    cfg.add_function(ADDR, 0x1AF4, 0x1110);
    cfg.set_mem_bar32(ADDR, PCI_BAR1_OFFSET, TABLE_PHYS, 0x1000, false);
    cfg.set_msix(ADDR, 0xF4, 3, 0x801);
    let func = PciFunction::new(cfg, ADDR);
    let (_pager, mut mapper) = paged_mapper();

    let msix = msix_setup(&func, &mut mapper, 8, 1)
        .expect("setup")
        .expect("capability");
    assert_eq!(msix.cap_offset, 0xF4);
    assert_eq!(msix.vectors_count(), 4);
    assert_ne!(cfg.peek16(ADDR, 0xF4 + MSIX_REG_CONTROL) & MSIX_CTRL_ENABLE, 0);
}

#[test]
fn test_capability_past_config_space_end_rejected() {
    let cfg = FakeConfigSpace::leaked();
    cfg.add_function(ADDR, 0x1AF4, 0x1110);
    cfg.set_mem_bar32(ADDR, PCI_BAR1_OFFSET, TABLE_PHYS, 0x1000, false);
    cfg.set_msix(ADDR, 0xF8, 3, 0x801);
    let func = PciFunction::new(cfg, ADDR);
    let (pager, mut mapper) = paged_mapper();

    assert!(matches!(
        msix_setup(&func, &mut mapper, 8, 1),
        Err(MsixError::CapabilityTruncated(0xF8))
    ));
    assert!(pager.calls().is_empty());
}
