//! Physical memory access and paging (the page-table-walk half of
//! spec.md's C4 "Memory Interface"; the segmentation/A20 half lives in
//! `relic-cpu-core::mem`, which wraps a `MemoryBus` impl from this crate).

#![forbid(unsafe_code)]

pub mod pagewalk;
pub mod tlb;

pub use pagewalk::{walk, PageFaultCause, PagingMode, WalkError, WalkRequest};
pub use tlb::Tlb;

/// Width-typed physical memory access, little-endian. Implementors need not
/// be backed by contiguous storage (devices, overlays, ...); the default
/// width-16/32/64 methods below compose the 8-bit primitive the same way
/// the teacher's bus traits do, so a minimal impl only needs to provide
/// byte-granular `read_u8`/`write_u8`.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u64) -> u8;
    fn write_u8(&mut self, paddr: u64, value: u8);

    fn read_u16(&mut self, paddr: u64) -> u16 {
        let lo = self.read_u8(paddr) as u16;
        let hi = self.read_u8(paddr.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        let lo = self.read_u16(paddr) as u32;
        let hi = self.read_u16(paddr.wrapping_add(2)) as u32;
        lo | (hi << 16)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        let lo = self.read_u32(paddr) as u64;
        let hi = self.read_u32(paddr.wrapping_add(4)) as u64;
        lo | (hi << 32)
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.write_u8(paddr, value as u8);
        self.write_u8(paddr.wrapping_add(1), (value >> 8) as u8);
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_u16(paddr, value as u16);
        self.write_u16(paddr.wrapping_add(2), (value >> 16) as u16);
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_u32(paddr, value as u32);
        self.write_u32(paddr.wrapping_add(4), (value >> 32) as u32);
    }
}

/// A flat, fully-mapped block of physical RAM starting at address 0. Used
/// by tests and by hosts that do not model MMIO holes at this layer.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new(size: usize) -> FlatMemory {
        FlatMemory {
            bytes: vec![0; size],
        }
    }

    pub fn load(&mut self, paddr: u64, data: &[u8]) {
        let start = paddr as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl MemoryBus for FlatMemory {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.bytes[paddr as usize]
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.bytes[paddr as usize] = value;
    }
}
