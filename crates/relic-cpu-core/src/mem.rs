//! Linear-address memory interface (C4's non-paging half): the `CpuBus`
//! trait every execution-core function reads/writes through, a flat test
//! bus, and `PagingBus`, which layers A20 masking and `relic_mmu`'s
//! page-table walker + TLB on top of any `relic_mmu::MemoryBus`.
//!
//! Segment-base addition happens one layer up, in `operand.rs`: by the
//! time a `CpuBus` method is called the address is already linear.

use crate::error::Exception;
use crate::state::{CpuState, CR0_PG, CR4_PAE, CR4_PSE, EFER_NXE};
use relic_mmu::{PageFaultCause, PagingMode, Tlb, WalkRequest};

/// Width-typed, fallible access to the linear address space. Fallibility
/// is architectural (#PF) for `PagingBus`; `FlatTestBus` only ever
/// panics on a genuinely out-of-range test configuration, matching the
/// teacher's own flat test buses.
pub trait CpuBus {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception>;
    fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), Exception>;

    fn read_u16(&mut self, addr: u64) -> Result<u16, Exception> {
        let lo = self.read_u8(addr)? as u16;
        let hi = self.read_u8(addr.wrapping_add(1))? as u16;
        Ok(lo | (hi << 8))
    }

    fn read_u32(&mut self, addr: u64) -> Result<u32, Exception> {
        let lo = self.read_u16(addr)? as u32;
        let hi = self.read_u16(addr.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }

    fn read_u64(&mut self, addr: u64) -> Result<u64, Exception> {
        let lo = self.read_u32(addr)? as u64;
        let hi = self.read_u32(addr.wrapping_add(4))? as u64;
        Ok(lo | (hi << 32))
    }

    fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), Exception> {
        self.write_u8(addr, value as u8)?;
        self.write_u8(addr.wrapping_add(1), (value >> 8) as u8)
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), Exception> {
        self.write_u16(addr, value as u16)?;
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16)
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), Exception> {
        self.write_u32(addr, value as u32)?;
        self.write_u32(addr.wrapping_add(4), (value >> 32) as u32)
    }

    /// Descriptor-table fetch (GDT/IDT/TSS). A system access: must not be
    /// rejected by a paging U/S check regardless of current CPL.
    fn read_u64_system(&mut self, addr: u64) -> Result<u64, Exception> {
        self.read_u64(addr)
    }

    /// IN/OUT's host callback boundary (spec §6: `PortIn`/`PortOut`).
    /// Default is an unwired port space so a bare `FlatTestBus` doesn't
    /// need its own impl; `Cpu` (the host-facing wrapper) overrides these
    /// to forward into the caller-supplied `PortIn`/`PortOut` closures.
    fn port_in(&mut self, _port: u16, _width: relic_x86::Width) -> u32 {
        0
    }

    fn port_out(&mut self, _port: u16, _width: relic_x86::Width, _value: u32) {}
}

/// A flat, fully-mapped linear address space for tests. Out-of-range
/// access panics rather than faulting — a too-small test bus is a test
/// bug, not a guest-visible condition.
#[derive(Debug, Clone)]
pub struct FlatTestBus {
    bytes: Vec<u8>,
}

impl FlatTestBus {
    pub fn new(size: usize) -> FlatTestBus {
        FlatTestBus { bytes: vec![0; size] }
    }

    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub fn dump(&self, addr: u64, len: usize) -> &[u8] {
        let start = addr as usize;
        &self.bytes[start..start + len]
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception> {
        self.bytes
            .get(addr as usize)
            .copied()
            .ok_or(Exception::MemoryFault { addr })
    }

    fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), Exception> {
        let slot = self
            .bytes
            .get_mut(addr as usize)
            .ok_or(Exception::MemoryFault { addr })?;
        *slot = value;
        Ok(())
    }
}

fn apply_a20(addr: u64, a20_enabled: bool) -> u64 {
    if a20_enabled {
        addr
    } else {
        addr & !(1 << 20)
    }
}

fn paging_mode(state: &CpuState) -> PagingMode {
    if matches!(state.mode, crate::state::CpuMode::Long)
        || matches!(state.mode, crate::state::CpuMode::Compatibility)
    {
        PagingMode::Long {
            nx_enabled: state.msr.efer & EFER_NXE != 0,
        }
    } else if state.control.cr4 & CR4_PAE != 0 {
        PagingMode::Pae {
            nx_enabled: state.msr.efer & EFER_NXE != 0,
        }
    } else {
        PagingMode::Legacy32 {
            pse: state.control.cr4 & CR4_PSE != 0,
        }
    }
}

/// A20 masking plus (if `CR0.PG` is set) a page-table walk on top of any
/// `relic_mmu::MemoryBus`-backed physical memory. Owns its own TLB and
/// must be resynced from `CpuState` (`sync`) whenever CR0/CR3/CR4/EFER,
/// CPL, or the A20 gate change.
pub struct PagingBus<M> {
    phys: M,
    tlb: Tlb,
    a20_enabled: bool,
    paging_enabled: bool,
    mode: PagingMode,
    cr3: u64,
    cpl: u8,
}

impl<M: relic_mmu::MemoryBus> PagingBus<M> {
    pub fn new(phys: M) -> PagingBus<M> {
        PagingBus {
            phys,
            tlb: Tlb::new(),
            a20_enabled: false,
            paging_enabled: false,
            mode: PagingMode::Legacy32 { pse: false },
            cr3: 0,
            cpl: 0,
        }
    }

    pub fn inner(&self) -> &M {
        &self.phys
    }

    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.phys
    }

    /// Resyncs cached paging configuration from `state`. A change to the
    /// paging mode or the CR3 root flushes the TLB (spec.md §4.5: the
    /// translation-block cache also invalidates on these transitions,
    /// handled separately by `tbcache`).
    pub fn sync(&mut self, state: &CpuState) {
        let new_mode = paging_mode(state);
        let new_paging = state.control.cr0 & CR0_PG != 0;
        let new_cr3 = state.control.cr3;
        if new_mode != self.mode || new_cr3 != self.cr3 || new_paging != self.paging_enabled {
            self.tlb.flush_all();
        }
        self.mode = new_mode;
        self.paging_enabled = new_paging;
        self.cr3 = new_cr3;
        self.a20_enabled = state.a20_enabled;
        self.cpl = state.cpl;
    }

    pub fn invalidate_page(&mut self, vaddr: u64) {
        self.tlb.invalidate_page(vaddr);
    }

    fn translate(&mut self, addr: u64, write: bool, fetch: bool) -> Result<u64, Exception> {
        let linear = apply_a20(addr, self.a20_enabled);
        if !self.paging_enabled {
            return Ok(linear);
        }
        let user = self.cpl == 3;
        if let Some((paddr, writable, cached_user)) = self.tlb.lookup(self.cr3, linear) {
            let would_permit = (!write || writable) && (!user || cached_user);
            if would_permit {
                return Ok(paddr);
            }
        }
        let req = WalkRequest {
            cr3: self.cr3,
            vaddr: linear,
            write,
            user,
            fetch,
            mode: self.mode,
        };
        match relic_mmu::walk(&mut self.phys, req) {
            Ok(paddr) => {
                let page_base = paddr & !0xFFF;
                // Caching write/user permission is conservative for a 2-entry
                // boolean pair; a finer model would cache from the actual PTE
                // bits rather than re-deriving them from the request.
                self.tlb
                    .insert(self.cr3, linear, page_base, write, user);
                Ok(paddr)
            }
            Err(e) => Err(Exception::PageFault {
                addr,
                error_code: e.error_code,
            }),
        }
    }

    fn translate_system(&mut self, addr: u64) -> Result<u64, Exception> {
        let linear = apply_a20(addr, self.a20_enabled);
        if !self.paging_enabled {
            return Ok(linear);
        }
        let req = WalkRequest {
            cr3: self.cr3,
            vaddr: linear,
            write: false,
            user: false,
            fetch: false,
            mode: self.mode,
        };
        relic_mmu::walk(&mut self.phys, req).map_err(|e| {
            let cause_is_fatal = matches!(e.cause, PageFaultCause::NotPresent);
            let _ = cause_is_fatal;
            Exception::PageFault {
                addr,
                error_code: e.error_code,
            }
        })
    }
}

impl<M: relic_mmu::MemoryBus> CpuBus for PagingBus<M> {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception> {
        let p = self.translate(addr, false, false)?;
        Ok(self.phys.read_u8(p))
    }

    fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), Exception> {
        let p = self.translate(addr, true, false)?;
        self.phys.write_u8(p, value);
        Ok(())
    }

    fn read_u64_system(&mut self, addr: u64) -> Result<u64, Exception> {
        let p = self.translate_system(addr)?;
        Ok(self.phys.read_u64(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CpuState;
    use relic_mmu::FlatMemory;

    #[test]
    fn a20_disabled_masks_bit_20() {
        assert_eq!(apply_a20(0x10_0000, false), 0);
        assert_eq!(apply_a20(0x10_0000, true), 0x10_0000);
    }

    #[test]
    fn paging_disabled_is_identity_mapped() {
        let mut bus = PagingBus::new(FlatMemory::new(0x2000));
        let st = CpuState::reset();
        bus.sync(&st);
        bus.write_u32(0x1000, 0xDEAD_BEEF).unwrap();
        assert_eq!(bus.read_u32(0x1000).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn gdt_descriptor_reads_ignore_user_supervisor_paging_bit() {
        use relic_mmu::MemoryBus;
        const PTE_PRESENT: u64 = 1;
        const PTE_WRITABLE: u64 = 1 << 1; // no PTE_USER bit set: supervisor-only page

        let mut phys = FlatMemory::new(0x10000);
        let pml4 = 0x3000u64;
        let pdpt = 0x4000u64;
        let pd = 0x5000u64;
        let pt = 0x6000u64;
        phys.write_u64(pml4, pdpt | PTE_PRESENT | PTE_WRITABLE);
        phys.write_u64(pdpt, pd | PTE_PRESENT | PTE_WRITABLE);
        phys.write_u64(pd, pt | PTE_PRESENT | PTE_WRITABLE);
        phys.write_u64(pt, 0x7000 | PTE_PRESENT | PTE_WRITABLE);
        phys.write_u64(0x7000 + 0x10, 0xCAFE_F00D_0000_0001);

        let mut bus = PagingBus::new(phys);
        let mut st = CpuState::reset();
        st.control.cr0 = CR0_PG | crate::state::CR0_PE;
        st.control.cr4 = CR4_PAE;
        st.msr.efer = crate::state::EFER_LME;
        st.segments.cs.l_bit = true;
        st.update_mode();
        st.control.cr3 = pml4;
        st.cpl = 3;
        bus.sync(&st);

        assert_eq!(
            bus.read_u64_system(0x10).unwrap(),
            0xCAFE_F00D_0000_0001,
            "descriptor-table read must bypass the U/S check"
        );
    }
}
