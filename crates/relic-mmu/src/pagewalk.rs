//! Page-table walking for the three paging shapes spec.md names: classical
//! 32-bit (2-level), PAE (3-level), and long-mode (4-level PML4/PDPT/PD/PT).
//! Canonicality/selection of *which* shape applies is the caller's job
//! (`relic-cpu-core::mem::PagingBus`, driven by CR0.PG/CR4.PAE/EFER.LME);
//! this module only walks the tables it is told to walk.

use crate::MemoryBus;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_PS: u64 = 1 << 7;
const PTE_NX: u64 = 1 << 63;

const LARGE_SHIFT_2M: u32 = 21;
const LARGE_SHIFT_4M: u32 = 22;

/// Which page-table format to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// 2-level, 4 KiB or (with `pse`) 4 MiB pages, 32-bit entries.
    Legacy32 { pse: bool },
    /// 3-level PAE, 4 KiB or 2 MiB pages, 64-bit entries, no NX unless the
    /// caller says so via `nx_enabled`.
    Pae { nx_enabled: bool },
    /// 4-level long mode, 4 KiB or 2 MiB pages, 64-bit entries.
    Long { nx_enabled: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct WalkRequest {
    pub cr3: u64,
    pub vaddr: u64,
    pub write: bool,
    pub user: bool,
    pub fetch: bool,
    pub mode: PagingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultCause {
    NotPresent,
    ProtectionViolation,
    ReservedBitSet,
    InstructionFetchOnNxPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkError {
    pub cause: PageFaultCause,
    /// Architectural #PF error code bits: P(0) W/R(1) U/S(2) RSVD(3) I/D(4).
    pub error_code: u32,
}

fn error_code(cause: PageFaultCause, write: bool, user: bool, fetch: bool) -> u32 {
    let p = !matches!(cause, PageFaultCause::NotPresent);
    let mut code = 0u32;
    if p {
        code |= 1 << 0;
    }
    if write {
        code |= 1 << 1;
    }
    if user {
        code |= 1 << 2;
    }
    if cause == PageFaultCause::ReservedBitSet {
        code |= 1 << 3;
    }
    if fetch {
        code |= 1 << 4;
    }
    code
}

fn fault(req: &WalkRequest, cause: PageFaultCause) -> WalkError {
    WalkError {
        cause,
        error_code: error_code(cause, req.write, req.user, req.fetch),
    }
}

fn check_entry(req: &WalkRequest, entry: u64, nx_enabled: bool) -> Result<(), WalkError> {
    if entry & PTE_PRESENT == 0 {
        return Err(fault(req, PageFaultCause::NotPresent));
    }
    if req.write && entry & PTE_WRITABLE == 0 {
        return Err(fault(req, PageFaultCause::ProtectionViolation));
    }
    if req.user && entry & PTE_USER == 0 {
        return Err(fault(req, PageFaultCause::ProtectionViolation));
    }
    if nx_enabled && req.fetch && entry & PTE_NX != 0 {
        return Err(fault(req, PageFaultCause::InstructionFetchOnNxPage));
    }
    Ok(())
}

/// Walk `req.vaddr` through `req.mode`'s tables rooted at `req.cr3`,
/// returning the resolved physical address or the #PF details to deliver.
pub fn walk<B: MemoryBus>(bus: &mut B, req: WalkRequest) -> Result<u64, WalkError> {
    match req.mode {
        PagingMode::Legacy32 { pse } => walk_legacy32(bus, &req, pse),
        PagingMode::Pae { nx_enabled } => walk_pae(bus, &req, nx_enabled),
        PagingMode::Long { nx_enabled } => walk_long(bus, &req, nx_enabled),
    }
}

fn walk_legacy32<B: MemoryBus>(
    bus: &mut B,
    req: &WalkRequest,
    pse: bool,
) -> Result<u64, WalkError> {
    let vaddr = req.vaddr as u32;
    let pd_index = (vaddr >> 22) & 0x3FF;
    let pt_index = (vaddr >> 12) & 0x3FF;
    let offset_4k = (vaddr & 0xFFF) as u64;

    let pde_addr = (req.cr3 & !0xFFF) + (pd_index as u64) * 4;
    let pde = bus.read_u32(pde_addr) as u64;
    check_entry(req, pde, false)?;

    if pse && pde & PTE_PS != 0 {
        // 4 MiB page: bits 21:13 go into the physical base alongside bit 21..31,
        // but at the 32-bit non-PAE level the base is just bits 31:22 plus the
        // low 10 bits of the virtual address (21:12) as the page offset.
        let base = (pde & 0xFFC0_0000) as u64;
        let offset = (vaddr & ((1 << LARGE_SHIFT_4M) - 1)) as u64;
        return Ok(base | offset);
    }

    let pte_addr = (pde & 0xFFFF_F000) + (pt_index as u64) * 4;
    let pte = bus.read_u32(pte_addr) as u64;
    check_entry(req, pte, false)?;

    let base = pte & 0xFFFF_F000;
    Ok(base | offset_4k)
}

fn walk_pae<B: MemoryBus>(bus: &mut B, req: &WalkRequest, nx_enabled: bool) -> Result<u64, WalkError> {
    let vaddr = req.vaddr;
    let pdpt_index = (vaddr >> 30) & 0x3;
    let pd_index = (vaddr >> 21) & 0x1FF;
    let pt_index = (vaddr >> 12) & 0x1FF;

    let pdpte_addr = (req.cr3 & !0x1F) + pdpt_index * 8;
    let pdpte = bus.read_u64(pdpte_addr);
    check_entry(req, pdpte, nx_enabled)?;

    let pde_addr = (pdpte & 0x000F_FFFF_FFFF_F000) + pd_index * 8;
    let pde = bus.read_u64(pde_addr);
    check_entry(req, pde, nx_enabled)?;

    if pde & PTE_PS != 0 {
        let base = pde & 0x000F_FFFF_FFE0_0000;
        let offset = vaddr & ((1 << LARGE_SHIFT_2M) - 1);
        return Ok(base | offset);
    }

    let pte_addr = (pde & 0x000F_FFFF_FFFF_F000) + pt_index * 8;
    let pte = bus.read_u64(pte_addr);
    check_entry(req, pte, nx_enabled)?;

    let base = pte & 0x000F_FFFF_FFFF_F000;
    Ok(base | (vaddr & 0xFFF))
}

fn walk_long<B: MemoryBus>(bus: &mut B, req: &WalkRequest, nx_enabled: bool) -> Result<u64, WalkError> {
    let vaddr = req.vaddr;
    let pml4_index = (vaddr >> 39) & 0x1FF;
    let pdpt_index = (vaddr >> 30) & 0x1FF;
    let pd_index = (vaddr >> 21) & 0x1FF;
    let pt_index = (vaddr >> 12) & 0x1FF;

    let pml4e_addr = (req.cr3 & 0x000F_FFFF_FFFF_F000) + pml4_index * 8;
    let pml4e = bus.read_u64(pml4e_addr);
    check_entry(req, pml4e, nx_enabled)?;

    let pdpte_addr = (pml4e & 0x000F_FFFF_FFFF_F000) + pdpt_index * 8;
    let pdpte = bus.read_u64(pdpte_addr);
    check_entry(req, pdpte, nx_enabled)?;

    if pdpte & PTE_PS != 0 {
        // 1 GiB page.
        let base = pdpte & 0x000F_FFFF_C000_0000;
        let offset = vaddr & ((1u64 << 30) - 1);
        return Ok(base | offset);
    }

    let pde_addr = (pdpte & 0x000F_FFFF_FFFF_F000) + pd_index * 8;
    let pde = bus.read_u64(pde_addr);
    check_entry(req, pde, nx_enabled)?;

    if pde & PTE_PS != 0 {
        let base = pde & 0x000F_FFFF_FFE0_0000;
        let offset = vaddr & ((1 << LARGE_SHIFT_2M) - 1);
        return Ok(base | offset);
    }

    let pte_addr = (pde & 0x000F_FFFF_FFFF_F000) + pt_index * 8;
    let pte = bus.read_u64(pte_addr);
    check_entry(req, pte, nx_enabled)?;

    let base = pte & 0x000F_FFFF_FFFF_F000;
    Ok(base | (vaddr & 0xFFF))
}
