//! Pattern recognizer (C11, spec §4.6): an optional peephole layer that
//! replaces a decoded instruction with a specialized routine whenever one
//! applies, with no observable difference in post-state versus running
//! the interpreter (P7 is exactly this equivalence for the one pattern
//! implemented here).
//!
//! The only pattern recognized is spec §4.8's named "bulk optimization":
//! a `REP MOVS`/`REP STOS` whose source and destination ranges each stay
//! within a single page and run forward (DF=0). `exec::string`'s ordinary
//! per-element loop is always correct; this module exists purely to skip
//! its per-element `Instruction` dispatch overhead when it's safe to.

use crate::decode::{Instruction, Mnemonic};
use crate::error::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::state::{gpr, CpuState, RepPrefix, RFLAGS_DF};
use relic_x86::{SegReg, Width};

const PAGE_SIZE: u64 = 0x1000;

fn single_page(addr: u64, len: u64) -> bool {
    if len == 0 {
        return true;
    }
    let last = addr.wrapping_add(len - 1);
    addr / PAGE_SIZE == last / PAGE_SIZE
}

/// Returns `None` when the instruction isn't a pattern this module knows,
/// or when it knows the mnemonic but the fast path doesn't apply (callers
/// should fall back to `exec::string`'s ordinary per-element loop, which
/// is always correct).
pub fn try_apply<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    inst: &Instruction,
) -> Option<Result<StepExit, Exception>> {
    if !matches!(inst.rep, Some(RepPrefix::Rep)) || state.flag(RFLAGS_DF) {
        return None;
    }
    match inst.mnemonic {
        Mnemonic::Movs => apply_movs(state, bus, inst),
        Mnemonic::Stos => apply_stos(state, bus, inst),
        _ => None,
    }
}

fn apply_movs<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    inst: &Instruction,
) -> Option<Result<StepExit, Exception>> {
    let width = inst.width;
    let addr_width = inst.addr_width;
    let count = state.read_gpr(gpr::RCX, addr_width) & addr_width.mask();
    if count == 0 {
        return Some(Ok(StepExit::Continue));
    }
    let elem = width.bytes() as u64;
    let span = count.checked_mul(elem)?;

    let seg = inst.seg_override.unwrap_or(SegReg::Ds);
    let src = state.segments.get(seg).base.wrapping_add(state.read_gpr(gpr::RSI, addr_width) & addr_width.mask());
    let dst = state.segments.es.base.wrapping_add(state.read_gpr(gpr::RDI, addr_width) & addr_width.mask());
    if !single_page(src, span) || !single_page(dst, span) {
        return None;
    }

    let result = (|| -> Result<(), Exception> {
        for i in 0..count {
            let v = read_elem(bus, src.wrapping_add(i * elem), width)?;
            write_elem(bus, dst.wrapping_add(i * elem), width, v)?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        return Some(Err(e));
    }

    state.write_gpr(gpr::RSI, addr_width, (src.wrapping_add(span).wrapping_sub(state.segments.get(seg).base)) & addr_width.mask());
    state.write_gpr(gpr::RDI, addr_width, (dst.wrapping_add(span).wrapping_sub(state.segments.es.base)) & addr_width.mask());
    state.write_gpr(gpr::RCX, addr_width, 0);
    Some(Ok(StepExit::Continue))
}

fn apply_stos<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    inst: &Instruction,
) -> Option<Result<StepExit, Exception>> {
    let width = inst.width;
    let addr_width = inst.addr_width;
    let count = state.read_gpr(gpr::RCX, addr_width) & addr_width.mask();
    if count == 0 {
        return Some(Ok(StepExit::Continue));
    }
    let elem = width.bytes() as u64;
    let span = count.checked_mul(elem)?;

    let dst = state.segments.es.base.wrapping_add(state.read_gpr(gpr::RDI, addr_width) & addr_width.mask());
    if !single_page(dst, span) {
        return None;
    }

    let value = state.read_gpr(gpr::RAX, width) & width.mask();
    let result = (|| -> Result<(), Exception> {
        for i in 0..count {
            write_elem(bus, dst.wrapping_add(i * elem), width, value)?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        return Some(Err(e));
    }

    state.write_gpr(gpr::RDI, addr_width, (dst.wrapping_add(span).wrapping_sub(state.segments.es.base)) & addr_width.mask());
    state.write_gpr(gpr::RCX, addr_width, 0);
    Some(Ok(StepExit::Continue))
}

fn read_elem<B: CpuBus>(bus: &mut B, addr: u64, width: Width) -> Result<u64, Exception> {
    match width {
        Width::W8 => bus.read_u8(addr).map(|v| v as u64),
        Width::W16 => bus.read_u16(addr).map(|v| v as u64),
        Width::W32 => bus.read_u32(addr).map(|v| v as u64),
        Width::W64 => bus.read_u64(addr),
    }
}

fn write_elem<B: CpuBus>(bus: &mut B, addr: u64, width: Width, value: u64) -> Result<(), Exception> {
    match width {
        Width::W8 => bus.write_u8(addr, value as u8),
        Width::W16 => bus.write_u16(addr, value as u16),
        Width::W32 => bus.write_u32(addr, value as u32),
        Width::W64 => bus.write_u64(addr, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::string::exec_movs;
    use crate::mem::FlatTestBus;
    use crate::operand::RmOperand;

    fn base_inst(width: Width) -> Instruction {
        Instruction {
            mnemonic: Mnemonic::Movs,
            width,
            addr_width: Width::W32,
            rm: RmOperand::Reg(0),
            raw_rm: None,
            reg: 0,
            imm: 0,
            rel: 0,
            rex_present: false,
            seg_override: None,
            rep: Some(RepPrefix::Rep),
            length: 2,
            far_selector: 0,
            imm_is_operand: false,
        }
    }

    #[test]
    fn bulk_movs_matches_interpreter_post_state() {
        let inst = base_inst(Width::W8);

        let mut st_pattern = CpuState::reset();
        st_pattern.write_gpr(gpr::RSI, Width::W32, 0x100);
        st_pattern.write_gpr(gpr::RDI, Width::W32, 0x200);
        st_pattern.write_gpr(gpr::RCX, Width::W32, 8);
        let mut bus_pattern = FlatTestBus::new(0x1000);
        bus_pattern.load(0x100, &[1, 2, 3, 4, 5, 6, 7, 8]);
        try_apply(&mut st_pattern, &mut bus_pattern, &inst).unwrap().unwrap();

        let mut st_interp = CpuState::reset();
        st_interp.write_gpr(gpr::RSI, Width::W32, 0x100);
        st_interp.write_gpr(gpr::RDI, Width::W32, 0x200);
        st_interp.write_gpr(gpr::RCX, Width::W32, 8);
        let mut bus_interp = FlatTestBus::new(0x1000);
        bus_interp.load(0x100, &[1, 2, 3, 4, 5, 6, 7, 8]);
        exec_movs(&mut st_interp, &mut bus_interp, &inst).unwrap();

        assert_eq!(st_pattern.read_gpr(gpr::RSI, Width::W32), st_interp.read_gpr(gpr::RSI, Width::W32));
        assert_eq!(st_pattern.read_gpr(gpr::RDI, Width::W32), st_interp.read_gpr(gpr::RDI, Width::W32));
        assert_eq!(st_pattern.read_gpr(gpr::RCX, Width::W32), st_interp.read_gpr(gpr::RCX, Width::W32));
        assert_eq!(bus_pattern.dump(0x200, 8), bus_interp.dump(0x200, 8));
    }

    #[test]
    fn declines_when_the_range_crosses_a_page_boundary() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RSI, Width::W32, 0xFFC);
        st.write_gpr(gpr::RDI, Width::W32, 0x2000);
        st.write_gpr(gpr::RCX, Width::W32, 8);
        let mut bus = FlatTestBus::new(0x3000);
        let inst = base_inst(Width::W8);
        assert!(try_apply(&mut st, &mut bus, &inst).is_none());
    }
}
