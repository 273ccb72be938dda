//! String/REP group (spec.md §4.8): MOVS/CMPS/STOS/LODS/SCAS, each
//! executed as a single dispatch call that runs its whole REP count
//! internally rather than being re-decoded once per element.

use crate::decode::Instruction;
use crate::error::Exception;
use crate::exec::StepExit;
use crate::flags::{set_zsp, sub_with_borrow};
use crate::mem::CpuBus;
use crate::state::{gpr, CpuState, RepPrefix, RFLAGS_AF, RFLAGS_CF, RFLAGS_DF, RFLAGS_OF, RFLAGS_ZF};
use relic_x86::{SegReg, Width};

fn step_delta(state: &CpuState, width: Width) -> i64 {
    let size = width.bytes() as i64;
    if state.flag(RFLAGS_DF) {
        -size
    } else {
        size
    }
}

fn src_addr(state: &CpuState, inst: &Instruction, addr_width: Width) -> u64 {
    let seg = inst.seg_override.unwrap_or(SegReg::Ds);
    let base = state.segments.get(seg).base;
    base.wrapping_add(state.read_gpr(gpr::RSI, addr_width) & addr_width.mask())
}

fn dst_addr(state: &CpuState, addr_width: Width) -> u64 {
    state.segments.es.base.wrapping_add(state.read_gpr(gpr::RDI, addr_width) & addr_width.mask())
}

fn read_mem<B: CpuBus>(bus: &mut B, addr: u64, width: Width) -> Result<u64, Exception> {
    match width {
        Width::W8 => bus.read_u8(addr).map(|v| v as u64),
        Width::W16 => bus.read_u16(addr).map(|v| v as u64),
        Width::W32 => bus.read_u32(addr).map(|v| v as u64),
        Width::W64 => bus.read_u64(addr),
    }
}

fn write_mem<B: CpuBus>(bus: &mut B, addr: u64, width: Width, value: u64) -> Result<(), Exception> {
    match width {
        Width::W8 => bus.write_u8(addr, value as u8),
        Width::W16 => bus.write_u16(addr, value as u16),
        Width::W32 => bus.write_u32(addr, value as u32),
        Width::W64 => bus.write_u64(addr, value),
    }
}

fn advance(state: &mut CpuState, addr_width: Width, delta: i64, advance_si: bool, advance_di: bool) {
    if advance_si {
        let v = (state.read_gpr(gpr::RSI, addr_width) as i64).wrapping_add(delta) as u64;
        state.write_gpr(gpr::RSI, addr_width, v & addr_width.mask());
    }
    if advance_di {
        let v = (state.read_gpr(gpr::RDI, addr_width) as i64).wrapping_add(delta) as u64;
        state.write_gpr(gpr::RDI, addr_width, v & addr_width.mask());
    }
}

fn decrement_count(state: &mut CpuState, addr_width: Width) -> u64 {
    let count = state.read_gpr(gpr::RCX, addr_width).wrapping_sub(1) & addr_width.mask();
    state.write_gpr(gpr::RCX, addr_width, count);
    count
}

/// For CMPS/SCAS only: the decoder folds REPE and plain REP onto the same
/// `RepPrefix::Rep` tag (they share the 0xF3 byte on real hardware too),
/// so the "repeat while equal" vs "repeat while not equal" choice is made
/// here from the mnemonic context rather than from a distinct enum value.
fn repeats_while_equal(rep: RepPrefix) -> bool {
    !matches!(rep, RepPrefix::Repne)
}

pub fn exec_movs<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let addr_width = inst.addr_width;
    let delta = step_delta(state, width);
    loop {
        if inst.rep.is_some() && state.read_gpr(gpr::RCX, addr_width) & addr_width.mask() == 0 {
            break;
        }
        let v = read_mem(bus, src_addr(state, inst, addr_width), width)?;
        write_mem(bus, dst_addr(state, addr_width), width, v)?;
        advance(state, addr_width, delta, true, true);
        match inst.rep {
            Some(_) => {
                if decrement_count(state, addr_width) == 0 {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(StepExit::Continue)
}

pub fn exec_stos<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let addr_width = inst.addr_width;
    let delta = step_delta(state, width);
    loop {
        if inst.rep.is_some() && state.read_gpr(gpr::RCX, addr_width) & addr_width.mask() == 0 {
            break;
        }
        let acc = state.read_gpr(gpr::RAX, width) & width.mask();
        write_mem(bus, dst_addr(state, addr_width), width, acc)?;
        advance(state, addr_width, delta, false, true);
        match inst.rep {
            Some(_) => {
                if decrement_count(state, addr_width) == 0 {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(StepExit::Continue)
}

pub fn exec_lods<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let addr_width = inst.addr_width;
    let delta = step_delta(state, width);
    loop {
        if inst.rep.is_some() && state.read_gpr(gpr::RCX, addr_width) & addr_width.mask() == 0 {
            break;
        }
        let v = read_mem(bus, src_addr(state, inst, addr_width), width)?;
        state.write_gpr(gpr::RAX, width, v);
        advance(state, addr_width, delta, true, false);
        match inst.rep {
            Some(_) => {
                if decrement_count(state, addr_width) == 0 {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(StepExit::Continue)
}

pub fn exec_cmps<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let addr_width = inst.addr_width;
    let delta = step_delta(state, width);
    loop {
        if inst.rep.is_some() && state.read_gpr(gpr::RCX, addr_width) & addr_width.mask() == 0 {
            break;
        }
        let a = read_mem(bus, src_addr(state, inst, addr_width), width)?;
        let b = read_mem(bus, dst_addr(state, addr_width), width)?;
        let r = sub_with_borrow(a, b, 0, width);
        state.set_flag(RFLAGS_CF, r.cf);
        state.set_flag(RFLAGS_OF, r.of);
        state.set_flag(RFLAGS_AF, r.af);
        set_zsp(state, r.result, width);
        advance(state, addr_width, delta, true, true);
        match inst.rep {
            Some(rep) => {
                let count = decrement_count(state, addr_width);
                let zf = state.flag(RFLAGS_ZF);
                let stop = if repeats_while_equal(rep) { !zf } else { zf };
                if count == 0 || stop {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(StepExit::Continue)
}

pub fn exec_scas<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let addr_width = inst.addr_width;
    let delta = step_delta(state, width);
    loop {
        if inst.rep.is_some() && state.read_gpr(gpr::RCX, addr_width) & addr_width.mask() == 0 {
            break;
        }
        let acc = state.read_gpr(gpr::RAX, width) & width.mask();
        let mem = read_mem(bus, dst_addr(state, addr_width), width)?;
        let r = sub_with_borrow(acc, mem, 0, width);
        state.set_flag(RFLAGS_CF, r.cf);
        state.set_flag(RFLAGS_OF, r.of);
        state.set_flag(RFLAGS_AF, r.af);
        set_zsp(state, r.result, width);
        advance(state, addr_width, delta, false, true);
        match inst.rep {
            Some(rep) => {
                let count = decrement_count(state, addr_width);
                let zf = state.flag(RFLAGS_ZF);
                let stop = if repeats_while_equal(rep) { !zf } else { zf };
                if count == 0 || stop {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(StepExit::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Mnemonic;
    use crate::mem::FlatTestBus;
    use crate::operand::RmOperand;

    fn base_inst(width: Width, rep: Option<RepPrefix>) -> Instruction {
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
            rep,
            length: 1,
            far_selector: 0,
            imm_is_operand: false,
        }
    }

    #[test]
    fn rep_movsb_copies_whole_block() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RSI, Width::W32, 0x100);
        st.write_gpr(gpr::RDI, Width::W32, 0x200);
        st.write_gpr(gpr::RCX, Width::W32, 4);
        let mut bus = FlatTestBus::new(0x1000);
        bus.load(0x100, &[1, 2, 3, 4]);
        let inst = base_inst(Width::W8, Some(RepPrefix::Rep));
        exec_movs(&mut st, &mut bus, &inst).unwrap();
        assert_eq!(st.read_gpr(gpr::RCX, Width::W32), 0);
        assert_eq!(st.read_gpr(gpr::RSI, Width::W32), 0x104);
        assert_eq!(st.read_gpr(gpr::RDI, Width::W32), 0x204);
        let mut out = [0u8; 4];
        for (i, b) in out.iter_mut().enumerate() {
            *b = bus.read_u8(0x200 + i as u64).unwrap();
        }
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn repe_cmpsb_stops_at_first_mismatch() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RSI, Width::W32, 0x100);
        st.write_gpr(gpr::RDI, Width::W32, 0x200);
        st.write_gpr(gpr::RCX, Width::W32, 4);
        let mut bus = FlatTestBus::new(0x1000);
        bus.load(0x100, &[1, 2, 3, 4]);
        bus.load(0x200, &[1, 2, 9, 4]);
        let inst = base_inst(Width::W8, Some(RepPrefix::Rep));
        let mut inst = inst;
        inst.mnemonic = Mnemonic::Cmps;
        exec_cmps(&mut st, &mut bus, &inst).unwrap();
        // stops after comparing index 2 (the mismatch), having advanced SI/DI three times.
        assert_eq!(st.read_gpr(gpr::RSI, Width::W32), 0x103);
        assert_eq!(st.read_gpr(gpr::RCX, Width::W32), 1);
        assert!(!st.flag(RFLAGS_ZF));
    }
}
