//! Control-flow group (spec.md §4.3): JMP/Jcc/CALL/RET (near and far),
//! LOOP family, JCXZ.

use crate::decode::{Instruction, LoopKind, Mnemonic};
use crate::error::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::operand::{read_operand, RmOperand};
use crate::segmentation;
use crate::state::{gpr, CpuMode, CpuState, RFLAGS_CF, RFLAGS_OF, RFLAGS_PF, RFLAGS_SF, RFLAGS_ZF};
use relic_x86::{Condition, Width};

fn push_stack_value<B: CpuBus>(state: &mut CpuState, bus: &mut B, width: Width, value: u64) -> Result<(), Exception> {
    let sp = state.read_gpr(gpr::RSP, width).wrapping_sub(width.bytes() as u64);
    state.write_gpr(gpr::RSP, width, sp);
    let addr = state.segments.ss.base.wrapping_add(sp & width.mask());
    match width {
        Width::W8 => bus.write_u8(addr, value as u8),
        Width::W16 => bus.write_u16(addr, value as u16),
        Width::W32 => bus.write_u32(addr, value as u32),
        Width::W64 => bus.write_u64(addr, value),
    }
}

fn pop_stack_value<B: CpuBus>(state: &mut CpuState, bus: &mut B, width: Width) -> Result<u64, Exception> {
    let sp = state.read_gpr(gpr::RSP, width);
    let addr = state.segments.ss.base.wrapping_add(sp & width.mask());
    let value = match width {
        Width::W8 => bus.read_u8(addr)? as u64,
        Width::W16 => bus.read_u16(addr)? as u64,
        Width::W32 => bus.read_u32(addr)? as u64,
        Width::W64 => bus.read_u64(addr)?,
    };
    state.write_gpr(gpr::RSP, width, sp.wrapping_add(width.bytes() as u64));
    Ok(value)
}

/// CALL/RET push/pop the return address at the stack's natural word size —
/// forced to 64 bits in long mode regardless of any operand-size prefix on
/// the branch opcode itself, mirroring the same forcing the decoder already
/// applies to PUSH/POP/PUSHF/POPF.
fn call_ret_width(state: &CpuState, inst: &Instruction) -> Width {
    if matches!(state.mode, CpuMode::Long) {
        Width::W64
    } else {
        inst.width
    }
}

pub fn exec_jmp_rel(state: &mut CpuState, inst: &Instruction) -> Result<StepExit, Exception> {
    let next = state.rip.wrapping_add(inst.length as u64);
    state.rip = next.wrapping_add(inst.rel as u64);
    Ok(StepExit::Branch)
}

pub fn exec_jmp_far<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let selector = inst.far_selector;
    let target_cpl = selector as u8 & 0b11;
    segmentation::load_code_seg(state, bus, selector, target_cpl)?;
    state.rip = inst.imm as u64;
    Ok(StepExit::Branch)
}

pub fn exec_jmp_rm<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let target = read_operand(state, bus, inst.rm, inst.width, inst.rex_present)?;
    state.rip = target & inst.width.mask();
    Ok(StepExit::Branch)
}

fn read_far_ptr<B: CpuBus>(bus: &mut B, inst: &Instruction) -> Result<(u16, u64), Exception> {
    let addr = match inst.rm {
        RmOperand::Mem(addr) => addr,
        RmOperand::Reg(_) => return Err(Exception::InvalidOpcode),
    };
    let width = inst.width;
    let offset = match width {
        Width::W16 => bus.read_u16(addr)? as u64,
        Width::W32 => bus.read_u32(addr)? as u64,
        _ => bus.read_u64(addr)?,
    };
    let selector = bus.read_u16(addr.wrapping_add(width.bytes() as u64))?;
    Ok((selector, offset))
}

pub fn exec_jmp_far_rm<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let (selector, offset) = read_far_ptr(bus, inst)?;
    let target_cpl = selector as u8 & 0b11;
    segmentation::load_code_seg(state, bus, selector, target_cpl)?;
    state.rip = offset;
    Ok(StepExit::Branch)
}

fn eval_condition(state: &CpuState, cond: Condition) -> bool {
    use Condition::*;
    let cf = state.flag(RFLAGS_CF);
    let zf = state.flag(RFLAGS_ZF);
    let sf = state.flag(RFLAGS_SF);
    let of = state.flag(RFLAGS_OF);
    let pf = state.flag(RFLAGS_PF);
    match cond {
        O => of,
        No => !of,
        B => cf,
        Ae => !cf,
        E => zf,
        Ne => !zf,
        Be => cf || zf,
        A => !cf && !zf,
        S => sf,
        Ns => !sf,
        P => pf,
        Np => !pf,
        L => sf != of,
        Ge => sf == of,
        Le => zf || (sf != of),
        G => !zf && (sf == of),
    }
}

pub fn exec_jcc(state: &mut CpuState, inst: &Instruction, cond: Condition) -> Result<StepExit, Exception> {
    if eval_condition(state, cond) {
        let next = state.rip.wrapping_add(inst.length as u64);
        state.rip = next.wrapping_add(inst.rel as u64);
        Ok(StepExit::Branch)
    } else {
        Ok(StepExit::Continue)
    }
}

pub fn exec_call_rel<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let return_ip = state.rip.wrapping_add(inst.length as u64);
    let target = return_ip.wrapping_add(inst.rel as u64);
    push_stack_value(state, bus, call_ret_width(state, inst), return_ip)?;
    state.rip = target;
    Ok(StepExit::Branch)
}

pub fn exec_call_rm<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let target = read_operand(state, bus, inst.rm, inst.width, inst.rex_present)? & inst.width.mask();
    let return_ip = state.rip.wrapping_add(inst.length as u64);
    push_stack_value(state, bus, call_ret_width(state, inst), return_ip)?;
    state.rip = target;
    Ok(StepExit::Branch)
}

pub fn exec_call_far<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let (selector, offset) = read_far_ptr(bus, inst)?;
    let return_cs = state.segments.cs.selector;
    let return_ip = state.rip.wrapping_add(inst.length as u64);
    let target_cpl = selector as u8 & 0b11;
    segmentation::load_code_seg(state, bus, selector, target_cpl)?;
    let width = call_ret_width(state, inst);
    push_stack_value(state, bus, width, return_cs as u64)?;
    push_stack_value(state, bus, width, return_ip)?;
    state.rip = offset;
    Ok(StepExit::Branch)
}

pub fn exec_ret<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = call_ret_width(state, inst);
    let target = pop_stack_value(state, bus, width)?;
    if matches!(inst.mnemonic, Mnemonic::RetImm) {
        let sp = (state.read_gpr(gpr::RSP, width).wrapping_add(inst.imm as u64)) & width.mask();
        state.write_gpr(gpr::RSP, width, sp);
    }
    state.rip = target;
    Ok(StepExit::Branch)
}

/// RETF's operand size isn't threaded through from the decoder (see
/// `exec::mod`'s dispatch signature); 16-bit legacy RETF defaults to 32
/// here, a documented simplification.
pub fn exec_ret_far<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<StepExit, Exception> {
    let width = if matches!(state.mode, CpuMode::Long) { Width::W64 } else { Width::W32 };
    let ip = pop_stack_value(state, bus, width)?;
    let selector = pop_stack_value(state, bus, width)? as u16;
    let target_cpl = selector as u8 & 0b11;
    segmentation::load_code_seg(state, bus, selector, target_cpl)?;
    state.rip = ip;
    Ok(StepExit::Branch)
}

pub fn exec_loop(state: &mut CpuState, inst: &Instruction, kind: LoopKind) -> Result<StepExit, Exception> {
    let width = inst.addr_width;
    let count = state.read_gpr(gpr::RCX, width).wrapping_sub(1) & width.mask();
    state.write_gpr(gpr::RCX, width, count);
    let take = match kind {
        LoopKind::Loop => count != 0,
        LoopKind::Loope => count != 0 && state.flag(RFLAGS_ZF),
        LoopKind::Loopne => count != 0 && !state.flag(RFLAGS_ZF),
    };
    if take {
        let next = state.rip.wrapping_add(inst.length as u64);
        state.rip = next.wrapping_add(inst.rel as u64);
        Ok(StepExit::Branch)
    } else {
        Ok(StepExit::Continue)
    }
}

pub fn exec_jcxz(state: &mut CpuState, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.addr_width;
    if state.read_gpr(gpr::RCX, width) & width.mask() == 0 {
        let next = state.rip.wrapping_add(inst.length as u64);
        state.rip = next.wrapping_add(inst.rel as u64);
        Ok(StepExit::Branch)
    } else {
        Ok(StepExit::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;

    fn base_inst() -> Instruction {
        Instruction {
            mnemonic: Mnemonic::JmpRel,
            width: Width::W32,
            addr_width: Width::W32,
            rm: RmOperand::Reg(0),
            raw_rm: None,
            reg: 0,
            imm: 0,
            rel: 0,
            rex_present: false,
            seg_override: None,
            rep: None,
            length: 2,
            far_selector: 0,
            imm_is_operand: false,
        }
    }

    #[test]
    fn jmp_rel_targets_next_ip_plus_displacement() {
        let mut st = CpuState::reset();
        st.rip = 0x1000;
        let mut inst = base_inst();
        inst.length = 2;
        inst.rel = 0x10;
        exec_jmp_rel(&mut st, &inst).unwrap();
        assert_eq!(st.rip, 0x1012);
    }

    #[test]
    fn jcc_not_taken_returns_continue_without_touching_rip() {
        let mut st = CpuState::reset();
        st.rip = 0x1000;
        st.set_flag(RFLAGS_ZF, false);
        let inst = base_inst();
        let exit = exec_jcc(&mut st, &inst, Condition::E).unwrap();
        assert_eq!(exit, StepExit::Continue);
        assert_eq!(st.rip, 0x1000);
    }

    #[test]
    fn call_rel_then_ret_round_trips() {
        let mut st = CpuState::reset();
        st.rip = 0x1000;
        st.write_gpr(gpr::RSP, Width::W32, 0x2000);
        let mut bus = FlatTestBus::new(0x4000);
        let mut call_inst = base_inst();
        call_inst.mnemonic = Mnemonic::CallRel;
        call_inst.length = 5;
        call_inst.rel = 0x100;
        exec_call_rel(&mut st, &mut bus, &call_inst).unwrap();
        assert_eq!(st.rip, 0x1105);

        let mut ret_inst = base_inst();
        ret_inst.mnemonic = Mnemonic::Ret;
        exec_ret(&mut st, &mut bus, &ret_inst).unwrap();
        assert_eq!(st.rip, 0x1005);
        assert_eq!(st.read_gpr(gpr::RSP, Width::W32), 0x2000);
    }

    #[test]
    fn loop_decrements_and_branches_while_nonzero() {
        let mut st = CpuState::reset();
        st.rip = 0x1000;
        st.write_gpr(gpr::RCX, Width::W32, 1);
        let mut inst = base_inst();
        inst.mnemonic = Mnemonic::Loop(LoopKind::Loop);
        inst.length = 2;
        inst.rel = -5;
        let exit = exec_loop(&mut st, &inst, LoopKind::Loop).unwrap();
        assert_eq!(exit, StepExit::Continue);
        assert_eq!(st.read_gpr(gpr::RCX, Width::W32), 0);
    }
}
