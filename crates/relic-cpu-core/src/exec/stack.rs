//! Stack group (spec.md §4.3): PUSH/POP/PUSHA/POPA/PUSHF/POPF/LEAVE.
//!
//! All of these share the push/pop-a-slot-through-SS primitive the
//! interrupt/privilege engine also uses, just without the gate/TSS
//! machinery — kept as its own small pair here rather than exported from
//! `interrupts`, since the two modules have no other reason to depend on
//! each other.

use crate::decode::Instruction;
use crate::error::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::operand::{read_operand, write_operand, RmOperand};
use crate::state::{gpr, mask_bits, CpuState, RFLAGS_IF, RFLAGS_IOPL_MASK};
use relic_x86::Width;

fn push_value<B: CpuBus>(state: &mut CpuState, bus: &mut B, width: Width, value: u64) -> Result<(), Exception> {
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

fn pop_value<B: CpuBus>(state: &mut CpuState, bus: &mut B, width: Width) -> Result<u64, Exception> {
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

pub fn exec_push<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let value = if inst.imm_is_operand {
        mask_bits(inst.imm as u64, width)
    } else {
        read_operand(state, bus, inst.rm, width, inst.rex_present)?
    };
    push_value(state, bus, width, value)?;
    Ok(StepExit::Continue)
}

pub fn exec_pop<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let value = pop_value(state, bus, width)?;
    write_operand(state, bus, inst.rm, width, inst.rex_present, value)?;
    Ok(StepExit::Continue)
}

/// LEAVE: `mov rsp, rbp` followed by `pop rbp`.
pub fn exec_leave<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let rbp = state.read_gpr(gpr::RBP, width);
    state.write_gpr(gpr::RSP, width, rbp);
    let value = pop_value(state, bus, width)?;
    state.write_gpr(gpr::RBP, width, value);
    let _ = inst;
    Ok(StepExit::Continue)
}

const PUSHA_ORDER: [u8; 8] = [gpr::RAX, gpr::RCX, gpr::RDX, gpr::RBX, gpr::RSP, gpr::RBP, gpr::RSI, gpr::RDI];

pub fn exec_pusha<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let original_sp = state.read_gpr(gpr::RSP, width);
    for &reg in PUSHA_ORDER.iter() {
        let value = if reg == gpr::RSP { original_sp } else { state.read_gpr(reg, width) };
        push_value(state, bus, width, value)?;
    }
    Ok(StepExit::Continue)
}

pub fn exec_popa<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    for &reg in PUSHA_ORDER.iter().rev() {
        let value = pop_value(state, bus, width)?;
        if reg != gpr::RSP {
            state.write_gpr(reg, width, value);
        }
    }
    Ok(StepExit::Continue)
}

pub fn exec_pushf<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let flags = state.rflags() & width.mask();
    push_value(state, bus, width, flags)?;
    Ok(StepExit::Continue)
}

pub fn exec_popf<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let popped = pop_value(state, bus, width)?;
    let current = state.rflags();
    let mut merged = (current & !width.mask()) | (popped & width.mask());

    let can_change_if = state.cpl == 0 || state.cpl <= state.iopl();
    let can_change_iopl = state.cpl == 0;
    if !can_change_if {
        merged = (merged & !RFLAGS_IF) | (current & RFLAGS_IF);
    }
    if !can_change_iopl {
        merged = (merged & !RFLAGS_IOPL_MASK) | (current & RFLAGS_IOPL_MASK);
    }
    state.set_rflags(merged);
    Ok(StepExit::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Mnemonic;
    use crate::mem::FlatTestBus;

    fn base_inst(width: Width, rm: RmOperand) -> Instruction {
        Instruction {
            mnemonic: Mnemonic::Push,
            width,
            addr_width: Width::W32,
            rm,
            raw_rm: None,
            reg: 0,
            imm: 0,
            rel: 0,
            rex_present: false,
            seg_override: None,
            rep: None,
            length: 1,
            far_selector: 0,
            imm_is_operand: false,
        }
    }

    #[test]
    fn push_then_pop_round_trips() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RSP, Width::W32, 0x2000);
        st.write_gpr(gpr::RAX, Width::W32, 0xDEAD_BEEF);
        let mut bus = FlatTestBus::new(0x4000);
        let push_inst = base_inst(Width::W32, RmOperand::Reg(gpr::RAX));
        exec_push(&mut st, &mut bus, &push_inst).unwrap();
        assert_eq!(st.read_gpr(gpr::RSP, Width::W32), 0x1FFC);

        st.write_gpr(gpr::RBX, Width::W32, 0);
        let pop_inst = base_inst(Width::W32, RmOperand::Reg(gpr::RBX));
        exec_pop(&mut st, &mut bus, &pop_inst).unwrap();
        assert_eq!(st.read_gpr(gpr::RBX, Width::W32), 0xDEAD_BEEF);
        assert_eq!(st.read_gpr(gpr::RSP, Width::W32), 0x2000);
    }

    #[test]
    fn push_imm_pushes_the_immediate_not_rax() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RSP, Width::W32, 0x2000);
        st.write_gpr(gpr::RAX, Width::W32, 0x1111_1111);
        let mut bus = FlatTestBus::new(0x4000);
        let mut inst = base_inst(Width::W32, RmOperand::Reg(gpr::RAX));
        inst.imm = 0x7F;
        inst.imm_is_operand = true;
        exec_push(&mut st, &mut bus, &inst).unwrap();
        let addr = st.segments.ss.base + 0x1FFC;
        assert_eq!(bus.read_u32(addr).unwrap(), 0x7F);
    }

    #[test]
    fn leave_restores_caller_frame() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RBP, Width::W32, 0x3000);
        st.write_gpr(gpr::RSP, Width::W32, 0x1000);
        let mut bus = FlatTestBus::new(0x4000);
        bus.write_u32(st.segments.ss.base + 0x3000, 0x2FF0).unwrap();
        let inst = base_inst(Width::W32, RmOperand::Reg(0));
        exec_leave(&mut st, &mut bus, &inst).unwrap();
        assert_eq!(st.read_gpr(gpr::RBP, Width::W32), 0x2FF0);
        assert_eq!(st.read_gpr(gpr::RSP, Width::W32), 0x3004);
    }

    #[test]
    fn popf_in_user_mode_cannot_raise_if() {
        let mut st = CpuState::reset();
        st.cpl = 3;
        st.write_gpr(gpr::RSP, Width::W32, 0x2000);
        let mut bus = FlatTestBus::new(0x4000);
        bus.write_u32(st.segments.ss.base + 0x2000, 0xFFFF_FFFF).unwrap();
        let inst = base_inst(Width::W32, RmOperand::Reg(0));
        exec_popf(&mut st, &mut bus, &inst).unwrap();
        assert!(!st.flag(RFLAGS_IF));
    }
}
