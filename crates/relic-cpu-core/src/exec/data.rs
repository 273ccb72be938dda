//! Data movement group (spec.md §4.3): MOV/MOVZX/MOVSX/LEA/XCHG/NOP and the
//! accumulator sign-extension family (CBW/CWDE/CDQE/CWD/CDQ/CQO).

use crate::decode::{Instruction, Mnemonic};
use crate::error::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::operand::{read_operand, write_operand, RmOperand};
use crate::state::{gpr, mask_bits, CpuState};
use relic_x86::{SegReg, Width};

fn sign_extend(value: u64, width: Width) -> i64 {
    let masked = value & width.mask();
    if masked & width.sign_bit() != 0 {
        (masked | !width.mask()) as i64
    } else {
        masked as i64
    }
}

pub fn exec_mov<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    if inst.far_selector == 1 {
        let v = read_operand(state, bus, inst.rm, width, inst.rex_present)?;
        write_operand(state, bus, RmOperand::Reg(inst.reg), width, inst.rex_present, v)?;
    } else {
        let v = if inst.imm_is_operand {
            mask_bits(inst.imm as u64, width)
        } else {
            read_operand(state, bus, RmOperand::Reg(inst.reg), width, inst.rex_present)?
        };
        write_operand(state, bus, inst.rm, width, inst.rex_present, v)?;
    }
    Ok(StepExit::Continue)
}

fn movzx_movsx_src_width(inst: &Instruction) -> Width {
    match inst.far_selector {
        8 => Width::W8,
        16 => Width::W16,
        _ => Width::W32,
    }
}

pub fn exec_movzx<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let src_width = movzx_movsx_src_width(inst);
    let v = read_operand(state, bus, inst.rm, src_width, inst.rex_present)? & src_width.mask();
    write_operand(state, bus, RmOperand::Reg(inst.reg), inst.width, inst.rex_present, v)?;
    Ok(StepExit::Continue)
}

pub fn exec_movsx<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let src_width = movzx_movsx_src_width(inst);
    let raw = read_operand(state, bus, inst.rm, src_width, inst.rex_present)?;
    let v = (sign_extend(raw, src_width) as u64) & inst.width.mask();
    write_operand(state, bus, RmOperand::Reg(inst.reg), inst.width, inst.rex_present, v)?;
    Ok(StepExit::Continue)
}

/// LEA's destination is the effective (segment-relative) address, not the
/// linear address the operand engine resolves for ordinary memory access —
/// so the segment base folded into `inst.rm` by the decoder has to come
/// back out here.
pub fn exec_lea(state: &mut CpuState, inst: &Instruction) -> Result<StepExit, Exception> {
    let linear = match inst.rm {
        RmOperand::Mem(addr) => addr,
        RmOperand::Reg(_) => return Err(Exception::InvalidOpcode),
    };
    let seg = inst.seg_override.unwrap_or(SegReg::Ds);
    let effective = linear.wrapping_sub(state.segments.get(seg).base);
    state.write_gpr(inst.reg, inst.width, effective & inst.width.mask());
    Ok(StepExit::Continue)
}

pub fn exec_xchg<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let a = read_operand(state, bus, inst.rm, width, inst.rex_present)?;
    let b = read_operand(state, bus, RmOperand::Reg(inst.reg), width, inst.rex_present)?;
    write_operand(state, bus, inst.rm, width, inst.rex_present, b)?;
    write_operand(state, bus, RmOperand::Reg(inst.reg), width, inst.rex_present, a)?;
    Ok(StepExit::Continue)
}

pub fn exec_sign_extend_acc(state: &mut CpuState, mnemonic: Mnemonic) -> Result<StepExit, Exception> {
    match mnemonic {
        Mnemonic::Cbw => {
            let al = state.read_gpr8(gpr::RAX, false) as i8 as i64 as u64;
            state.write_gpr(gpr::RAX, Width::W16, al & Width::W16.mask());
        }
        Mnemonic::Cwde => {
            let ax = state.read_gpr(gpr::RAX, Width::W16) as u16 as i16 as i64 as u64;
            state.write_gpr(gpr::RAX, Width::W32, ax & Width::W32.mask());
        }
        Mnemonic::Cdqe => {
            let eax = state.read_gpr(gpr::RAX, Width::W32) as u32 as i32 as i64 as u64;
            state.write_gpr(gpr::RAX, Width::W64, eax);
        }
        _ => unreachable!("exec_sign_extend_acc called with non-Cbw/Cwde/Cdqe mnemonic"),
    }
    Ok(StepExit::Continue)
}

pub fn exec_sign_extend_pair(state: &mut CpuState, mnemonic: Mnemonic) -> Result<StepExit, Exception> {
    match mnemonic {
        Mnemonic::Cwd => {
            let ax = state.read_gpr(gpr::RAX, Width::W16) as u16 as i16;
            state.write_gpr(gpr::RDX, Width::W16, if ax < 0 { 0xFFFF } else { 0 });
        }
        Mnemonic::Cdq => {
            let eax = state.read_gpr(gpr::RAX, Width::W32) as u32 as i32;
            state.write_gpr(gpr::RDX, Width::W32, if eax < 0 { 0xFFFF_FFFF } else { 0 });
        }
        Mnemonic::Cqo => {
            let rax = state.read_gpr(gpr::RAX, Width::W64) as i64;
            state.write_gpr(gpr::RDX, Width::W64, if rax < 0 { u64::MAX } else { 0 });
        }
        _ => unreachable!("exec_sign_extend_pair called with non-Cwd/Cdq/Cqo mnemonic"),
    }
    Ok(StepExit::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Mnemonic;
    use crate::mem::FlatTestBus;

    fn base_inst() -> Instruction {
        Instruction {
            mnemonic: Mnemonic::Mov,
            width: Width::W32,
            addr_width: Width::W32,
            rm: RmOperand::Reg(gpr::RAX),
            raw_rm: None,
            reg: gpr::RBX,
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
    fn mov_rm_dest_reads_from_reg() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RBX, Width::W32, 0x1234);
        let mut bus = FlatTestBus::new(16);
        let inst = base_inst();
        exec_mov(&mut st, &mut bus, &inst).unwrap();
        assert_eq!(st.read_gpr(gpr::RAX, Width::W32), 0x1234);
    }

    #[test]
    fn mov_reg_dest_reads_from_rm() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W32, 0x9999);
        let mut bus = FlatTestBus::new(16);
        let mut inst = base_inst();
        inst.far_selector = 1;
        exec_mov(&mut st, &mut bus, &inst).unwrap();
        assert_eq!(st.read_gpr(gpr::RBX, Width::W32), 0x9999);
    }

    #[test]
    fn movsx_sign_extends_negative_byte() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W8, 0x80);
        let mut bus = FlatTestBus::new(16);
        let mut inst = base_inst();
        inst.mnemonic = Mnemonic::Movsx;
        inst.far_selector = 8;
        inst.width = Width::W32;
        exec_movsx(&mut st, &mut bus, &inst).unwrap();
        assert_eq!(st.read_gpr(gpr::RBX, Width::W32), 0xFFFF_FF80);
    }

    #[test]
    fn cdqe_sign_extends_eax_into_rax() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W32, 0x8000_0000);
        exec_sign_extend_acc(&mut st, Mnemonic::Cdqe).unwrap();
        assert_eq!(st.read_gpr64(gpr::RAX), 0xFFFF_FFFF_8000_0000);
    }

    #[test]
    fn cdq_fills_edx_with_sign_of_eax() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W32, 0x8000_0000);
        exec_sign_extend_pair(&mut st, Mnemonic::Cdq).unwrap();
        assert_eq!(st.read_gpr(gpr::RDX, Width::W32), 0xFFFF_FFFF);
    }

    #[test]
    fn xchg_swaps_both_operands() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W32, 1);
        st.write_gpr(gpr::RBX, Width::W32, 2);
        let mut bus = FlatTestBus::new(16);
        let inst = base_inst();
        super::exec_xchg(&mut st, &mut bus, &inst).unwrap();
        assert_eq!(st.read_gpr(gpr::RAX, Width::W32), 2);
        assert_eq!(st.read_gpr(gpr::RBX, Width::W32), 1);
    }
}
