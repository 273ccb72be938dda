//! Arithmetic/logic group (spec.md §4.3): ADD/OR/ADC/SBB/AND/SUB/XOR/CMP,
//! TEST, NOT/NEG, MUL/IMUL, DIV/IDIV, INC/DEC, DAA/DAS.

use crate::decode::{AluOp, Instruction};
use crate::error::Exception;
use crate::exec::StepExit;
use crate::flags::{add_with_carry, clear_cf_of, set_zsp, sub_with_borrow};
use crate::mem::CpuBus;
use crate::operand::{read_operand, write_operand, RmOperand};
use crate::state::{gpr, mask_bits, CpuState, RFLAGS_AF, RFLAGS_CF, RFLAGS_OF};
use relic_x86::Width;

fn read_reg<B: CpuBus>(state: &CpuState, bus: &mut B, idx: u8, width: Width, rex_present: bool) -> Result<u64, Exception> {
    read_operand(state, bus, RmOperand::Reg(idx), width, rex_present)
}

fn sign_extend(value: u64, width: Width) -> i64 {
    let masked = value & width.mask();
    if masked & width.sign_bit() != 0 {
        (masked | !width.mask()) as i64
    } else {
        masked as i64
    }
}

pub fn exec_alu<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction, op: AluOp) -> Result<StepExit, Exception> {
    let width = inst.width;
    let dest_is_reg = inst.far_selector == 1;

    let (dest_val, src_val) = if dest_is_reg {
        let dest = read_reg(state, bus, inst.reg, width, inst.rex_present)?;
        let src = read_operand(state, bus, inst.rm, width, inst.rex_present)?;
        (dest, src)
    } else {
        let dest = read_operand(state, bus, inst.rm, width, inst.rex_present)?;
        let src = if inst.imm_is_operand {
            mask_bits(inst.imm as u64, width)
        } else {
            read_reg(state, bus, inst.reg, width, inst.rex_present)?
        };
        (dest, src)
    };

    let carry_in = state.flag(RFLAGS_CF) as u64;
    let result = match op {
        AluOp::Add | AluOp::Adc => {
            let carry = if matches!(op, AluOp::Adc) { carry_in } else { 0 };
            let r = add_with_carry(dest_val, src_val, carry, width);
            state.set_flag(RFLAGS_CF, r.cf);
            state.set_flag(RFLAGS_OF, r.of);
            state.set_flag(RFLAGS_AF, r.af);
            set_zsp(state, r.result, width);
            Some(r.result)
        }
        AluOp::Sub | AluOp::Sbb | AluOp::Cmp => {
            let borrow = if matches!(op, AluOp::Sbb) { carry_in } else { 0 };
            let r = sub_with_borrow(dest_val, src_val, borrow, width);
            state.set_flag(RFLAGS_CF, r.cf);
            state.set_flag(RFLAGS_OF, r.of);
            state.set_flag(RFLAGS_AF, r.af);
            set_zsp(state, r.result, width);
            if matches!(op, AluOp::Cmp) {
                None
            } else {
                Some(r.result)
            }
        }
        AluOp::And | AluOp::Or | AluOp::Xor => {
            let r = (match op {
                AluOp::And => dest_val & src_val,
                AluOp::Or => dest_val | src_val,
                _ => dest_val ^ src_val,
            }) & width.mask();
            clear_cf_of(state);
            set_zsp(state, r, width);
            Some(r)
        }
    };

    if let Some(value) = result {
        if dest_is_reg {
            write_operand(state, bus, RmOperand::Reg(inst.reg), width, inst.rex_present, value)?;
        } else {
            write_operand(state, bus, inst.rm, width, inst.rex_present, value)?;
        }
    }

    Ok(StepExit::Continue)
}

pub fn exec_test<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let a = read_operand(state, bus, inst.rm, width, inst.rex_present)?;
    let b = if inst.imm_is_operand {
        mask_bits(inst.imm as u64, width)
    } else {
        read_reg(state, bus, inst.reg, width, inst.rex_present)?
    };
    let r = (a & b) & width.mask();
    clear_cf_of(state);
    set_zsp(state, r, width);
    Ok(StepExit::Continue)
}

pub fn exec_not<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let v = read_operand(state, bus, inst.rm, width, inst.rex_present)?;
    let r = (!v) & width.mask();
    write_operand(state, bus, inst.rm, width, inst.rex_present, r)?;
    Ok(StepExit::Continue)
}

pub fn exec_neg<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let v = read_operand(state, bus, inst.rm, width, inst.rex_present)?;
    let r = sub_with_borrow(0, v, 0, width);
    state.set_flag(RFLAGS_CF, r.cf);
    state.set_flag(RFLAGS_OF, r.of);
    state.set_flag(RFLAGS_AF, r.af);
    set_zsp(state, r.result, width);
    write_operand(state, bus, inst.rm, width, inst.rex_present, r.result)?;
    Ok(StepExit::Continue)
}

pub fn exec_inc_dec<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction, is_inc: bool) -> Result<StepExit, Exception> {
    let width = inst.width;
    let v = read_operand(state, bus, inst.rm, width, inst.rex_present)?;
    // INC/DEC leave CF untouched; only AF/OF/ZF/SF/PF are live here.
    let (result, af, of) = if is_inc {
        let r = add_with_carry(v, 1, 0, width);
        (r.result, r.af, r.of)
    } else {
        let r = sub_with_borrow(v, 1, 0, width);
        (r.result, r.af, r.of)
    };
    state.set_flag(RFLAGS_AF, af);
    state.set_flag(RFLAGS_OF, of);
    set_zsp(state, result, width);
    write_operand(state, bus, inst.rm, width, inst.rex_present, result)?;
    Ok(StepExit::Continue)
}

fn split_product(value: u128, width: Width) -> (u64, u64) {
    let n = width.bits();
    let mask: u128 = if n == 64 { u128::MAX } else { (1u128 << n) - 1 };
    let lo = (value & mask) as u64;
    let hi = ((value >> n) & mask) as u64;
    (lo, hi)
}

fn store_wide_result<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    inst: &Instruction,
    lo: u64,
    hi: u64,
    width: Width,
) -> Result<(), Exception> {
    match width {
        Width::W8 => {
            let combined = (lo & 0xFF) | ((hi & 0xFF) << 8);
            write_operand(state, bus, RmOperand::Reg(gpr::RAX), Width::W16, inst.rex_present, combined)
        }
        _ => {
            write_operand(state, bus, RmOperand::Reg(gpr::RAX), width, inst.rex_present, lo)?;
            write_operand(state, bus, RmOperand::Reg(gpr::RDX), width, inst.rex_present, hi)
        }
    }
}

pub fn exec_mul<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let src = read_operand(state, bus, inst.rm, width, inst.rex_present)? & width.mask();
    let acc = read_operand(state, bus, RmOperand::Reg(gpr::RAX), width, inst.rex_present)? & width.mask();
    let product = (acc as u128) * (src as u128);
    let (lo, hi) = split_product(product, width);
    store_wide_result(state, bus, inst, lo, hi, width)?;
    let overflow = hi != 0;
    state.set_flag(RFLAGS_CF, overflow);
    state.set_flag(RFLAGS_OF, overflow);
    Ok(StepExit::Continue)
}

pub fn exec_imul1<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let src = sign_extend(read_operand(state, bus, inst.rm, width, inst.rex_present)?, width) as i128;
    let acc = sign_extend(read_operand(state, bus, RmOperand::Reg(gpr::RAX), width, inst.rex_present)?, width) as i128;
    let product = (acc * src) as u128;
    let (lo, hi) = split_product(product, width);
    store_wide_result(state, bus, inst, lo, hi, width)?;
    let expected_hi = if lo & width.sign_bit() != 0 { width.mask() } else { 0 };
    let overflow = hi != expected_hi;
    state.set_flag(RFLAGS_CF, overflow);
    state.set_flag(RFLAGS_OF, overflow);
    Ok(StepExit::Continue)
}

pub fn exec_imul_rm_reg<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let a = sign_extend(read_operand(state, bus, RmOperand::Reg(inst.reg), width, inst.rex_present)?, width) as i128;
    let b = sign_extend(read_operand(state, bus, inst.rm, width, inst.rex_present)?, width) as i128;
    let product = a * b;
    let truncated = (product as u64) & width.mask();
    let overflow = sign_extend(truncated, width) as i128 != product;
    state.set_flag(RFLAGS_CF, overflow);
    state.set_flag(RFLAGS_OF, overflow);
    write_operand(state, bus, RmOperand::Reg(inst.reg), width, inst.rex_present, truncated)?;
    Ok(StepExit::Continue)
}

pub fn exec_imul_rm_imm<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let a = sign_extend(read_operand(state, bus, inst.rm, width, inst.rex_present)?, width) as i128;
    let b = inst.imm as i128;
    let product = a * b;
    let truncated = (product as u64) & width.mask();
    let overflow = sign_extend(truncated, width) as i128 != product;
    state.set_flag(RFLAGS_CF, overflow);
    state.set_flag(RFLAGS_OF, overflow);
    write_operand(state, bus, RmOperand::Reg(inst.reg), width, inst.rex_present, truncated)?;
    Ok(StepExit::Continue)
}

fn load_wide_dividend<B: CpuBus>(state: &CpuState, bus: &mut B, inst: &Instruction, width: Width) -> Result<u128, Exception> {
    match width {
        Width::W8 => {
            let ax = read_operand(state, bus, RmOperand::Reg(gpr::RAX), Width::W16, inst.rex_present)?;
            Ok(ax as u128)
        }
        _ => {
            let lo = read_operand(state, bus, RmOperand::Reg(gpr::RAX), width, inst.rex_present)?;
            let hi = read_operand(state, bus, RmOperand::Reg(gpr::RDX), width, inst.rex_present)?;
            Ok((lo as u128) | ((hi as u128) << width.bits()))
        }
    }
}

fn store_div_result<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    inst: &Instruction,
    quotient: u64,
    remainder: u64,
    width: Width,
) -> Result<(), Exception> {
    match width {
        Width::W8 => {
            write_operand(state, bus, RmOperand::Reg(gpr::RAX), Width::W8, inst.rex_present, quotient)?;
            // AH (encoding 4, REX never applies to this implicit operand).
            write_operand(state, bus, RmOperand::Reg(4), Width::W8, false, remainder)
        }
        _ => {
            write_operand(state, bus, RmOperand::Reg(gpr::RAX), width, inst.rex_present, quotient)?;
            write_operand(state, bus, RmOperand::Reg(gpr::RDX), width, inst.rex_present, remainder)
        }
    }
}

pub fn exec_div<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let divisor = read_operand(state, bus, inst.rm, width, inst.rex_present)? & width.mask();
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let dividend = load_wide_dividend(state, bus, inst, width)?;
    let divisor_u = divisor as u128;
    let quotient = dividend / divisor_u;
    let remainder = dividend % divisor_u;
    if quotient > width.mask() as u128 {
        return Err(Exception::DivideError);
    }
    store_div_result(state, bus, inst, quotient as u64, remainder as u64, width)?;
    Ok(StepExit::Continue)
}

/// Reinterprets `value` as a two's-complement number at `2 * width.bits()`
/// bits — the natural width of a `RDX:RAX`-style dividend.
fn double_signed(value: u128, width: Width) -> i128 {
    let n = width.bits();
    if n == 64 {
        value as i128
    } else {
        let total_bits = n * 2;
        let sign_bit = 1u128 << (total_bits - 1);
        if value & sign_bit != 0 {
            (value | (!0u128 << total_bits)) as i128
        } else {
            value as i128
        }
    }
}

pub fn exec_idiv<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    let width = inst.width;
    let divisor = sign_extend(read_operand(state, bus, inst.rm, width, inst.rex_present)?, width) as i128;
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let dividend = double_signed(load_wide_dividend(state, bus, inst, width)?, width);
    let quotient = dividend / divisor;
    let remainder = dividend % divisor;

    let n = width.bits();
    let max_q = (1i128 << (n - 1)) - 1;
    let min_q = -(1i128 << (n - 1));
    if quotient > max_q || quotient < min_q {
        return Err(Exception::DivideError);
    }

    store_div_result(
        state,
        bus,
        inst,
        (quotient as u64) & width.mask(),
        (remainder as u64) & width.mask(),
        width,
    )?;
    Ok(StepExit::Continue)
}

pub fn exec_daa(state: &mut CpuState) -> Result<StepExit, Exception> {
    let old_al = state.read_gpr8(gpr::RAX, false);
    let old_cf = state.flag(RFLAGS_CF);
    let mut al = old_al;
    let af_in = state.flag(RFLAGS_AF);
    let mut cf = false;
    let af;

    if (al & 0x0F) > 9 || af_in {
        cf = old_cf || old_al > 0xF9;
        al = al.wrapping_add(6);
        af = true;
    } else {
        af = false;
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_add(0x60);
        cf = true;
    }

    state.write_gpr8(gpr::RAX, false, al);
    state.set_flag(RFLAGS_CF, cf);
    state.set_flag(RFLAGS_AF, af);
    set_zsp(state, al as u64, Width::W8);
    Ok(StepExit::Continue)
}

pub fn exec_das(state: &mut CpuState) -> Result<StepExit, Exception> {
    let old_al = state.read_gpr8(gpr::RAX, false);
    let old_cf = state.flag(RFLAGS_CF);
    let mut al = old_al;
    let af_in = state.flag(RFLAGS_AF);
    let mut cf = false;
    let af;

    if (al & 0x0F) > 9 || af_in {
        cf = old_cf || old_al < 6;
        al = al.wrapping_sub(6);
        af = true;
    } else {
        af = false;
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_sub(0x60);
        cf = true;
    }

    state.write_gpr8(gpr::RAX, false, al);
    state.set_flag(RFLAGS_CF, cf);
    state.set_flag(RFLAGS_AF, af);
    set_zsp(state, al as u64, Width::W8);
    Ok(StepExit::Continue)
}
