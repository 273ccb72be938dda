//! Shift/rotate group (spec.md §4.3): ROL/ROR/RCL/RCR/SHL/SHR/SAR.
//!
//! OF is architecturally defined only when the masked shift count is
//! exactly 1; for any other count it is left untouched (genuinely
//! undefined on real hardware, and exec doesn't pretend otherwise).

use crate::decode::{Instruction, ShiftOp};
use crate::error::Exception;
use crate::exec::StepExit;
use crate::flags::set_zsp;
use crate::mem::CpuBus;
use crate::operand::{read_operand, write_operand};
use crate::state::{gpr, CpuState, RFLAGS_CF, RFLAGS_OF};
use relic_x86::Width;

fn shift_count<B: CpuBus>(state: &CpuState, bus: &mut B, inst: &Instruction, width: Width) -> Result<u32, Exception> {
    let raw: u64 = if inst.far_selector == 2 {
        read_operand(state, bus, crate::operand::RmOperand::Reg(gpr::RCX), Width::W8, false)?
    } else {
        inst.imm as u64
    };
    let mask: u64 = if width == Width::W64 { 0x3F } else { 0x1F };
    Ok((raw & mask) as u32)
}

pub fn exec_shift<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction, op: ShiftOp) -> Result<StepExit, Exception> {
    let width = inst.width;
    let bits = width.bits();
    let count = shift_count(state, bus, inst, width)?;
    if count == 0 {
        return Ok(StepExit::Continue);
    }

    let value = read_operand(state, bus, inst.rm, width, inst.rex_present)? & width.mask();
    let cf_in = state.flag(RFLAGS_CF) as u64;

    let (result, cf, of) = match op {
        ShiftOp::Shl => {
            let n = count.min(bits);
            let result = if n == bits { 0 } else { (value << n) & width.mask() };
            let cf = if n == 0 {
                cf_in != 0
            } else {
                (value >> (bits - n)) & 1 != 0
            };
            let of = (result & width.sign_bit() != 0) ^ cf;
            (result, cf, of)
        }
        ShiftOp::Shr => {
            let n = count.min(bits);
            let result = if n == bits { 0 } else { value >> n };
            let cf = if n == 0 { cf_in != 0 } else { (value >> (n - 1)) & 1 != 0 };
            let of = value & width.sign_bit() != 0;
            (result, cf, of)
        }
        ShiftOp::Sar => {
            let signed = sign_extend_to_i64(value, width);
            let n = count.min(63);
            let result = ((signed >> n) as u64) & width.mask();
            let cf = if count >= bits {
                signed < 0
            } else {
                (value >> (count - 1)) & 1 != 0
            };
            (result, cf, false)
        }
        ShiftOp::Rol => {
            let n = count % bits;
            let result = if n == 0 { value } else { ((value << n) | (value >> (bits - n))) & width.mask() };
            let cf = result & 1 != 0;
            let of = (result & width.sign_bit() != 0) ^ cf;
            (result, cf, of)
        }
        ShiftOp::Ror => {
            let n = count % bits;
            let result = if n == 0 { value } else { ((value >> n) | (value << (bits - n))) & width.mask() };
            let cf = result & width.sign_bit() != 0;
            let second_bit = (result >> (bits - 2)) & 1 != 0;
            let of = cf ^ second_bit;
            (result, cf, of)
        }
        ShiftOp::Rcl => {
            let modulus = bits + 1;
            let n = count % modulus;
            let mut acc = value;
            let mut carry = cf_in;
            for _ in 0..n {
                let new_carry = (acc & width.sign_bit() != 0) as u64;
                acc = ((acc << 1) | carry) & width.mask();
                carry = new_carry;
            }
            let of = (acc & width.sign_bit() != 0) ^ (carry != 0);
            (acc, carry != 0, of)
        }
        ShiftOp::Rcr => {
            let modulus = bits + 1;
            let n = count % modulus;
            let mut acc = value;
            let mut carry = cf_in;
            for _ in 0..n {
                let new_carry = acc & 1;
                acc = (acc >> 1) | (carry << (bits - 1));
                acc &= width.mask();
                carry = new_carry;
            }
            let of = (acc & width.sign_bit() != 0) ^ ((value & width.sign_bit() != 0));
            (acc, carry != 0, of)
        }
    };

    state.set_flag(RFLAGS_CF, cf);
    if count == 1 {
        state.set_flag(RFLAGS_OF, of);
    }
    match op {
        ShiftOp::Shl | ShiftOp::Shr | ShiftOp::Sar => set_zsp(state, result, width),
        ShiftOp::Rol | ShiftOp::Ror | ShiftOp::Rcl | ShiftOp::Rcr => {}
    }

    write_operand(state, bus, inst.rm, width, inst.rex_present, result)?;
    Ok(StepExit::Continue)
}

fn sign_extend_to_i64(value: u64, width: Width) -> i64 {
    let masked = value & width.mask();
    if masked & width.sign_bit() != 0 {
        (masked | !width.mask()) as i64
    } else {
        masked as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Mnemonic;
    use crate::mem::FlatTestBus;
    use crate::operand::RmOperand;

    fn base_inst(width: Width, imm: i64, rm: RmOperand) -> Instruction {
        Instruction {
            mnemonic: Mnemonic::Shift(ShiftOp::Shl),
            width,
            addr_width: Width::W32,
            rm,
            raw_rm: None,
            reg: 0,
            imm,
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
    fn shl_by_one_sets_cf_from_vacated_bit_and_of_from_xor() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W8, 0x80);
        let mut bus = FlatTestBus::new(16);
        let inst = base_inst(Width::W8, 1, RmOperand::Reg(gpr::RAX));
        exec_shift(&mut st, &mut bus, &inst, ShiftOp::Shl).unwrap();
        assert_eq!(st.read_gpr(gpr::RAX, Width::W8), 0);
        assert!(st.flag(RFLAGS_CF));
        assert!(st.flag(RFLAGS_OF));
    }

    #[test]
    fn sar_preserves_sign() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W8, 0x80);
        let mut bus = FlatTestBus::new(16);
        let inst = base_inst(Width::W8, 4, RmOperand::Reg(gpr::RAX));
        exec_shift(&mut st, &mut bus, &inst, ShiftOp::Sar).unwrap();
        assert_eq!(st.read_gpr(gpr::RAX, Width::W8), 0xF8);
    }

    #[test]
    fn rcl_by_nine_on_byte_is_identity_rotation_length() {
        let mut st = CpuState::reset();
        st.set_flag(RFLAGS_CF, false);
        st.write_gpr(gpr::RAX, Width::W8, 0x01);
        let mut bus = FlatTestBus::new(16);
        // rotation length for RCL8 is 9; rotating by 9 is the identity.
        let inst = base_inst(Width::W8, 9, RmOperand::Reg(gpr::RAX));
        exec_shift(&mut st, &mut bus, &inst, ShiftOp::Rcl).unwrap();
        assert_eq!(st.read_gpr(gpr::RAX, Width::W8), 0x01);
    }
}
