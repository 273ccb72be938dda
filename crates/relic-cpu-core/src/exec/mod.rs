//! Execution Core (C7): the dispatch table spec.md §4.3 describes, keyed
//! here by `Mnemonic` rather than a literal 256×256×8 array — the
//! variant-heavy tagged-enum-plus-flat-match approach spec.md §9
//! recommends over boxed instruction objects, just expressed through
//! Rust's own match exhaustiveness instead of a hand-built jump table.

pub mod alu;
pub mod branch;
pub mod data;
pub mod shift;
pub mod stack;
pub mod string;
pub mod system;

use crate::decode::{Instruction, Mnemonic};
use crate::error::Exception;
use crate::mem::CpuBus;
use crate::state::CpuState;

/// What the dispatcher should do next. `Continue`/`ContinueInhibitInterrupt`
/// both mean "advance to `next_ip`, call the decoder again"; `Branch` means
/// IP was already redirected non-sequentially (the caller must not add
/// `inst.length`); `Halt` means HLT retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    Continue,
    ContinueInhibitInterrupt,
    Branch,
    Halt,
}

pub fn dispatch<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    inst: &Instruction,
) -> Result<StepExit, Exception> {
    use Mnemonic::*;
    match inst.mnemonic {
        Alu(op) => alu::exec_alu(state, bus, inst, op),
        Test => alu::exec_test(state, bus, inst),
        Not => alu::exec_not(state, bus, inst),
        Neg => alu::exec_neg(state, bus, inst),
        Mul => alu::exec_mul(state, bus, inst),
        Imul1 => alu::exec_imul1(state, bus, inst),
        ImulRmReg => alu::exec_imul_rm_reg(state, bus, inst),
        ImulRmImm => alu::exec_imul_rm_imm(state, bus, inst),
        Div => alu::exec_div(state, bus, inst),
        Idiv => alu::exec_idiv(state, bus, inst),
        Inc => alu::exec_inc_dec(state, bus, inst, true),
        Dec => alu::exec_inc_dec(state, bus, inst, false),
        Daa => alu::exec_daa(state),
        Das => alu::exec_das(state),

        Shift(op) => shift::exec_shift(state, bus, inst, op),

        Mov => data::exec_mov(state, bus, inst),
        Movzx => data::exec_movzx(state, bus, inst),
        Movsx => data::exec_movsx(state, bus, inst),
        Lea => data::exec_lea(state, inst),
        Xchg => data::exec_xchg(state, bus, inst),
        Nop => Ok(StepExit::Continue),
        Cbw | Cwde | Cdqe => data::exec_sign_extend_acc(state, inst.mnemonic),
        Cwd | Cdq | Cqo => data::exec_sign_extend_pair(state, inst.mnemonic),

        Push => stack::exec_push(state, bus, inst),
        Pop => stack::exec_pop(state, bus, inst),
        Leave => stack::exec_leave(state, bus, inst),
        Pusha => stack::exec_pusha(state, bus, inst),
        Popa => stack::exec_popa(state, bus, inst),
        Pushf => stack::exec_pushf(state, bus, inst),
        Popf => stack::exec_popf(state, bus, inst),

        JmpRel => branch::exec_jmp_rel(state, inst),
        JmpFar => branch::exec_jmp_far(state, bus, inst),
        JmpRm => branch::exec_jmp_rm(state, bus, inst),
        JmpFarRm => branch::exec_jmp_far_rm(state, bus, inst),
        Jcc(cond) => branch::exec_jcc(state, inst, cond),
        CallRel => branch::exec_call_rel(state, bus, inst),
        CallRm => branch::exec_call_rm(state, bus, inst),
        CallFar => branch::exec_call_far(state, bus, inst),
        Ret => branch::exec_ret(state, bus, inst),
        RetImm => branch::exec_ret(state, bus, inst),
        RetFar => branch::exec_ret_far(state, bus),
        Loop(kind) => branch::exec_loop(state, inst, kind),
        Jcxz => branch::exec_jcxz(state, inst),

        Movs => string::exec_movs(state, bus, inst),
        Cmps => string::exec_cmps(state, bus, inst),
        Stos => string::exec_stos(state, bus, inst),
        Lods => string::exec_lods(state, bus, inst),
        Scas => string::exec_scas(state, bus, inst),

        Clc => {
            state.set_flag(crate::state::RFLAGS_CF, false);
            Ok(StepExit::Continue)
        }
        Stc => {
            state.set_flag(crate::state::RFLAGS_CF, true);
            Ok(StepExit::Continue)
        }
        Cmc => {
            let cf = state.flag(crate::state::RFLAGS_CF);
            state.set_flag(crate::state::RFLAGS_CF, !cf);
            Ok(StepExit::Continue)
        }
        Cld => {
            state.set_flag(crate::state::RFLAGS_DF, false);
            Ok(StepExit::Continue)
        }
        Std => {
            state.set_flag(crate::state::RFLAGS_DF, true);
            Ok(StepExit::Continue)
        }
        Cli => system::exec_cli(state),
        Sti => system::exec_sti(state),

        Hlt => {
            state.halted = true;
            Ok(StepExit::Halt)
        }

        Int3 => {
            let return_ip = state.rip.wrapping_add(inst.length as u64);
            crate::interrupts::deliver_software(state, bus, 3, return_ip)?;
            Ok(StepExit::Branch)
        }
        IntImm => {
            let return_ip = state.rip.wrapping_add(inst.length as u64);
            crate::interrupts::deliver_software(state, bus, inst.imm as u8, return_ip)?;
            Ok(StepExit::Branch)
        }
        Into => {
            if state.flag(crate::state::RFLAGS_OF) {
                let return_ip = state.rip.wrapping_add(inst.length as u64);
                crate::interrupts::deliver_software(state, bus, 4, return_ip)?;
                Ok(StepExit::Branch)
            } else {
                Ok(StepExit::Continue)
            }
        }
        Iret => {
            crate::interrupts::iret(state, bus)?;
            Ok(StepExit::Branch)
        }

        Cpuid => system::exec_cpuid(state),
        Rdtsc => Err(Exception::InvalidOpcode),
        In => system::exec_in(state, bus, inst),
        Out => system::exec_out(state, bus, inst),
        Ud2 => Err(Exception::InvalidOpcode),
    }
}
