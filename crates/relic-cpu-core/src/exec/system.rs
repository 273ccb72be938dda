//! System/misc group (spec.md §4 supplements): CLI/STI, the CPUID leaf
//! 0/1 stub, and IN/OUT's host port-I/O callback boundary.
//!
//! CLI/STI/IN/OUT share x86's IOPL-gating rule: in real mode they are
//! unconditionally permitted; in protected/compatibility/long mode they
//! require CPL <= IOPL, else #GP(0).

use crate::decode::Instruction;
use crate::error::Exception;
use crate::exec::StepExit;
use crate::mem::CpuBus;
use crate::state::{gpr, CpuMode, CpuState, RFLAGS_IF};
use relic_x86::Width;

fn iopl_gated(state: &CpuState) -> bool {
    !matches!(state.mode, CpuMode::Real)
}

fn check_iopl(state: &CpuState) -> Result<(), Exception> {
    if iopl_gated(state) && state.cpl > state.iopl() {
        return Err(Exception::GeneralProtection { selector: 0 });
    }
    Ok(())
}

pub fn exec_cli(state: &mut CpuState) -> Result<StepExit, Exception> {
    check_iopl(state)?;
    state.set_flag(RFLAGS_IF, false);
    // A CLI immediately after STI cancels the pending shadow outright.
    state.interrupt_shadow = false;
    Ok(StepExit::Continue)
}

pub fn exec_sti(state: &mut CpuState) -> Result<StepExit, Exception> {
    check_iopl(state)?;
    state.set_flag(RFLAGS_IF, true);
    // Armed so the host's interrupt-recognition check only fires after
    // the instruction following STI has also retired; `ContinueInhibitInterrupt`
    // tells the step/run loop not to clear it on this same retirement.
    state.interrupt_shadow = true;
    Ok(StepExit::ContinueInhibitInterrupt)
}

/// Vendor string split little-endian across EBX:EDX:ECX, Intel's own
/// CPUID-leaf-0 convention applied to a string of our own.
const VENDOR_STRING: &[u8; 12] = b"GenuineRelic";

pub fn exec_cpuid(state: &mut CpuState) -> Result<StepExit, Exception> {
    let leaf = state.read_gpr(gpr::RAX, Width::W32) as u32;
    match leaf {
        0 => {
            let ebx = u32::from_le_bytes(VENDOR_STRING[0..4].try_into().unwrap());
            let edx = u32::from_le_bytes(VENDOR_STRING[4..8].try_into().unwrap());
            let ecx = u32::from_le_bytes(VENDOR_STRING[8..12].try_into().unwrap());
            state.write_gpr(gpr::RAX, Width::W32, 1);
            state.write_gpr(gpr::RBX, Width::W32, ebx as u64);
            state.write_gpr(gpr::RCX, Width::W32, ecx as u64);
            state.write_gpr(gpr::RDX, Width::W32, edx as u64);
        }
        _ => {
            // Leaf 1: a fixed family/model/stepping and an all-clear
            // feature mask (FPU/TSC/MSR/PAE/PGE/CX8/APIC all unset —
            // matches RDTSC's #UD stub and the x87/SSE Non-goal).
            state.write_gpr(gpr::RAX, Width::W32, 0x0000_0600);
            state.write_gpr(gpr::RBX, Width::W32, 0);
            state.write_gpr(gpr::RCX, Width::W32, 0);
            state.write_gpr(gpr::RDX, Width::W32, 0);
        }
    }
    Ok(StepExit::Continue)
}

fn port_number(state: &CpuState, inst: &Instruction) -> u16 {
    if inst.imm_is_operand {
        inst.imm as u16
    } else {
        state.read_gpr(gpr::RDX, Width::W16) as u16
    }
}

pub fn exec_in<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    check_iopl(state)?;
    let width = inst.width;
    let port = port_number(state, inst);
    let value = bus.port_in(port, width) as u64 & width.mask();
    state.write_gpr(gpr::RAX, width, value);
    Ok(StepExit::Continue)
}

pub fn exec_out<B: CpuBus>(state: &mut CpuState, bus: &mut B, inst: &Instruction) -> Result<StepExit, Exception> {
    check_iopl(state)?;
    let width = inst.width;
    let port = port_number(state, inst);
    let value = (state.read_gpr(gpr::RAX, width) & width.mask()) as u32;
    bus.port_out(port, width, value);
    Ok(StepExit::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Mnemonic;
    use crate::mem::FlatTestBus;
    use crate::operand::RmOperand;

    fn base_inst(width: Width) -> Instruction {
        Instruction {
            mnemonic: Mnemonic::In,
            width,
            addr_width: Width::W32,
            rm: RmOperand::Reg(0),
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
    fn cpuid_leaf0_reports_max_leaf_and_vendor_string() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W32, 0);
        exec_cpuid(&mut st).unwrap();
        assert_eq!(st.read_gpr(gpr::RAX, Width::W32), 1);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(st.read_gpr(gpr::RBX, Width::W32) as u32).to_le_bytes());
        bytes.extend_from_slice(&(st.read_gpr(gpr::RDX, Width::W32) as u32).to_le_bytes());
        bytes.extend_from_slice(&(st.read_gpr(gpr::RCX, Width::W32) as u32).to_le_bytes());
        assert_eq!(&bytes, VENDOR_STRING);
    }

    #[test]
    fn cpuid_leaf1_reports_no_fpu_tsc_msr() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W32, 1);
        exec_cpuid(&mut st).unwrap();
        assert_eq!(st.read_gpr(gpr::RDX, Width::W32), 0);
        assert_eq!(st.read_gpr(gpr::RCX, Width::W32), 0);
    }

    #[test]
    fn out_dx_does_not_fault_in_real_mode() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RDX, Width::W16, 0x3F8);
        st.write_gpr(gpr::RAX, Width::W8, 0x42);
        let mut bus = FlatTestBus::new(0x10);
        let mut inst = base_inst(Width::W8);
        inst.mnemonic = Mnemonic::Out;
        assert_eq!(exec_out(&mut st, &mut bus, &inst).unwrap(), StepExit::Continue);
    }

    #[test]
    fn in_imm8_port_in_user_mode_with_low_iopl_faults() {
        let mut st = CpuState::reset();
        st.mode = CpuMode::Protected;
        st.cpl = 3;
        let mut bus = FlatTestBus::new(0x10);
        let mut inst = base_inst(Width::W8);
        inst.imm = 0x60;
        inst.imm_is_operand = true;
        let err = exec_in(&mut st, &mut bus, &inst).unwrap_err();
        assert!(matches!(err, Exception::GeneralProtection { .. }));
    }
}
