//! Interrupt & Privilege Engine (C9): INT n / INT3 / INTO software-trap
//! delivery, architectural-fault delivery, and IRET, all funneled through
//! one IDT-gate-dispatch path (spec.md §4.4).
//!
//! Real mode bypasses gates entirely and reads the classic 4-byte-entry
//! IVT. Protected and long mode fetch an IDT gate (8 bytes legacy, 16
//! bytes long-mode) and, on a privilege-level increase toward the
//! kernel, switch stacks via the TSS: RSP0-2/ISTn in long mode, ESP0/SS0
//! in legacy protected mode.

use crate::error::Exception;
use crate::mem::CpuBus;
use crate::segmentation;
use crate::state::{
    gpr, CpuMode, CpuState, SegDescriptor, RFLAGS_IF, RFLAGS_IOPL_MASK, RFLAGS_NT, RFLAGS_TF,
};
use relic_x86::{SegReg, Width};

struct Gate {
    selector: u16,
    offset: u64,
    dpl: u8,
    present: bool,
    is_interrupt_gate: bool,
    ist: u8,
    push_width: Width,
}

fn long_gate_format(state: &CpuState) -> bool {
    matches!(state.mode, CpuMode::Long | CpuMode::Compatibility)
}

fn gate_fault(vector: u8) -> Exception {
    Exception::GeneralProtection {
        selector: (vector as u32) * 8 + 2,
    }
}

fn fetch_gate<B: CpuBus>(state: &CpuState, bus: &mut B, vector: u8) -> Result<Gate, Exception> {
    let long = long_gate_format(state);
    let entry_size: u64 = if long { 16 } else { 8 };
    let byte_offset = vector as u64 * entry_size;
    if byte_offset + entry_size - 1 > state.tables.idtr_limit as u64 {
        return Err(gate_fault(vector));
    }

    let base = state.tables.idtr_base + byte_offset;
    let lo = bus.read_u64_system(base)?;
    let selector = ((lo >> 16) & 0xFFFF) as u16;
    let ist = ((lo >> 32) & 0b111) as u8;
    let type_attr = ((lo >> 40) & 0xFF) as u8;
    let offset_low = lo & 0xFFFF;
    let offset_mid = (lo >> 48) & 0xFFFF;
    let type_nibble = type_attr & 0xF;

    let (offset, valid_type) = if long {
        let hi = bus.read_u64_system(base + 8)?;
        let offset_high = hi & 0xFFFF_FFFF;
        (
            offset_low | (offset_mid << 16) | (offset_high << 32),
            matches!(type_nibble, 0xE | 0xF),
        )
    } else {
        (
            offset_low | (offset_mid << 16),
            matches!(type_nibble, 0x6 | 0x7 | 0xE | 0xF),
        )
    };

    if !valid_type {
        return Err(gate_fault(vector));
    }

    let push_width = if long {
        Width::W64
    } else if matches!(type_nibble, 0xE | 0xF) {
        Width::W32
    } else {
        Width::W16
    };

    Ok(Gate {
        selector,
        offset,
        dpl: (type_attr >> 5) & 0b11,
        present: type_attr & 0x80 != 0,
        is_interrupt_gate: matches!(type_nibble, 0x6 | 0xE),
        ist: if long { ist } else { 0 },
        push_width,
    })
}

fn tss_rsp_for_cpl<B: CpuBus>(state: &CpuState, bus: &mut B, cpl: u8) -> Result<u64, Exception> {
    bus.read_u64_system(state.tables.tr_base + 4 + 8 * cpl as u64)
}

fn tss_ist<B: CpuBus>(state: &CpuState, bus: &mut B, ist: u8) -> Result<u64, Exception> {
    bus.read_u64_system(state.tables.tr_base + 0x24 + 8 * (ist as u64 - 1))
}

/// Legacy 32-bit TSS SS0:ESP0, read as one system qword at offset 4
/// (ESP0 low, SS0 + 2 reserved bytes high).
fn tss_legacy_stack<B: CpuBus>(state: &CpuState, bus: &mut B) -> Result<(u16, u32), Exception> {
    let word = bus.read_u64_system(state.tables.tr_base + 4)?;
    Ok((((word >> 32) & 0xFFFF) as u16, (word & 0xFFFF_FFFF) as u32))
}

fn push_value<B: CpuBus>(state: &mut CpuState, bus: &mut B, width: Width, value: u64) -> Result<(), Exception> {
    let size: u64 = match width {
        Width::W8 => 1,
        Width::W16 => 2,
        Width::W32 => 4,
        Width::W64 => 8,
    };
    let sp = state.read_gpr(gpr::RSP, width).wrapping_sub(size);
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
    let size: u64 = match width {
        Width::W8 => 1,
        Width::W16 => 2,
        Width::W32 => 4,
        Width::W64 => 8,
    };
    let sp = state.read_gpr(gpr::RSP, width);
    let addr = state.segments.ss.base.wrapping_add(sp & width.mask());
    let value = match width {
        Width::W8 => bus.read_u8(addr)? as u64,
        Width::W16 => bus.read_u16(addr)? as u64,
        Width::W32 => bus.read_u32(addr)? as u64,
        Width::W64 => bus.read_u64(addr)?,
    };
    state.write_gpr(gpr::RSP, width, sp.wrapping_add(size));
    Ok(value)
}

fn deliver_real<B: CpuBus>(state: &mut CpuState, bus: &mut B, vector: u8, return_ip: u64) -> Result<(), Exception> {
    let entry = bus.read_u32(state.tables.idtr_base + vector as u64 * 4)?;
    let offset = (entry & 0xFFFF) as u64;
    let segment = (entry >> 16) as u16;

    push_value(state, bus, Width::W16, state.rflags())?;
    push_value(state, bus, Width::W16, state.segments.cs.selector as u64)?;
    push_value(state, bus, Width::W16, return_ip)?;

    state.set_flag(RFLAGS_IF, false);
    state.set_flag(RFLAGS_TF, false);
    state.segments.cs = SegDescriptor::real_mode(segment);
    state.rip = offset;
    Ok(())
}

fn deliver_protected_or_long<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    return_ip: u64,
    error_code: Option<u64>,
    software: bool,
) -> Result<(), Exception> {
    let gate = fetch_gate(state, bus, vector)?;
    if !gate.present {
        return Err(gate_fault(vector));
    }
    if software && gate.dpl < state.cpl {
        return Err(gate_fault(vector));
    }

    let target_desc = segmentation::fetch_descriptor(state, bus, gate.selector)?;
    if !target_desc.present {
        return Err(Exception::SegmentNotPresent {
            selector: gate.selector as u32,
        });
    }
    let target_cpl = target_desc.dpl;
    let long = long_gate_format(state);
    let stack_switch = target_cpl < state.cpl;
    let push_ss_rsp = long || stack_switch;

    let old_ss_selector = state.segments.ss.selector;
    let old_rsp = state.read_gpr64(gpr::RSP);
    let old_rflags = state.rflags();
    let old_cs_selector = state.segments.cs.selector;

    if stack_switch {
        let new_rsp = if long {
            if gate.ist != 0 {
                tss_ist(state, bus, gate.ist)?
            } else {
                tss_rsp_for_cpl(state, bus, target_cpl)?
            }
        } else {
            let (ss0, esp0) = tss_legacy_stack(state, bus)?;
            segmentation::load_seg(state, bus, SegReg::Ss, ss0, segmentation::LoadReason::Stack)?;
            esp0 as u64
        };
        let aligned_rsp = if long { new_rsp & !0xF } else { new_rsp };
        if long {
            state.segments.ss = SegDescriptor::null();
        }
        state.write_gpr(gpr::RSP, Width::W64, aligned_rsp);
    } else if long && gate.ist != 0 {
        let new_rsp = tss_ist(state, bus, gate.ist)? & !0xF;
        state.write_gpr(gpr::RSP, Width::W64, new_rsp);
    }

    // CS/CPL must be updated before the frame is pushed (pushes target the
    // post-switch stack) but the values pushed are the pre-switch ones.
    segmentation::load_code_seg(state, bus, gate.selector, target_cpl)?;

    if push_ss_rsp {
        push_value(state, bus, gate.push_width, old_ss_selector as u64)?;
        push_value(state, bus, gate.push_width, old_rsp)?;
    }
    push_value(state, bus, gate.push_width, old_rflags)?;
    push_value(state, bus, gate.push_width, old_cs_selector as u64)?;
    push_value(state, bus, gate.push_width, return_ip)?;
    if let Some(code) = error_code {
        push_value(state, bus, gate.push_width, code)?;
    }

    state.set_flag(RFLAGS_TF, false);
    state.set_flag(RFLAGS_NT, false);
    if gate.is_interrupt_gate {
        state.set_flag(RFLAGS_IF, false);
    }
    state.rip = gate.offset;
    Ok(())
}

fn deliver<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    return_ip: u64,
    error_code: Option<u64>,
    software: bool,
) -> Result<(), Exception> {
    if matches!(state.mode, CpuMode::Real) {
        deliver_real(state, bus, vector, return_ip)
    } else {
        deliver_protected_or_long(state, bus, vector, return_ip, error_code, software)
    }
}

/// INT3 / INT imm8 / INTO: always a trap-style delivery initiated by
/// guest code, so the gate DPL must be `>= CPL` (else `#GP`).
/// `return_ip` is the address of the instruction *after* the trap, i.e.
/// `state.rip + inst.length` at the call site.
pub fn deliver_software<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    return_ip: u64,
) -> Result<(), Exception> {
    deliver(state, bus, vector, return_ip, None, true)
}

/// External (maskable) hardware interrupt: recognized only at an
/// instruction boundary, so `return_ip` is always the current `state.rip`.
/// Not gated by a software DPL≥CPL check.
pub fn deliver_hardware<B: CpuBus>(state: &mut CpuState, bus: &mut B, vector: u8) -> Result<(), Exception> {
    deliver(state, bus, vector, state.rip, None, false)
}

/// Architectural-fault dispatch (spec.md §7 category 1): the pushed
/// return address is the faulting instruction itself (`state.rip`,
/// unadvanced), since most of these faults are meant to be retried.
pub fn deliver_exception<B: CpuBus>(state: &mut CpuState, bus: &mut B, exc: Exception) -> Result<(), Exception> {
    let vector = exc.vector();
    let error_code = exc.pushes_error_code().then(|| exc.error_code());
    deliver(state, bus, vector, state.rip, error_code, false)
}

pub fn iret<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<(), Exception> {
    if matches!(state.mode, CpuMode::Real) {
        let ip = pop_value(state, bus, Width::W16)?;
        let cs = pop_value(state, bus, Width::W16)? as u16;
        let flags = pop_value(state, bus, Width::W16)?;
        state.rip = ip;
        state.segments.cs = SegDescriptor::real_mode(cs);
        state.set_rflags(flags);
        return Ok(());
    }

    let long = long_gate_format(state);
    let width = if long {
        Width::W64
    } else if state.segments.cs.default_size == 32 {
        Width::W32
    } else {
        Width::W16
    };

    let return_ip = pop_value(state, bus, width)?;
    let cs_selector = pop_value(state, bus, width)? as u16;
    let new_rflags = pop_value(state, bus, width)?;

    let old_cpl = state.cpl;
    let old_iopl = state.iopl();
    let rpl = (cs_selector & 0b11) as u8;
    let privilege_change = rpl > old_cpl;

    if privilege_change || long {
        let new_rsp = pop_value(state, bus, width)?;
        let new_ss = pop_value(state, bus, width)? as u16;
        segmentation::load_code_seg(state, bus, cs_selector, rpl)?;
        if new_ss & !0b111 != 0 {
            segmentation::load_seg(state, bus, SegReg::Ss, new_ss, segmentation::LoadReason::Stack)?;
        } else {
            state.segments.ss = SegDescriptor::null();
        }
        state.write_gpr(gpr::RSP, Width::W64, new_rsp);
    } else {
        segmentation::load_code_seg(state, bus, cs_selector, rpl)?;
    }

    state.rip = return_ip;

    // RFLAGS restore masking (spec.md §4.4): IF only changes if the CPL
    // the IRET executed *at* permits it (CPL0, or CPL <= IOPL); IOPL
    // itself only changes at CPL0, both evaluated against the
    // pre-transition privilege level.
    let can_change_if = old_cpl == 0 || old_cpl <= old_iopl;
    let can_change_iopl = old_cpl == 0;
    let current = state.rflags();
    let mut merged = new_rflags;
    if !can_change_if {
        merged = (merged & !RFLAGS_IF) | (current & RFLAGS_IF);
    }
    if !can_change_iopl {
        merged = (merged & !RFLAGS_IOPL_MASK) | (current & RFLAGS_IOPL_MASK);
    }
    state.set_rflags(merged);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::state::{CR0_PE, EFER_LME};

    fn write_idt_gate32(bus: &mut FlatTestBus, idt_base: u64, vector: u8, selector: u16, offset: u32, dpl: u8) {
        let lo = ((offset & 0xFFFF) as u64) | ((selector as u64) << 16) | (0x8Eu64 | ((dpl as u64) << 5)) << 40;
        let hi = ((offset >> 16) as u64) << 48;
        bus.write_u64(idt_base + vector as u64 * 8, lo | hi).unwrap();
    }

    fn write_idt_gate64(bus: &mut FlatTestBus, idt_base: u64, vector: u8, selector: u16, offset: u64, dpl: u8, ist: u8) {
        let lo = (offset & 0xFFFF)
            | ((selector as u64) << 16)
            | ((ist as u64) << 32)
            | ((0x8Eu64 | ((dpl as u64) << 5)) << 40)
            | (((offset >> 16) & 0xFFFF) << 48);
        let hi = (offset >> 32) & 0xFFFF_FFFF;
        let addr = idt_base + vector as u64 * 16;
        bus.write_u64(addr, lo).unwrap();
        bus.write_u64(addr + 8, hi).unwrap();
    }

    fn gdt_flat_code(bus: &mut FlatTestBus, gdt_base: u64, index: u32, dpl: u8, long: bool) {
        let flags = if long { 1u32 << 21 } else { 1u32 << 22 };
        let access = 0x80u32 | ((dpl as u32) << 5) | 0b1010;
        let hi = (0xF << 16) | (1 << 23) | flags | (access << 8);
        bus.load(gdt_base + index as u64 * 8, &0xFFFFu32.to_le_bytes());
        bus.load(gdt_base + index as u64 * 8 + 4, &hi.to_le_bytes());
    }

    #[test]
    fn real_mode_int_pushes_flags_cs_ip_and_clears_if() {
        let mut st = CpuState::reset();
        st.set_flag(RFLAGS_IF, true);
        st.write_gpr(gpr::RSP, Width::W64, 0x2000);
        st.rip = 0x500;
        let mut bus = FlatTestBus::new(0x10000);
        bus.write_u32(0x80 * 4, 0x1234_0010).unwrap(); // seg=0x1234 off=0x0010

        deliver_software(&mut st, &mut bus, 0x80, 0x502).unwrap();

        assert_eq!(st.rip, 0x0010);
        assert_eq!(st.segments.cs.selector, 0x1234);
        assert!(!st.flag(RFLAGS_IF));
        assert_eq!(st.read_gpr64(gpr::RSP), 0x2000 - 6);
    }

    #[test]
    fn protected_mode_int_same_privilege_pushes_three_words_no_switch() {
        let mut st = CpuState::reset();
        st.control.cr0 = CR0_PE;
        st.tables.gdtr_base = 0x1000;
        st.tables.gdtr_limit = 0xFFFF;
        st.tables.idtr_base = 0x2000;
        st.tables.idtr_limit = 0xFFFF;
        st.update_mode();
        let mut bus = FlatTestBus::new(0x20000);
        gdt_flat_code(&mut bus, 0x1000, 1, 0, false);
        write_idt_gate32(&mut bus, 0x2000, 0x80, 0x0008, 0x9000, 0);

        st.segments.ss.base = 0x5000;
        st.write_gpr(gpr::RSP, Width::W32, 0x1000);
        st.rip = 0x400;

        deliver_software(&mut st, &mut bus, 0x80, 0x404).unwrap();

        assert_eq!(st.rip, 0x9000);
        assert_eq!(st.segments.cs.selector, 0x0008);
        assert_eq!(st.read_gpr(gpr::RSP, Width::W32), 0x1000 - 12);
        assert!(!st.flag(RFLAGS_IF));
    }

    #[test]
    fn long_mode_int_0x80_privilege_change_switches_stack_via_tss() {
        let mut st = CpuState::reset();
        st.control.cr0 = CR0_PE;
        st.control.cr4 = crate::state::CR4_PAE;
        st.msr.efer = EFER_LME;
        st.segments.cs.l_bit = true;
        st.update_mode();
        st.tables.gdtr_base = 0x1000;
        st.tables.gdtr_limit = 0xFFFF;
        st.tables.idtr_base = 0x2000;
        st.tables.idtr_limit = 0xFFFF;
        st.tables.tr_base = 0x3000;
        st.cpl = 3;

        let mut bus = FlatTestBus::new(0x20000);
        gdt_flat_code(&mut bus, 0x1000, 1, 0, true); // index 1 => selector 0x0008, DPL 0
        write_idt_gate64(&mut bus, 0x2000, 0x80, 0x0008, 0x7777, 3, 0);
        bus.write_u64(0x3000 + 4, 0x9000).unwrap(); // TSS.RSP0

        st.segments.ss.base = 0;
        st.write_gpr(gpr::RSP, Width::W64, 0x8000);
        st.rip = 0x400;

        deliver_software(&mut st, &mut bus, 0x80, 0x402).unwrap();

        assert_eq!(st.cpl, 0);
        assert_eq!(st.rip, 0x7777);
        assert_eq!(st.read_gpr64(gpr::RSP), 0x9000 - 40);
    }

    #[test]
    fn long_mode_iret_restores_caller_stack_and_cpl() {
        let mut st = CpuState::reset();
        st.control.cr0 = CR0_PE;
        st.control.cr4 = crate::state::CR4_PAE;
        st.msr.efer = EFER_LME;
        st.segments.cs.l_bit = true;
        st.update_mode();
        st.tables.gdtr_base = 0x1000;
        st.tables.gdtr_limit = 0xFFFF;
        st.tables.idtr_base = 0x2000;
        st.tables.idtr_limit = 0xFFFF;
        st.tables.tr_base = 0x3000;
        st.cpl = 3;

        let mut bus = FlatTestBus::new(0x20000);
        gdt_flat_code(&mut bus, 0x1000, 1, 0, true);
        gdt_flat_code(&mut bus, 0x1000, 2, 3, true);
        st.segments.cs.selector = (2 << 3) | 3;
        write_idt_gate64(&mut bus, 0x2000, 0x80, 0x0008, 0x7777, 3, 0);
        bus.write_u64(0x3000 + 4, 0x9000).unwrap();

        st.segments.ss.base = 0;
        st.write_gpr(gpr::RSP, Width::W64, 0x8000);
        st.rip = 0x400;

        deliver_software(&mut st, &mut bus, 0x80, 0x402).unwrap();
        assert_eq!(st.cpl, 0);

        iret(&mut st, &mut bus).unwrap();

        assert_eq!(st.cpl, 3);
        assert_eq!(st.rip, 0x402);
        assert_eq!(st.read_gpr64(gpr::RSP), 0x8000);
    }
}
