//! End-to-end coverage driving raw instruction bytes through `Cpu::step`
//! (decode + dispatch together), one test per named scenario rather than
//! the per-function unit tests scattered across `flags`/`exec`/`decode`.

use relic_cpu_core::mem::FlatTestBus;
use relic_cpu_core::state::{
    gpr, CpuMode, CR0_PE, CR4_PAE, EFER_LME, RFLAGS_AF, RFLAGS_CF, RFLAGS_DF, RFLAGS_IF, RFLAGS_OF,
    RFLAGS_PF, RFLAGS_SF, RFLAGS_ZF,
};
use relic_cpu_core::{Cpu, Fault, StepStatus};
use relic_x86::Width;

/// CS is reloaded to a flat base-0 segment before placing code, since
/// `CpuState::reset`'s `0xFFFF_0000` CS base is a reset-vector artifact,
/// not a sensible fetch address for these scenarios.
fn flat_code(cpu: &mut Cpu, rip: u64) {
    cpu.state.segments.cs.base = 0;
    cpu.state.rip = rip;
}

fn gdt_flat_code(bus: &mut FlatTestBus, gdt_base: u64, index: u32, dpl: u8, long: bool) {
    let flags = if long { 1u32 << 21 } else { 1u32 << 22 };
    let access = 0x80u32 | ((dpl as u32) << 5) | 0b1010;
    let hi = (0xF << 16) | (1 << 23) | flags | (access << 8);
    bus.load(gdt_base + index as u64 * 8, &0xFFFFu32.to_le_bytes());
    bus.load(gdt_base + index as u64 * 8 + 4, &hi.to_le_bytes());
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

/// Scenario 1: `SUB RAX, imm8` sign-extending the immediate, RAX=0.
#[test]
fn sub_rax_imm8_sign_extended_underflows_to_all_ones() {
    let mut cpu = Cpu::new();
    cpu.configure_mode(CpuMode::Long);
    let mut bus = FlatTestBus::new(0x2000);
    flat_code(&mut cpu, 0x1000);
    cpu.state.write_gpr(gpr::RAX, Width::W64, 0);
    bus.load(0x1000, &[0x48, 0x83, 0xE8, 0x01]); // REX.W SUB RAX, 1

    let status = cpu.step(&mut bus).unwrap();
    assert!(matches!(status, StepStatus::Retired(_)));

    assert_eq!(cpu.state.read_gpr(gpr::RAX, Width::W64), 0xFFFF_FFFF_FFFF_FFFF);
    assert_eq!(cpu.state.rip, 0x1004);
    assert!(cpu.state.flag(RFLAGS_CF));
    assert!(!cpu.state.flag(RFLAGS_OF));
    assert!(cpu.state.flag(RFLAGS_AF));
    assert!(!cpu.state.flag(RFLAGS_ZF));
    assert!(cpu.state.flag(RFLAGS_SF));
    assert!(cpu.state.flag(RFLAGS_PF));
}

/// Scenario 2: `ADC RAX, 0` on RAX=u64::MAX with CF=1 wraps to zero.
#[test]
fn adc_rax_zero_after_max_value_with_carry_in_wraps_to_zero() {
    let mut cpu = Cpu::new();
    cpu.configure_mode(CpuMode::Long);
    let mut bus = FlatTestBus::new(0x2000);
    flat_code(&mut cpu, 0x1000);
    cpu.state.write_gpr(gpr::RAX, Width::W64, 0xFFFF_FFFF_FFFF_FFFF);
    cpu.state.set_flag(RFLAGS_CF, true);
    bus.load(0x1000, &[0x48, 0x83, 0xD0, 0x00]); // REX.W ADC RAX, 0

    cpu.step(&mut bus).unwrap();

    assert_eq!(cpu.state.read_gpr(gpr::RAX, Width::W64), 0);
    assert!(cpu.state.flag(RFLAGS_CF));
    assert!(cpu.state.flag(RFLAGS_ZF));
    assert!(!cpu.state.flag(RFLAGS_SF));
    assert!(cpu.state.flag(RFLAGS_PF));
    assert!(cpu.state.flag(RFLAGS_AF));
}

/// Scenario 3: `REP STOSD` zeroing 4 dwords starting at ES:EDI.
#[test]
fn rep_stosd_zeroes_the_whole_block_and_drains_ecx() {
    let mut cpu = Cpu::new(); // reset() defaults to real mode
    let mut bus = FlatTestBus::new(0x4000);
    flat_code(&mut cpu, 0x2000);
    cpu.state.segments.es.base = 0;
    cpu.state.write_gpr(gpr::RAX, Width::W32, 0);
    cpu.state.write_gpr(gpr::RCX, Width::W16, 4);
    cpu.state.write_gpr(gpr::RDI, Width::W16, 0x3D80);
    cpu.state.set_flag(RFLAGS_DF, false);
    bus.load(0x2000, &[0xF3, 0x66, 0xAB]); // REP + opsize override + STOS

    // Pre-fill the destination with a marker so a no-op would be visible.
    bus.load(0x3D80, &[0xAA; 16]);

    cpu.step(&mut bus).unwrap();

    assert_eq!(bus.dump(0x3D80, 16), &[0u8; 16][..]);
    assert_eq!(cpu.state.read_gpr(gpr::RCX, Width::W16), 0);
    assert_eq!(cpu.state.read_gpr(gpr::RDI, Width::W16), 0x3D90);
    assert_eq!(cpu.state.rip, 0x2003);
}

/// Scenario 4: direct `JMP FAR 0008:1234` in protected mode against a
/// flat 32-bit code descriptor at GDT index 1.
#[test]
fn jmp_far_loads_flat_code_descriptor_and_redirects_rip() {
    let mut cpu = Cpu::new();
    cpu.configure_mode(CpuMode::Protected);
    cpu.state.tables.gdtr_base = 0x1000;
    cpu.state.tables.gdtr_limit = 0xFFFF;
    let mut bus = FlatTestBus::new(0x10000);
    gdt_flat_code(&mut bus, 0x1000, 1, 0, false);
    flat_code(&mut cpu, 0x500);
    bus.load(0x500, &[0xEA, 0x34, 0x12, 0x00, 0x00, 0x08, 0x00]); // JMP FAR 0008:00001234

    let status = cpu.step(&mut bus).unwrap();
    assert!(matches!(status, StepStatus::Retired(_)));

    assert_eq!(cpu.state.segments.cs.selector, 0x0008);
    assert_eq!(cpu.state.segments.cs.base, 0);
    assert_eq!(cpu.state.segments.cs.limit, 0xFFFF_FFFF);
    assert_eq!(cpu.state.segments.cs.default_size, 32);
    assert_eq!(cpu.state.rip, 0x1234);
    assert_eq!(cpu.state.mode, CpuMode::Protected);
}

/// Scenario 5: `INT 0x80` from CPL 3 through a DPL-3 interrupt gate,
/// privilege-changing to CPL 0 via the TSS's RSP0, driven through the
/// `CD 80` opcode bytes rather than calling `interrupts::deliver_software`
/// directly.
#[test]
fn int_0x80_opcode_switches_privilege_and_stack_via_tss() {
    let mut cpu = Cpu::new();
    cpu.state.control.cr0 = CR0_PE;
    cpu.state.control.cr4 = CR4_PAE;
    cpu.state.msr.efer = EFER_LME;
    cpu.state.segments.cs.l_bit = true;
    cpu.state.update_mode();
    cpu.state.tables.gdtr_base = 0x1000;
    cpu.state.tables.gdtr_limit = 0xFFFF;
    cpu.state.tables.idtr_base = 0x2000;
    cpu.state.tables.idtr_limit = 0xFFFF;
    cpu.state.tables.tr_base = 0x3000;
    cpu.state.cpl = 3;

    let mut bus = FlatTestBus::new(0x20000);
    gdt_flat_code(&mut bus, 0x1000, 1, 0, true); // selector 0x0008, DPL 0
    write_idt_gate64(&mut bus, 0x2000, 0x80, 0x0008, 0x7777, 3, 0);
    bus.write_u64(0x3000 + 4, 0x9000).unwrap(); // TSS.RSP0

    cpu.state.segments.ss.base = 0;
    cpu.state.write_gpr(gpr::RSP, Width::W64, 0x8000);
    cpu.state.set_flag(RFLAGS_IF, true);
    flat_code(&mut cpu, 0x400);
    bus.load(0x400, &[0xCD, 0x80]); // INT 0x80

    let status = cpu.step(&mut bus).unwrap();
    assert!(matches!(status, StepStatus::Retired(_)));

    assert_eq!(cpu.state.cpl, 0);
    assert_eq!(cpu.state.rip, 0x7777);
    assert_eq!(cpu.state.read_gpr(gpr::RSP, Width::W64), 0x9000 - 40);
    assert!(!cpu.state.flag(RFLAGS_IF));
}

/// Scenario 6: `SHL EAX, 1` on EAX=0x8000_0000 (the literal 32-bit case;
/// `exec/shift.rs`'s own unit test only covers the 8-bit analogue).
#[test]
fn shl_eax_by_one_on_msb_set_clears_eax_and_sets_cf_and_of() {
    let mut cpu = Cpu::new();
    cpu.configure_mode(CpuMode::Long);
    let mut bus = FlatTestBus::new(0x2000);
    flat_code(&mut cpu, 0x1000);
    cpu.state.write_gpr(gpr::RAX, Width::W32, 0x8000_0000);
    bus.load(0x1000, &[0xD1, 0xE0]); // SHL EAX, 1

    cpu.step(&mut bus).unwrap();

    assert_eq!(cpu.state.read_gpr(gpr::RAX, Width::W32), 0);
    assert!(cpu.state.flag(RFLAGS_CF));
    assert!(cpu.state.flag(RFLAGS_OF));
    assert!(cpu.state.flag(RFLAGS_ZF));
    assert!(!cpu.state.flag(RFLAGS_SF));
}

/// Regression for a translation-block replay bug: a cached block's `MOV
/// AL,[RSI]` must re-derive its address from RSI's *current* value on
/// every replay, not dispatch against the address RSI held the first time
/// the block was decoded. `run()` drives the whole loop so the second and
/// later passes go through `tbcache` replay rather than fresh decode.
#[test]
fn run_replays_cached_loop_with_register_relative_operand_correctly() {
    let mut cpu = Cpu::new();
    cpu.configure_mode(CpuMode::Long);
    let mut bus = FlatTestBus::new(0x4000);
    flat_code(&mut cpu, 0x1000);
    bus.load(
        0x1000,
        &[
            0x8A, 0x06, // top: MOV AL, [RSI]
            0x48, 0xFF, 0xC6, // INC RSI
            0x48, 0xFF, 0xC9, // DEC RCX
            0x75, 0xF6, // JNZ top
            0xF4, // HLT
        ],
    );
    bus.load(0x2000, &[0x11, 0x22, 0x33, 0x44]);
    cpu.state.write_gpr(gpr::RSI, Width::W64, 0x2000);
    cpu.state.write_gpr(gpr::RCX, Width::W64, 4);

    let fault = cpu.run(&mut bus, 1000);

    assert_eq!(fault, Fault::Halted);
    assert_eq!(cpu.state.read_gpr(gpr::RAX, Width::W8), 0x44);
    assert_eq!(cpu.state.read_gpr(gpr::RSI, Width::W64), 0x2004);
    assert_eq!(cpu.state.read_gpr(gpr::RCX, Width::W64), 0);
}

/// STI's interrupt-delivery shadow (spec.md §4.3, C3) must stay armed
/// through the instruction following STI and clear only once that
/// instruction retires — not immediately, and not forever.
#[test]
fn sti_shadow_clears_after_the_next_instruction_retires() {
    let mut cpu = Cpu::new();
    let mut bus = FlatTestBus::new(0x2000);
    flat_code(&mut cpu, 0x1000);
    bus.load(0x1000, &[0xFB, 0x90, 0x90]); // STI; NOP; NOP

    cpu.step(&mut bus).unwrap();
    assert!(cpu.state.interrupt_shadow);
    assert!(cpu.state.flag(RFLAGS_IF));

    cpu.step(&mut bus).unwrap(); // first NOP retires: shadow was armed by STI, not this step
    assert!(!cpu.state.interrupt_shadow);

    cpu.step(&mut bus).unwrap(); // second NOP: stays clear
    assert!(!cpu.state.interrupt_shadow);
}

/// A CLI immediately following STI cancels the pending shadow outright
/// rather than waiting for the next instruction to retire.
#[test]
fn cli_immediately_after_sti_clears_the_shadow() {
    let mut cpu = Cpu::new();
    let mut bus = FlatTestBus::new(0x2000);
    flat_code(&mut cpu, 0x1000);
    bus.load(0x1000, &[0xFB, 0xFA]); // STI; CLI

    cpu.step(&mut bus).unwrap();
    assert!(cpu.state.interrupt_shadow);

    cpu.step(&mut bus).unwrap();
    assert!(!cpu.state.interrupt_shadow);
    assert!(!cpu.state.flag(RFLAGS_IF));
}
