//! Host-facing aggregate (spec.md §6 "External Interfaces"): `Cpu` wraps
//! `CpuState` plus the translation-block cache and exposes `reset`,
//! `step`, `load_memory`, register/flag accessors, `configure_mode`, and
//! `set_option` as the host's only door into the core. `step`/`run` are
//! generic over `CpuBus` like every other function in this crate rather
//! than owning a boxed bus — the host picks its own `CpuBus` impl (a
//! `FlatTestBus`, a `PagingBus`, or one of its own) per call.

use crate::decode::decode_instruction;
use crate::error::Exception;
use crate::exec::{dispatch, StepExit};
use crate::interrupts;
use crate::mem::CpuBus;
use crate::state::{
    gpr, CpuMode, CpuState, CR0_PE, CR0_PG, CR4_PAE, EFER_LME,
};
use crate::tbcache::{ModeToken, TbCache, TranslationBlock};
use relic_x86::Width;

/// Host callback for `IN` (spec §6). A `CpuBus` implementation typically
/// owns one of these and forwards `CpuBus::port_in` into it.
pub trait PortIn {
    fn port_in(&mut self, port: u16, width: Width) -> u32;
}

/// Host callback for `OUT` (spec §6).
pub trait PortOut {
    fn port_out(&mut self, port: u16, width: Width, value: u32);
}

/// What `InterruptService` decided about a hardware vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAck {
    /// The host fully serviced the interrupt itself; the core does not
    /// run the guest's IDT handler for this vector.
    Handled,
    /// The host declined; dispatch through the guest's IDT as usual.
    RunIdt,
}

/// Optional override consulted by `Cpu::inject_interrupt` before falling
/// back to ordinary IDT dispatch (spec §6).
pub trait InterruptService {
    fn service(&mut self, vector: u8) -> InterruptAck;
}

/// Terminal status `Cpu::run` returns (spec §7 categories 2 and 3, plus
/// architectural faults the host didn't otherwise recover from).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Exception(Exception),
    Halted,
    StopAfterInstructions,
    RspBelowThreshold,
}

/// `set_option` knobs (spec §6): `stop_after_insns` and
/// `stop_on_rsp_below_threshold` are mechanical instruction-boundary
/// checks the host uses as a timeout substitute; `trace_execution` gates
/// a `tracing::trace!` emitted per retired instruction.
#[derive(Debug, Clone, Default)]
pub struct CpuOptions {
    pub trace_execution: bool,
    pub stop_after_insns: Option<u64>,
    pub stop_on_rsp_below_threshold: Option<u64>,
}

/// Instructions collected so far while speculatively building a
/// translation block during `Cpu::run`. Dropped (not cached) if the
/// block never reaches a clean `Continue`-chain boundary.
struct BlockBuilder {
    entry_ip: u64,
    instructions: Vec<crate::decode::Instruction>,
    total_length: u64,
}

const MAX_BLOCK_INSTRUCTIONS: usize = 64;

pub struct Cpu {
    pub state: CpuState,
    pub options: CpuOptions,
    tbcache: TbCache,
    interrupt_service: Option<Box<dyn InterruptService>>,
    /// Set when the instruction that just retired armed
    /// `state.interrupt_shadow` (STI); consumed — clearing the shadow —
    /// once the *next* instruction retires, per spec §4.3's one-instruction
    /// delay. Never set and consumed by the same retirement.
    shadow_clear_pending: bool,
}

impl Cpu {
    pub fn new() -> Cpu {
        Cpu {
            state: CpuState::reset(),
            options: CpuOptions::default(),
            tbcache: TbCache::new(),
            interrupt_service: None,
            shadow_clear_pending: false,
        }
    }

    pub fn reset(&mut self) {
        self.state = CpuState::reset();
        self.tbcache.clear();
        self.shadow_clear_pending = false;
    }

    pub fn set_interrupt_service(&mut self, service: Box<dyn InterruptService>) {
        self.interrupt_service = Some(service);
    }

    pub fn set_option(&mut self, options: CpuOptions) {
        self.options = options;
    }

    /// Copies bytes into the linear address space, outside of any live
    /// instruction. Invalidates any cached block the write overlaps.
    pub fn load_memory<B: CpuBus>(&mut self, bus: &mut B, addr: u64, bytes: &[u8]) -> Result<(), Exception> {
        for (i, &b) in bytes.iter().enumerate() {
            bus.write_u8(addr.wrapping_add(i as u64), b)?;
        }
        self.tbcache.invalidate_range(addr, bytes.len() as u64);
        Ok(())
    }

    pub fn get_register(&self, idx: u8, width: Width) -> u64 {
        self.state.read_gpr(idx, width)
    }

    pub fn set_register(&mut self, idx: u8, width: Width, value: u64) {
        self.state.write_gpr(idx, width, value);
    }

    pub fn get_flag(&self, mask: u64) -> bool {
        self.state.flag(mask)
    }

    pub fn set_flag(&mut self, mask: u64, value: bool) {
        self.state.set_flag(mask, value);
    }

    /// Sets CR0.PE/PG, CR4.PAE, and EFER.LME to match the requested mode,
    /// then lets `CpuState::update_mode` derive `mode` and the default
    /// operand/address sizes from those bits plus the current CS
    /// descriptor, exactly as a real far jump/IRET mode switch would.
    /// Switching modes invalidates the translation-block cache (spec
    /// §4.5: linear-address meaning changes).
    pub fn configure_mode(&mut self, mode: CpuMode) {
        match mode {
            CpuMode::Real => {
                self.state.control.cr0 &= !(CR0_PE | CR0_PG);
                self.state.msr.efer &= !EFER_LME;
            }
            CpuMode::Protected => {
                self.state.control.cr0 |= CR0_PE;
                self.state.control.cr0 &= !CR0_PG;
                self.state.msr.efer &= !EFER_LME;
            }
            CpuMode::Compatibility => {
                self.state.control.cr0 |= CR0_PE | CR0_PG;
                self.state.control.cr4 |= CR4_PAE;
                self.state.msr.efer |= EFER_LME;
                self.state.segments.cs.l_bit = false;
            }
            CpuMode::Long => {
                self.state.control.cr0 |= CR0_PE | CR0_PG;
                self.state.control.cr4 |= CR4_PAE;
                self.state.msr.efer |= EFER_LME;
                self.state.segments.cs.l_bit = true;
            }
        }
        self.state.update_mode();
        self.tbcache.clear();
    }

    fn mode_token(&self) -> ModeToken {
        ModeToken {
            mode: self.state.mode,
            paging_enabled: self.state.control.cr0 & CR0_PG != 0,
        }
    }

    /// Host-injected hardware (maskable) interrupt (spec §6
    /// `InterruptService`): consults the optional override first, runs
    /// ordinary IDT dispatch otherwise. The caller is responsible for
    /// only calling this when `!state.flag(RFLAGS_IF) == false` and no
    /// interrupt-delivery shadow is armed; `Cpu` does not poll for
    /// pending interrupts on its own.
    pub fn inject_interrupt<B: CpuBus>(&mut self, bus: &mut B, vector: u8) -> Result<(), Exception> {
        if let Some(service) = self.interrupt_service.as_mut() {
            if service.service(vector) == InterruptAck::Handled {
                return Ok(());
            }
        }
        interrupts::deliver_hardware(&mut self.state, bus, vector)?;
        self.tbcache.clear();
        Ok(())
    }

    /// Decodes and executes exactly one instruction (spec §6 `step`).
    /// Never consults the translation-block cache — see `tbcache`'s
    /// module docs for why that's `run`'s job, not this one's.
    pub fn step<B: CpuBus>(&mut self, bus: &mut B) -> Result<StepStatus, Fault> {
        if self.state.halted {
            return Err(Fault::Halted);
        }
        let result = self.step_uncached(bus);
        result
    }

    fn step_uncached<B: CpuBus>(&mut self, bus: &mut B) -> Result<StepStatus, Fault> {
        let inst = match decode_instruction(&mut self.state, bus) {
            Ok(inst) => inst,
            Err(e) => return self.handle_fault(bus, e),
        };
        if self.options.trace_execution {
            tracing::trace!(rip = self.state.rip, mnemonic = ?inst.mnemonic, "step");
        }
        match dispatch(&mut self.state, bus, &inst) {
            Ok(exit @ (StepExit::Continue | StepExit::ContinueInhibitInterrupt)) => {
                self.state.rip = self.state.rip.wrapping_add(inst.length as u64);
                self.retire_interrupt_shadow(exit);
                Ok(StepStatus::Retired(inst))
            }
            Ok(exit @ StepExit::Branch) => {
                self.retire_interrupt_shadow(exit);
                Ok(StepStatus::Retired(inst))
            }
            Ok(StepExit::Halt) => Err(Fault::Halted),
            Err(e) => self.handle_fault(bus, e),
        }
    }

    /// Applies the one-instruction-delayed STI shadow (spec §4.3, C3): the
    /// instruction that arms the shadow (`ContinueInhibitInterrupt`) must
    /// not also clear it; the shadow is consumed on the retirement that
    /// follows.
    fn retire_interrupt_shadow(&mut self, exit: StepExit) {
        if exit == StepExit::ContinueInhibitInterrupt {
            self.shadow_clear_pending = true;
        } else if self.shadow_clear_pending {
            self.state.interrupt_shadow = false;
            self.shadow_clear_pending = false;
        }
    }

    fn handle_fault<B: CpuBus>(&mut self, bus: &mut B, exc: Exception) -> Result<StepStatus, Fault> {
        if matches!(exc, Exception::MemoryFault { .. }) {
            return Err(Fault::Exception(exc));
        }
        match interrupts::deliver_exception(&mut self.state, bus, exc) {
            Ok(()) => Ok(StepStatus::Faulted(exc)),
            Err(double_fault) => Err(Fault::Exception(double_fault)),
        }
    }

    /// Executes up to `max_instructions` (or until a configured stop
    /// condition, HLT, or an unrecovered fault), opportunistically
    /// building and replaying translation blocks (C10) and, where
    /// applicable, the bulk-string pattern (C11) along the way. Always
    /// produces the same final `CpuState` as calling `step` that many
    /// times would (P10) — the cache only changes how, never what, gets
    /// executed.
    pub fn run<B: CpuBus>(&mut self, bus: &mut B, max_instructions: u64) -> Fault {
        let mut executed: u64 = 0;
        let mut building: Option<BlockBuilder> = None;

        while executed < max_instructions {
            if let Some(threshold) = self.options.stop_on_rsp_below_threshold {
                if self.state.read_gpr(gpr::RSP, Width::W64) < threshold {
                    return Fault::RspBelowThreshold;
                }
            }

            let token = self.mode_token();
            let cached = self.tbcache.lookup(self.state.rip, token).map(|block| block.instructions.clone());
            if let Some(mut instructions) = cached {
                for inst in &mut instructions {
                    // A cached instruction's `rm` was resolved against
                    // whatever registers were live the first time this
                    // block was decoded; re-derive it from the *current*
                    // registers before replaying (P10, C10 — see
                    // `Instruction::reresolve_mem`'s docs).
                    inst.reresolve_mem(&self.state);
                    match dispatch(&mut self.state, bus, &*inst) {
                        Ok(exit @ (StepExit::Continue | StepExit::ContinueInhibitInterrupt)) => {
                            self.state.rip = self.state.rip.wrapping_add(inst.length as u64);
                            self.retire_interrupt_shadow(exit);
                            executed += 1;
                        }
                        Ok(exit @ StepExit::Branch) => {
                            self.retire_interrupt_shadow(exit);
                            executed += 1;
                            break;
                        }
                        Ok(StepExit::Halt) => return Fault::Halted,
                        Err(e) => return self.fault_from(bus, e),
                    }
                }
                continue;
            }

            // A straight-line chain: this step's post-state landed exactly
            // at entry+length, i.e. `StepExit::Continue` fired (taken
            // branches, far jumps, etc. redirect `rip` elsewhere and end
            // the chain here, with this last instruction still recorded).
            let entry_ip = self.state.rip;
            match self.step_uncached(bus) {
                Ok(StepStatus::Retired(inst)) => {
                    executed += 1;
                    let chain_continues = self.state.rip == entry_ip.wrapping_add(inst.length as u64);
                    let builder = building.get_or_insert_with(|| BlockBuilder {
                        entry_ip,
                        instructions: Vec::new(),
                        total_length: 0,
                    });
                    builder.instructions.push(inst);
                    builder.total_length += inst.length as u64;
                    if !chain_continues || builder.instructions.len() >= MAX_BLOCK_INSTRUCTIONS {
                        let finished = building.take().unwrap();
                        self.tbcache.insert(
                            token,
                            TranslationBlock {
                                entry_ip: finished.entry_ip,
                                instructions: finished.instructions,
                                total_length: finished.total_length,
                            },
                        );
                    }
                }
                Ok(StepStatus::Faulted(_)) => {
                    building = None;
                }
                Err(fault) => return fault,
            }

            if let Some(cap) = self.options.stop_after_insns {
                if executed >= cap {
                    return Fault::StopAfterInstructions;
                }
            }
        }
        Fault::StopAfterInstructions
    }

    fn fault_from<B: CpuBus>(&mut self, bus: &mut B, exc: Exception) -> Fault {
        match self.handle_fault(bus, exc) {
            Ok(_) => Fault::Exception(exc),
            Err(f) => f,
        }
    }
}

impl Default for Cpu {
    fn default() -> Cpu {
        Cpu::new()
    }
}

/// What one `step` actually did, distinct from `exec::StepExit`: this is
/// the host-visible record (the decoded instruction, or which exception
/// was delivered into the guest's IDT) rather than the dispatcher's
/// internal "where does IP go next" signal.
#[derive(Debug, Clone)]
pub enum StepStatus {
    Retired(crate::decode::Instruction),
    Faulted(Exception),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;

    #[test]
    fn step_executes_one_nop_and_advances_rip() {
        let mut cpu = Cpu::new();
        cpu.state.rip = 0x100;
        let mut bus = FlatTestBus::new(0x1000);
        bus.write_u8(0x100, 0x90).unwrap(); // NOP
        let before = cpu.state.rip;
        let status = cpu.step(&mut bus).unwrap();
        assert!(matches!(status, StepStatus::Retired(_)));
        assert_eq!(cpu.state.rip, before + 1);
    }

    #[test]
    fn run_stops_after_configured_instruction_count() {
        let mut cpu = Cpu::new();
        cpu.state.rip = 0x100;
        cpu.options.stop_after_insns = Some(3);
        let mut bus = FlatTestBus::new(0x1000);
        for i in 0..8u64 {
            bus.write_u8(0x100 + i, 0x90).unwrap();
        }
        let fault = cpu.run(&mut bus, 1000);
        assert_eq!(fault, Fault::StopAfterInstructions);
        assert_eq!(cpu.state.rip, 0x103);
    }

    #[test]
    fn configure_mode_to_protected_sets_cr0_pe() {
        let mut cpu = Cpu::new();
        cpu.configure_mode(CpuMode::Protected);
        assert_eq!(cpu.state.mode, CpuMode::Protected);
        assert_ne!(cpu.state.control.cr0 & CR0_PE, 0);
    }

    #[test]
    fn load_memory_invalidates_overlapping_cached_block() {
        let mut cpu = Cpu::new();
        let mut bus = FlatTestBus::new(0x1000);
        cpu.tbcache.insert(
            cpu.mode_token(),
            TranslationBlock { entry_ip: 0x100, instructions: vec![], total_length: 8 },
        );
        cpu.load_memory(&mut bus, 0x104, &[0x90]).unwrap();
        assert!(cpu.tbcache.lookup(0x100, cpu.mode_token()).is_none());
    }
}
