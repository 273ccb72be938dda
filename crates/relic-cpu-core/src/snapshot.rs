//! Snapshot facility (spec §6 "optional... if provided"): serializes
//! `CpuState` with `serde`/`serde_json`, matching `aero-debug`'s choice of
//! those crates for inspection tooling elsewhere in the workspace.
//!
//! `CpuState` itself borrows `relic_x86` types (`Rex`, `SegReg`) that don't
//! carry `serde` derives, so this module mirrors the architectural state
//! into a plain-data `Snapshot` rather than deriving `Serialize` on
//! `CpuState` directly. `Snapshot::from_state`/`Snapshot::apply_to` are the
//! only two points of contact with the live struct. Memory is out of
//! scope here; the host's own `CpuBus` owns that.

use crate::state::{
    ControlRegs, CpuMode, CpuState, DescriptorTables, LazyFlagRecord, MsrFile, SegDescriptor,
    SegmentFile,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegDescriptorSnapshot {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub present: bool,
    pub default_size: u8,
    pub dpl: u8,
    pub seg_type: u8,
    pub system: bool,
    pub l_bit: bool,
    pub db_bit: bool,
    pub granularity: bool,
}

impl From<&SegDescriptor> for SegDescriptorSnapshot {
    fn from(d: &SegDescriptor) -> SegDescriptorSnapshot {
        SegDescriptorSnapshot {
            selector: d.selector,
            base: d.base,
            limit: d.limit,
            present: d.present,
            default_size: d.default_size,
            dpl: d.dpl,
            seg_type: d.seg_type,
            system: d.system,
            l_bit: d.l_bit,
            db_bit: d.db_bit,
            granularity: d.granularity,
        }
    }
}

impl From<&SegDescriptorSnapshot> for SegDescriptor {
    fn from(s: &SegDescriptorSnapshot) -> SegDescriptor {
        SegDescriptor {
            selector: s.selector,
            base: s.base,
            limit: s.limit,
            present: s.present,
            default_size: s.default_size,
            dpl: s.dpl,
            seg_type: s.seg_type,
            system: s.system,
            l_bit: s.l_bit,
            db_bit: s.db_bit,
            granularity: s.granularity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentFileSnapshot {
    pub es: SegDescriptorSnapshot,
    pub cs: SegDescriptorSnapshot,
    pub ss: SegDescriptorSnapshot,
    pub ds: SegDescriptorSnapshot,
    pub fs: SegDescriptorSnapshot,
    pub gs: SegDescriptorSnapshot,
}

impl From<&SegmentFile> for SegmentFileSnapshot {
    fn from(s: &SegmentFile) -> SegmentFileSnapshot {
        SegmentFileSnapshot {
            es: (&s.es).into(),
            cs: (&s.cs).into(),
            ss: (&s.ss).into(),
            ds: (&s.ds).into(),
            fs: (&s.fs).into(),
            gs: (&s.gs).into(),
        }
    }
}

impl From<&SegmentFileSnapshot> for SegmentFile {
    fn from(s: &SegmentFileSnapshot) -> SegmentFile {
        SegmentFile {
            es: (&s.es).into(),
            cs: (&s.cs).into(),
            ss: (&s.ss).into(),
            ds: (&s.ds).into(),
            fs: (&s.fs).into(),
            gs: (&s.gs).into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ControlRegsSnapshot {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
}

impl From<&ControlRegs> for ControlRegsSnapshot {
    fn from(c: &ControlRegs) -> ControlRegsSnapshot {
        ControlRegsSnapshot { cr0: c.cr0, cr2: c.cr2, cr3: c.cr3, cr4: c.cr4, cr8: c.cr8 }
    }
}

impl From<&ControlRegsSnapshot> for ControlRegs {
    fn from(c: &ControlRegsSnapshot) -> ControlRegs {
        ControlRegs { cr0: c.cr0, cr2: c.cr2, cr3: c.cr3, cr4: c.cr4, cr8: c.cr8 }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MsrFileSnapshot {
    pub efer: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub kernel_gs_base: u64,
}

impl From<&MsrFile> for MsrFileSnapshot {
    fn from(m: &MsrFile) -> MsrFileSnapshot {
        MsrFileSnapshot {
            efer: m.efer,
            fs_base: m.fs_base,
            gs_base: m.gs_base,
            kernel_gs_base: m.kernel_gs_base,
        }
    }
}

impl From<&MsrFileSnapshot> for MsrFile {
    fn from(m: &MsrFileSnapshot) -> MsrFile {
        MsrFile { efer: m.efer, fs_base: m.fs_base, gs_base: m.gs_base, kernel_gs_base: m.kernel_gs_base }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DescriptorTablesSnapshot {
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
    pub tr_selector: u16,
    pub tr_base: u64,
    pub tr_limit: u32,
}

impl From<&DescriptorTables> for DescriptorTablesSnapshot {
    fn from(t: &DescriptorTables) -> DescriptorTablesSnapshot {
        DescriptorTablesSnapshot {
            gdtr_base: t.gdtr_base,
            gdtr_limit: t.gdtr_limit,
            idtr_base: t.idtr_base,
            idtr_limit: t.idtr_limit,
            tr_selector: t.tr_selector,
            tr_base: t.tr_base,
            tr_limit: t.tr_limit,
        }
    }
}

impl From<&DescriptorTablesSnapshot> for DescriptorTables {
    fn from(t: &DescriptorTablesSnapshot) -> DescriptorTables {
        DescriptorTables {
            gdtr_base: t.gdtr_base,
            gdtr_limit: t.gdtr_limit,
            idtr_base: t.idtr_base,
            idtr_limit: t.idtr_limit,
            tr_selector: t.tr_selector,
            tr_base: t.tr_base,
            tr_limit: t.tr_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LazyFlagRecordSnapshot {
    pub width_bits: u32,
    pub left: u64,
    pub right: u64,
    pub carry_in: u64,
    pub result: u64,
}

impl From<&LazyFlagRecord> for LazyFlagRecordSnapshot {
    fn from(r: &LazyFlagRecord) -> LazyFlagRecordSnapshot {
        LazyFlagRecordSnapshot {
            width_bits: r.width_bits,
            left: r.left,
            right: r.right,
            carry_in: r.carry_in,
            result: r.result,
        }
    }
}

impl From<&LazyFlagRecordSnapshot> for LazyFlagRecord {
    fn from(r: &LazyFlagRecordSnapshot) -> LazyFlagRecord {
        LazyFlagRecord {
            width_bits: r.width_bits,
            left: r.left,
            right: r.right,
            carry_in: r.carry_in,
            result: r.result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuModeSnapshot {
    Real,
    Protected,
    Compatibility,
    Long,
}

impl From<CpuMode> for CpuModeSnapshot {
    fn from(m: CpuMode) -> CpuModeSnapshot {
        match m {
            CpuMode::Real => CpuModeSnapshot::Real,
            CpuMode::Protected => CpuModeSnapshot::Protected,
            CpuMode::Compatibility => CpuModeSnapshot::Compatibility,
            CpuMode::Long => CpuModeSnapshot::Long,
        }
    }
}

impl From<CpuModeSnapshot> for CpuMode {
    fn from(m: CpuModeSnapshot) -> CpuMode {
        match m {
            CpuModeSnapshot::Real => CpuMode::Real,
            CpuModeSnapshot::Protected => CpuMode::Protected,
            CpuModeSnapshot::Compatibility => CpuMode::Compatibility,
            CpuModeSnapshot::Long => CpuMode::Long,
        }
    }
}

/// The whole architectural snapshot, minus the transient per-instruction
/// prefix scratchpad (`CpuState::prefix`) and `debug` registers, neither
/// of which outlive a single `step` or matter to a host rehydrating a
/// paused guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub segments: SegmentFileSnapshot,
    pub control: ControlRegsSnapshot,
    pub msr: MsrFileSnapshot,
    pub tables: DescriptorTablesSnapshot,
    pub mode: CpuModeSnapshot,
    pub cpl: u8,
    pub default_operand_size: u8,
    pub default_address_size: u8,
    pub a20_enabled: bool,
    pub halted: bool,
    pub interrupt_shadow: bool,
    pub lazy_flags: LazyFlagRecordSnapshot,
}

impl Snapshot {
    pub fn from_state(state: &CpuState) -> Snapshot {
        let mut gprs = [0u64; 16];
        for (i, slot) in gprs.iter_mut().enumerate() {
            *slot = state.read_gpr64(i as u8);
        }
        Snapshot {
            gprs,
            rip: state.rip,
            rflags: state.rflags(),
            segments: (&state.segments).into(),
            control: (&state.control).into(),
            msr: (&state.msr).into(),
            tables: (&state.tables).into(),
            mode: state.mode.into(),
            cpl: state.cpl,
            default_operand_size: state.default_operand_size,
            default_address_size: state.default_address_size,
            a20_enabled: state.a20_enabled,
            halted: state.halted,
            interrupt_shadow: state.interrupt_shadow,
            lazy_flags: (&state.lazy_flags).into(),
        }
    }

    /// Rehydrates a `CpuState`, starting from `CpuState::reset()` so every
    /// field this snapshot doesn't carry (the prefix scratchpad, debug
    /// registers) gets a well-defined value rather than staying
    /// uninitialized.
    pub fn apply_to(&self, state: &mut CpuState) {
        *state = CpuState::reset();
        for (i, &v) in self.gprs.iter().enumerate() {
            state.write_gpr(i as u8, relic_x86::Width::W64, v);
        }
        state.rip = self.rip;
        state.set_rflags(self.rflags);
        state.segments = (&self.segments).into();
        state.control = (&self.control).into();
        state.msr = (&self.msr).into();
        state.tables = (&self.tables).into();
        state.mode = self.mode.into();
        state.cpl = self.cpl;
        state.default_operand_size = self.default_operand_size;
        state.default_address_size = self.default_address_size;
        state.a20_enabled = self.a20_enabled;
        state.halted = self.halted;
        state.interrupt_shadow = self.interrupt_shadow;
        state.lazy_flags = (&self.lazy_flags).into();
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Snapshot, serde_json::Error> {
        serde_json::from_str(json)
    }
}
