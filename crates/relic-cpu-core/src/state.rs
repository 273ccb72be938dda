//! Register file (C1), flag state (C2), and CPU context (C3).
//!
//! These three live together in one `CpuState` aggregate rather than as
//! separate structs behind separate borrows — spec.md §9 calls out that
//! they are mutually referenced on every instruction, and a systems
//! language should model that as plain fields of one struct rather than
//! fight the borrow checker with cross-referencing handles.

use relic_x86::Width;

/// Plain `u8` GPR indices, post-REX-extension (0..16), matching the
/// decoder's ModR/M/SIB/opcode-embedded register fields directly.
pub mod gpr {
    pub const RAX: u8 = 0;
    pub const RCX: u8 = 1;
    pub const RDX: u8 = 2;
    pub const RBX: u8 = 3;
    pub const RSP: u8 = 4;
    pub const RBP: u8 = 5;
    pub const RSI: u8 = 6;
    pub const RDI: u8 = 7;
}

pub const RFLAGS_CF: u64 = 1 << 0;
pub const RFLAGS_RESERVED1: u64 = 1 << 1;
pub const RFLAGS_PF: u64 = 1 << 2;
pub const RFLAGS_AF: u64 = 1 << 4;
pub const RFLAGS_ZF: u64 = 1 << 6;
pub const RFLAGS_SF: u64 = 1 << 7;
pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_DF: u64 = 1 << 10;
pub const RFLAGS_OF: u64 = 1 << 11;
pub const RFLAGS_IOPL_MASK: u64 = 0b11 << 12;
pub const RFLAGS_NT: u64 = 1 << 14;

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_EM: u64 = 1 << 2;
pub const CR0_TS: u64 = 1 << 3;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;

pub const EFER_SCE: u64 = 1 << 0;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

/// The four operating modes named in spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    Compatibility,
    Long,
}

/// A "lazy record" (spec.md §3) of the last arithmetic op's operands, kept
/// only so that implementations could later add on-demand flag recovery;
/// per §9's eager-flags design note we compute everything up front and
/// never read this back, but it's preserved because the host-visible
/// snapshot includes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LazyFlagRecord {
    pub width_bits: u32,
    pub left: u64,
    pub right: u64,
    pub carry_in: u64,
    pub result: u64,
}

/// The active REX prefix, if any, plus the transient per-instruction
/// overrides the decoder accumulates while reading the prefix chain.
/// Everything here except `rex` is scoped to a single instruction and is
/// cleared by the dispatcher after a terminal (non-CONTINUE) decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixState {
    pub rex: Option<relic_x86::Rex>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub segment_override: Option<relic_x86::SegReg>,
    pub lock: bool,
    pub rep: Option<RepPrefix>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepPrefix {
    Rep,
    Repe,
    Repne,
}

/// A decoded, cached segment descriptor (spec.md §3 "Cached Segment
/// Descriptor"). `base`/`limit` are already expanded from the raw
/// granularity-bit encoding.
#[derive(Debug, Clone, Copy)]
pub struct SegDescriptor {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub present: bool,
    /// Default operand/address size this segment implies when it's CS:
    /// 16, 32, or 64 (64 only meaningful when `l_bit` is set).
    pub default_size: u8,
    pub dpl: u8,
    pub seg_type: u8,
    /// S bit: true for code/data, false for system descriptors (TSS, LDT, gates).
    pub system: bool,
    pub l_bit: bool,
    pub db_bit: bool,
    pub granularity: bool,
}

impl SegDescriptor {
    /// The descriptor real mode and a null-selector data-segment load
    /// install: a flat, always-present, 64 KiB segment.
    pub fn real_mode(selector: u16) -> SegDescriptor {
        SegDescriptor {
            selector,
            base: (selector as u64) << 4,
            limit: 0xFFFF,
            present: true,
            default_size: 16,
            dpl: 0,
            seg_type: 0b10, // read/write data
            system: false,
            l_bit: false,
            db_bit: false,
            granularity: false,
        }
    }

    pub fn null() -> SegDescriptor {
        SegDescriptor {
            selector: 0,
            base: 0,
            limit: 0,
            present: false,
            default_size: 32,
            dpl: 0,
            seg_type: 0,
            system: false,
            l_bit: false,
            db_bit: false,
            granularity: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentFile {
    pub es: SegDescriptor,
    pub cs: SegDescriptor,
    pub ss: SegDescriptor,
    pub ds: SegDescriptor,
    pub fs: SegDescriptor,
    pub gs: SegDescriptor,
}

impl SegmentFile {
    pub fn get(&self, seg: relic_x86::SegReg) -> &SegDescriptor {
        use relic_x86::SegReg::*;
        match seg {
            Es => &self.es,
            Cs => &self.cs,
            Ss => &self.ss,
            Ds => &self.ds,
            Fs => &self.fs,
            Gs => &self.gs,
        }
    }

    pub fn get_mut(&mut self, seg: relic_x86::SegReg) -> &mut SegDescriptor {
        use relic_x86::SegReg::*;
        match seg {
            Es => &mut self.es,
            Cs => &mut self.cs,
            Ss => &mut self.ss,
            Ds => &mut self.ds,
            Fs => &mut self.fs,
            Gs => &mut self.gs,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControlRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MsrFile {
    pub efer: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub kernel_gs_base: u64,
}

/// Task register contents (selector + the base/limit cached from the TSS
/// descriptor at load time), plus GDTR/IDTR. Hardware task switching via
/// task gates is a spec.md Non-goal; we keep the register only far enough
/// to read RSP0/ISTn during INT/IRET stack switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorTables {
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
    pub tr_selector: u16,
    pub tr_base: u64,
    pub tr_limit: u32,
}

/// The full architectural state an `Emulator` aggregate owns: C1
/// (register file), C2 (flag state), and C3 (CPU context) in one struct,
/// per spec.md §9's guidance against splitting these into cyclically
/// referencing handles.
#[derive(Debug, Clone)]
pub struct CpuState {
    gprs: [u64; 16],
    pub rip: u64,
    rflags: u64,
    pub segments: SegmentFile,
    pub control: ControlRegs,
    pub debug: [u64; 8],
    pub msr: MsrFile,
    pub tables: DescriptorTables,
    pub mode: CpuMode,
    pub cpl: u8,
    pub default_operand_size: u8,
    pub default_address_size: u8,
    pub a20_enabled: bool,
    pub halted: bool,
    /// STI's "interrupt-delivery block" (spec.md §4.3): armed by STI,
    /// consumed by the host's interrupt-recognition check after the next
    /// instruction retires.
    pub interrupt_shadow: bool,
    pub prefix: PrefixState,
    pub lazy_flags: LazyFlagRecord,
}

impl CpuState {
    /// `reset()` (spec.md §6): real mode, CS:IP = F000:FFF0, A20 off.
    pub fn reset() -> CpuState {
        let mut st = CpuState {
            gprs: [0; 16],
            rip: 0xFFF0,
            rflags: RFLAGS_RESERVED1,
            segments: SegmentFile {
                es: SegDescriptor::real_mode(0),
                cs: SegDescriptor::real_mode(0xF000),
                ss: SegDescriptor::real_mode(0),
                ds: SegDescriptor::real_mode(0),
                fs: SegDescriptor::real_mode(0),
                gs: SegDescriptor::real_mode(0),
            },
            control: ControlRegs::default(),
            debug: [0; 8],
            msr: MsrFile::default(),
            tables: DescriptorTables::default(),
            mode: CpuMode::Real,
            cpl: 0,
            default_operand_size: 16,
            default_address_size: 16,
            a20_enabled: false,
            halted: false,
            interrupt_shadow: false,
            prefix: PrefixState::default(),
            lazy_flags: LazyFlagRecord::default(),
        };
        // CS.base is conventionally F0000 at reset, not selector<<4 (the
        // one exception to the real-mode base formula, matching the
        // power-up microcode's reset vector base).
        st.segments.cs.base = 0xFFFF_0000;
        st
    }

    // ---- GPR access -----------------------------------------------------

    pub fn read_gpr(&self, idx: u8, width: Width) -> u64 {
        self.gprs[idx as usize] & width.mask()
    }

    pub fn write_gpr(&mut self, idx: u8, width: Width, value: u64) {
        let slot = &mut self.gprs[idx as usize];
        match width {
            Width::W8 => *slot = (*slot & !0xFF) | (value & 0xFF),
            Width::W16 => *slot = (*slot & !0xFFFF) | (value & 0xFFFF),
            // 32-bit writes always zero-extend to 64 bits. In non-long
            // modes the upper 32 bits are architecturally unobserved, so
            // this is equivalent to "preserve" there and required by P1
            // in long mode.
            Width::W32 => *slot = value & 0xFFFF_FFFF,
            Width::W64 => *slot = value,
        }
    }

    pub fn read_gpr64(&self, idx: u8) -> u64 {
        self.gprs[idx as usize]
    }

    /// 8-bit GPR read honoring the AH/CH/DH/BH vs SPL/BPL/SIL/DIL split
    /// (spec.md §3, §4.1: "When REX is present, byte-register indices 4-7
    /// refer to SPL/BPL/SIL/DIL rather than AH/CH/DH/BH"). `enc` is the
    /// *unextended* 0..8 encoding field; REX.B extension to reach
    /// R8B..R15B is applied by the caller before calling this for enc>=8,
    /// at which point the high-byte special case never applies.
    pub fn read_gpr8(&self, enc: u8, rex_present: bool) -> u8 {
        if enc < 4 || rex_present || enc >= 8 {
            (self.gprs[enc as usize] & 0xFF) as u8
        } else {
            ((self.gprs[(enc - 4) as usize] >> 8) & 0xFF) as u8
        }
    }

    pub fn write_gpr8(&mut self, enc: u8, rex_present: bool, value: u8) {
        if enc < 4 || rex_present || enc >= 8 {
            let slot = &mut self.gprs[enc as usize];
            *slot = (*slot & !0xFF) | (value as u64);
        } else {
            let slot = &mut self.gprs[(enc - 4) as usize];
            *slot = (*slot & !0xFF00) | ((value as u64) << 8);
        }
    }

    // ---- RFLAGS -----------------------------------------------------

    pub fn rflags(&self) -> u64 {
        self.rflags
    }

    /// Sets RFLAGS wholesale, re-forcing bit 1 (always reads as 1) and
    /// masking off bits this model does not implement (VM, RF, AC, VIF,
    /// VIP, ID — none of these appear in spec.md's named-bit list).
    pub fn set_rflags(&mut self, value: u64) {
        self.rflags = (value & 0x0003_7FD5) | RFLAGS_RESERVED1;
    }

    pub fn flag(&self, mask: u64) -> bool {
        self.rflags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u64, value: bool) {
        if value {
            self.rflags |= mask;
        } else {
            self.rflags &= !mask;
        }
    }

    pub fn iopl(&self) -> u8 {
        ((self.rflags & RFLAGS_IOPL_MASK) >> 12) as u8
    }

    pub fn set_iopl(&mut self, iopl: u8) {
        self.rflags = (self.rflags & !RFLAGS_IOPL_MASK) | (((iopl & 0b11) as u64) << 12);
    }

    // ---- mode derivation --------------------------------------------

    /// Recomputes `mode`, EFER.LMA, and the default operand/address
    /// sizes from CR0/CR4/EFER and the current CS descriptor. Must be
    /// called after any write to CR0, CR4, EFER, or CS (far jump/call,
    /// IRET, task switch equivalent).
    pub fn update_mode(&mut self) {
        let long_mode_active = self.control.cr0 & CR0_PE != 0
            && self.control.cr0 & CR0_PG != 0
            && self.control.cr4 & CR4_PAE != 0
            && self.msr.efer & EFER_LME != 0;

        self.mode = if self.control.cr0 & CR0_PE == 0 {
            CpuMode::Real
        } else if long_mode_active {
            if self.segments.cs.l_bit {
                CpuMode::Long
            } else {
                CpuMode::Compatibility
            }
        } else {
            CpuMode::Protected
        };

        if long_mode_active {
            self.msr.efer |= EFER_LMA;
        } else {
            self.msr.efer &= !EFER_LMA;
        }

        match self.mode {
            CpuMode::Real => {
                self.default_operand_size = 16;
                self.default_address_size = 16;
            }
            CpuMode::Long => {
                self.default_operand_size = 32;
                self.default_address_size = 64;
            }
            CpuMode::Protected | CpuMode::Compatibility => {
                let wide = self.segments.cs.db_bit;
                self.default_operand_size = if wide { 32 } else { 16 };
                self.default_address_size = if wide { 32 } else { 16 };
            }
        }
    }
}

/// Masks a raw value down to the bits a register of this width can hold;
/// used by the shift/rotate count masking rule (spec.md §4.3, P9) as well
/// as anywhere a wraparound-sized quantity (address offsets) needs
/// trimming.
pub fn mask_bits(value: u64, width: Width) -> u64 {
    value & width.mask()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writing_al_leaves_upper_bits_unchanged() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W64, 0x1122_3344_5566_7788);
        st.write_gpr8(gpr::RAX, true, 0xFF);
        assert_eq!(st.read_gpr64(gpr::RAX), 0x1122_3344_5566_77FF);
    }

    #[test]
    fn write_gpr32_zero_extends_to_64() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W64, 0xFFFF_FFFF_FFFF_FFFF);
        st.write_gpr(gpr::RAX, Width::W32, 0x1234_5678);
        assert_eq!(st.read_gpr64(gpr::RAX), 0x1234_5678);
    }

    #[test]
    fn ah_ch_dh_bh_addressed_without_rex() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RAX, Width::W64, 0);
        st.write_gpr8(4, false, 0xAB); // AH
        assert_eq!(st.read_gpr64(gpr::RAX), 0xAB00);
        assert_eq!(st.read_gpr8(4, false), 0xAB);
    }

    #[test]
    fn spl_addressed_with_rex_present_instead_of_ah() {
        let mut st = CpuState::reset();
        st.write_gpr(gpr::RSP, Width::W64, 0x1100);
        st.write_gpr8(4, true, 0x77); // SPL, not AH
        assert_eq!(st.read_gpr64(gpr::RSP), 0x1177);
    }

    #[test]
    fn reserved_bit_one_always_set() {
        let mut st = CpuState::reset();
        st.set_rflags(0);
        assert!(st.flag(RFLAGS_RESERVED1));
    }

    #[test]
    fn update_mode_real_to_long() {
        let mut st = CpuState::reset();
        st.control.cr0 = CR0_PE | CR0_PG;
        st.control.cr4 = CR4_PAE;
        st.msr.efer = EFER_LME;
        st.segments.cs.l_bit = true;
        st.update_mode();
        assert_eq!(st.mode, CpuMode::Long);
        assert_eq!(st.default_operand_size, 32);
        assert_eq!(st.default_address_size, 64);
        assert!(st.msr.efer & EFER_LMA != 0);
    }

    #[test]
    fn update_mode_protected_32bit_from_cs_db_bit() {
        let mut st = CpuState::reset();
        st.control.cr0 = CR0_PE;
        st.segments.cs.db_bit = true;
        st.update_mode();
        assert_eq!(st.mode, CpuMode::Protected);
        assert_eq!(st.default_operand_size, 32);
        assert_eq!(st.default_address_size, 32);
    }
}
