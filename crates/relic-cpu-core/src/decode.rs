//! Decoder (C5): prefix chain, one/two-byte opcode maps, ModR/M + SIB,
//! immediate extraction (spec.md §4.1).
//!
//! Simplification vs. the literal CONTINUE contract: spec.md's `CONTINUE`
//! status exists because a translation block may decode in bounded
//! fetch windows and need to resume a prefix chain across a window
//! boundary. This decoder always has the live bus available and decodes
//! one whole instruction per call with no windowing, so `CONTINUE` never
//! actually arises here — but the REX-survives-prefix-parsing invariant
//! it exists to protect is still upheld structurally, since
//! `state.prefix.rex` is a `CpuState` field the dispatcher (not the
//! decoder) clears after a terminal decode. See DESIGN.md.

use crate::error::Exception;
use crate::mem::CpuBus;
use crate::operand::{resolve_mem_operand, RawMemOperand, RmOperand};
use crate::state::{CpuMode, CpuState, RepPrefix};
use relic_x86::{ModRm, Rex, SegReg, Sib, Width};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    pub fn from_index(idx: u8) -> AluOp {
        use AluOp::*;
        match idx & 0b111 {
            0 => Add,
            1 => Or,
            2 => Adc,
            3 => Sbb,
            4 => And,
            5 => Sub,
            6 => Xor,
            _ => Cmp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    pub fn from_index(idx: u8) -> ShiftOp {
        use ShiftOp::*;
        match idx & 0b111 {
            0 => Rol,
            1 => Ror,
            2 => Rcl,
            3 => Rcr,
            4 => Shl,
            5 => Shr,
            6 => Shl, // SAL is a documented alias of SHL
            _ => Sar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Loop,
    Loope,
    Loopne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Mov,
    Movzx,
    Movsx,
    Lea,
    Xchg,
    Nop,
    Alu(AluOp),
    Test,
    Not,
    Neg,
    Mul,
    Imul1,
    ImulRmReg,
    ImulRmImm,
    Div,
    Idiv,
    Inc,
    Dec,
    Shift(ShiftOp),
    Daa,
    Das,
    Cbw,
    Cwde,
    Cdqe,
    Cwd,
    Cdq,
    Cqo,
    Push,
    Pop,
    Leave,
    Pusha,
    Popa,
    Pushf,
    Popf,
    JmpRel,
    JmpFar,
    JmpRm,
    JmpFarRm,
    Jcc(relic_x86::Condition),
    CallRel,
    CallRm,
    CallFar,
    Ret,
    RetImm,
    RetFar,
    Loop(LoopKind),
    Jcxz,
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Cli,
    Sti,
    Hlt,
    Int3,
    IntImm,
    Into,
    Iret,
    Cpuid,
    Rdtsc,
    In,
    Out,
    Ud2,
}

#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    pub width: Width,
    pub addr_width: Width,
    pub rm: RmOperand,
    /// Unresolved form of a `Mem` `rm`, kept around so a translation block
    /// replayed out of `tbcache` can re-derive the linear address from
    /// current register state instead of dispatching against whatever
    /// address was live the first time this instruction was decoded. `None`
    /// whenever `rm` is `Reg` (and for absolute `moffs` forms, where it
    /// would be harmless but pointless to carry).
    pub raw_rm: Option<RawMemOperand>,
    /// ModR/M reg field (REX.R-extended). Meaning is mnemonic-dependent:
    /// a second GPR operand for two-operand forms, or an ALU/shift-op
    /// selector already folded into `mnemonic` for group opcodes.
    pub reg: u8,
    pub imm: i64,
    pub rel: i64,
    pub rex_present: bool,
    pub seg_override: Option<SegReg>,
    pub rep: Option<RepPrefix>,
    pub length: u32,
    pub far_selector: u16,
    /// True when the non-destination operand for `Alu`/`Test`/`Mov` is
    /// `imm` rather than the register named by `reg` — the two share
    /// opcodes (e.g. `ADD rm,r` vs `ADD rm,imm`; `MOV reg,rm` vs `MOV
    /// reg,imm`) and `reg`/`imm` alone can't tell exec which one applies
    /// since both default to 0 when unused.
    pub imm_is_operand: bool,
}

struct Fetcher<'a, B> {
    bus: &'a mut B,
    code_base: u64,
    start_ip: u64,
    offset: u32,
}

impl<'a, B: CpuBus> Fetcher<'a, B> {
    fn next_u8(&mut self) -> Result<u8, Exception> {
        let addr = self.code_base.wrapping_add(self.start_ip.wrapping_add(self.offset as u64));
        let b = self.bus.read_u8(addr)?;
        self.offset += 1;
        Ok(b)
    }

    fn next_i8(&mut self) -> Result<i8, Exception> {
        Ok(self.next_u8()? as i8)
    }

    fn next_u16(&mut self) -> Result<u16, Exception> {
        let lo = self.next_u8()? as u16;
        let hi = self.next_u8()? as u16;
        Ok(lo | (hi << 8))
    }

    fn next_i16(&mut self) -> Result<i16, Exception> {
        Ok(self.next_u16()? as i16)
    }

    fn next_u32(&mut self) -> Result<u32, Exception> {
        let lo = self.next_u16()? as u32;
        let hi = self.next_u16()? as u32;
        Ok(lo | (hi << 16))
    }

    fn next_i32(&mut self) -> Result<i32, Exception> {
        Ok(self.next_u32()? as i32)
    }

    fn next_u64(&mut self) -> Result<u64, Exception> {
        let lo = self.next_u32()? as u64;
        let hi = self.next_u32()? as u64;
        Ok(lo | (hi << 32))
    }
}

enum PendingRm {
    Reg(u8),
    Mem(RawMemOperand),
}

fn width_from_size(size: u8) -> Width {
    match size {
        16 => Width::W16,
        64 => Width::W64,
        _ => Width::W32,
    }
}

fn operand_width(state: &CpuState, rex: Option<Rex>, toggled: bool) -> Width {
    if rex.map_or(false, |r| r.w) {
        return Width::W64;
    }
    let base = state.default_operand_size;
    let eff = if toggled {
        if base == 16 {
            32
        } else {
            16
        }
    } else {
        base
    };
    width_from_size(eff)
}

fn address_width(state: &CpuState, toggled: bool) -> Width {
    let base = state.default_address_size;
    let eff = if toggled {
        match base {
            16 => 32,
            32 => 16,
            64 => 32,
            _ => 32,
        }
    } else {
        base
    };
    width_from_size(eff)
}

/// Classic 16-bit ModR/M addressing forms (spec.md §4.2's "legacy BX/BP +
/// SI/DI form").
fn decode_mem16<B: CpuBus>(
    fetcher: &mut Fetcher<B>,
    modrm: ModRm,
    seg_override: Option<SegReg>,
) -> Result<RawMemOperand, Exception> {
    use crate::state::gpr::*;
    let (base_reg, index) = match modrm.rm {
        0 => (Some(RBX), Some((RSI, 1))),
        1 => (Some(RBX), Some((RDI, 1))),
        2 => (Some(RBP), Some((RSI, 1))),
        3 => (Some(RBP), Some((RDI, 1))),
        4 => (Some(RSI), None),
        5 => (Some(RDI), None),
        6 => (Some(RBP), None),
        _ => (Some(RBX), None),
    };
    let default_seg = if matches!(modrm.rm, 2 | 3 | 6) {
        SegReg::Ss
    } else {
        SegReg::Ds
    };
    let (base_reg, disp) = if modrm.modbits == 0 && modrm.rm == 6 {
        (None, fetcher.next_i16()? as i64)
    } else {
        let disp = match modrm.modbits {
            1 => fetcher.next_i8()? as i64,
            2 => fetcher.next_i16()? as i64,
            _ => 0,
        };
        (base_reg, disp)
    };
    Ok(RawMemOperand {
        seg: seg_override.unwrap_or(default_seg),
        base_reg,
        index,
        disp,
        rip_relative: false,
    })
}

/// 32/64-bit ModR/M + optional SIB addressing forms.
fn decode_mem32_64<B: CpuBus>(
    fetcher: &mut Fetcher<B>,
    modrm: ModRm,
    rex: Option<Rex>,
    long_mode: bool,
    seg_override: Option<SegReg>,
) -> Result<RawMemOperand, Exception> {
    let rex_x = rex.map_or(false, |r| r.x);
    let rex_b = rex.map_or(false, |r| r.b);

    if modrm.rm == 4 {
        let sib = Sib::from_byte(fetcher.next_u8()?);
        let index = if sib.index == 4 && !rex_x {
            None
        } else {
            Some((sib.index | ((rex_x as u8) << 3), sib.scale))
        };
        let (base_reg, disp) = if modrm.modbits == 0 && sib.base == 5 {
            (None, fetcher.next_i32()? as i64)
        } else {
            let base = sib.base | ((rex_b as u8) << 3);
            let disp = match modrm.modbits {
                1 => fetcher.next_i8()? as i64,
                2 => fetcher.next_i32()? as i64,
                _ => 0,
            };
            (Some(base), disp)
        };
        let default_seg = if matches!(base_reg, Some(4) | Some(5)) {
            SegReg::Ss
        } else {
            SegReg::Ds
        };
        return Ok(RawMemOperand {
            seg: seg_override.unwrap_or(default_seg),
            base_reg,
            index,
            disp,
            rip_relative: false,
        });
    }

    if modrm.modbits == 0 && modrm.rm == 5 {
        let disp = fetcher.next_i32()? as i64;
        if long_mode {
            return Ok(RawMemOperand {
                seg: seg_override.unwrap_or(SegReg::Ds),
                base_reg: None,
                index: None,
                disp,
                rip_relative: true,
            });
        }
        return Ok(RawMemOperand {
            seg: seg_override.unwrap_or(SegReg::Ds),
            base_reg: None,
            index: None,
            disp,
            rip_relative: false,
        });
    }

    let base = modrm.rm | ((rex_b as u8) << 3);
    let disp = match modrm.modbits {
        1 => fetcher.next_i8()? as i64,
        2 => fetcher.next_i32()? as i64,
        _ => 0,
    };
    let default_seg = if matches!(base, 4 | 5) { SegReg::Ss } else { SegReg::Ds };
    Ok(RawMemOperand {
        seg: seg_override.unwrap_or(default_seg),
        base_reg: Some(base),
        index: None,
        disp,
        rip_relative: false,
    })
}

fn decode_rm<B: CpuBus>(
    fetcher: &mut Fetcher<B>,
    modrm: ModRm,
    rex: Option<Rex>,
    addr_width: Width,
    long_mode: bool,
    seg_override: Option<SegReg>,
) -> Result<PendingRm, Exception> {
    if modrm.is_register_direct() {
        let rex_b = rex.map_or(false, |r| r.b);
        return Ok(PendingRm::Reg(modrm.rm | ((rex_b as u8) << 3)));
    }
    let raw = if addr_width == Width::W16 {
        decode_mem16(fetcher, modrm, seg_override)?
    } else {
        decode_mem32_64(fetcher, modrm, rex, long_mode, seg_override)?
    };
    Ok(PendingRm::Mem(raw))
}

macro_rules! bail_ud {
    () => {
        return Err(Exception::InvalidOpcode)
    };
}

/// Decodes and fully resolves one instruction starting at `state.rip`.
/// Does not advance `state.rip`; the caller (exec::dispatch, via
/// `Cpu::step`) advances it by `Instruction::length` once execution
/// (which may itself redirect IP for branches) completes.
pub fn decode_instruction<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
) -> Result<Instruction, Exception> {
    let code_base = state.segments.cs.base;
    let start_ip = state.rip;
    let mut f = Fetcher {
        bus,
        code_base,
        start_ip,
        offset: 0,
    };

    let long_mode = matches!(state.mode, CpuMode::Long);
    let mut rex: Option<Rex> = None;
    let mut operand_toggle = false;
    let mut address_toggle = false;
    let mut seg_override: Option<SegReg> = None;
    let mut rep: Option<RepPrefix> = None;

    let opcode = loop {
        let byte = f.next_u8()?;
        match byte {
            0x26 => seg_override = Some(SegReg::Es),
            0x2E => seg_override = Some(SegReg::Cs),
            0x36 => seg_override = Some(SegReg::Ss),
            0x3E => seg_override = Some(SegReg::Ds),
            0x64 => seg_override = Some(SegReg::Fs),
            0x65 => seg_override = Some(SegReg::Gs),
            0x66 => operand_toggle = !operand_toggle,
            0x67 => address_toggle = !address_toggle,
            0xF0 => {} // LOCK: accepted, not separately modeled
            0xF2 => rep = Some(RepPrefix::Repne),
            0xF3 => rep = Some(RepPrefix::Rep),
            0x40..=0x4F if long_mode => rex = Some(Rex::from_byte(byte)),
            _ => break byte,
        }
    };

    let width = operand_width(state, rex, operand_toggle);
    let addr_width = address_width(state, address_toggle);
    let rex_present = rex.is_some();

    let mut mnemonic;
    let mut rm = PendingRm::Reg(0);
    let mut reg_field: u8 = 0;
    let mut imm: i64 = 0;
    let mut rel: i64 = 0;
    let mut far_selector: u16 = 0;
    let mut imm_is_operand = false;
    let mut inst_width = width;

    macro_rules! modrm {
        () => {{
            let byte = f.next_u8()?;
            ModRm::from_byte(byte)
        }};
    }
    macro_rules! reg_of {
        ($m:expr) => {
            $m.reg | ((rex.map_or(false, |r| r.r) as u8) << 3)
        };
    }
    macro_rules! rm_of {
        ($m:expr) => {
            decode_rm(&mut f, $m, rex, addr_width, long_mode, seg_override)?
        };
    }

    match opcode {
        // ALU rm,reg / reg,rm / AL,imm8 / eAX,imm families: 00..3D, skipping
        // 0F/26/etc which are handled as prefixes/two-byte already.
        b if (b & 0xC0 == 0) && matches!(b & 0x07, 0..=5) && b < 0x40 => {
            let op = AluOp::from_index((b >> 3) & 0x7);
            match b & 0x7 {
                0 => {
                    inst_width = Width::W8;
                    let m = modrm!();
                    reg_field = reg_of!(m);
                    rm = rm_of!(m);
                    mnemonic = Mnemonic::Alu(op); // rm8, r8
                }
                1 => {
                    let m = modrm!();
                    reg_field = reg_of!(m);
                    rm = rm_of!(m);
                    mnemonic = Mnemonic::Alu(op); // rm, r
                }
                2 => {
                    inst_width = Width::W8;
                    let m = modrm!();
                    reg_field = reg_of!(m);
                    rm = rm_of!(m);
                    mnemonic = Mnemonic::Alu(op); // r8, rm8 (dest is reg)
                }
                3 => {
                    let m = modrm!();
                    reg_field = reg_of!(m);
                    rm = rm_of!(m);
                    mnemonic = Mnemonic::Alu(op); // r, rm (dest is reg)
                }
                4 => {
                    inst_width = Width::W8;
                    imm = f.next_u8()? as i64;
                    rm = PendingRm::Reg(crate::state::gpr::RAX);
                    imm_is_operand = true;
                    mnemonic = Mnemonic::Alu(op); // AL, imm8
                }
                _ => {
                    imm = match width {
                        Width::W16 => f.next_i16()? as i64,
                        _ => f.next_i32()? as i64,
                    };
                    rm = PendingRm::Reg(crate::state::gpr::RAX);
                    imm_is_operand = true;
                    mnemonic = Mnemonic::Alu(op); // eAX, imm
                }
            }
            // Direction is recovered by exec::alu from `b & 0x7`'s position;
            // we fold it into `reg_field`/`rm` ordering via a convention:
            // forms 0/1/4/5 write through `rm`, forms 2/3 write through the
            // register named by `reg_field`. exec::alu inspects `opcode_form`.
            let (resolved_rm, raw_rm) = resolve(&rm, state, addr_width, start_ip, f.offset);
            return finish(
                state,
                &f,
                Instruction {
                    mnemonic,
                    width: inst_width,
                    addr_width,
                    rm: resolved_rm,
                    raw_rm,
                    reg: reg_field,
                    imm,
                    rel,
                    rex_present,
                    seg_override,
                    rep,
                    length: f.offset,
                    far_selector,
                    imm_is_operand,
                },
                b & 0x7,
            );
        }
        0x50..=0x57 => {
            mnemonic = Mnemonic::Push;
            reg_field = (opcode - 0x50) | ((rex.map_or(false, |r| r.b) as u8) << 3);
            rm = PendingRm::Reg(reg_field);
        }
        0x58..=0x5F => {
            mnemonic = Mnemonic::Pop;
            reg_field = (opcode - 0x58) | ((rex.map_or(false, |r| r.b) as u8) << 3);
            rm = PendingRm::Reg(reg_field);
        }
        0x60 => mnemonic = Mnemonic::Pusha,
        0x61 => mnemonic = Mnemonic::Popa,
        0x68 => {
            mnemonic = Mnemonic::Push;
            imm = match width {
                Width::W16 => f.next_i16()? as i64,
                _ => f.next_i32()? as i64,
            };
            imm_is_operand = true;
        }
        0x6A => {
            mnemonic = Mnemonic::Push;
            imm = f.next_i8()? as i64;
            imm_is_operand = true;
        }
        0x70..=0x7F => {
            mnemonic = Mnemonic::Jcc(relic_x86::Condition::from_nibble(opcode));
            rel = f.next_i8()? as i64;
        }
        0x80 | 0x82 => {
            inst_width = Width::W8;
            let m = modrm!();
            rm = rm_of!(m);
            imm = f.next_u8()? as i64;
            imm_is_operand = true;
            mnemonic = Mnemonic::Alu(AluOp::from_index(m.reg));
        }
        0x81 => {
            let m = modrm!();
            rm = rm_of!(m);
            imm = match width {
                Width::W16 => f.next_i16()? as i64,
                _ => f.next_i32()? as i64,
            };
            imm_is_operand = true;
            mnemonic = Mnemonic::Alu(AluOp::from_index(m.reg));
        }
        0x83 => {
            let m = modrm!();
            rm = rm_of!(m);
            imm = f.next_i8()? as i64;
            imm_is_operand = true;
            mnemonic = Mnemonic::Alu(AluOp::from_index(m.reg));
        }
        0x84 => {
            inst_width = Width::W8;
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            mnemonic = Mnemonic::Test;
        }
        0x85 => {
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            mnemonic = Mnemonic::Test;
        }
        0x86 => {
            inst_width = Width::W8;
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            mnemonic = Mnemonic::Xchg;
        }
        0x87 => {
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            mnemonic = Mnemonic::Xchg;
        }
        0x88 => {
            inst_width = Width::W8;
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            mnemonic = Mnemonic::Mov; // rm8 <- r8
        }
        0x89 => {
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            mnemonic = Mnemonic::Mov; // rm <- r
        }
        0x8A => {
            inst_width = Width::W8;
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            mnemonic = Mnemonic::Mov; // r8 <- rm8 (dest is reg_field)
            far_selector = 1; // reuse as a "reg is dest" marker for exec::data
        }
        0x8B => {
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            mnemonic = Mnemonic::Mov;
            far_selector = 1;
        }
        0x8D => {
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            mnemonic = Mnemonic::Lea;
        }
        0x8F => {
            let m = modrm!();
            rm = rm_of!(m);
            mnemonic = Mnemonic::Pop;
        }
        0x90 => mnemonic = Mnemonic::Nop,
        0x91..=0x97 => {
            mnemonic = Mnemonic::Xchg;
            reg_field = crate::state::gpr::RAX;
            rm = PendingRm::Reg((opcode - 0x90) | ((rex.map_or(false, |r| r.b) as u8) << 3));
        }
        0x98 => {
            mnemonic = match width {
                Width::W16 => Mnemonic::Cbw,
                Width::W64 => Mnemonic::Cdqe,
                _ => Mnemonic::Cwde,
            };
        }
        0x99 => {
            mnemonic = match width {
                Width::W16 => Mnemonic::Cwd,
                Width::W64 => Mnemonic::Cqo,
                _ => Mnemonic::Cdq,
            };
        }
        0x9C => mnemonic = Mnemonic::Pushf,
        0x9D => mnemonic = Mnemonic::Popf,
        0xA0 => {
            inst_width = Width::W8;
            let off = moffs(&mut f, addr_width)?;
            rm = PendingRm::Mem(off);
            reg_field = crate::state::gpr::RAX;
            mnemonic = Mnemonic::Mov;
            far_selector = 1;
        }
        0xA1 => {
            let off = moffs(&mut f, addr_width)?;
            rm = PendingRm::Mem(off);
            reg_field = crate::state::gpr::RAX;
            mnemonic = Mnemonic::Mov;
            far_selector = 1;
        }
        0xA2 => {
            inst_width = Width::W8;
            let off = moffs(&mut f, addr_width)?;
            rm = PendingRm::Mem(off);
            reg_field = crate::state::gpr::RAX;
            mnemonic = Mnemonic::Mov;
        }
        0xA3 => {
            let off = moffs(&mut f, addr_width)?;
            rm = PendingRm::Mem(off);
            reg_field = crate::state::gpr::RAX;
            mnemonic = Mnemonic::Mov;
        }
        0xA4 => {
            inst_width = Width::W8;
            mnemonic = Mnemonic::Movs;
        }
        0xA5 => mnemonic = Mnemonic::Movs,
        0xA6 => {
            inst_width = Width::W8;
            mnemonic = Mnemonic::Cmps;
        }
        0xA7 => mnemonic = Mnemonic::Cmps,
        0xA8 => {
            inst_width = Width::W8;
            imm = f.next_u8()? as i64;
            imm_is_operand = true;
            mnemonic = Mnemonic::Test;
            rm = PendingRm::Reg(crate::state::gpr::RAX);
        }
        0xA9 => {
            imm = match width {
                Width::W16 => f.next_i16()? as i64,
                _ => f.next_i32()? as i64,
            };
            imm_is_operand = true;
            mnemonic = Mnemonic::Test;
            rm = PendingRm::Reg(crate::state::gpr::RAX);
        }
        0xAA => {
            inst_width = Width::W8;
            mnemonic = Mnemonic::Stos;
        }
        0xAB => mnemonic = Mnemonic::Stos,
        0xAC => {
            inst_width = Width::W8;
            mnemonic = Mnemonic::Lods;
        }
        0xAD => mnemonic = Mnemonic::Lods,
        0xAE => {
            inst_width = Width::W8;
            mnemonic = Mnemonic::Scas;
        }
        0xAF => mnemonic = Mnemonic::Scas,
        0xB0..=0xB7 => {
            inst_width = Width::W8;
            reg_field = (opcode - 0xB0) | ((rex.map_or(false, |r| r.b) as u8) << 3);
            imm = f.next_u8()? as i64;
            imm_is_operand = true;
            mnemonic = Mnemonic::Mov;
            rm = PendingRm::Reg(reg_field);
            far_selector = 1;
        }
        0xB8..=0xBF => {
            reg_field = (opcode - 0xB8) | ((rex.map_or(false, |r| r.b) as u8) << 3);
            imm = if width == Width::W64 {
                f.next_u64()? as i64
            } else if width == Width::W16 {
                f.next_i16()? as i64
            } else {
                f.next_i32()? as i64
            };
            imm_is_operand = true;
            mnemonic = Mnemonic::Mov;
            rm = PendingRm::Reg(reg_field);
            far_selector = 1;
        }
        0xC0 | 0xC1 => {
            inst_width = if opcode == 0xC0 { Width::W8 } else { width };
            let m = modrm!();
            rm = rm_of!(m);
            imm = f.next_u8()? as i64;
            mnemonic = Mnemonic::Shift(ShiftOp::from_index(m.reg));
        }
        0xC2 => {
            imm = f.next_u16()? as i64;
            mnemonic = Mnemonic::RetImm;
        }
        0xC3 => mnemonic = Mnemonic::Ret,
        0xC6 => {
            inst_width = Width::W8;
            let m = modrm!();
            rm = rm_of!(m);
            imm = f.next_u8()? as i64;
            imm_is_operand = true;
            mnemonic = Mnemonic::Mov;
        }
        0xC7 => {
            let m = modrm!();
            rm = rm_of!(m);
            imm = match width {
                Width::W16 => f.next_i16()? as i64,
                _ => f.next_i32()? as i64,
            };
            imm_is_operand = true;
            mnemonic = Mnemonic::Mov;
        }
        0xC9 => mnemonic = Mnemonic::Leave,
        0xCB => mnemonic = Mnemonic::RetFar,
        0xCC => mnemonic = Mnemonic::Int3,
        0xCD => {
            imm = f.next_u8()? as i64;
            mnemonic = Mnemonic::IntImm;
        }
        0xCE => mnemonic = Mnemonic::Into,
        0xCF => mnemonic = Mnemonic::Iret,
        0xD0 | 0xD1 => {
            inst_width = if opcode == 0xD0 { Width::W8 } else { width };
            let m = modrm!();
            rm = rm_of!(m);
            imm = 1;
            mnemonic = Mnemonic::Shift(ShiftOp::from_index(m.reg));
        }
        0xD2 | 0xD3 => {
            inst_width = if opcode == 0xD2 { Width::W8 } else { width };
            let m = modrm!();
            rm = rm_of!(m);
            mnemonic = Mnemonic::Shift(ShiftOp::from_index(m.reg));
            far_selector = 2; // marker: count comes from CL
        }
        0xE0 => {
            rel = f.next_i8()? as i64;
            mnemonic = Mnemonic::Loop(LoopKind::Loopne);
        }
        0xE1 => {
            rel = f.next_i8()? as i64;
            mnemonic = Mnemonic::Loop(LoopKind::Loope);
        }
        0xE2 => {
            rel = f.next_i8()? as i64;
            mnemonic = Mnemonic::Loop(LoopKind::Loop);
        }
        0xE3 => {
            rel = f.next_i8()? as i64;
            mnemonic = Mnemonic::Jcxz;
        }
        0xE4 => {
            imm = f.next_u8()? as i64;
            imm_is_operand = true;
            inst_width = Width::W8;
            mnemonic = Mnemonic::In;
        }
        0xE5 => {
            imm = f.next_u8()? as i64;
            imm_is_operand = true;
            mnemonic = Mnemonic::In;
        }
        0xE6 => {
            imm = f.next_u8()? as i64;
            imm_is_operand = true;
            inst_width = Width::W8;
            mnemonic = Mnemonic::Out;
        }
        0xE7 => {
            imm = f.next_u8()? as i64;
            imm_is_operand = true;
            mnemonic = Mnemonic::Out;
        }
        0xE8 => {
            rel = f.next_i32()? as i64;
            mnemonic = Mnemonic::CallRel;
        }
        0xE9 => {
            rel = f.next_i32()? as i64;
            mnemonic = Mnemonic::JmpRel;
        }
        0xEA => {
            imm = f.next_u32()? as i64;
            far_selector = f.next_u16()?;
            mnemonic = Mnemonic::JmpFar;
        }
        0xEB => {
            rel = f.next_i8()? as i64;
            mnemonic = Mnemonic::JmpRel;
        }
        0xEC => {
            inst_width = Width::W8;
            mnemonic = Mnemonic::In;
        }
        0xED => mnemonic = Mnemonic::In,
        0xEE => {
            inst_width = Width::W8;
            mnemonic = Mnemonic::Out;
        }
        0xEF => mnemonic = Mnemonic::Out,
        0xF4 => mnemonic = Mnemonic::Hlt,
        0xF5 => mnemonic = Mnemonic::Cmc,
        0xF6 => {
            inst_width = Width::W8;
            let m = modrm!();
            rm = rm_of!(m);
            mnemonic = match m.reg {
                0 | 1 => {
                    imm = f.next_u8()? as i64;
                    imm_is_operand = true;
                    Mnemonic::Test
                }
                2 => Mnemonic::Not,
                3 => Mnemonic::Neg,
                4 => Mnemonic::Mul,
                5 => Mnemonic::Imul1,
                6 => Mnemonic::Div,
                _ => Mnemonic::Idiv,
            };
        }
        0xF7 => {
            let m = modrm!();
            rm = rm_of!(m);
            mnemonic = match m.reg {
                0 | 1 => {
                    imm = match width {
                        Width::W16 => f.next_i16()? as i64,
                        _ => f.next_i32()? as i64,
                    };
                    imm_is_operand = true;
                    Mnemonic::Test
                }
                2 => Mnemonic::Not,
                3 => Mnemonic::Neg,
                4 => Mnemonic::Mul,
                5 => Mnemonic::Imul1,
                6 => Mnemonic::Div,
                _ => Mnemonic::Idiv,
            };
        }
        0xF8 => mnemonic = Mnemonic::Clc,
        0xF9 => mnemonic = Mnemonic::Stc,
        0xFA => mnemonic = Mnemonic::Cli,
        0xFB => mnemonic = Mnemonic::Sti,
        0xFC => mnemonic = Mnemonic::Cld,
        0xFD => mnemonic = Mnemonic::Std,
        0xFE => {
            inst_width = Width::W8;
            let m = modrm!();
            rm = rm_of!(m);
            mnemonic = if m.reg == 0 { Mnemonic::Inc } else { Mnemonic::Dec };
        }
        0xFF => {
            let m = modrm!();
            rm = rm_of!(m);
            mnemonic = match m.reg {
                0 => Mnemonic::Inc,
                1 => Mnemonic::Dec,
                2 => Mnemonic::CallRm,
                3 => Mnemonic::CallFar,
                4 => Mnemonic::JmpRm,
                5 => Mnemonic::JmpFarRm,
                6 => Mnemonic::Push,
                _ => bail_ud!(),
            };
        }
        0x27 => mnemonic = Mnemonic::Daa,
        0x2F => mnemonic = Mnemonic::Das,
        0x0F => {
            let second = f.next_u8()?;
            match second {
                0x00 | 0x01 => bail_ud!(), // LGDT/SGDT/LLDT/LTR family: not modeled
                0x0B => mnemonic = Mnemonic::Ud2,
                0x1F => {
                    // multi-byte NOP (NOP r/m)
                    let m = modrm!();
                    rm = rm_of!(m);
                    mnemonic = Mnemonic::Nop;
                }
                0x31 => mnemonic = Mnemonic::Rdtsc,
                0x80..=0x8F => {
                    mnemonic = Mnemonic::Jcc(relic_x86::Condition::from_nibble(second));
                    rel = match width {
                        Width::W16 => f.next_i16()? as i64,
                        _ => f.next_i32()? as i64,
                    };
                }
                0xA2 => mnemonic = Mnemonic::Cpuid,
                0xAF => {
                    let m = modrm!();
                    reg_field = reg_of!(m);
                    rm = rm_of!(m);
                    mnemonic = Mnemonic::ImulRmReg;
                }
                0xB6 => {
                    let m = modrm!();
                    reg_field = reg_of!(m);
                    rm = rm_of!(m);
                    mnemonic = Mnemonic::Movzx;
                    far_selector = 8; // source width marker (bits)
                }
                0xB7 => {
                    let m = modrm!();
                    reg_field = reg_of!(m);
                    rm = rm_of!(m);
                    mnemonic = Mnemonic::Movzx;
                    far_selector = 16;
                }
                0xBE => {
                    let m = modrm!();
                    reg_field = reg_of!(m);
                    rm = rm_of!(m);
                    mnemonic = Mnemonic::Movsx;
                    far_selector = 8;
                }
                0xBF => {
                    let m = modrm!();
                    reg_field = reg_of!(m);
                    rm = rm_of!(m);
                    mnemonic = Mnemonic::Movsx;
                    far_selector = 16;
                }
                _ => bail_ud!(),
            }
        }
        0x69 => {
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            imm = match width {
                Width::W16 => f.next_i16()? as i64,
                _ => f.next_i32()? as i64,
            };
            mnemonic = Mnemonic::ImulRmImm;
        }
        0x6B => {
            let m = modrm!();
            reg_field = reg_of!(m);
            rm = rm_of!(m);
            imm = f.next_i8()? as i64;
            mnemonic = Mnemonic::ImulRmImm;
        }
        _ => bail_ud!(),
    }

    // Stack-operand width is not the general operand-size rule: in long
    // mode PUSH/POP/PUSHF/POPF default to 64 bits regardless of the
    // (32-bit) general default operand size, unless an explicit 66
    // override asks for the legacy 16-bit form (spec.md §4.3 "Stack").
    if long_mode
        && matches!(
            mnemonic,
            Mnemonic::Push | Mnemonic::Pop | Mnemonic::Pushf | Mnemonic::Popf
        )
    {
        inst_width = if operand_toggle { Width::W16 } else { Width::W64 };
    }

    let (resolved_rm, raw_rm) = resolve(&rm, state, addr_width, start_ip, f.offset);
    Ok(Instruction {
        mnemonic,
        width: inst_width,
        addr_width,
        rm: resolved_rm,
        raw_rm,
        reg: reg_field,
        imm,
        rel,
        rex_present,
        seg_override,
        rep,
        length: f.offset,
        far_selector,
        imm_is_operand,
    })
}

fn moffs<B: CpuBus>(f: &mut Fetcher<B>, addr_width: Width) -> Result<RawMemOperand, Exception> {
    let offset = match addr_width {
        Width::W16 => f.next_u16()? as i64,
        Width::W64 => f.next_u64()? as i64,
        _ => f.next_u32()? as i64,
    };
    Ok(RawMemOperand {
        seg: SegReg::Ds,
        base_reg: None,
        index: None,
        disp: offset,
        rip_relative: false,
    })
}

fn resolve(rm: &PendingRm, state: &CpuState, addr_width: Width, start_ip: u64, length: u32) -> (RmOperand, Option<RawMemOperand>) {
    match rm {
        PendingRm::Reg(idx) => (RmOperand::Reg(*idx), None),
        PendingRm::Mem(raw) => {
            let next_ip = start_ip.wrapping_add(length as u64);
            (RmOperand::Mem(resolve_mem_operand(state, addr_width, next_ip, *raw)), Some(*raw))
        }
    }
}

impl Instruction {
    /// Re-derives `rm` from `raw_rm` against `state`'s *current* registers
    /// and `state.rip` as the current instruction pointer. A no-op when
    /// `raw_rm` is `None` (register operand, or an absolute `moffs` form).
    ///
    /// Used by `tbcache` replay (C10, spec §4.5): a cached block's
    /// instructions were decoded once against whatever registers were live
    /// at that time, so a register-relative or RIP-relative memory operand
    /// must be recomputed on every replay rather than dispatched against
    /// the address baked in at first decode.
    pub fn reresolve_mem(&mut self, state: &CpuState) {
        if let Some(raw) = self.raw_rm {
            let next_ip = state.rip.wrapping_add(self.length as u64);
            self.rm = RmOperand::Mem(resolve_mem_operand(state, self.addr_width, next_ip, raw));
        }
    }
}

/// Used only by the ALU-family fast path above, which needs to finish
/// building the `Instruction` before the match arm's borrow of `f` ends.
fn finish<B: CpuBus>(
    state: &CpuState,
    f: &Fetcher<B>,
    mut inst: Instruction,
    form: u8,
) -> Result<Instruction, Exception> {
    let _ = state;
    let _ = f;
    // `form` 2/3 (r8,rm8 / r,rm) mean the register named by `reg` is the
    // destination; exec::alu keys off this via `far_selector`.
    inst.far_selector = if matches!(form, 2 | 3) { 1 } else { 0 };
    Ok(inst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::state::{gpr, CR0_PE};

    fn decode_bytes(bytes: &[u8], rex_w: bool) -> (Instruction, CpuState) {
        let mut st = CpuState::reset();
        st.segments.cs.base = 0; // reset's 0xFFFF_0000 reset-vector base doesn't apply once CS is reloaded
        st.control.cr0 = CR0_PE;
        st.segments.cs.db_bit = true;
        st.update_mode();
        if rex_w {
            // force long mode so REX is recognized
            st.control.cr4 = crate::state::CR4_PAE;
            st.msr.efer = crate::state::EFER_LME;
            st.control.cr0 |= crate::state::CR0_PG;
            st.segments.cs.l_bit = true;
            st.update_mode();
        }
        st.rip = 0x1000;
        let mut bus = FlatTestBus::new(0x2000);
        bus.load(0x1000, bytes);
        let inst = decode_instruction(&mut st, &mut bus).unwrap();
        (inst, st)
    }

    #[test]
    fn sub_rax_imm8_sign_extend_scenario_decodes() {
        // REX.W=1 (0x48), 83 E8 01 -> SUB RAX, imm8(1)
        let (inst, _st) = decode_bytes(&[0x48, 0x83, 0xE8, 0x01], true);
        assert_eq!(inst.mnemonic, Mnemonic::Alu(AluOp::Sub));
        assert_eq!(inst.width, Width::W64);
        assert_eq!(inst.imm, 1);
        assert_eq!(inst.length, 4);
        match inst.rm {
            RmOperand::Reg(idx) => assert_eq!(idx, gpr::RAX),
            _ => panic!("expected register operand"),
        }
    }

    #[test]
    fn jmp_far_decodes_selector_and_offset() {
        let (inst, _st) = decode_bytes(&[0xEA, 0x34, 0x12, 0x00, 0x00, 0x08, 0x00], false);
        assert_eq!(inst.mnemonic, Mnemonic::JmpFar);
        assert_eq!(inst.imm, 0x1234);
        assert_eq!(inst.far_selector, 0x0008);
    }

    #[test]
    fn rep_stosd_prefix_is_captured() {
        let (inst, _st) = decode_bytes(&[0xF3, 0x66, 0xAB], false);
        assert_eq!(inst.mnemonic, Mnemonic::Stos);
        assert_eq!(inst.rep, Some(RepPrefix::Rep));
        assert_eq!(inst.width, Width::W16);
    }

    #[test]
    fn double_operand_size_prefix_cancels() {
        let (inst, _st) = decode_bytes(&[0x66, 0x66, 0x90], false);
        assert_eq!(inst.mnemonic, Mnemonic::Nop);
        assert_eq!(inst.length, 3);
    }

    #[test]
    fn lea_computes_address_without_memory_access() {
        let mut st = CpuState::reset();
        st.control.cr0 = CR0_PE | crate::state::CR0_PG;
        st.control.cr4 = crate::state::CR4_PAE;
        st.msr.efer = crate::state::EFER_LME;
        st.segments.cs.l_bit = true;
        st.update_mode();
        st.write_gpr(gpr::RBX, Width::W64, 0x2000);
        st.rip = 0x1000;
        let mut bus = FlatTestBus::new(0x4000);
        // 48 8D 43 10 -> LEA RAX, [RBX+0x10]
        bus.load(0x1000, &[0x48, 0x8D, 0x43, 0x10]);
        let inst = decode_instruction(&mut st, &mut bus).unwrap();
        assert_eq!(inst.mnemonic, Mnemonic::Lea);
        match inst.rm {
            RmOperand::Mem(addr) => assert_eq!(addr, 0x2010),
            _ => panic!("expected memory operand"),
        }
    }
}
