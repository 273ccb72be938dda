//! Segment descriptor loading: MOV to a segment register, far JMP/CALL,
//! and (via `load_code_seg`) the CS switch done by INT/IRET gate
//! traversal (spec.md §3 "Cached Segment Descriptor", §4.3 "JMP FAR").
//!
//! LDT-based selectors are not modeled (documented simplification, see
//! DESIGN.md): every selector is resolved against the GDT regardless of
//! its TI bit.

use crate::error::Exception;
use crate::mem::CpuBus;
use crate::state::{CpuState, SegDescriptor};
use relic_x86::SegReg as Seg;

pub use relic_x86::SegReg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadReason {
    Data,
    Stack,
    Code,
}

fn decode_raw_descriptor(selector: u16, lo: u32, hi: u32) -> SegDescriptor {
    let base = ((lo >> 16) & 0xFFFF) as u64
        | (((hi & 0xFF) as u64) << 16)
        | ((((hi >> 24) & 0xFF) as u64) << 24);
    let limit_low = (lo & 0xFFFF) as u32;
    let limit_high = (hi & 0xF_0000) >> 16;
    let granularity = hi & (1 << 23) != 0;
    let mut limit = limit_low | (limit_high << 16);
    if granularity {
        limit = (limit << 12) | 0xFFF;
    }
    let access = (hi >> 8) & 0xFF;
    let seg_type = (access & 0xF) as u8;
    let system = access & 0x10 != 0;
    let dpl = ((access >> 5) & 0b11) as u8;
    let present = access & 0x80 != 0;
    let l_bit = hi & (1 << 21) != 0;
    let db_bit = hi & (1 << 22) != 0;

    SegDescriptor {
        selector,
        base,
        limit,
        present,
        default_size: if l_bit {
            64
        } else if db_bit {
            32
        } else {
            16
        },
        dpl,
        seg_type,
        system,
        l_bit,
        db_bit,
        granularity,
    }
}

/// Fetches the raw 8-byte GDT descriptor for `selector`. Descriptor-table
/// reads are a *system* access and must not be rejected by U/S paging
/// checks even at CPL 3 (`CpuBus::read_u64_system`).
pub(crate) fn fetch_descriptor<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    selector: u16,
) -> Result<SegDescriptor, Exception> {
    let index = (selector >> 3) as u32;
    let byte_offset = index as u64 * 8;
    if byte_offset + 7 > state.tables.gdtr_limit as u64 {
        return Err(Exception::GeneralProtection {
            selector: selector as u32,
        });
    }
    let raw = bus.read_u64_system(state.tables.gdtr_base + byte_offset)?;
    Ok(decode_raw_descriptor(selector, raw as u32, (raw >> 32) as u32))
}

/// MOV to a segment register / POP to a segment register (`reason` is
/// `Data` or `Stack`); far JMP/CALL and INT/IRET gate dispatch load CS
/// through `load_code_seg` instead, since the privilege rules differ.
pub fn load_seg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    seg: Seg,
    selector: u16,
    reason: LoadReason,
) -> Result<(), Exception> {
    debug_assert!(reason != LoadReason::Code, "use load_code_seg for CS");

    if matches!(state.mode, crate::state::CpuMode::Real) {
        *state.segments.get_mut(seg) = SegDescriptor::real_mode(selector);
        return Ok(());
    }

    if selector & !0b111 == 0 {
        // Null selector.
        if reason == LoadReason::Stack {
            return Err(Exception::GeneralProtection { selector: 0 });
        }
        *state.segments.get_mut(seg) = SegDescriptor::null();
        return Ok(());
    }

    let desc = fetch_descriptor(state, bus, selector)?;
    if !desc.present {
        return Err(Exception::SegmentNotPresent {
            selector: selector as u32,
        });
    }

    let rpl = (selector & 0b11) as u8;
    match reason {
        LoadReason::Stack => {
            if desc.dpl != state.cpl || rpl != state.cpl {
                return Err(Exception::GeneralProtection {
                    selector: selector as u32,
                });
            }
        }
        LoadReason::Data => {
            let conforming_code = desc.system && false; // S=0 => system descriptor, not a valid data/code seg here
            let _ = conforming_code;
            if desc.system {
                return Err(Exception::GeneralProtection {
                    selector: selector as u32,
                });
            }
            let is_conforming_readable_code = desc.seg_type & 0b1000 != 0 && desc.seg_type & 0b0100 != 0;
            if !is_conforming_readable_code {
                let effective_priv = rpl.max(state.cpl);
                if effective_priv > desc.dpl {
                    return Err(Exception::GeneralProtection {
                        selector: selector as u32,
                    });
                }
            }
        }
        LoadReason::Code => unreachable!(),
    }

    *state.segments.get_mut(seg) = desc;
    Ok(())
}

/// Far JMP/CALL and INT/IRET gate dispatch: loads CS and updates CPL plus
/// the default operand/address sizes from the new descriptor (spec.md
/// §4.3 "JMP FAR" / P8).
pub fn load_code_seg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
    target_cpl: u8,
) -> Result<(), Exception> {
    if matches!(state.mode, crate::state::CpuMode::Real) {
        state.segments.cs = SegDescriptor::real_mode(selector);
        state.cpl = 0;
        state.update_mode();
        return Ok(());
    }

    if selector & !0b111 == 0 {
        return Err(Exception::GeneralProtection { selector: 0 });
    }

    let desc = fetch_descriptor(state, bus, selector)?;
    if !desc.present {
        return Err(Exception::SegmentNotPresent {
            selector: selector as u32,
        });
    }
    if desc.system || desc.seg_type & 0b1000 == 0 {
        return Err(Exception::GeneralProtection {
            selector: selector as u32,
        });
    }

    state.segments.cs = desc;
    state.cpl = target_cpl;
    state.update_mode();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::state::{CpuMode, CR0_PE};

    fn gdt_flat_code32(bus: &mut FlatTestBus, gdt_base: u64, index: u32, dpl: u8) {
        // base=0 limit=0xFFFFF (gran) type=code,readable,nonconforming present
        let access = 0x80u32 | ((dpl as u32) << 5) | 0b1010;
        let hi = (0xF << 16) | (1 << 23) | (1 << 22) | (access << 8); // D/B=1 -> 32-bit default
        let lo = 0xFFFF; // limit low
        bus.load(gdt_base + index as u64 * 8, &lo.to_le_bytes());
        bus.load(gdt_base + index as u64 * 8 + 4, &hi.to_le_bytes());
    }

    #[test]
    fn jmp_far_flat_code_descriptor_sets_cached_fields() {
        let mut st = CpuState::reset();
        st.control.cr0 = CR0_PE;
        st.tables.gdtr_base = 0x1000;
        st.tables.gdtr_limit = 0xFFFF;
        st.update_mode();
        let mut bus = FlatTestBus::new(0x10000);
        gdt_flat_code32(&mut bus, 0x1000, 1, 0);

        load_code_seg(&mut st, &mut bus, 0x0008, 0).unwrap();
        assert_eq!(st.segments.cs.base, 0);
        assert_eq!(st.segments.cs.limit, 0xFFFF_FFFF);
        assert_eq!(st.segments.cs.default_size, 32);
        assert_eq!(st.mode, CpuMode::Protected);
    }

    #[test]
    fn null_selector_for_ss_faults() {
        let mut st = CpuState::reset();
        st.control.cr0 = CR0_PE;
        st.update_mode();
        let mut bus = FlatTestBus::new(0x10000);
        let err = load_seg(&mut st, &mut bus, Seg::Ss, 0, LoadReason::Stack).unwrap_err();
        assert!(matches!(err, Exception::GeneralProtection { .. }));
    }

    #[test]
    fn null_selector_for_ds_is_allowed_and_unusable() {
        let mut st = CpuState::reset();
        st.control.cr0 = CR0_PE;
        st.update_mode();
        let mut bus = FlatTestBus::new(0x10000);
        load_seg(&mut st, &mut bus, Seg::Ds, 0, LoadReason::Data).unwrap();
        assert!(!st.segments.ds.present);
    }
}
