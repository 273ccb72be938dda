//! Architectural faults (spec.md §7 category 1) plus the one
//! non-architectural "the host's bus doesn't cover this address" condition
//! that a memory access can hit. `MemoryFault` is never delivered through
//! the guest IDT — see `interrupts::deliver`.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exception {
    #[error("#DE divide error")]
    DivideError,
    #[error("#UD invalid opcode")]
    InvalidOpcode,
    #[error("#GP general protection (selector/code {selector:#06x})")]
    GeneralProtection { selector: u32 },
    #[error("#PF page fault at {addr:#018x} (error code {error_code:#x})")]
    PageFault { addr: u64, error_code: u32 },
    #[error("#SS stack fault (selector {selector:#06x})")]
    StackFault { selector: u32 },
    #[error("#NP segment not present (selector {selector:#06x})")]
    SegmentNotPresent { selector: u32 },
    #[error("#DF double fault")]
    DoubleFault,
    #[error("host bus does not cover address {addr:#018x}")]
    MemoryFault { addr: u64 },
}

impl Exception {
    /// IDT/IVT vector for this fault. Meaningless for `MemoryFault`, which
    /// never reaches `interrupts::deliver`.
    pub fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::InvalidOpcode => 6,
            Exception::DoubleFault => 8,
            Exception::SegmentNotPresent { .. } => 11,
            Exception::StackFault { .. } => 12,
            Exception::GeneralProtection { .. } => 13,
            Exception::PageFault { .. } => 14,
            Exception::MemoryFault { .. } => 0,
        }
    }

    /// Whether the IDT/IVT dispatch pushes an architectural error code.
    pub fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Exception::GeneralProtection { .. }
                | Exception::PageFault { .. }
                | Exception::StackFault { .. }
                | Exception::SegmentNotPresent { .. }
                | Exception::DoubleFault
        )
    }

    pub fn error_code(self) -> u64 {
        match self {
            Exception::GeneralProtection { selector } => selector as u64,
            Exception::PageFault { error_code, .. } => error_code as u64,
            Exception::StackFault { selector } => selector as u64,
            Exception::SegmentNotPresent { selector } => selector as u64,
            Exception::DoubleFault => 0,
            _ => 0,
        }
    }

    /// Category 3 of spec.md §7: a bug the host should log and abort on,
    /// never routed through the guest's own IDT.
    pub fn is_host_bug(self) -> bool {
        matches!(self, Exception::MemoryFault { .. })
    }
}
