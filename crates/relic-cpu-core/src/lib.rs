//! relic-cpu-core: the x86/x86-64 instruction-set core built on top of
//! `relic-x86`'s encoding types and `relic-mmu`'s page-table walker.
//!
//! Layout mirrors the component breakdown: register/flag/context state
//! (`state`), segment descriptor loading (`segmentation`), the linear
//! memory interface (`mem`), shared flag-computation primitives
//! (`flags`), the operand engine (`operand`), the decoder (`decode`),
//! the execution core (`exec`), the interrupt/privilege engine
//! (`interrupts`), the translation-block cache (`tbcache`), the
//! optional peephole pattern recognizer (`pattern`), and the
//! host-facing aggregate (`cpu`).

pub mod decode;
pub mod error;
pub mod exec;
pub mod flags;
pub mod interrupts;
pub mod mem;
pub mod operand;
pub mod pattern;
pub mod segmentation;
pub mod state;
pub mod tbcache;

mod cpu;

#[cfg(feature = "snapshot")]
pub mod snapshot;

pub use cpu::{Cpu, CpuOptions, Fault, InterruptAck, InterruptService, PortIn, PortOut, StepStatus};
pub use error::Exception;
pub use state::CpuState;
