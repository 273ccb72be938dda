//! Translation-block cache (C10, spec §4.5): memoizes a run of decoded
//! instructions keyed by entry IP so `Cpu::run` can replay straight-line
//! code without re-decoding every byte on each pass.
//!
//! `Cpu::step` never consults this cache — it always decodes fresh, which
//! keeps the single-instruction host contract trivially correct. Only the
//! bulk `Cpu::run` loop uses it, and only ever with blocks it built itself
//! out of real `decode_instruction`/`dispatch` calls, so replay is a pure
//! performance path: it can never produce a result `step()` wouldn't also
//! have produced (P10).

use crate::decode::Instruction;
use crate::state::CpuMode;
use rustc_hash::FxHashMap;

/// Everything besides raw bytes that changes what decoding/executing the
/// same linear address means. The whole cache is dropped wholesale when
/// this changes, per spec §4.5 ("invalidates when the mode changes... or
/// when paging is enabled/disabled").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeToken {
    pub mode: CpuMode,
    pub paging_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct TranslationBlock {
    pub entry_ip: u64,
    pub instructions: Vec<Instruction>,
    pub total_length: u64,
}

impl TranslationBlock {
    fn covers(&self, addr: u64, len: u64) -> bool {
        let block_end = self.entry_ip.wrapping_add(self.total_length);
        let write_end = addr.wrapping_add(len);
        addr < block_end && write_end > self.entry_ip
    }
}

#[derive(Debug, Default)]
pub struct TbCache {
    mode_token: Option<ModeToken>,
    blocks: FxHashMap<u64, TranslationBlock>,
}

impl TbCache {
    pub fn new() -> TbCache {
        TbCache { mode_token: None, blocks: FxHashMap::default() }
    }

    pub fn lookup(&self, entry_ip: u64, token: ModeToken) -> Option<&TranslationBlock> {
        if self.mode_token != Some(token) {
            return None;
        }
        self.blocks.get(&entry_ip)
    }

    pub fn insert(&mut self, token: ModeToken, block: TranslationBlock) {
        if self.mode_token != Some(token) {
            self.blocks.clear();
            self.mode_token = Some(token);
        }
        self.blocks.insert(block.entry_ip, block);
    }

    /// A host write (`Cpu::load_memory`) into `[addr, addr+len)` drops any
    /// block whose byte range overlaps it. Guest self-modifying code
    /// executed entirely through cached replay is not separately detected
    /// here; see DESIGN.md.
    pub fn invalidate_range(&mut self, addr: u64, len: u64) {
        self.blocks.retain(|_, block| !block.covers(addr, len));
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.mode_token = None;
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
