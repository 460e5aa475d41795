//! Tunable constants for the block recompiler.
//!
//! The original design hard-codes these as C preprocessor constants and
//! file-scope statics. Exposing them as a plain configuration struct keeps
//! the same defaults while letting a host application (or a test) override
//! them without touching the driver.

/// Guest page size in bytes. Guest pages are always 4 KiB aligned.
pub const PAGE_SIZE_BYTES: u32 = 0x1000;

/// Guest instructions per page (`PAGE_SIZE_BYTES / 4`), i.e. 1024 for a
/// 4 KiB page. See `DESIGN.md` for why this crate settles on 1024 rather
/// than 256.
pub const PAGE_INSTR_COUNT: usize = (PAGE_SIZE_BYTES / 4) as usize;

/// Size of the `is_jump_dst` branch-destination bit vector, one entry per
/// guest instruction slot in a page.
pub const JUMP_DST_BITS: usize = PAGE_INSTR_COUNT;

/// Default capacity of the jump-patch table (`MAX_JUMPS`).
///
/// Sized generously relative to a page's instruction count; a real block
/// rarely registers more than a handful of unresolved jumps, but pathological
/// input (e.g. a page that is almost entirely branches) is the worst case
/// this must cover.
pub const DEFAULT_MAX_JUMPS: usize = 512;

/// Emission headroom the translate loop keeps in front of the write cursor
/// before triggering a buffer grow (see [`crate::recompiler::recompile_block`]).
pub const EMIT_HEADROOM: usize = 64;

/// Minimum number of host instructions added per buffer grow.
pub const MIN_GROW: usize = 64;

/// Tunable parameters for [`crate::recompiler::recompile_block`] and
/// friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecompilerConfig {
    /// Maximum number of deferred jump records per block.
    pub max_jumps: usize,
    /// Emission headroom before the buffer is grown.
    pub emit_headroom: usize,
    /// Minimum grow size in host instructions.
    pub min_grow: usize,
}

impl Default for RecompilerConfig {
    fn default() -> Self {
        Self {
            max_jumps: DEFAULT_MAX_JUMPS,
            emit_headroom: EMIT_HEADROOM,
            min_grow: MIN_GROW,
        }
    }
}
