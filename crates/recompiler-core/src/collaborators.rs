//! Trait boundary for every collaborator this crate treats as external:
//! the per-opcode translator, the register allocator, the recompilation
//! cache, the guest MMU, the invalidation bit vector, and the host
//! cache-maintenance primitives.
//!
//! None of these traits are implemented by this crate itself — the
//! concrete opcode encoders, register allocator, and cache eviction policy
//! are out of scope. [`crate::testkit`] provides fakes for tests and
//! benchmarks.

use crate::cursor::TranslationCursor;
use crate::error::RecompileError;

/// The per-opcode translator (`convert()`).
///
/// Reads one or more guest instructions from the cursor's source stream and
/// emits zero or more host instructions through its emission cursor,
/// optionally registering unresolved jumps via
/// [`TranslationCursor::add_jump`]/[`TranslationCursor::add_jump_special`].
///
/// For a branch or jump, `add_jump` must be called *after* the delay slot
/// has been consumed (i.e. after the second `get_next_src`/`unget_last_src`
/// pair for that instruction), so the recorded `guest_source_index` lines up
/// with the delay-slot-relative base Pass 0 used when it marked
/// `is_jump_dst`. [`crate::testkit::ScriptedTranslator`] follows this
/// convention and is the reference for implementers.
pub trait OpcodeTranslator {
    /// Translate exactly one guest instruction (and, if it is a branch or
    /// jump, its delay slot) starting at the cursor's current position.
    fn convert(&mut self, cursor: &mut TranslationCursor<'_>) -> Result<(), RecompileError>;
}

/// Register-allocator hooks invoked by the block recompiler around
/// function and mapping boundaries.
pub trait RegisterMapper {
    /// Called once at the start of a new function, before the first
    /// instruction is translated.
    fn start_new_block(&mut self);

    /// Called at every register-mapping flush point: branch destinations
    /// when register maps are in use, or every instruction when they are
    /// not.
    fn start_new_mapping(&mut self);
}

/// A handle to a function's host code storage, as handed back by
/// [`RecompCache::alloc`]. The *base address* is the logical host address
/// the function's first instruction will reside at; it never changes even
/// if the backing storage is reallocated (that is the cache allocator's
/// problem to solve, not the recompiler's).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheAllocation {
    /// Logical host address of the function's first instruction.
    pub base_address: u32,
}

/// The recompilation cache: a code-cache allocator with its own eviction
/// policy, keyed by guest address.
pub trait RecompCache {
    /// Allocate storage for a new function of `capacity` host instructions
    /// rooted at `guest_addr`.
    fn alloc(&mut self, guest_addr: u32, capacity: usize) -> Result<CacheAllocation, RecompileError>;

    /// Grow (or shrink) an existing allocation in place conceptually; the
    /// returned [`CacheAllocation`] may have a different `base_address` if
    /// the cache had to relocate the function.
    fn realloc(
        &mut self,
        guest_addr: u32,
        new_capacity: usize,
    ) -> Result<CacheAllocation, RecompileError>;

    /// Free the function rooted at `guest_addr`.
    fn free(&mut self, guest_addr: u32);
}

/// The guest MMU's virtual-to-physical address translation, used for pages
/// outside the two fixed cached/uncached KSEG mirrors.
pub trait MemoryTranslator {
    /// Translate a guest virtual address to a physical address. `mode`
    /// mirrors the original `virtual_to_physical_address(vaddr, mode)`
    /// collaborator and is passed through uninterpreted.
    fn virtual_to_physical(&self, vaddr: u32, mode: u32) -> u32;
}

/// The per-physical-page invalidation bit vector.
pub trait InvalidCodeBits {
    /// Read the invalidation bit for a physical page index.
    fn get(&self, page_index: u32) -> bool;
    /// Set the invalidation bit for a physical page index.
    fn set(&mut self, page_index: u32, invalid: bool);
}

/// Host cache-coherence primitives, required after emitting new code and
/// before it can be executed.
pub trait CacheMaintenance {
    /// Flush the data cache over `[base_address, base_address + len)`.
    fn dc_flush_range(&mut self, base_address: u32, len: usize);
    /// Invalidate the instruction cache over `[base_address, base_address + len)`.
    fn ic_invalidate_range(&mut self, base_address: u32, len: usize);
}
