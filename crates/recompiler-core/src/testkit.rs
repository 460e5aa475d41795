//! Fake implementations of every collaborator trait, for this crate's own
//! integration tests and benchmarks, and for downstream crates that want to
//! exercise [`crate::recompiler::recompile_block`] without a real register
//! allocator, opcode translator, or code cache on hand.
//!
//! None of these are tuned for realism beyond what the test scenarios in
//! `spec.md` §8 need: [`ScriptedTranslator`] treats every branch and jump as
//! in-block, for instance, which is true of every scenario these fakes are
//! exercised against but would be wrong for a real guest program.

use std::collections::HashMap;

use crate::collaborators::{
    CacheAllocation, CacheMaintenance, InvalidCodeBits, MemoryTranslator, OpcodeTranslator,
    RecompCache, RegisterMapper,
};
use crate::cursor::TranslationCursor;
use crate::error::RecompileError;
use crate::host::{self, HostInstruction};
use crate::mips::{classify, ControlFlow};

/// A host `nop`-equivalent placeholder used for any instruction
/// [`ScriptedTranslator`] doesn't model any further.
const PLACEHOLDER_OPCODE: HostInstruction = HostInstruction::new(0x6000_0000);
/// `b` (unconditional `B`-form branch, `AA=0 LK=0`), used as the patch site
/// for absolute jumps.
const B_FORM_PLACEHOLDER: HostInstruction = HostInstruction::new(0x4800_0000);
/// `bc` (conditional `BC`-form branch, "branch always"), used as the patch
/// site for conditional branches.
const BC_FORM_PLACEHOLDER: HostInstruction = HostInstruction::new(0x4080_0000);

/// A translator that treats every branch/jump as resolving in-block, and
/// every other instruction as a single opaque placeholder. Good enough to
/// drive [`crate::recompiler::recompile_block`] end to end for scenario
/// tests and benchmarks that only care about control flow.
#[derive(Debug, Default)]
pub struct ScriptedTranslator;

impl OpcodeTranslator for ScriptedTranslator {
    fn convert(&mut self, cursor: &mut TranslationCursor<'_>) -> Result<(), RecompileError> {
        let instr = cursor
            .get_next_src()
            .expect("convert() called with nothing left to translate");

        match classify(instr) {
            ControlFlow::Sequential => {
                cursor.set_next_dst(PLACEHOLDER_OPCODE);
            }
            ControlFlow::AbsoluteJump { .. } => {
                cursor.get_next_src(); // delay slot
                // `add_jump` must run before the placeholder is emitted:
                // `position()` reports the *next* emission slot, so calling
                // it after `set_next_dst` would record the slot the
                // following instruction lands in, not this branch's own.
                cursor.add_jump(i64::from(instr.jump_index()), true, false)?;
                cursor.set_next_dst(B_FORM_PLACEHOLDER);
            }
            ControlFlow::ConditionalBranch => {
                cursor.get_next_src(); // delay slot
                cursor.add_jump(i64::from(instr.immediate()), false, false)?;
                cursor.set_next_dst(BC_FORM_PLACEHOLDER);
            }
            ControlFlow::RegisterJump | ControlFlow::ExceptionReturn => {
                cursor.get_next_src(); // delay slot
                cursor.set_next_dst(host::gen::blr());
            }
        }
        Ok(())
    }
}

/// Counts calls instead of doing anything with them, so tests can assert on
/// flush-point behaviour without a real register allocator.
#[derive(Debug, Default)]
pub struct CountingRegisterMapper {
    /// Number of times `start_new_block` was called.
    pub block_starts: usize,
    /// Number of times `start_new_mapping` was called.
    pub mapping_flushes: usize,
}

impl RegisterMapper for CountingRegisterMapper {
    fn start_new_block(&mut self) {
        self.block_starts += 1;
    }

    fn start_new_mapping(&mut self) {
        self.mapping_flushes += 1;
    }
}

/// A bump-allocating code cache keyed by guest address. Never evicts or
/// reclaims space on its own; `free` just removes the bookkeeping entry.
#[derive(Debug)]
pub struct BumpCache {
    next_base: u32,
    step: u32,
    allocations: HashMap<u32, u32>,
}

impl BumpCache {
    /// A cache that hands out addresses starting at `start`, `step` bytes
    /// apart per allocation (large enough that no two functions' nominal
    /// address ranges can overlap for the capacities tests pass in).
    #[must_use]
    pub fn new(start: u32, step: u32) -> Self {
        Self {
            next_base: start,
            step,
            allocations: HashMap::new(),
        }
    }

    /// Whether `guest_addr` currently has a live allocation.
    #[must_use]
    pub fn is_allocated(&self, guest_addr: u32) -> bool {
        self.allocations.contains_key(&guest_addr)
    }
}

impl Default for BumpCache {
    fn default() -> Self {
        Self::new(0x9000_0000, 0x0001_0000)
    }
}

impl RecompCache for BumpCache {
    fn alloc(&mut self, guest_addr: u32, _capacity: usize) -> Result<CacheAllocation, RecompileError> {
        let base = self.next_base;
        self.next_base += self.step;
        self.allocations.insert(guest_addr, base);
        Ok(CacheAllocation { base_address: base })
    }

    fn realloc(&mut self, guest_addr: u32, _new_capacity: usize) -> Result<CacheAllocation, RecompileError> {
        let base = *self.allocations.get(&guest_addr).ok_or(RecompileError::AllocationFailure { guest_addr })?;
        Ok(CacheAllocation { base_address: base })
    }

    fn free(&mut self, guest_addr: u32) {
        self.allocations.remove(&guest_addr);
    }
}

/// A `MemoryTranslator` that passes addresses through unchanged, as if
/// every virtual address were already a physical one (the common case in
/// tests, which stay inside the KSEG0/KSEG1 mirrors `PageRegistry` already
/// handles without consulting this trait at all).
#[derive(Debug, Default)]
pub struct IdentityMemoryTranslator;

impl MemoryTranslator for IdentityMemoryTranslator {
    fn virtual_to_physical(&self, vaddr: u32, _mode: u32) -> u32 {
        vaddr
    }
}

/// A sparse invalidation bit vector backed by a hash set.
#[derive(Debug, Default)]
pub struct SparseInvalidCodeBits {
    invalid: HashMap<u32, bool>,
}

impl InvalidCodeBits for SparseInvalidCodeBits {
    fn get(&self, page_index: u32) -> bool {
        self.invalid.get(&page_index).copied().unwrap_or(false)
    }

    fn set(&mut self, page_index: u32, invalid: bool) {
        self.invalid.insert(page_index, invalid);
    }
}

/// Records every flush/invalidate call instead of touching real hardware
/// caches.
#[derive(Debug, Default)]
pub struct RecordingCacheMaintenance {
    /// `(base_address, len)` for every `dc_flush_range` call, in order.
    pub dc_flushes: Vec<(u32, usize)>,
    /// `(base_address, len)` for every `ic_invalidate_range` call, in order.
    pub ic_invalidations: Vec<(u32, usize)>,
}

impl CacheMaintenance for RecordingCacheMaintenance {
    fn dc_flush_range(&mut self, base_address: u32, len: usize) {
        self.dc_flushes.push((base_address, len));
    }

    fn ic_invalidate_range(&mut self, base_address: u32, len: usize) {
        self.ic_invalidations.push((base_address, len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_cache_hands_out_distinct_bases() {
        let mut cache = BumpCache::default();
        let a = cache.alloc(0x8000_0000, 64).unwrap();
        let b = cache.alloc(0x8000_1000, 64).unwrap();
        assert_ne!(a.base_address, b.base_address);
        assert!(cache.is_allocated(0x8000_0000));
        cache.free(0x8000_0000);
        assert!(!cache.is_allocated(0x8000_0000));
    }

    #[test]
    fn recording_cache_maintenance_tracks_calls() {
        let mut maint = RecordingCacheMaintenance::default();
        maint.dc_flush_range(0x1000, 16);
        maint.ic_invalidate_range(0x1000, 16);
        assert_eq!(maint.dc_flushes, vec![(0x1000, 16)]);
        assert_eq!(maint.ic_invalidations, vec![(0x1000, 16)]);
    }
}
