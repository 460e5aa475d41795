//! The recompiler core's error taxonomy.
//!
//! Most of the conditions below are fatal in the original design (the
//! recompiler has no recoverable error channel and aborts the emulator on
//! any of them). This crate still returns them as `Result`s from its public
//! entry points so a host application can log and shut down cleanly rather
//! than being forced to `panic!` inside a library call; [`crate::recompiler`]
//! documents exactly which variants it additionally panics on after logging.

use thiserror::Error;

/// Errors surfaced by the block recompiler's public entry points.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecompileError {
    /// The host code buffer could not be grown or allocated.
    ///
    /// Fatal in the original design (`"Realloc failed. Panic!"`); the
    /// driver logs this and panics rather than returning it, but it is
    /// part of the enum so callers building their own diagnostics around
    /// [`crate::collaborators::RecompCache`] failures can match on it.
    #[error("allocation failed while sizing the code buffer for guest address 0x{guest_addr:08X}")]
    AllocationFailure {
        /// Guest address of the block being recompiled.
        guest_addr: u32,
    },

    /// Pass 0 computed a relative branch target outside the `is_jump_dst`
    /// bit vector's valid range.
    #[error(
        "branch at guest offset {source_offset} targets out-of-range index {computed_index} \
         (valid range is 0..{valid_len})"
    )]
    JumpTargetOutOfRange {
        /// Guest instruction offset (within the page) of the branch.
        source_offset: u32,
        /// The computed (and invalid) `is_jump_dst` index.
        computed_index: i64,
        /// The bit vector's length.
        valid_len: usize,
    },

    /// The per-opcode translator emitted more host instructions in a single
    /// `convert()` call than the driver's headroom check allows for.
    #[error(
        "translator overflowed the emission headroom at guest offset {source_offset}: \
         emitted past capacity {capacity}"
    )]
    EmissionOverflow {
        /// Guest instruction offset being translated when the overflow was
        /// detected.
        source_offset: u32,
        /// The buffer capacity that was exceeded.
        capacity: usize,
    },

    /// A single block registered more jump records than the patch table's
    /// fixed capacity (`MAX_JUMPS`). The original C implementation used a
    /// fixed-size array with no bounds check; this is the safe Rust
    /// equivalent of the array overrun it would have suffered.
    #[error(
        "jump-patch table capacity ({capacity}) exceeded while recompiling guest address 0x{guest_addr:08X}"
    )]
    CapacityExceeded {
        /// Guest address of the block being recompiled.
        guest_addr: u32,
        /// The table's fixed capacity.
        capacity: usize,
    },
}
