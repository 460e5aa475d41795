//! A MIPS (R4300i) to PowerPC dynamic block recompiler core.
//!
//! This crate owns exactly the part of a dynamic binary translator that
//! decides *where* a function ends, *how* its branch targets resolve, and
//! *when* compiled code must be discarded and retranslated. It does not
//! decode MIPS opcodes into PowerPC instruction sequences, allocate host
//! registers, manage a code cache's eviction policy, or implement the guest
//! MMU — those are the [`collaborators`] trait boundary, supplied by a host
//! application (or, for tests and benchmarks, by [`testkit`]).
//!
//! Three things anchor the design:
//!
//! - [`analyzer::analyze_pass0`] walks a function's guest instructions once
//!   to find where it ends and which in-block offsets are branch/jump
//!   destinations, before any host code is emitted.
//! - [`recompiler::recompile_block`] drives the translate loop and resolves
//!   every deferred branch/jump against the page's `host_map` once the whole
//!   function has been translated (Pass 2).
//! - [`page::Page`] and [`page::PageShared`] model the fact that the same
//!   physical guest page can be visible through more than one virtual
//!   address window (the KSEG0/KSEG1 mirrors, primarily): every alias shares
//!   one `host_map` and function table by holding an `Rc` to the same state.

pub mod analyzer;
pub mod collaborators;
pub mod config;
pub mod cursor;
pub mod error;
pub mod host;
pub mod mips;
pub mod page;
pub mod patch;
pub mod recompiler;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use analyzer::{analyze_pass0, is_jump_out, BranchTarget, Pass0Result};
pub use collaborators::{
    CacheAllocation, CacheMaintenance, InvalidCodeBits, MemoryTranslator, OpcodeTranslator,
    RecompCache, RegisterMapper,
};
pub use config::RecompilerConfig;
pub use error::RecompileError;
pub use host::HostInstruction;
pub use mips::GuestInstruction;
pub use page::{Function, FunctionId, HostSlot, Page, PageShared};
pub use patch::{JumpId, JumpKind, JumpPatchTable, JumpRecord};
pub use recompiler::{deinit_block, init_block, invalidate_block, recompile_block, PageRegistry};
