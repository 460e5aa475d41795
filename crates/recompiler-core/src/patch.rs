//! The jump-patch table: defers host branch/jump target resolution until
//! Pass 2, when every guest offset in the block has a known host address.

use crate::error::RecompileError;
use crate::page::HostSlot;

/// The kind of deferred control-flow patch, and how Pass 2 should resolve
/// its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// An in-block conditional branch. Target is computed from
    /// `guest_source_index + guest_target_raw`.
    Branch,
    /// An in-block absolute jump. Target is computed from the 26-bit jump
    /// index in `guest_target_raw`.
    Jump,
    /// A translator-fabricated branch whose target is another host site the
    /// translator identifies itself (see [`JumpPatchTable::set_jump_special`]).
    SpecialBranch,
    /// A translator-fabricated jump whose target is another host site the
    /// translator identifies itself.
    SpecialJump,
    /// A branch/jump whose target lies outside this block entirely.
    /// Deprecated: left unpatched, see `spec.md` §9.
    OutOfBlock,
}

impl JumpKind {
    fn is_special(self) -> bool {
        matches!(self, JumpKind::SpecialBranch | JumpKind::SpecialJump)
    }

    /// Whether this record's target field is the PowerPC `LI` field (a jump)
    /// rather than `BD` (a branch).
    #[must_use]
    pub fn is_jump(self) -> bool {
        matches!(self, JumpKind::Jump | JumpKind::SpecialJump)
    }
}

/// One entry in the jump-patch table.
#[derive(Debug, Clone, Copy)]
pub struct JumpRecord {
    /// What kind of deferred patch this is.
    pub kind: JumpKind,
    /// The immediate as read from the guest instruction: the (already
    /// sign-extended, word-granularity) branch displacement, or the 26-bit
    /// jump index. Unused for `Special*`.
    pub guest_target_raw: i64,
    /// Guest offset (within the page) of the instruction being patched.
    /// Unused for `Special*`.
    pub guest_source_index: u32,
    /// The host instruction to patch.
    pub host_patch_site: HostSlot,
    /// The resolved host byte displacement from `host_patch_site` to the
    /// target, once known.
    pub resolved_displacement: Option<i64>,
}

/// Opaque handle to a [`JumpRecord`], returned by `add_jump`/`add_jump_special`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpId(usize);

/// Fixed-capacity deferred-jump table, scoped to the lifetime of a single
/// `recompile_block` call.
#[derive(Debug)]
pub struct JumpPatchTable {
    records: Vec<JumpRecord>,
    capacity: usize,
}

impl JumpPatchTable {
    /// Create an empty table with room for `capacity` records
    /// (`MAX_JUMPS`).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of currently-registered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no registered records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Register a normal (non-special) deferred jump.
    pub fn add_jump(
        &mut self,
        kind: JumpKind,
        guest_target_raw: i64,
        guest_source_index: u32,
        host_patch_site: HostSlot,
    ) -> Result<JumpId, RecompileError> {
        debug_assert!(!kind.is_special());
        self.push(JumpRecord {
            kind,
            guest_target_raw,
            guest_source_index,
            host_patch_site,
            resolved_displacement: None,
        })
    }

    /// Register a translator-fabricated jump whose target will be supplied
    /// later via [`Self::set_jump_special`].
    pub fn add_jump_special(
        &mut self,
        is_jump: bool,
        host_patch_site: HostSlot,
    ) -> Result<JumpId, RecompileError> {
        let kind = if is_jump {
            JumpKind::SpecialJump
        } else {
            JumpKind::SpecialBranch
        };
        self.push(JumpRecord {
            kind,
            guest_target_raw: 0,
            guest_source_index: 0,
            host_patch_site,
            resolved_displacement: None,
        })
    }

    /// Supply the resolved displacement for a record previously created by
    /// [`Self::add_jump_special`]. A no-op if `id` does not name a special
    /// record (mirrors the original's silent `if(!SPEC) return;`).
    pub fn set_jump_special(&mut self, id: JumpId, displacement: i64) {
        if let Some(record) = self.records.get_mut(id.0) {
            if record.kind.is_special() {
                record.resolved_displacement = Some(displacement);
            }
        }
    }

    /// Iterate over all registered records.
    pub fn iter(&self) -> impl Iterator<Item = &JumpRecord> {
        self.records.iter()
    }

    /// Drain every registered record. Pass 2 calls this once it has
    /// resolved (or deliberately skipped) every entry, which is what keeps
    /// the table empty at the end of every `recompile_block` call
    /// (invariant 2 in `spec.md` §8).
    pub fn drain(&mut self) -> Vec<JumpRecord> {
        self.records.drain(..).collect()
    }

    fn push(&mut self, record: JumpRecord) -> Result<JumpId, RecompileError> {
        if self.records.len() >= self.capacity {
            return Err(RecompileError::CapacityExceeded {
                guest_addr: 0,
                capacity: self.capacity,
            });
        }
        let id = JumpId(self.records.len());
        self.records.push(record);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::FunctionId;

    fn slot(offset: u32) -> HostSlot {
        HostSlot {
            function: FunctionId::from_raw(0),
            offset,
        }
    }

    #[test]
    fn add_jump_and_drain_round_trips() {
        let mut table = JumpPatchTable::new(4);
        let id = table.add_jump(JumpKind::Branch, 3, 0, slot(0)).unwrap();
        table.set_jump_special(id, 99); // no-op: not a special record
        assert_eq!(table.len(), 1);
        let drained = table.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].resolved_displacement.is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn special_jump_resolves_via_set_jump_special() {
        let mut table = JumpPatchTable::new(4);
        let id = table.add_jump_special(true, slot(0)).unwrap();
        table.set_jump_special(id, -16);
        let drained = table.drain();
        assert_eq!(drained[0].resolved_displacement, Some(-16));
    }

    #[test]
    fn capacity_exceeded_is_reported_not_panicked() {
        let mut table = JumpPatchTable::new(1);
        table.add_jump(JumpKind::Branch, 0, 0, slot(0)).unwrap();
        let err = table.add_jump(JumpKind::Branch, 0, 0, slot(0));
        assert!(matches!(err, Err(RecompileError::CapacityExceeded { .. })));
    }
}
