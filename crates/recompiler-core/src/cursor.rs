//! The two cursors the translate loop is built from: a read head over the
//! guest instruction stream with delay-slot pushback, and an append-only
//! write head into the function being emitted. [`TranslationCursor`] bundles
//! both together with the jump-patch table and the `is_jump_dst` vector into
//! the single object handed to [`crate::collaborators::OpcodeTranslator::convert`].

use crate::error::RecompileError;
use crate::host::HostInstruction;
use crate::mips::GuestInstruction;
use crate::page::{FunctionId, HostSlot};
use crate::patch::{JumpId, JumpKind, JumpPatchTable};

/// Read head over a slice of guest instructions, with one-slot pushback.
#[derive(Debug)]
pub struct SourceCursor<'a> {
    code: &'a [GuestInstruction],
    base_address: u32,
    first_index: usize,
    limit_index: usize,
    pos: usize,
}

impl<'a> SourceCursor<'a> {
    /// Start a cursor over `code` (a whole page's worth of guest
    /// instructions) at `first_index`, whose guest address is
    /// `base_address`. The cursor initially has no upper limit narrower
    /// than the slice itself; call [`Self::set_limit`] once Pass 0 has
    /// determined `src_last`.
    #[must_use]
    pub fn new(code: &'a [GuestInstruction], first_index: usize, base_address: u32) -> Self {
        Self {
            code,
            base_address,
            first_index,
            limit_index: code.len(),
            pos: first_index,
        }
    }

    /// Narrow the cursor's upper bound to `limit_index` (Pass 0's
    /// `src_last`, expressed as a page-relative offset).
    pub fn set_limit(&mut self, limit_index: usize) {
        self.limit_index = limit_index;
    }

    /// Consume and return the next instruction, advancing the guest PC by 4.
    ///
    /// Bounded only by the underlying page buffer, *not* by
    /// [`Self::set_limit`]: a branch or jump that terminates a function at
    /// `limit_index` still needs to read its own delay slot one instruction
    /// past that boundary (the delay slot belongs to whichever function
    /// translates it next, but its guest instruction still has to be read
    /// and translated here). [`Self::remaining`] is what the driver's
    /// translate loop checks to decide whether to keep going.
    pub fn next(&mut self) -> Option<GuestInstruction> {
        if self.pos < self.code.len() {
            let instr = self.code[self.pos];
            self.pos += 1;
            Some(instr)
        } else {
            None
        }
    }

    /// Return the next instruction without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<GuestInstruction> {
        if self.pos < self.code.len() {
            Some(self.code[self.pos])
        } else {
            None
        }
    }

    /// Undo the last [`Self::next`]. Required because delay slots are
    /// speculatively consumed while scanning ahead for a branch target.
    pub fn pushback(&mut self) {
        debug_assert!(self.pos > self.first_index, "pushback with nothing consumed");
        self.pos -= 1;
    }

    /// Number of guest instructions left before the cursor's limit.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.limit_index.saturating_sub(self.pos)
    }

    /// Page-relative offset of the *last consumed* instruction.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.pos.saturating_sub(1)
    }

    /// Page-relative offset of the *next* instruction to be read.
    #[must_use]
    pub fn next_offset(&self) -> usize {
        self.pos
    }

    /// Guest PC of the last consumed instruction
    /// (`addr_first + 4*(consumed - 1)`).
    #[must_use]
    pub fn current_guest_pc(&self) -> u32 {
        self.base_address + 4 * (self.current_offset() - self.first_index) as u32
    }
}

/// Append-only write head into a [`crate::page::Function`]'s host code
/// buffer.
#[derive(Debug)]
pub struct EmitCursor<'a> {
    code: &'a mut Vec<HostInstruction>,
    function: FunctionId,
}

impl<'a> EmitCursor<'a> {
    /// Wrap a function's code buffer for emission.
    pub fn new(code: &'a mut Vec<HostInstruction>, function: FunctionId) -> Self {
        Self { code, function }
    }

    /// Append a host instruction and advance the cursor.
    pub fn emit(&mut self, instr: HostInstruction) -> HostSlot {
        let offset = self.code.len() as u32;
        self.code.push(instr);
        HostSlot {
            function: self.function,
            offset,
        }
    }

    /// The slot the *next* `emit` call will write to.
    #[must_use]
    pub fn position(&self) -> HostSlot {
        HostSlot {
            function: self.function,
            offset: self.code.len() as u32,
        }
    }

    /// Move the cursor back one slot, discarding the last emitted
    /// instruction. Used after emitting a delay-slot no-op that turns out
    /// to be unreachable.
    pub fn rewind(&mut self) -> Option<HostInstruction> {
        self.code.pop()
    }

    /// Number of host instructions emitted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Whether nothing has been emitted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// The bundle handed to [`crate::collaborators::OpcodeTranslator::convert`]:
/// the source and emission cursors, the jump-patch table, the page's
/// `host_map`, and the `is_jump_dst` vector, all scoped to the instruction
/// currently being translated.
pub struct TranslationCursor<'a> {
    source: SourceCursor<'a>,
    emit: EmitCursor<'a>,
    jumps: &'a mut JumpPatchTable,
    host_map: &'a mut [Option<HostSlot>],
    is_jump_dst: &'a [bool],
}

impl<'a> TranslationCursor<'a> {
    /// Assemble a translation cursor from its parts. Used by the block
    /// recompiler driver once per translate-loop iteration.
    pub fn new(
        source: SourceCursor<'a>,
        emit: EmitCursor<'a>,
        jumps: &'a mut JumpPatchTable,
        host_map: &'a mut [Option<HostSlot>],
        is_jump_dst: &'a [bool],
    ) -> Self {
        Self {
            source,
            emit,
            jumps,
            host_map,
            is_jump_dst,
        }
    }

    /// `get_next_src()`.
    pub fn get_next_src(&mut self) -> Option<GuestInstruction> {
        self.source.next()
    }

    /// `peek_next_src()`.
    #[must_use]
    pub fn peek_next_src(&self) -> Option<GuestInstruction> {
        self.source.peek()
    }

    /// `has_next_src()`.
    #[must_use]
    pub fn has_next_src(&self) -> bool {
        self.source.remaining() > 0
    }

    /// `unget_last_src()`.
    pub fn unget_last_src(&mut self) {
        self.source.pushback();
    }

    /// `get_curr_dst()`.
    #[must_use]
    pub fn get_curr_dst(&self) -> HostSlot {
        self.emit.position()
    }

    /// `set_next_dst(instr)`.
    pub fn set_next_dst(&mut self, instr: HostInstruction) -> HostSlot {
        self.emit.emit(instr)
    }

    /// `is_j_dst()`: whether the instruction just consumed is a recorded
    /// branch/jump destination.
    #[must_use]
    pub fn is_j_dst(&self) -> bool {
        self.is_jump_dst[self.source.current_offset()]
    }

    /// `get_src_pc()`: guest PC of the instruction just consumed.
    #[must_use]
    pub fn get_src_pc(&self) -> u32 {
        self.source.current_guest_pc()
    }

    /// `nop_ignored()`: called after `get_next_src` returns a delay-slot
    /// NOP that the translator chooses not to emit, so a branch landing on
    /// that guest offset still resolves to a valid host address (the next
    /// instruction actually emitted).
    pub fn nop_ignored(&mut self) {
        if self.source.remaining() > 0 {
            let offset = self.source.current_offset();
            self.host_map[offset] = Some(self.emit.position());
        }
    }

    /// `reset_code_addr()`: identical to [`Self::nop_ignored`] in effect —
    /// re-points the current guest offset's `host_map` entry at the next
    /// emission site. Kept as a distinct method because the original
    /// interface exposes it under its own name for a different call site
    /// (after a register-mapping flush rather than after a skipped NOP).
    pub fn reset_code_addr(&mut self) {
        self.nop_ignored();
    }

    /// `add_jump(old_jump, is_j, is_out)`.
    pub fn add_jump(
        &mut self,
        guest_target_raw: i64,
        is_jump: bool,
        is_out_of_block: bool,
    ) -> Result<JumpId, RecompileError> {
        let kind = if is_out_of_block {
            JumpKind::OutOfBlock
        } else if is_jump {
            JumpKind::Jump
        } else {
            JumpKind::Branch
        };
        let site = self.emit.position();
        let source_index = self.source.current_offset() as u32;
        self.jumps.add_jump(kind, guest_target_raw, source_index, site)
    }

    /// `add_jump_special(is_j)`.
    pub fn add_jump_special(&mut self, is_jump: bool) -> Result<JumpId, RecompileError> {
        let site = self.emit.position();
        self.jumps.add_jump_special(is_jump, site)
    }

    /// `set_jump_special(which, new_jump)`.
    pub fn set_jump_special(&mut self, id: JumpId, displacement: i64) {
        self.jumps.set_jump_special(id, displacement);
    }

    /// Number of host instructions emitted into the current function so far.
    #[must_use]
    pub fn emitted_len(&self) -> usize {
        self.emit.len()
    }

    /// Page-relative offset of the next unread guest instruction. The block
    /// recompiler driver uses this to know how far `convert()` advanced the
    /// source stream (one instruction, or two when it also consumed a delay
    /// slot) once the call returns.
    #[must_use]
    pub fn source_position(&self) -> usize {
        self.source.next_offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mips::opcode;

    fn sample_code() -> Vec<GuestInstruction> {
        (0..8)
            .map(|i| GuestInstruction::new((opcode::SPECIAL << 26) | i))
            .collect()
    }

    #[test]
    fn next_peek_and_remaining() {
        let code = sample_code();
        let mut cursor = SourceCursor::new(&code, 0, 0x8000_0000);
        assert_eq!(cursor.remaining(), 8);
        assert_eq!(cursor.peek(), Some(code[0]));
        assert_eq!(cursor.next(), Some(code[0]));
        assert_eq!(cursor.remaining(), 7);
        assert_eq!(cursor.current_guest_pc(), 0x8000_0000);
    }

    #[test]
    fn pushback_undoes_next() {
        let code = sample_code();
        let mut cursor = SourceCursor::new(&code, 0, 0x8000_0000);
        cursor.next();
        cursor.next();
        cursor.pushback();
        assert_eq!(cursor.next(), Some(code[1]));
    }

    #[test]
    fn current_guest_pc_advances_by_four() {
        let code = sample_code();
        let mut cursor = SourceCursor::new(&code, 2, 0x8000_1008);
        cursor.next(); // consumes code[2], pc should read back as base
        assert_eq!(cursor.current_guest_pc(), 0x8000_1008);
        cursor.next();
        assert_eq!(cursor.current_guest_pc(), 0x8000_100C);
    }

    #[test]
    fn emit_cursor_tracks_position_and_rewind() {
        let mut buf = Vec::new();
        let mut emit = EmitCursor::new(&mut buf, FunctionId::from_raw(7));
        assert_eq!(emit.position().offset, 0);
        emit.emit(HostInstruction::new(1));
        emit.emit(HostInstruction::new(2));
        assert_eq!(emit.position().offset, 2);
        let rewound = emit.rewind();
        assert_eq!(rewound, Some(HostInstruction::new(2)));
        assert_eq!(emit.position().offset, 1);
    }
}
