//! Pass 0: the single forward scan over a function's guest instructions
//! that determines where the function ends and which in-block offsets are
//! branch/jump destinations.

use crate::config::{JUMP_DST_BITS, PAGE_INSTR_COUNT};
use crate::error::RecompileError;
use crate::mips::{classify, ControlFlow, GuestInstruction};

/// Which kind of target-in-block check to perform (`is_jump_out` in the
/// original design takes a `branch` value and an `is_aa` flag; we split
/// that into a small enum instead of an untyped boolean).
#[derive(Debug, Clone, Copy)]
pub enum BranchTarget {
    /// An absolute jump (`J`/`JAL`): `jump_index` is the 26-bit `LI` field.
    Absolute {
        /// The 26-bit jump index field.
        jump_index: u32,
    },
    /// A relative branch: `displacement` is the already sign-extended
    /// word-granularity offset, measured from `current_page_index` (the
    /// guest offset, within the page, of the instruction immediately after
    /// the branch — i.e. its delay slot).
    Relative {
        /// Page-relative offset of the branch's delay slot.
        current_page_index: usize,
        /// Signed word displacement.
        displacement: i32,
    },
}

/// `is_jump_out(branch, is_aa)`: whether a branch/jump target falls outside
/// the function's currently-known bounds `[addr_first, addr_last)`.
#[must_use]
pub fn is_jump_out(target: BranchTarget, addr_first: u32, addr_last: u32, page_start: u32) -> bool {
    let target_addr = match target {
        BranchTarget::Absolute { jump_index } => (jump_index << 2) | (addr_first & 0xF000_0000),
        BranchTarget::Relative {
            current_page_index,
            displacement,
        } => {
            let word_index = current_page_index as i64 + i64::from(displacement);
            (i64::from(page_start) + 4 * word_index) as u32
        }
    };
    !(addr_first..addr_last).contains(&target_addr)
}

/// The result of scanning one function with Pass 0.
#[derive(Debug, Clone)]
pub struct Pass0Result {
    /// Whether the function is fully contained in this page (`true`) or
    /// runs off the end of it (`false`). Register mappings may only be used
    /// across instruction boundaries when this is `true`.
    pub use_register_maps: bool,
    /// Guest address of the function's first instruction.
    pub addr_first: u32,
    /// Exclusive guest address of the function's end.
    pub addr_last: u32,
    /// Page-relative offset matching `addr_last` (`src_last`).
    pub src_last_offset: usize,
    /// Per-page bit vector: `is_jump_dst[i]` is set if guest offset `i` is a
    /// recorded in-block branch or local-jump destination.
    pub is_jump_dst: Vec<bool>,
}

/// Run Pass 0 over `guest_code` (a whole page) starting at `entry_offset`,
/// where the page spans guest addresses `[page_start, page_start + 0x1000)`.
pub fn analyze_pass0(
    guest_code: &[GuestInstruction; PAGE_INSTR_COUNT],
    page_start: u32,
    entry_offset: usize,
) -> Result<Pass0Result, RecompileError> {
    let addr_first = page_start + 4 * entry_offset as u32;
    let page_end = page_start + crate::config::PAGE_SIZE_BYTES;
    let addr_last = page_end;

    let mut is_jump_dst = vec![false; JUMP_DST_BITS];
    let mut idx = entry_offset;
    let mut terminated_at: Option<usize> = None;

    while page_start + 4 * (idx as u32) < addr_last {
        let instr = guest_code[idx];
        match classify(instr) {
            ControlFlow::AbsoluteJump { is_link } => {
                let jump_index = instr.jump_index();
                if !is_jump_out(
                    BranchTarget::Absolute { jump_index },
                    addr_first,
                    addr_last,
                    page_start,
                ) {
                    is_jump_dst[(jump_index & 0x3FF) as usize] = true;
                }
                idx += 1; // now at the delay slot
                if !is_link {
                    terminated_at = Some(idx);
                    break;
                }
                idx += 1; // consume delay slot, JAL keeps scanning
            }
            ControlFlow::ConditionalBranch => {
                let displacement = instr.immediate();
                idx += 1; // now at the delay slot
                let delay_slot_idx = idx;
                if !is_jump_out(
                    BranchTarget::Relative {
                        current_page_index: delay_slot_idx,
                        displacement,
                    },
                    addr_first,
                    addr_last,
                    page_start,
                ) {
                    let computed = delay_slot_idx as i64 + i64::from(displacement);
                    if computed < 0 || computed as usize >= JUMP_DST_BITS {
                        return Err(RecompileError::JumpTargetOutOfRange {
                            source_offset: (idx - 1) as u32,
                            computed_index: computed,
                            valid_len: JUMP_DST_BITS,
                        });
                    }
                    is_jump_dst[computed as usize] = true;
                }
                idx += 1; // consume delay slot
            }
            ControlFlow::RegisterJump | ControlFlow::ExceptionReturn => {
                idx += 1; // now at the delay slot; excluded from this function
                terminated_at = Some(idx);
                break;
            }
            ControlFlow::Sequential => {
                idx += 1;
            }
        }
    }

    let (use_register_maps, src_last_offset, resolved_addr_last) = match terminated_at {
        Some(offset) => (true, offset, page_start + 4 * offset as u32),
        None => (false, idx, addr_last),
    };

    Ok(Pass0Result {
        use_register_maps,
        addr_first,
        addr_last: resolved_addr_last,
        src_last_offset,
        is_jump_dst,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mips::opcode;

    fn page_of(instrs: &[GuestInstruction]) -> [GuestInstruction; PAGE_INSTR_COUNT] {
        let mut page = [GuestInstruction::default(); PAGE_INSTR_COUNT];
        for (i, instr) in instrs.iter().enumerate() {
            page[i] = *instr;
        }
        page
    }

    fn nop() -> GuestInstruction {
        GuestInstruction::new(0)
    }

    fn jr_ra() -> GuestInstruction {
        GuestInstruction::new((opcode::SPECIAL << 26) | (31 << 21) | crate::mips::special_function::JR)
    }

    fn beq(rs: u32, rt: u32, disp: i16) -> GuestInstruction {
        GuestInstruction::new((opcode::BEQ << 26) | (rs << 21) | (rt << 16) | (disp as u16 as u32))
    }

    fn bne(rs: u32, rt: u32, disp: i16) -> GuestInstruction {
        GuestInstruction::new((opcode::BNE << 26) | (rs << 21) | (rt << 16) | (disp as u16 as u32))
    }

    fn j(target_word_index_low26: u32) -> GuestInstruction {
        GuestInstruction::new((opcode::J << 26) | (target_word_index_low26 & 0x03FF_FFFF))
    }

    /// S1: straight-line function of 8 arithmetic instructions then `JR RA` + delay nop.
    #[test]
    fn s1_straight_line() {
        let mut instrs = vec![nop(); 8];
        instrs.push(jr_ra());
        instrs.push(nop());
        let page = page_of(&instrs);

        let result = analyze_pass0(&page, 0x8000_0000, 0).unwrap();
        assert!(result.use_register_maps);
        assert_eq!(result.src_last_offset, 9);
        assert_eq!(result.addr_last - result.addr_first, 36);
        assert!(result.is_jump_dst.iter().all(|&b| !b));
    }

    /// S2: forward in-block branch `BEQ r0, r0, +3` then 4 NOPs.
    #[test]
    fn s2_forward_branch() {
        let mut instrs = vec![beq(0, 0, 3)];
        instrs.extend(vec![nop(); 4]);
        instrs.push(jr_ra());
        instrs.push(nop());
        let page = page_of(&instrs);

        let result = analyze_pass0(&page, 0x8000_0000, 0).unwrap();
        assert!(result.is_jump_dst[4]);
        assert!(result.is_jump_dst.iter().enumerate().filter(|(_, &b)| b).count() == 1);
    }

    /// S3: backward in-block branch `BNE r1, r2, -2` at offset 5.
    #[test]
    fn s3_backward_branch() {
        let mut instrs = vec![nop(); 5];
        instrs.push(bne(1, 2, -2));
        instrs.push(nop());
        instrs.push(jr_ra());
        instrs.push(nop());
        let page = page_of(&instrs);

        let result = analyze_pass0(&page, 0x8000_0000, 0).unwrap();
        // The branch sits at offset 5; its delay slot (offset 6) is the base
        // the displacement is added to, so -2 lands on offset 4.
        assert!(result.is_jump_dst[4]);
    }

    /// S4: absolute jump `J 0x80001010` within page `0x80001000`.
    #[test]
    fn s4_absolute_jump_in_block() {
        let target_word_index = 0x0000_1010 >> 2; // li field as assembled
        let mut instrs = vec![nop(); 4];
        instrs.push(j(target_word_index));
        instrs.push(nop());
        let page = page_of(&instrs);

        let result = analyze_pass0(&page, 0x8000_1000, 0).unwrap();
        assert!(result.is_jump_dst[4]);
        assert!(result.use_register_maps);
        assert_eq!(result.src_last_offset, 5);
    }

    /// S5: function with no terminator within the page.
    #[test]
    fn s5_spans_pages() {
        let instrs = vec![nop(); PAGE_INSTR_COUNT];
        let page = page_of(&instrs);

        let result = analyze_pass0(&page, 0x8000_0000, 0).unwrap();
        assert!(!result.use_register_maps);
        assert_eq!(result.addr_last, 0x8000_1000);
        assert_eq!(result.src_last_offset, PAGE_INSTR_COUNT);
    }

    #[test]
    fn jal_does_not_terminate_scan() {
        let mut instrs = vec![GuestInstruction::new((opcode::JAL << 26) | 0)];
        instrs.push(nop());
        instrs.push(jr_ra());
        instrs.push(nop());
        let page = page_of(&instrs);

        let result = analyze_pass0(&page, 0x8000_0000, 0).unwrap();
        assert!(result.use_register_maps);
        assert_eq!(result.src_last_offset, 4);
    }

    #[test]
    fn out_of_range_relative_branch_is_rejected() {
        // A branch whose delay-slot-relative target would land outside the
        // is_jump_dst vector: this can't actually occur if is_jump_out is
        // computed correctly (since addr_last bounds the search), but we
        // defend the invariant regardless by constructing an instruction
        // whose target is in-block per is_jump_out yet whose computed index
        // would exceed 1024 only if page math were inconsistent. Verify the
        // normal path instead returns Ok for a legal in-range branch.
        let mut instrs = vec![beq(0, 0, 0)];
        instrs.push(nop());
        instrs.push(jr_ra());
        instrs.push(nop());
        let page = page_of(&instrs);
        assert!(analyze_pass0(&page, 0x8000_0000, 0).is_ok());
    }
}
