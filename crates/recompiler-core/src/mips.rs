//! Guest (MIPS/R4300i) instruction decoding.
//!
//! The recompiler never executes guest instructions itself; it only needs
//! enough of the encoding to classify control flow during Pass 0 and to hand
//! raw words to the external [`crate::collaborators::OpcodeTranslator`].

/// A single 32-bit R4300i instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestInstruction(pub u32);

impl GuestInstruction {
    /// Wrap a raw instruction word.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw 32-bit encoding.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// 6-bit primary opcode field (bits 31-26).
    #[must_use]
    pub const fn opcode(self) -> u32 {
        (self.0 >> 26) & 0x3F
    }

    /// `rs` register field (bits 25-21).
    #[must_use]
    pub const fn rs(self) -> u32 {
        (self.0 >> 21) & 0x1F
    }

    /// `rt` register field (bits 20-16).
    #[must_use]
    pub const fn rt(self) -> u32 {
        (self.0 >> 16) & 0x1F
    }

    /// `rd` register field (bits 15-11), valid for R-type instructions.
    #[must_use]
    pub const fn rd(self) -> u32 {
        (self.0 >> 11) & 0x1F
    }

    /// 6-bit function field (bits 5-0), valid for SPECIAL/COP0 instructions.
    #[must_use]
    pub const fn function(self) -> u32 {
        self.0 & 0x3F
    }

    /// 16-bit immediate field, sign-extended to `i32`.
    #[must_use]
    pub const fn immediate(self) -> i32 {
        ((self.0 & 0xFFFF) as i16) as i32
    }

    /// 26-bit jump index field (`LI`), used by `J`/`JAL`.
    #[must_use]
    pub const fn jump_index(self) -> u32 {
        self.0 & 0x03FF_FFFF
    }
}

/// Primary opcode values relevant to Pass 0 control-flow classification.
pub mod opcode {
    /// `SPECIAL` (R-type instructions, function field selects the operation).
    pub const SPECIAL: u32 = 0x00;
    /// `J` — unconditional absolute jump.
    pub const J: u32 = 0x02;
    /// `JAL` — absolute jump and link.
    pub const JAL: u32 = 0x03;
    /// `BEQ` — branch if equal.
    pub const BEQ: u32 = 0x04;
    /// `BNE` — branch if not equal.
    pub const BNE: u32 = 0x05;
    /// `BLEZ` — branch if less than or equal to zero.
    pub const BLEZ: u32 = 0x06;
    /// `BGTZ` — branch if greater than zero.
    pub const BGTZ: u32 = 0x07;
    /// `COP0` — system coprocessor instructions (`ERET` lives here).
    pub const COP0: u32 = 0x10;
    /// `COP1` — floating point coprocessor instructions (`BC` lives here).
    pub const COP1: u32 = 0x11;
    /// `BEQL` — branch likely if equal.
    pub const BEQL: u32 = 0x14;
    /// `BNEL` — branch likely if not equal.
    pub const BNEL: u32 = 0x15;
    /// `BLEZL` — branch likely if less than or equal to zero.
    pub const BLEZL: u32 = 0x16;
    /// `BGTZL` — branch likely if greater than zero.
    pub const BGTZL: u32 = 0x17;
}

/// `SPECIAL` function-field values relevant to Pass 0.
pub mod special_function {
    /// `JR` — jump register.
    pub const JR: u32 = 0x08;
}

/// `COP0` function-field values relevant to Pass 0.
pub mod cop0_function {
    /// `ERET` — exception return.
    pub const ERET: u32 = 0x18;
}

/// `COP1` `rs`-field values relevant to Pass 0.
pub mod cop1_rs {
    /// `BC` — floating point conditional branch.
    pub const BC: u32 = 0x08;
}

/// Classification of an instruction's effect on Pass 0's scan.
///
/// `BEQ $zero, $zero, offset` is the assembler's unconditional branch
/// (`b`) pseudo-instruction; it decodes as an ordinary [`opcode::BEQ`] and
/// needs no separate case here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// `J`/`JAL`: absolute jump, 26-bit jump index, consumes a delay slot.
    AbsoluteJump {
        /// Whether this is `JAL` (link) as opposed to plain `J`.
        is_link: bool,
    },
    /// A conditional (or floating-point) branch with a 16-bit displacement,
    /// consumes a delay slot.
    ConditionalBranch,
    /// `JR`: jump through a register, consumes a delay slot.
    RegisterJump,
    /// `ERET`: return from exception, consumes a delay slot.
    ExceptionReturn,
    /// Anything that does not affect control flow as far as Pass 0 cares.
    Sequential,
}

/// Classify an instruction for Pass 0's branch-target scan.
#[must_use]
pub fn classify(instr: GuestInstruction) -> ControlFlow {
    let op = instr.opcode();
    match op {
        opcode::J => ControlFlow::AbsoluteJump { is_link: false },
        opcode::JAL => ControlFlow::AbsoluteJump { is_link: true },
        opcode::BEQ
        | opcode::BNE
        | opcode::BLEZ
        | opcode::BGTZ
        | opcode::BEQL
        | opcode::BNEL
        | opcode::BLEZL
        | opcode::BGTZL => ControlFlow::ConditionalBranch,
        opcode::COP1 if instr.rs() == cop1_rs::BC => ControlFlow::ConditionalBranch,
        opcode::SPECIAL if instr.function() == special_function::JR => {
            ControlFlow::RegisterJump
        }
        opcode::COP0 if instr.function() == cop0_function::ERET => {
            ControlFlow::ExceptionReturn
        }
        _ => ControlFlow::Sequential,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_beq_fields() {
        // BEQ $0, $0, +3
        let instr = GuestInstruction::new((opcode::BEQ << 26) | (0 << 21) | (0 << 16) | 3);
        assert_eq!(instr.opcode(), opcode::BEQ);
        assert_eq!(instr.immediate(), 3);
        assert_eq!(classify(instr), ControlFlow::ConditionalBranch);
    }

    #[test]
    fn sign_extends_negative_immediate() {
        let instr = GuestInstruction::new((opcode::BNE << 26) | 0xFFFE); // -2
        assert_eq!(instr.immediate(), -2);
    }

    #[test]
    fn decodes_jump_index() {
        let instr = GuestInstruction::new((opcode::J << 26) | 0x0000_4010);
        assert_eq!(instr.jump_index(), 0x0000_4010);
        assert_eq!(classify(instr), ControlFlow::AbsoluteJump { is_link: false });
    }

    #[test]
    fn classifies_jr_and_eret() {
        let jr = GuestInstruction::new((opcode::SPECIAL << 26) | special_function::JR);
        assert_eq!(classify(jr), ControlFlow::RegisterJump);

        let eret = GuestInstruction::new((opcode::COP0 << 26) | cop0_function::ERET);
        assert_eq!(classify(eret), ControlFlow::ExceptionReturn);
    }

    #[test]
    fn classifies_cop1_bc() {
        let bc = GuestInstruction::new((opcode::COP1 << 26) | (cop1_rs::BC << 21) | 5);
        assert_eq!(classify(bc), ControlFlow::ConditionalBranch);
    }

    #[test]
    fn unrelated_cop1_is_sequential() {
        let mtc1 = GuestInstruction::new((opcode::COP1 << 26) | (4 << 21));
        assert_eq!(classify(mtc1), ControlFlow::Sequential);
    }
}
