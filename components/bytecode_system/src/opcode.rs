//! The instruction set of the register VM.

/// Bytecode operations. Discriminants are the 5-bit field packed into
/// the low bits of every instruction word; 0x1F is reserved as the
/// invalid opcode so the all-ones break sentinel can never decode to a
/// legal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// `locals[A] = symbols(locals[B])[C]` - instance fields, then the
    /// class chain, then module variables.
    LoadSymbol = 0,
    /// `locals[A] =` true (Bx 0), false (1), nil (2), the current
    /// module (3), or constant `Bx - 4`.
    LoadBasic = 1,
    /// `locals[A] = locals[Bx]`.
    StoreMove = 2,
    /// `symbols(locals[A])[B] = locals[C]`.
    StoreSymbol = 3,
    /// `locals[A] = new instance of the class in locals[Bx]`, fields
    /// seeded from the class's initializer list.
    NewClass = 4,
    /// `locals[A] = locals[B] + locals[C]`; concatenates when either
    /// side is a string.
    MathAdd = 5,
    /// `locals[A] = locals[B] - locals[C]`.
    MathSub = 6,
    /// `locals[A] = locals[B] * locals[C]`.
    MathMul = 7,
    /// `locals[A] = locals[B] / locals[C]`.
    MathDiv = 8,
    /// `locals[A] = locals[B] % locals[C]`.
    MathMod = 9,
    /// `locals[A] = locals[B] ^ locals[C]` (exponentiation).
    MathPow = 10,
    /// `locals[A] = -locals[Bx]`.
    MathInv = 11,
    /// `locals[A] = locals[B] == locals[C]`.
    CmpEe = 12,
    /// `locals[A] = locals[B] != locals[C]`.
    CmpNe = 13,
    /// `locals[A] = locals[B] < locals[C]`.
    CmpLt = 14,
    /// `locals[A] = locals[B] <= locals[C]`.
    CmpLe = 15,
    /// `locals[A] = locals[B] > locals[C]`.
    CmpGt = 16,
    /// `locals[A] = locals[B] >= locals[C]`.
    CmpGe = 17,
    /// `locals[A] = truthy(locals[B]) && truthy(locals[C])`.
    CmpAnd = 18,
    /// `locals[A] = truthy(locals[B]) || truthy(locals[C])`.
    CmpOr = 19,
    /// `locals[A] = !truthy(locals[Bx])`.
    Not = 20,
    /// Call `locals[B]` with `C` arguments in `locals[A..A+C]`; the
    /// return value lands in `locals[A]`.
    CallFn = 21,
    /// `ip += sBx`.
    Jump = 22,
    /// `if truthy(locals[A]) { ip += sBx }`.
    JumpIf = 23,
    /// `if !truthy(locals[A]) { ip += sBx }`.
    JumpIfNot = 24,
    /// Return `locals[Bx]` to the caller.
    Return = 25,
}

impl OpCode {
    /// Decodes a 5-bit opcode field. Returns `None` for values outside
    /// the instruction set (including the reserved invalid opcode).
    pub fn from_u8(bits: u8) -> Option<OpCode> {
        Some(match bits {
            0 => OpCode::LoadSymbol,
            1 => OpCode::LoadBasic,
            2 => OpCode::StoreMove,
            3 => OpCode::StoreSymbol,
            4 => OpCode::NewClass,
            5 => OpCode::MathAdd,
            6 => OpCode::MathSub,
            7 => OpCode::MathMul,
            8 => OpCode::MathDiv,
            9 => OpCode::MathMod,
            10 => OpCode::MathPow,
            11 => OpCode::MathInv,
            12 => OpCode::CmpEe,
            13 => OpCode::CmpNe,
            14 => OpCode::CmpLt,
            15 => OpCode::CmpLe,
            16 => OpCode::CmpGt,
            17 => OpCode::CmpGe,
            18 => OpCode::CmpAnd,
            19 => OpCode::CmpOr,
            20 => OpCode::Not,
            21 => OpCode::CallFn,
            22 => OpCode::Jump,
            23 => OpCode::JumpIf,
            24 => OpCode::JumpIfNot,
            25 => OpCode::Return,
            _ => return None,
        })
    }

    /// Short mnemonic used by the disassembler.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::LoadSymbol => "LOAD_SYMBOL",
            OpCode::LoadBasic => "LOAD_BASIC",
            OpCode::StoreMove => "STORE_MOVE",
            OpCode::StoreSymbol => "STORE_SYMBOL",
            OpCode::NewClass => "NEW_CLZ",
            OpCode::MathAdd => "MATH_ADD",
            OpCode::MathSub => "MATH_SUB",
            OpCode::MathMul => "MATH_MUL",
            OpCode::MathDiv => "MATH_DIV",
            OpCode::MathMod => "MATH_MOD",
            OpCode::MathPow => "MATH_POW",
            OpCode::MathInv => "MATH_INV",
            OpCode::CmpEe => "CMP_EE",
            OpCode::CmpNe => "CMP_NE",
            OpCode::CmpLt => "CMP_LT",
            OpCode::CmpLe => "CMP_LE",
            OpCode::CmpGt => "CMP_GT",
            OpCode::CmpGe => "CMP_GE",
            OpCode::CmpAnd => "CMP_AND",
            OpCode::CmpOr => "CMP_OR",
            OpCode::Not => "NOT",
            OpCode::CallFn => "CALL_FN",
            OpCode::Jump => "JUMP",
            OpCode::JumpIf => "JUMP_IF",
            OpCode::JumpIfNot => "JUMP_IF_NOT",
            OpCode::Return => "RETURN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes_fit_five_bits() {
        for bits in 0u8..=25 {
            let op = OpCode::from_u8(bits).unwrap();
            assert_eq!(op as u8, bits);
            assert!((op as u8) < 0x1F, "0x1F is the reserved invalid opcode");
        }
    }

    #[test]
    fn test_invalid_opcodes_rejected() {
        for bits in 26u8..=31 {
            assert!(OpCode::from_u8(bits).is_none());
        }
    }
}
