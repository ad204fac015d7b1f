//! The closed set of operations understood by the cache and the evaluator
use strum::{Display, EnumCount, EnumIter, EnumString};

/// A single operation in an expression DAG or a compiled tape.
///
/// Discriminants are stable: the cache and the evaluator share them, and
/// the flat text format ([`Cache::from_text`](crate::Cache::from_text))
/// uses the kebab-case names below.  Codes are grouped by arity, with
/// [`Opcode::Const`] ordered before every other nullary opcode so that a
/// linear scan of cache keys sees all constants first.
#[derive(
    Copy,
    Clone,
    Debug,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Display,
    EnumCount,
    EnumIter,
    EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum Opcode {
    /// Compile-time constant
    Const = 0,
    /// The X axis variable
    VarX = 1,
    /// The Y axis variable
    VarY = 2,
    /// The Z axis variable
    VarZ = 3,
    /// `a·X + b·Y + c·Z + d`, stored as a single node carrying the 4-tuple
    Affine = 4,

    Square = 5,
    Sqrt = 6,
    Neg = 7,
    Abs = 8,
    Sin = 9,
    Cos = 10,
    Tan = 11,
    Asin = 12,
    Acos = 13,
    Atan = 14,
    Exp = 15,

    Add = 16,
    Mul = 17,
    Min = 18,
    Max = 19,
    Sub = 20,
    Div = 21,
    Atan2 = 22,
    Pow = 23,
    NthRoot = 24,
    Mod = 25,
    NanFill = 26,

    /// Pass through operand A, ignoring B (substituted when B is pruned)
    DummyA = 27,
    /// Pass through operand B, ignoring A (substituted when A is pruned)
    DummyB = 28,

    /// Placeholder for uninitialized or erroneous clauses
    Invalid = 29,
}

impl Opcode {
    /// Returns the number of operands (0, 1, or 2) taken by this opcode.
    ///
    /// The dummy opcodes report 2, since they stand in for a binary
    /// operation whose other operand has been pruned; [`Opcode::Invalid`]
    /// reports 0.
    pub fn arity(&self) -> usize {
        use Opcode::*;
        match self {
            Const | VarX | VarY | VarZ | Affine | Invalid => 0,
            Square | Sqrt | Neg | Abs | Sin | Cos | Tan | Asin | Acos
            | Atan | Exp => 1,
            Add | Mul | Min | Max | Sub | Div | Atan2 | Pow | NthRoot
            | Mod | NanFill | DummyA | DummyB => 2,
        }
    }

    /// Checks whether operand order is irrelevant for this opcode
    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Mul | Opcode::Min | Opcode::Max
        )
    }
}
