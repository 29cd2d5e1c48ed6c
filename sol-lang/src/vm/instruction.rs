//! The 32-bit instruction encoding.
//!
//! Every instruction stores its [`Opcode`] in the low 6 bits. The remaining
//! 26 bits hold operands in one of three layouts, fixed per opcode:
//!
//! | layout      | fields                                       |
//! |-------------|----------------------------------------------|
//! | `A B C`     | `A`: 8 bits, `B`: 9 bits, `C`: 9 bits        |
//! | `A Bu`/`Bs` | `A`: 8 bits, `B`: 18 bits unsigned or signed |
//! | `Buu`/`Bss` | 26 bits unsigned or signed                   |
//!
//! Signed fields are stored with a bias of half the field's range. Values
//! that do not fit in a field are masked, so encoding never fails and never
//! spills into a neighboring field.

use std::fmt::{self, Debug};

/// Operands at or above this index address the constant pool instead of the
/// register file.
pub const RK_CONSTANT: u32 = 255;

const OP_BITS: u32 = 6;
const A_BITS: u32 = 8;
const B_BITS: u32 = 9;
const C_BITS: u32 = 9;
const BX_BITS: u32 = B_BITS + C_BITS;
const BXX_BITS: u32 = A_BITS + BX_BITS;

const A_OFFSET: u32 = OP_BITS;
const B_OFFSET: u32 = A_OFFSET + A_BITS;
const C_OFFSET: u32 = B_OFFSET + B_BITS;
const BXX_OFFSET: u32 = OP_BITS;

const OP_MASK: u32 = (1 << OP_BITS) - 1;

/// The largest value representable in the `A` field.
pub const A_MAX: u32 = (1 << A_BITS) - 1;
/// The largest value representable in the `B` field.
pub const B_MAX: u32 = (1 << B_BITS) - 1;
/// The largest value representable in the `C` field.
pub const C_MAX: u32 = (1 << C_BITS) - 1;
/// The largest value representable in the `Bu` field.
pub const BU_MAX: u32 = (1 << BX_BITS) - 1;
/// The largest value representable in the `Buu` field.
pub const BUU_MAX: u32 = (1 << BXX_BITS) - 1;

/// The smallest value representable in the `Bs` field.
pub const BS_MIN: i32 = -BS_BIAS;
/// The largest value representable in the `Bs` field.
#[allow(clippy::cast_possible_wrap)]
pub const BS_MAX: i32 = BU_MAX as i32 - BS_BIAS;
/// The smallest value representable in the `Bss` field.
pub const BSS_MIN: i32 = -BSS_BIAS;
/// The largest value representable in the `Bss` field.
#[allow(clippy::cast_possible_wrap)]
pub const BSS_MAX: i32 = BUU_MAX as i32 - BSS_BIAS;

#[allow(clippy::cast_possible_wrap)]
const BS_BIAS: i32 = (BU_MAX >> 1) as i32;
#[allow(clippy::cast_possible_wrap)]
const BSS_BIAS: i32 = (BUU_MAX >> 1) as i32;

/// An operation the virtual machine can execute.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// `RETURN A B`: return `R(A)..R(A+B-1)` to the caller.
    Return = 0,
    /// `YIELD A B C`: yield (`A = 0`), sleep for `RK(B)` milliseconds
    /// (`A = 1`), or receive a message into `R(B)` (`A = 2`).
    Yield,
    /// `MOVE A B`: `R(A) = R(B)`.
    Move,
    /// `LOADK A Bu`: `R(A) = K(Bu)`.
    LoadConstant,
    /// `CALL A B C`: `R(A)..R(A+C-1) = R(A)(R(A+1)..R(A+B))`.
    Call,
    /// `SPAWN A B`: start a child task running `RK(B)`, storing its id in
    /// `R(A)`.
    Spawn,
    /// `ADD A B C`: `R(A) = RK(B) + RK(C)`.
    Add,
    /// `SUB A B C`: `R(A) = RK(B) - RK(C)`.
    Subtract,
    /// `MUL A B C`: `R(A) = RK(B) * RK(C)`.
    Multiply,
    /// `DIV A B C`: `R(A) = RK(B) / RK(C)`.
    Divide,
    /// `NOT A B`: `R(A) = not R(B)`.
    Not,
    /// `EQ A B C`: if `(RK(B) == RK(C)) != A`, execute the next `JUMP`.
    Equal,
    /// `LT A B C`: if `(RK(B) < RK(C)) != A`, execute the next `JUMP`.
    LessThan,
    /// `LE A B C`: if `(RK(B) <= RK(C)) != A`, execute the next `JUMP`.
    LessThanOrEqual,
    /// `JUMP Bss`: move the program counter by `Bss` instructions.
    Jump,
    /// `HOOK A B`: invoke the host hook stored in `RK(B)`.
    Hook,
    /// `DBGREG A B C`: log the contents of `R(A)`, `R(B)`, and `R(C)`.
    DumpRegisters,
}

impl Opcode {
    /// Every opcode, indexed by its encoded value.
    pub const ALL: [Opcode; 17] = [
        Opcode::Return,
        Opcode::Yield,
        Opcode::Move,
        Opcode::LoadConstant,
        Opcode::Call,
        Opcode::Spawn,
        Opcode::Add,
        Opcode::Subtract,
        Opcode::Multiply,
        Opcode::Divide,
        Opcode::Not,
        Opcode::Equal,
        Opcode::LessThan,
        Opcode::LessThanOrEqual,
        Opcode::Jump,
        Opcode::Hook,
        Opcode::DumpRegisters,
    ];

    /// Returns the assembly mnemonic of this opcode.
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Return => "RETURN",
            Opcode::Yield => "YIELD",
            Opcode::Move => "MOVE",
            Opcode::LoadConstant => "LOADK",
            Opcode::Call => "CALL",
            Opcode::Spawn => "SPAWN",
            Opcode::Add => "ADD",
            Opcode::Subtract => "SUB",
            Opcode::Multiply => "MUL",
            Opcode::Divide => "DIV",
            Opcode::Not => "NOT",
            Opcode::Equal => "EQ",
            Opcode::LessThan => "LT",
            Opcode::LessThanOrEqual => "LE",
            Opcode::Jump => "JUMP",
            Opcode::Hook => "HOOK",
            Opcode::DumpRegisters => "DBGREG",
        }
    }

    fn layout(self) -> Layout {
        match self {
            Opcode::LoadConstant => Layout::ABu,
            Opcode::Jump => Layout::Bss,
            _ => Layout::Abc,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(usize::from(value)).copied().ok_or(value)
    }
}

#[derive(Clone, Copy)]
enum Layout {
    Abc,
    ABu,
    Bss,
}

/// A single encoded virtual machine instruction.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Instruction(pub u32);

impl Instruction {
    /// Encodes an instruction using the `A B C` layout.
    #[must_use]
    pub const fn abc(op: Opcode, a: u32, b: u32, c: u32) -> Self {
        Self(
            op as u32
                | (a & A_MAX) << A_OFFSET
                | (b & B_MAX) << B_OFFSET
                | (c & C_MAX) << C_OFFSET,
        )
    }

    /// Encodes an instruction using the `A Bu` layout.
    #[must_use]
    pub const fn abu(op: Opcode, a: u32, bu: u32) -> Self {
        Self(op as u32 | (a & A_MAX) << A_OFFSET | (bu & BU_MAX) << B_OFFSET)
    }

    /// Encodes an instruction using the `A Bs` layout.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn abs(op: Opcode, a: u32, bs: i32) -> Self {
        Self::abu(op, a, bs.wrapping_add(BS_BIAS) as u32)
    }

    /// Encodes an instruction using the `Buu` layout.
    #[must_use]
    pub const fn wide(op: Opcode, buu: u32) -> Self {
        Self(op as u32 | (buu & BUU_MAX) << BXX_OFFSET)
    }

    /// Encodes an instruction using the `Bss` layout.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn wide_signed(op: Opcode, bss: i32) -> Self {
        Self::wide(op, bss.wrapping_add(BSS_BIAS) as u32)
    }

    /// `RETURN A B`
    #[must_use]
    pub const fn return_values(first: u32, count: u32) -> Self {
        Self::abc(Opcode::Return, first, count, 0)
    }

    /// `YIELD 0`
    #[must_use]
    pub const fn yield_now() -> Self {
        Self::abc(Opcode::Yield, 0, 0, 0)
    }

    /// `YIELD 1 B`, where `RK(B)` holds the number of milliseconds to wait.
    ///
    /// `duration` is a register-or-constant operand, not a literal duration.
    #[must_use]
    pub const fn sleep(duration: u32) -> Self {
        Self::abc(Opcode::Yield, 1, duration, 0)
    }

    /// `YIELD 2 B`, storing the next received message in `R(B)`.
    #[must_use]
    pub const fn receive(destination: u32) -> Self {
        Self::abc(Opcode::Yield, 2, destination, 0)
    }

    /// `MOVE A B`
    #[must_use]
    pub const fn move_register(destination: u32, source: u32) -> Self {
        Self::abc(Opcode::Move, destination, source, 0)
    }

    /// `LOADK A Bu`
    #[must_use]
    pub const fn load_constant(destination: u32, constant: u32) -> Self {
        Self::abu(Opcode::LoadConstant, destination, constant)
    }

    /// `CALL A B C`
    #[must_use]
    pub const fn call(function: u32, arguments: u32, results: u32) -> Self {
        Self::abc(Opcode::Call, function, arguments, results)
    }

    /// `SPAWN A B`
    #[must_use]
    pub const fn spawn(destination: u32, function: u32) -> Self {
        Self::abc(Opcode::Spawn, destination, function, 0)
    }

    /// `ADD A B C`
    #[must_use]
    pub const fn add(destination: u32, lhs: u32, rhs: u32) -> Self {
        Self::abc(Opcode::Add, destination, lhs, rhs)
    }

    /// `SUB A B C`
    #[must_use]
    pub const fn sub(destination: u32, lhs: u32, rhs: u32) -> Self {
        Self::abc(Opcode::Subtract, destination, lhs, rhs)
    }

    /// `MUL A B C`
    #[must_use]
    pub const fn mul(destination: u32, lhs: u32, rhs: u32) -> Self {
        Self::abc(Opcode::Multiply, destination, lhs, rhs)
    }

    /// `DIV A B C`
    #[must_use]
    pub const fn div(destination: u32, lhs: u32, rhs: u32) -> Self {
        Self::abc(Opcode::Divide, destination, lhs, rhs)
    }

    /// `NOT A B`
    #[must_use]
    pub const fn not(destination: u32, source: u32) -> Self {
        Self::abc(Opcode::Not, destination, source, 0)
    }

    /// `EQ A B C`. Must be followed by a [`Instruction::jump`].
    #[must_use]
    pub const fn eq(expected: u32, lhs: u32, rhs: u32) -> Self {
        Self::abc(Opcode::Equal, expected, lhs, rhs)
    }

    /// `LT A B C`. Must be followed by a [`Instruction::jump`].
    #[must_use]
    pub const fn lt(expected: u32, lhs: u32, rhs: u32) -> Self {
        Self::abc(Opcode::LessThan, expected, lhs, rhs)
    }

    /// `LE A B C`. Must be followed by a [`Instruction::jump`].
    #[must_use]
    pub const fn le(expected: u32, lhs: u32, rhs: u32) -> Self {
        Self::abc(Opcode::LessThanOrEqual, expected, lhs, rhs)
    }

    /// `JUMP Bss`
    #[must_use]
    pub const fn jump(offset: i32) -> Self {
        Self::wide_signed(Opcode::Jump, offset)
    }

    /// `HOOK 0 B`
    #[must_use]
    pub const fn hook(hook: u32) -> Self {
        Self::abc(Opcode::Hook, 0, hook, 0)
    }

    /// `DBGREG A B C`
    #[must_use]
    pub const fn dump_registers(a: u32, b: u32, c: u32) -> Self {
        Self::abc(Opcode::DumpRegisters, a, b, c)
    }

    /// Returns the raw 6-bit opcode.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn op(self) -> u8 {
        (self.0 & OP_MASK) as u8
    }

    /// Returns the decoded opcode, or the raw value if it is not a known
    /// opcode.
    pub fn opcode(self) -> Result<Opcode, u8> {
        Opcode::try_from(self.op())
    }

    /// Returns the `A` field.
    #[must_use]
    pub const fn a(self) -> u32 {
        (self.0 >> A_OFFSET) & A_MAX
    }

    /// Returns the `B` field.
    #[must_use]
    pub const fn b(self) -> u32 {
        (self.0 >> B_OFFSET) & B_MAX
    }

    /// Returns the `C` field.
    #[must_use]
    pub const fn c(self) -> u32 {
        (self.0 >> C_OFFSET) & C_MAX
    }

    /// Returns the `Bu` field.
    #[must_use]
    pub const fn bu(self) -> u32 {
        (self.0 >> B_OFFSET) & BU_MAX
    }

    /// Returns the `Bs` field.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn bs(self) -> i32 {
        self.bu() as i32 - BS_BIAS
    }

    /// Returns the `Buu` field.
    #[must_use]
    pub const fn buu(self) -> u32 {
        (self.0 >> BXX_OFFSET) & BUU_MAX
    }

    /// Returns the `Bss` field.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn bss(self) -> i32 {
        self.buu() as i32 - BSS_BIAS
    }
}

impl From<u32> for Instruction {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Instruction> for u32 {
    fn from(value: Instruction) -> Self {
        value.0
    }
}

impl Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Ok(op) => match op.layout() {
                Layout::Abc => write!(
                    f,
                    "{} {} {} {}",
                    op.mnemonic(),
                    self.a(),
                    self.b(),
                    self.c()
                ),
                Layout::ABu => write!(f, "{} {} {}", op.mnemonic(), self.a(), self.bu()),
                Layout::Bss => write!(f, "{} {}", op.mnemonic(), self.bss()),
            },
            Err(op) => write!(f, "?{op} {:#010x}", self.0),
        }
    }
}
