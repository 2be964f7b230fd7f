//! Bytecode chunks: instruction encoding, constant pools and line tables.

use crate::value::Value;

/// One-byte instruction opcodes.
///
/// Operands follow the opcode inline in the code stream: `u16` (big-endian)
/// for constant-pool indices, local slots and jump offsets, `u8` for argument
/// counts and flags. Jumps are relative to the offset of the instruction
/// *after* the operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Push `constants[u16]`.
    Constant,
    Nil,
    True,
    False,

    Pop,
    /// Duplicate the top of the stack.
    Dup,
    /// Duplicate the top two slots, preserving their order.
    Dup2,
    /// Rotate the top three slots so the top lands beneath the other two.
    Rot3,

    /// Push the local in frame slot `u16`.
    GetLocal,
    /// Store the top of the stack (without popping) into frame slot `u16`.
    SetLocal,
    /// Pop the top of the stack into a new global named by `constants[u16]`.
    DefineGlobal,
    GetGlobal,
    SetGlobal,

    /// Pop an object, push the property named by `constants[u16]`.
    GetField,
    /// Pop value then object, store the field, push the value back.
    SetField,
    /// Pop index then container, push the element.
    GetIndex,
    /// Pop value, index, container; store; push the value back.
    SetIndex,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,

    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    /// Instance-of test against a class.
    Is,
    /// Membership test against an array, string or range.
    In,

    /// Pop end then start, push a range; `u8` operand: 1 = inclusive.
    Range,
    /// Pop the top `u16` values, push them as a new array.
    Array,

    /// Unconditional forward jump by `u16`.
    Jump,
    /// Forward jump by `u16` when the top of the stack is falsey. Peeks;
    /// the condition is popped by an explicit `Pop`.
    JumpIfFalse,
    /// Backward jump by `u16`.
    Loop,

    /// Call the value under the top `u8` arguments.
    Call,
    /// Method call: `constants[u16]` names the method, `u8` is the argc.
    /// Fuses `GetField` + `Call` so the bound-method object is never built.
    Invoke,
    Ret,
    /// Pop and print a value followed by a newline.
    Print,

    /// Push a fresh class named by `constants[u16]`.
    Class,
    /// Pop a superclass, link it into the class on top of the stack.
    Inherit,
    /// Pop a function, add it to the class on top as a method.
    Method,
    /// Pop a function, add it to the class on top as a static method.
    StaticMethod,
    /// Pop the receiver, push the superclass method named by `constants[u16]`
    /// bound to it.
    GetBase,
    /// Superclass method call, same operands as `Invoke`.
    InvokeBase,

    /// Pop an iterable, push iterator state for it.
    IterNew,
    /// Advance the iterator on top of the stack: push the next element, or
    /// jump forward by `u16` when exhausted.
    IterNext,

    /// Push a handler covering everything up to a forward jump of `u16`.
    TryPush,
    /// Discard the innermost handler at the end of a protected block.
    TryPop,
    /// Pop a value and raise it.
    Throw,

    /// Load the module at the path in `constants[u16]`, push its value.
    Import,
}

impl OpCode {
    /// Every opcode, in discriminant order.
    const ALL: [OpCode; 53] = [
        OpCode::Constant,
        OpCode::Nil,
        OpCode::True,
        OpCode::False,
        OpCode::Pop,
        OpCode::Dup,
        OpCode::Dup2,
        OpCode::Rot3,
        OpCode::GetLocal,
        OpCode::SetLocal,
        OpCode::DefineGlobal,
        OpCode::GetGlobal,
        OpCode::SetGlobal,
        OpCode::GetField,
        OpCode::SetField,
        OpCode::GetIndex,
        OpCode::SetIndex,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Mod,
        OpCode::Neg,
        OpCode::Not,
        OpCode::Eq,
        OpCode::NotEq,
        OpCode::Lt,
        OpCode::LtEq,
        OpCode::Gt,
        OpCode::GtEq,
        OpCode::Is,
        OpCode::In,
        OpCode::Range,
        OpCode::Array,
        OpCode::Jump,
        OpCode::JumpIfFalse,
        OpCode::Loop,
        OpCode::Call,
        OpCode::Invoke,
        OpCode::Ret,
        OpCode::Print,
        OpCode::Class,
        OpCode::Inherit,
        OpCode::Method,
        OpCode::StaticMethod,
        OpCode::GetBase,
        OpCode::InvokeBase,
        OpCode::IterNew,
        OpCode::IterNext,
        OpCode::TryPush,
        OpCode::TryPop,
        OpCode::Throw,
        OpCode::Import,
    ];

    /// Decode a byte back into an opcode.
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        OpCode::ALL.get(byte as usize).copied()
    }

    /// Uppercase mnemonic for the disassembler and trace output.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Constant => "CONSTANT",
            OpCode::Nil => "NIL",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::Dup2 => "DUP2",
            OpCode::Rot3 => "ROT3",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::DefineGlobal => "DEFINE_GLOBAL",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::GetField => "GET_FIELD",
            OpCode::SetField => "SET_FIELD",
            OpCode::GetIndex => "GET_INDEX",
            OpCode::SetIndex => "SET_INDEX",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Neg => "NEG",
            OpCode::Not => "NOT",
            OpCode::Eq => "EQ",
            OpCode::NotEq => "NOT_EQ",
            OpCode::Lt => "LT",
            OpCode::LtEq => "LT_EQ",
            OpCode::Gt => "GT",
            OpCode::GtEq => "GT_EQ",
            OpCode::Is => "IS",
            OpCode::In => "IN",
            OpCode::Range => "RANGE",
            OpCode::Array => "ARRAY",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::Loop => "LOOP",
            OpCode::Call => "CALL",
            OpCode::Invoke => "INVOKE",
            OpCode::Ret => "RET",
            OpCode::Print => "PRINT",
            OpCode::Class => "CLASS",
            OpCode::Inherit => "INHERIT",
            OpCode::Method => "METHOD",
            OpCode::StaticMethod => "STATIC_METHOD",
            OpCode::GetBase => "GET_BASE",
            OpCode::InvokeBase => "INVOKE_BASE",
            OpCode::IterNew => "ITER_NEW",
            OpCode::IterNext => "ITER_NEXT",
            OpCode::TryPush => "TRY_PUSH",
            OpCode::TryPop => "TRY_POP",
            OpCode::Throw => "THROW",
            OpCode::Import => "IMPORT",
        }
    }
}

/// A compiled function body: bytecode, its constant pool and a line table
/// with one entry per code byte for runtime tracebacks.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub lines: Vec<u32>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk::default()
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.code.push(op as u8);
        self.lines.push(line);
    }

    pub fn write_byte(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Append a `u16` operand, big-endian.
    pub fn write_u16(&mut self, value: u16, line: u32) {
        self.write_byte((value >> 8) as u8, line);
        self.write_byte((value & 0xff) as u8, line);
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | self.code[offset + 1] as u16
    }

    /// Overwrite a previously written `u16` operand, used to back-patch
    /// forward jumps.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        self.code[offset] = (value >> 8) as u8;
        self.code[offset + 1] = (value & 0xff) as u8;
    }

    /// Intern `value` in the constant pool, reusing an equal existing entry.
    /// Returns `None` once the pool outgrows a `u16` index.
    pub fn add_constant(&mut self, value: Value) -> Option<u16> {
        if let Some(index) = self.constants.iter().position(|existing| *existing == value) {
            return Some(index as u16);
        }
        if self.constants.len() > u16::MAX as usize {
            return None;
        }
        self.constants.push(value);
        Some((self.constants.len() - 1) as u16)
    }

    /// Source line for the byte at `offset`.
    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
