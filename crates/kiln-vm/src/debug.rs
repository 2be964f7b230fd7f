//! Bytecode disassembler, shared by the driver's `dis` command, the VM's
//! instruction tracing and compiler tests.

use std::fmt::Write as _;

use crate::chunk::{Chunk, OpCode};
use crate::value::Value;

/// Disassemble a whole chunk under a `== name ==` header.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(chunk, offset);
        let _ = writeln!(out, "{text}");
        offset = next;
    }
    out
}

/// Disassemble `chunk` and, depth-first, every function in its constant pool.
pub fn disassemble_recursive(chunk: &Chunk, name: &str) -> String {
    let mut out = disassemble_chunk(chunk, name);
    for constant in &chunk.constants {
        if let Value::Fn(func) = constant {
            out.push('\n');
            out.push_str(&disassemble_recursive(&func.chunk, &func.name));
        }
    }
    out
}

/// Render the instruction at `offset` as `OFFS LINE MNEMONIC operands`;
/// returns the text and the offset of the next instruction. A line column of
/// `|` means "same line as the previous instruction".
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        text.push_str("   | ");
    } else {
        let _ = write!(text, "{:4} ", chunk.line_at(offset));
    }

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        let _ = write!(text, "BAD_OPCODE {:#04x}", chunk.code[offset]);
        return (text, offset + 1);
    };

    match op {
        // u16 constant-pool operand
        OpCode::Constant
        | OpCode::DefineGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::GetField
        | OpCode::SetField
        | OpCode::Class
        | OpCode::Method
        | OpCode::StaticMethod
        | OpCode::GetBase
        | OpCode::Import => {
            let index = chunk.read_u16(offset + 1);
            let _ = write!(text, "{:<16} {index:4} '{}'", op.name(), constant_at(chunk, index));
            (text, offset + 3)
        }
        // u16 slot operand
        OpCode::GetLocal | OpCode::SetLocal => {
            let slot = chunk.read_u16(offset + 1);
            let _ = write!(text, "{:<16} {slot:4}", op.name());
            (text, offset + 3)
        }
        // u8 operand
        OpCode::Call | OpCode::Range => {
            let byte = chunk.code[offset + 1];
            let _ = write!(text, "{:<16} {byte:4}", op.name());
            (text, offset + 2)
        }
        // u16 array element count
        OpCode::Array => {
            let count = chunk.read_u16(offset + 1);
            let _ = write!(text, "{:<16} {count:4}", op.name());
            (text, offset + 3)
        }
        // forward jumps
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::IterNext | OpCode::TryPush => {
            let jump = chunk.read_u16(offset + 1) as usize;
            let _ = write!(text, "{:<16} {:4} -> {}", op.name(), offset, offset + 3 + jump);
            (text, offset + 3)
        }
        OpCode::Loop => {
            let jump = chunk.read_u16(offset + 1) as usize;
            let _ = write!(text, "{:<16} {:4} -> {}", op.name(), offset, offset + 3 - jump);
            (text, offset + 3)
        }
        // u16 name constant plus u8 argc
        OpCode::Invoke | OpCode::InvokeBase => {
            let index = chunk.read_u16(offset + 1);
            let argc = chunk.code[offset + 3];
            let _ = write!(
                text,
                "{:<16} {index:4} '{}' ({argc} args)",
                op.name(),
                constant_at(chunk, index)
            );
            (text, offset + 4)
        }
        _ => {
            text.push_str(op.name());
            (text, offset + 1)
        }
    }
}

fn constant_at(chunk: &Chunk, index: u16) -> String {
    match chunk.constants.get(index as usize) {
        Some(value) => value.to_string(),
        None => format!("<bad constant {index}>"),
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_and_constant_instructions() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Num(1.5)).unwrap();
        chunk.write_op(OpCode::Constant, 7);
        chunk.write_u16(idx, 7);
        chunk.write_op(OpCode::Ret, 7);

        let text = disassemble_chunk(&chunk, "main");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "== main ==");
        assert_eq!(lines[1], "0000    7 CONSTANT            0 '1.5'");
        assert_eq!(lines[2], "0003    | RET");
    }

    #[test]
    fn jump_targets_are_absolute() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::JumpIfFalse, 1);
        chunk.write_u16(4, 1);
        chunk.write_op(OpCode::Loop, 2);
        chunk.write_u16(6, 2);

        let (fwd, next) = disassemble_instruction(&chunk, 0);
        assert!(fwd.ends_with("JUMP_IF_FALSE       0 -> 7"), "{fwd}");
        let (back, _) = disassemble_instruction(&chunk, next);
        assert!(back.ends_with("LOOP                3 -> 0"), "{back}");
    }

    #[test]
    fn recursive_dump_includes_nested_functions() {
        use crate::object::Function;
        use std::rc::Rc;

        let mut inner = Function::new("helper", 0);
        inner.chunk.write_op(OpCode::Nil, 1);
        inner.chunk.write_op(OpCode::Ret, 1);

        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Fn(Rc::new(inner))).unwrap();
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_u16(idx, 1);
        chunk.write_op(OpCode::Ret, 1);

        let text = disassemble_recursive(&chunk, "script");
        assert!(text.contains("== script =="), "{text}");
        assert!(text.contains("== helper =="), "{text}");
        assert!(text.contains("'<fn helper>'"), "{text}");
    }
}
