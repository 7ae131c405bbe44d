//! Textual disassembly of a compiled chunk, gated behind the
//! `debug-print-code` feature. Mirrors the VM's own decoding logic closely
//! enough to be a useful cross-check when the two disagree.

use quill_core::{Chunk, OpCode};
use quill_vm::Heap;

pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, heap, &mut out);
    }
    out
}

fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    out.push_str(&format!("{offset:04} "));
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let op = match OpCode::try_from(chunk.code[offset]) {
        Ok(op) => op,
        Err(byte) => {
            out.push_str(&format!("Unknown opcode {byte}\n"));
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, offset, heap, out),
        OpCode::Nil => simple_instruction("OP_NIL", offset, out),
        OpCode::True => simple_instruction("OP_TRUE", offset, out),
        OpCode::False => simple_instruction("OP_FALSE", offset, out),
        OpCode::Pop => simple_instruction("OP_POP", offset, out),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset, out),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset, out),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset, heap, out),
        OpCode::DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset, heap, out),
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset, heap, out),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset, out),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset, out),
        OpCode::GetProperty => constant_instruction("OP_GET_PROPERTY", chunk, offset, heap, out),
        OpCode::SetProperty => constant_instruction("OP_SET_PROPERTY", chunk, offset, heap, out),
        OpCode::GetSuper => constant_instruction("OP_GET_SUPER", chunk, offset, heap, out),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset, out),
        OpCode::Greater => simple_instruction("OP_GREATER", offset, out),
        OpCode::Less => simple_instruction("OP_LESS", offset, out),
        OpCode::Add => simple_instruction("OP_ADD", offset, out),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset, out),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset, out),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset, out),
        OpCode::Not => simple_instruction("OP_NOT", offset, out),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset, out),
        OpCode::Print => simple_instruction("OP_PRINT", offset, out),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset, out),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset, out),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset, out),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset, out),
        OpCode::Invoke => invoke_instruction("OP_INVOKE", chunk, offset, heap, out),
        OpCode::SuperInvoke => invoke_instruction("OP_SUPER_INVOKE", chunk, offset, heap, out),
        OpCode::Closure => closure_instruction(chunk, offset, heap, out),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset, out),
        OpCode::Return => simple_instruction("OP_RETURN", offset, out),
        OpCode::Class => constant_instruction("OP_CLASS", chunk, offset, heap, out),
        OpCode::Inherit => simple_instruction("OP_INHERIT", offset, out),
        OpCode::Method => constant_instruction("OP_METHOD", chunk, offset, heap, out),
    }
}

fn simple_instruction(name: &str, offset: usize, out: &mut String) -> usize {
    out.push_str(name);
    out.push('\n');
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    out.push_str(&format!("{name:<16} {slot:4}\n"));
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
    let target = offset as i32 + 3 + sign * jump as i32;
    out.push_str(&format!("{name:<16} {offset:4} -> {target}\n"));
    offset + 3
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let value = chunk.constants[index];
    out.push_str(&format!("{name:<16} {index:4} '{}'\n", render(value, heap)));
    offset + 2
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let argc = chunk.code[offset + 2];
    let value = chunk.constants[index];
    out.push_str(&format!("{name:<16} ({argc} args) {index:4} '{}'\n", render(value, heap)));
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let value = chunk.constants[index];
    out.push_str(&format!("OP_CLOSURE        {index:4} '{}'\n", render(value, heap)));
    let mut cursor = offset + 2;
    let upvalue_count = match heap.get(value.as_object()).as_function() {
        Some(f) => f.upvalue_count,
        None => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[cursor];
        let index = chunk.code[cursor + 1];
        out.push_str(&format!(
            "{cursor:04}      |                     {} {index}\n",
            if is_local != 0 { "local" } else { "upvalue" }
        ));
        cursor += 2;
    }
    cursor
}

fn render(value: quill_core::Value, heap: &Heap) -> String {
    if value.is_object() {
        match heap.get(value.as_object()) {
            quill_core::Obj::String(s) => s.bytes.clone(),
            quill_core::Obj::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", heap.get_string(n)),
                None => "<script>".to_string(),
            },
            other => other.type_name().to_string(),
        }
    } else if value.is_number() {
        format!("{}", value.as_number())
    } else if value.is_bool() {
        value.as_bool().to_string()
    } else {
        "nil".to_string()
    }
}
