use std::fmt::Write;

use crate::compiler::{Op, Program, REG_BP, REG_IP, REG_SP, REG_WORDS};

/// Render the instruction stream, one `address: opcode [operand]` line
/// per instruction.
pub fn disasm(program: &Program) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "; ip={} sp={} bp={} code_end={}",
        program.mem[REG_IP], program.mem[REG_SP], program.mem[REG_BP], program.code_end
    );
    let mut at = REG_WORDS;
    while at < program.code_end {
        let word = program.mem[at];
        match Op::decode(word) {
            Some(op) if op.has_operand() && at + 1 < program.code_end => {
                let _ = writeln!(out, "{:>6}: {:?} {}", at, op, program.mem[at + 1]);
                at += 2;
            }
            Some(op) => {
                let _ = writeln!(out, "{:>6}: {:?}", at, op);
                at += 1;
            }
            None => {
                let _ = writeln!(out, "{:>6}: ??? ({})", at, word);
                at += 1;
            }
        }
    }
    return out;
}

/// Decode the instruction stream into `(opcode, operand)` pairs.
pub fn decoded(program: &Program) -> Vec<(Op, Option<i64>)> {
    let mut ops = Vec::new();
    let mut at = REG_WORDS;
    while at < program.code_end {
        let word = program.mem[at];
        let Some(op) = Op::decode(word) else {
            panic!("junk opcode {} at {}", word, at);
        };
        at += 1;
        let operand = if op.has_operand() {
            let operand = program.mem[at];
            at += 1;
            Some(operand)
        } else {
            None
        };
        ops.push((op, operand));
    }
    return ops;
}
