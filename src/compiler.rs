pub mod disasm;

use thiserror::Error;

use crate::ast::{Ast, Binop, Builtin, LabelId, Node, UnOp, XIndex};

/// words reserved per call frame for locals
pub const FRAME_WORDS: i64 = 256;
/// return address, caller sp, caller bp
pub const LINKAGE_WORDS: i64 = 3;

/// register block at the bottom of program memory
pub const REG_IP: usize = 0;
pub const REG_SP: usize = 1;
pub const REG_BP: usize = 2;
pub const REG_WORDS: usize = 3;

/// stack region appended after the instruction stream
pub const STACK_WORDS: usize = 16 * 1024;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(i64)]
pub enum Op {
    Nop,
    Halt,
    /// unconditional jump to an absolute address
    Jmp,
    /// jump when a popped value is exactly zero
    Jz,
    Call,
    Ret,
    /// slide the top of stack down over n words (call-site argument cleanup)
    Adj,
    /// discard the top of stack
    Pop,
    Push,
    /// push the word at bp+offset
    Load,
    /// push the address bp+offset
    Lea,
    /// pop an address, push the word stored there
    Deref,
    /// pop a value, pop an address, store, push the value back
    Store,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    Or,
    Xor,
    And,
    /// bitwise complement
    Inv,
    Neg,
    /// `x == 0`, pushed as 0 or 1
    Not,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    SysRead,
    SysWrite,
    SysSleep,
}

impl Op {
    // must list every variant in declaration order
    const ALL: [Op; 35] = [
        Op::Nop,
        Op::Halt,
        Op::Jmp,
        Op::Jz,
        Op::Call,
        Op::Ret,
        Op::Adj,
        Op::Pop,
        Op::Push,
        Op::Load,
        Op::Lea,
        Op::Deref,
        Op::Store,
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::Shl,
        Op::Shr,
        Op::Or,
        Op::Xor,
        Op::And,
        Op::Inv,
        Op::Neg,
        Op::Not,
        Op::Eq,
        Op::Ne,
        Op::Lt,
        Op::Gt,
        Op::Le,
        Op::Ge,
        Op::SysRead,
        Op::SysWrite,
        Op::SysSleep,
    ];

    pub fn decode(word: i64) -> Option<Op> {
        return usize::try_from(word)
            .ok()
            .and_then(|i| Self::ALL.get(i))
            .copied();
    }

    pub fn has_operand(self) -> bool {
        return matches!(
            self,
            Op::Jmp | Op::Jz | Op::Call | Op::Adj | Op::Push | Op::Load | Op::Lea
        );
    }
}

impl From<Binop> for Op {
    fn from(op: Binop) -> Self {
        match op {
            Binop::Add => Op::Add,
            Binop::Sub => Op::Sub,
            Binop::Mul => Op::Mul,
            Binop::Div => Op::Div,
            Binop::Mod => Op::Mod,
            Binop::Shl => Op::Shl,
            Binop::Shr => Op::Shr,
            Binop::BitOr => Op::Or,
            Binop::BitXor => Op::Xor,
            Binop::BitAnd => Op::And,
            Binop::Eq => Op::Eq,
            Binop::Ne => Op::Ne,
            Binop::Lt => Op::Lt,
            Binop::Gt => Op::Gt,
            Binop::LtEq => Op::Le,
            Binop::GtEq => Op::Ge,
            // `&&`/`||` are the machine's bitwise ops, not short-circuits
            Binop::LogAnd => Op::And,
            Binop::LogOr => Op::Or,
            Binop::Comma => unreachable!("comma has no opcode"),
        }
    }
}

impl From<UnOp> for Op {
    fn from(op: UnOp) -> Self {
        match op {
            UnOp::Neg => Op::Neg,
            UnOp::Not => Op::Not,
            UnOp::Inv => Op::Inv,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LinkError {
    #[error("label {0} referenced but never defined")]
    UndefinedLabel(LabelId),
}

/// A linked program: one flat word region holding the register block,
/// the instruction stream, and the stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub mem: Vec<i64>,
    /// first word after the instruction stream
    pub code_end: usize,
    /// the entry frame's base, where top-level locals live
    pub entry_bp: usize,
}

pub struct Compiler<'a> {
    ast: &'a Ast,
    code: Vec<i64>,
    /// label id -> absolute address, filled during generation
    labels: Vec<Option<i64>>,
    /// operand words awaiting a label address
    patches: Vec<(usize, LabelId)>,
    /// fun id -> entry label, in declaration order (the resolver assigns
    /// ids in the same order)
    fun_labels: Vec<LabelId>,
}

impl<'a> Compiler<'a> {
    pub fn compile(ast: &'a Ast) -> Result<Program, LinkError> {
        let mut compiler = Compiler {
            ast,
            code: Vec::new(),
            labels: vec![None; ast.num_labels as usize],
            patches: Vec::new(),
            fun_labels: Vec::new(),
        };
        compiler.generate();
        compiler.link()?;
        return Ok(compiler.finish());
    }

    // ------------------------------------------------------------------
    // pass 1: emission

    fn generate(&mut self) {
        let ast = self.ast;
        let top = ast.extra.slice(ast.top);
        for &item in top {
            if let Node::FunDef { entry_label, .. } = ast.nodes[item as usize] {
                self.fun_labels.push(entry_label);
            }
        }

        let last_stmt = top
            .iter()
            .rposition(|&i| !matches!(ast.nodes[i as usize], Node::FunDef { .. }));
        for (i, &item) in top.iter().enumerate() {
            match ast.nodes[item as usize] {
                Node::FunDef {
                    body,
                    entry_label,
                    skip_label,
                    ..
                } => self.gen_fundef(body, entry_label, skip_label),
                _ => self.gen_stmt(item as usize, Some(i) == last_stmt),
            }
        }
        self.emit(Op::Halt);
    }

    fn here(&self) -> i64 {
        return (REG_WORDS + self.code.len()) as i64;
    }

    fn emit(&mut self, op: Op) {
        self.code.push(op as i64);
    }

    fn emit_with(&mut self, op: Op, operand: i64) {
        debug_assert!(op.has_operand());
        self.code.push(op as i64);
        self.code.push(operand);
    }

    fn emit_jump(&mut self, op: Op, target: LabelId) {
        self.code.push(op as i64);
        self.patches.push((self.code.len(), target));
        self.code.push(0);
    }

    fn mark(&mut self, label: LabelId) {
        debug_assert!(self.labels[label as usize].is_none(), "label defined twice");
        self.labels[label as usize] = Some(self.here());
    }

    fn gen_fundef(&mut self, body: XIndex, entry_label: LabelId, skip_label: LabelId) {
        self.emit_jump(Op::Jmp, skip_label);
        self.mark(entry_label);
        self.gen_block(body);
        // falling off the end returns zero
        self.emit_with(Op::Push, 0);
        self.emit(Op::Ret);
        self.mark(skip_label);
    }

    fn gen_block(&mut self, block: XIndex) {
        let ast = self.ast;
        for &stmt in ast.extra.slice(block) {
            self.gen_stmt(stmt as usize, false);
        }
    }

    /// A statement's value is discarded unless `keep` is set (the last
    /// top-level statement keeps its value as the program result).
    fn gen_stmt(&mut self, n: usize, keep: bool) {
        match self.ast.nodes[n] {
            Node::Break { value, target } => {
                self.gen_expr(value);
                self.emit_jump(Op::Jmp, target);
            }
            Node::Continue { target } => {
                self.emit_jump(Op::Jmp, target);
            }
            Node::Return { value } => {
                match value {
                    Some(v) => self.gen_expr(v),
                    None => self.emit_with(Op::Push, 0),
                }
                self.emit(Op::Ret);
            }
            Node::If {
                cond,
                then_blk,
                else_blk,
                else_label,
                end_label,
            } => {
                self.gen_expr(cond);
                self.emit_jump(Op::Jz, else_label);
                self.gen_block(then_blk);
                self.emit_jump(Op::Jmp, end_label);
                self.mark(else_label);
                self.gen_block(else_blk);
                self.mark(end_label);
            }
            _ => {
                self.gen_expr(n);
                if !keep {
                    self.emit(Op::Pop);
                }
            }
        }
    }

    /// Post-order: operands first, then the opcode that consumes them.
    fn gen_expr(&mut self, n: usize) {
        match self.ast.nodes[n] {
            Node::Int(value) => self.emit_with(Op::Push, value),
            Node::Local { offset } => self.emit_with(Op::Load, offset),
            Node::Unary { op, operand } => {
                self.gen_expr(operand);
                self.emit(Op::from(op));
            }
            Node::AddrOf { target } => {
                let Node::Local { offset } = self.ast.nodes[target] else {
                    unreachable!("unresolved address-of target");
                };
                self.emit_with(Op::Lea, offset);
            }
            Node::Deref { addr } => {
                self.gen_expr(addr);
                self.emit(Op::Deref);
            }
            Node::Assign { target, value } => {
                match self.ast.nodes[target] {
                    Node::AddrOf { target: slot } => {
                        let Node::Local { offset } = self.ast.nodes[slot] else {
                            unreachable!("unresolved assignment target");
                        };
                        self.emit_with(Op::Lea, offset);
                    }
                    // the pointer value is the target address
                    Node::Deref { addr } => self.gen_expr(addr),
                    _ => unreachable!("parser enforces assignment targets"),
                }
                self.gen_expr(value);
                self.emit(Op::Store);
            }
            Node::Binop { op, lhs, rhs } => {
                if op == Binop::Comma {
                    self.gen_expr(lhs);
                    self.emit(Op::Pop);
                    self.gen_expr(rhs);
                } else {
                    self.gen_expr(lhs);
                    self.gen_expr(rhs);
                    self.emit(Op::from(op));
                }
            }
            Node::CallFun { fun, args } => {
                let ast = self.ast;
                let n_args = ast.extra.len_of(args);
                for &arg in ast.extra.slice(args) {
                    self.gen_expr(arg as usize);
                }
                let entry = self.fun_labels[fun as usize];
                self.emit_jump(Op::Call, entry);
                if n_args > 0 {
                    self.emit_with(Op::Adj, n_args as i64);
                }
            }
            Node::CallBuiltin { which, args } => {
                let ast = self.ast;
                for &arg in ast.extra.slice(args) {
                    self.gen_expr(arg as usize);
                }
                let op = match which {
                    Builtin::Read => Op::SysRead,
                    Builtin::Write => Op::SysWrite,
                    Builtin::Usleep => Op::SysSleep,
                };
                self.emit(op);
            }
            Node::Loop {
                body,
                start_label,
                end_label,
            } => {
                self.mark(start_label);
                self.gen_block(body);
                self.emit_jump(Op::Jmp, start_label);
                self.mark(end_label);
            }
            Node::Ident(_)
            | Node::Call { .. }
            | Node::If { .. }
            | Node::Break { .. }
            | Node::Continue { .. }
            | Node::Return { .. }
            | Node::FunDef { .. } => {
                unreachable!("not an expression: {:?}", self.ast.nodes[n])
            }
        }
    }

    // ------------------------------------------------------------------
    // pass 2: backpatching

    fn link(&mut self) -> Result<(), LinkError> {
        for &(at, label) in &self.patches {
            let Some(addr) = self.labels[label as usize] else {
                return Err(LinkError::UndefinedLabel(label));
            };
            self.code[at] = addr;
        }
        Ok(())
    }

    fn finish(self) -> Program {
        let code_end = REG_WORDS + self.code.len();
        // the entry frame mirrors a called one: linkage margin, then the
        // fixed reservation, with the operand stack above it
        let entry_bp = code_end + LINKAGE_WORDS as usize;
        let sp = entry_bp + FRAME_WORDS as usize;

        let mut mem = Vec::with_capacity(code_end + STACK_WORDS);
        mem.extend_from_slice(&[0; REG_WORDS]);
        mem.extend_from_slice(&self.code);
        mem.resize(code_end + STACK_WORDS, 0);

        mem[REG_IP] = REG_WORDS as i64;
        mem[REG_SP] = sp as i64;
        mem[REG_BP] = entry_bp as i64;

        return Program {
            mem,
            code_end,
            entry_bp,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::disasm::decoded;
    use super::*;
    use crate::parser::tests::parse;
    use crate::resolve::resolve;

    pub fn compile(contents: &str) -> Program {
        let mut ast = parse(contents).expect("parse error");
        resolve(&mut ast, contents).expect("resolve error");
        return Compiler::compile(&ast).expect("link error");
    }

    macro_rules! assert_code_matches {
        ($program:expr, [$($ops:pat),* $(,)?]) => {
            let ops = decoded(&$program);
            let mut i = 0;
            $(
                #[allow(unused_assignments)]
                {
                    assert!(
                        matches!(ops[i], $ops),
                        "at {}: expected {}, got {:?}",
                        i, stringify!($ops), ops[i]
                    );
                    i += 1;
                }
            )*
            assert_eq!(ops.len(), i, "expected {} ops, got {}. Extra: {:?}", i, ops.len(), &ops[i..]);
        };
    }

    #[test]
    fn add() {
        let program = compile("1 + 2");
        assert_code_matches!(
            program,
            [
                (Op::Push, Some(1)),
                (Op::Push, Some(2)),
                (Op::Add, None),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn nested_arithmetic_is_post_order() {
        let program = compile("1 + 2 * 3");
        assert_code_matches!(
            program,
            [
                (Op::Push, Some(1)),
                (Op::Push, Some(2)),
                (Op::Push, Some(3)),
                (Op::Mul, None),
                (Op::Add, None),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn all_statements_but_the_last_are_popped() {
        let program = compile("1\n2");
        assert_code_matches!(
            program,
            [
                (Op::Push, Some(1)),
                (Op::Pop, None),
                (Op::Push, Some(2)),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn assign_emits_lea_store() {
        let program = compile("&x = 1");
        assert_code_matches!(
            program,
            [
                (Op::Lea, Some(0)),
                (Op::Push, Some(1)),
                (Op::Store, None),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn assign_through_pointer_evaluates_the_address() {
        let program = compile("&x = 1\n&p = &x\n*p = 9");
        assert_code_matches!(
            program,
            [
                (Op::Lea, Some(0)),
                (Op::Push, Some(1)),
                (Op::Store, None),
                (Op::Pop, None),
                (Op::Lea, Some(1)),
                (Op::Lea, Some(0)),
                (Op::Store, None),
                (Op::Pop, None),
                (Op::Load, Some(1)),
                (Op::Push, Some(9)),
                (Op::Store, None),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn comma_pops_the_first_value() {
        let program = compile("1, 2");
        assert_code_matches!(
            program,
            [
                (Op::Push, Some(1)),
                (Op::Pop, None),
                (Op::Push, Some(2)),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn logical_ops_lower_to_bitwise() {
        let program = compile("1 && 2 || 3");
        assert_code_matches!(
            program,
            [
                (Op::Push, Some(1)),
                (Op::Push, Some(2)),
                (Op::And, None),
                (Op::Push, Some(3)),
                (Op::Or, None),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn if_links_both_branches() {
        let program = compile("if (1) { 2 } else { 3 }\n0");
        // 3: Push 1; 5: Jz 12; 7: Push 2; 9: Pop; 10: Jmp 15;
        // 12: Push 3; 14: Pop; 15: Push 0; 17: Halt
        assert_code_matches!(
            program,
            [
                (Op::Push, Some(1)),
                (Op::Jz, Some(12)),
                (Op::Push, Some(2)),
                (Op::Pop, None),
                (Op::Jmp, Some(15)),
                (Op::Push, Some(3)),
                (Op::Pop, None),
                (Op::Push, Some(0)),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn loop_jumps_back_to_its_start() {
        let program = compile("loop { break 42 }");
        // 3(start): Push 42; 5: Jmp end(9); 7: Jmp start(3); 9(end): Halt
        assert_code_matches!(
            program,
            [
                (Op::Push, Some(42)),
                (Op::Jmp, Some(9)),
                (Op::Jmp, Some(3)),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn fundef_is_skipped_and_called() {
        let program = compile("fn one() { return 1 }\n&r = one()");
        // 3: Jmp 11; 5: Push 1; 7: Ret; 8: Push 0; 10: Ret;
        // 11: Lea 0; 13: Call 5; 15: Store; 16: Halt
        assert_code_matches!(
            program,
            [
                (Op::Jmp, Some(11)),
                (Op::Push, Some(1)),
                (Op::Ret, None),
                (Op::Push, Some(0)),
                (Op::Ret, None),
                (Op::Lea, Some(0)),
                (Op::Call, Some(5)),
                (Op::Store, None),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn call_with_args_adjusts_the_stack() {
        let program = compile("fn add(a, b) { return a + b }\nadd(5, 7)");
        assert_code_matches!(
            program,
            [
                (Op::Jmp, Some(14)),
                (Op::Load, Some(-5)),
                (Op::Load, Some(-4)),
                (Op::Add, None),
                (Op::Ret, None),
                (Op::Push, Some(0)),
                (Op::Ret, None),
                (Op::Push, Some(5)),
                (Op::Push, Some(7)),
                (Op::Call, Some(5)),
                (Op::Adj, Some(2)),
                (Op::Halt, None),
            ]
        );
    }

    #[test]
    fn jump_operands_stay_inside_the_code() {
        let program = compile(
            "fn f(n) { if (n == 0) { return 0 }\n return f(n - 1) }\n&x = loop { break f(3) }",
        );
        let ops = decoded(&program);
        let mut addr = REG_WORDS;
        for (op, operand) in ops {
            if matches!(op, Op::Jmp | Op::Jz | Op::Call) {
                let target = operand.unwrap();
                assert!(
                    (REG_WORDS as i64) <= target && target < program.code_end as i64,
                    "jump at {} targets {} outside the code",
                    addr,
                    target
                );
            }
            addr += if op.has_operand() { 2 } else { 1 };
        }
    }

    #[test]
    fn registers_are_initialized() {
        let program = compile("1");
        assert_eq!(program.mem[REG_IP], REG_WORDS as i64);
        assert_eq!(program.entry_bp, program.code_end + LINKAGE_WORDS as usize);
        assert_eq!(
            program.mem[REG_SP],
            (program.entry_bp as i64) + FRAME_WORDS
        );
        assert_eq!(program.mem[REG_BP], program.entry_bp as i64);
    }

    #[test]
    fn compilation_is_deterministic() {
        let src = "fn f(a) { return a * 2 }\n&x = f(21)";
        let a = compile(src);
        let b = compile(src);
        assert_eq!(a.mem, b.mem);
    }

    #[test]
    fn empty_program_is_just_halt() {
        let program = compile("");
        assert_code_matches!(program, [(Op::Halt, None)]);
    }

    #[test]
    fn decode_rejects_junk() {
        assert_eq!(Op::decode(-1), None);
        assert_eq!(Op::decode(Op::ALL.len() as i64), None);
        assert_eq!(Op::decode(0), Some(Op::Nop));
    }
}
